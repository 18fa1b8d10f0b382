mod common;

use std::collections::HashMap;

use common::{ci_count, predicate, store, t};
use layerkeeper::construct::{
    AttributeState, CiSelection, Ciid, LayerId, LayerSet, NameSelection, TimeThreshold,
};
use layerkeeper::datatype::AttributeValue;
use layerkeeper::error::LayerkeeperError;
use layerkeeper::identify::{CiCandidateAttributeData, Fragment, IdentificationMethod};
use layerkeeper::ingest::{ChangesetProxy, CiCandidate, IngestData, IngestService, RelationCandidate};
use layerkeeper::merge::MergeEngine;
use layerkeeper::persist::Persistor;
use layerkeeper::storage::Storage;

const LAYER: &str = "discovery";

fn host(hostname: &str, extra: &[(&str, &str)]) -> CiCandidate {
    let mut fragments = vec![Fragment::new("hostname", hostname)];
    fragments.extend(extra.iter().map(|(n, v)| Fragment::new(*n, *v)));
    let attributes = CiCandidateAttributeData::new(fragments);
    let identification = IdentificationMethod::by_data_from_attributes(
        &["hostname"],
        &attributes,
        LayerSet::from_ids([LAYER]),
    )
    .unwrap();
    CiCandidate::new(identification, attributes)
}

async fn states(p: &Persistor) -> HashMap<(String, Ciid), AttributeState> {
    let mut tx = p.begin().await.unwrap();
    let latest = p
        .latest_attributes(
            &LayerId::from(LAYER),
            &CiSelection::All,
            &NameSelection::All,
            TimeThreshold::Latest,
            &mut tx,
        )
        .await
        .unwrap();
    latest.into_iter().map(|a| (a.key(), a.state())).collect()
}

#[tokio::test]
async fn batches_replace_the_layer_content() {
    let p = store();
    predicate(&p, "runs_on").await;
    let service = IngestService::new(&p);
    let layer = LayerId::from(LAYER);
    let (web, db) = (Ciid::generate(), Ciid::generate());

    let first = IngestData::new(
        vec![(web, host("web-01", &[])), (db, host("db-01", &[]))],
        vec![RelationCandidate::new(
            IdentificationMethod::ByTemporaryCiid(web),
            IdentificationMethod::ByTemporaryCiid(db),
            "runs_on",
        )],
    );
    let summary = service
        .ingest(&layer, first.clone(), &mut ChangesetProxy::new(7, t(0)))
        .await
        .unwrap();
    assert_eq!(summary.created_cis, 2);
    assert_eq!(summary.written_attributes, 2);
    assert_eq!(summary.written_relations, 1);
    assert!(summary.changeset.is_some());
    let web_ciid = summary.temporary_to_final[&web];
    let db_ciid = summary.temporary_to_final[&db];
    assert_ne!(web_ciid, db_ciid);

    // the same data again changes nothing and issues no changeset
    let mut proxy = ChangesetProxy::new(7, t(10));
    let again = service.ingest(&layer, first, &mut proxy).await.unwrap();
    assert_eq!(again.created_cis, 0);
    assert_eq!(again.written_attributes + again.removed_attributes, 0);
    assert_eq!(again.temporary_to_final[&web], web_ciid);
    assert!(again.changeset.is_none());
    assert!(proxy.changeset().is_none());

    // db-01 and the relation are not sent any more
    let third = IngestData::new(vec![(web, host("web-01", &[("os", "linux")]))], vec![]);
    let summary = service
        .ingest(&layer, third, &mut ChangesetProxy::new(7, t(20)))
        .await
        .unwrap();
    assert_eq!(summary.written_attributes, 1);
    assert_eq!(summary.removed_attributes, 1);
    assert_eq!(summary.removed_relations, 1);
    let current = states(&p).await;
    assert_eq!(current[&("hostname".to_string(), web_ciid)], AttributeState::New);
    assert_eq!(current[&("os".to_string(), web_ciid)], AttributeState::New);
    assert_eq!(current[&("hostname".to_string(), db_ciid)], AttributeState::Removed);

    // naming db-01 explicitly brings it back, and web-01 changes its value
    let fourth = IngestData::new(
        vec![
            (web, host("web-01", &[("os", "bsd")])),
            (
                db,
                CiCandidate::new(
                    IdentificationMethod::ByCiid(db_ciid),
                    CiCandidateAttributeData::new(vec![Fragment::new("hostname", "db-01")]),
                ),
            ),
        ],
        vec![],
    );
    service
        .ingest(&layer, fourth, &mut ChangesetProxy::new(7, t(30)))
        .await
        .unwrap();
    let current = states(&p).await;
    assert_eq!(current[&("os".to_string(), web_ciid)], AttributeState::Changed);
    assert_eq!(current[&("hostname".to_string(), db_ciid)], AttributeState::Renewed);
    assert_eq!(ci_count(&p).await, 2);

    let mut tx = p.begin().await.unwrap();
    let merged = MergeEngine::new(&p)
        .merged_attribute("os", web_ciid, &LayerSet::from_ids([LAYER]), TimeThreshold::at(t(25)), &mut tx)
        .await
        .unwrap()
        .expect("os at t25");
    assert_eq!(merged.attribute().value(), &AttributeValue::text("linux"));
}

#[tokio::test]
async fn temporary_ids_must_be_resolved_before_use() {
    let p = store();
    let service = IngestService::new(&p);
    let (early, late) = (Ciid::generate(), Ciid::generate());
    let data = IngestData::new(
        vec![
            (
                early,
                CiCandidate::new(
                    IdentificationMethod::ByTemporaryCiid(late),
                    CiCandidateAttributeData::default(),
                ),
            ),
            (late, host("web-01", &[])),
        ],
        vec![],
    );
    let result = service
        .ingest(&LayerId::from(LAYER), data, &mut ChangesetProxy::new(1, t(0)))
        .await;
    assert!(matches!(
        result,
        Err(LayerkeeperError::UnresolvedTemporaryCiid { temporary, .. }) if temporary == late
    ));
    assert_eq!(ci_count(&p).await, 0);
}

#[tokio::test]
async fn failing_batches_roll_back_and_name_the_candidate() {
    let p = store();
    let service = IngestService::new(&p);
    let layer = LayerId::from(LAYER);
    let (web, broken) = (Ciid::generate(), Ciid::generate());
    let data = IngestData::new(
        vec![
            (web, host("web-01", &[])),
            (broken, host("web-02", &[("os", "linux"), ("os", "bsd")])),
        ],
        vec![],
    );
    let mut proxy = ChangesetProxy::new(1, t(0));
    match service.ingest(&layer, data, &mut proxy).await {
        Err(LayerkeeperError::Ingest { candidate, message }) => {
            assert_eq!(candidate, broken.to_string());
            assert!(message.contains("os"));
        }
        other => panic!("expected an ingest error, got {:?}", other),
    }
    assert_eq!(ci_count(&p).await, 0);
    assert!(states(&p).await.is_empty());
    assert!(proxy.changeset().is_none());
}

#[tokio::test]
async fn relations_need_a_known_predicate() {
    let p = store();
    let service = IngestService::new(&p);
    let (web, db) = (Ciid::generate(), Ciid::generate());
    let data = IngestData::new(
        vec![(web, host("web-01", &[])), (db, host("db-01", &[]))],
        vec![RelationCandidate::new(
            IdentificationMethod::ByTemporaryCiid(web),
            IdentificationMethod::ByTemporaryCiid(db),
            "depends_on",
        )],
    );
    let result = service
        .ingest(&LayerId::from(LAYER), data, &mut ChangesetProxy::new(1, t(0)))
        .await;
    assert!(matches!(result, Err(LayerkeeperError::Ingest { .. })));
    assert_eq!(ci_count(&p).await, 0);
}
