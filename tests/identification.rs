mod common;

use common::{create_ci, put, store, t};
use layerkeeper::construct::{AttributeState, Ciid, LayerSet, TimeThreshold};
use layerkeeper::error::LayerkeeperError;
use layerkeeper::identify::{Fragment, IdentificationMethod, IdentificationService, MappingContext};
use layerkeeper::storage::Storage;

fn by_data(fragments: &[(&str, &str)]) -> IdentificationMethod {
    IdentificationMethod::ByData {
        fragments: fragments.iter().map(|(n, v)| Fragment::new(*n, *v)).collect(),
        search_layers: LayerSet::from_ids(["inventory"]),
    }
}

#[tokio::test]
async fn ambiguous_data_resolves_to_the_first_inserted_ci() {
    let p = store();
    let first = create_ci(&p).await;
    let second = create_ci(&p).await;
    put(&p, "inventory", first, "hostname", "web", AttributeState::New, t(0)).await;
    put(&p, "inventory", second, "hostname", "web", AttributeState::New, t(1)).await;
    put(&p, "inventory", second, "os", "linux", AttributeState::New, t(1)).await;

    let service = IdentificationService::new(&p);
    let mut context = MappingContext::default();
    let mut tx = p.begin().await.unwrap();

    let method = by_data(&[("hostname", "web")]);
    let all = service.try_to_match("candidate", &method, &mut context, &mut tx).await.unwrap();
    assert_eq!(all, vec![first, second]);
    let resolved = service.resolve("candidate", &method, &mut context, &mut tx).await.unwrap();
    assert_eq!(resolved, Some(first));

    let narrowed = by_data(&[("hostname", "web"), ("os", "linux")]);
    let resolved = service.resolve("candidate", &narrowed, &mut context, &mut tx).await.unwrap();
    assert_eq!(resolved, Some(second));

    let nothing = by_data(&[("hostname", "web"), ("os", "windows")]);
    let resolved = service.resolve("candidate", &nothing, &mut context, &mut tx).await.unwrap();
    assert_eq!(resolved, None);
}

#[tokio::test]
async fn data_outside_the_search_layers_is_ignored() {
    let p = store();
    let ci = create_ci(&p).await;
    put(&p, "scratch", ci, "hostname", "web", AttributeState::New, t(0)).await;

    let service = IdentificationService::new(&p);
    let mut context = MappingContext::default();
    let mut tx = p.begin().await.unwrap();
    let resolved = service
        .resolve("candidate", &by_data(&[("hostname", "web")]), &mut context, &mut tx)
        .await
        .unwrap();
    assert_eq!(resolved, None);
}

#[tokio::test]
async fn context_memoizes_lookups_for_its_batch() {
    let p = store();
    let ci = create_ci(&p).await;
    put(&p, "inventory", ci, "hostname", "web", AttributeState::New, t(0)).await;

    let service = IdentificationService::new(&p);
    let method = by_data(&[("hostname", "db")]);
    let mut context = MappingContext::new(TimeThreshold::Latest);
    {
        let mut tx = p.begin().await.unwrap();
        let resolved = service.resolve("c", &method, &mut context, &mut tx).await.unwrap();
        assert_eq!(resolved, None);
    }

    let db = create_ci(&p).await;
    put(&p, "inventory", db, "hostname", "db", AttributeState::New, t(1)).await;

    let mut tx = p.begin().await.unwrap();
    let stale = service.resolve("c", &method, &mut context, &mut tx).await.unwrap();
    assert_eq!(stale, None);
    let mut fresh = MappingContext::default();
    let resolved = service.resolve("c", &method, &mut fresh, &mut tx).await.unwrap();
    assert_eq!(resolved, Some(db));
}

#[tokio::test]
async fn explicit_methods_need_no_lookup() {
    let p = store();
    let service = IdentificationService::new(&p);
    let mut context = MappingContext::default();
    let mut tx = p.begin().await.unwrap();

    let named = Ciid::generate();
    let resolved = service
        .resolve("c", &IdentificationMethod::ByCiid(named), &mut context, &mut tx)
        .await
        .unwrap();
    assert_eq!(resolved, Some(named));
    // resolving never creates anything
    assert!(!p.ci_exists(named, &mut tx).await.unwrap());

    let resolved = service
        .resolve("c", &IdentificationMethod::Noop, &mut context, &mut tx)
        .await
        .unwrap();
    assert_eq!(resolved, None);

    let (temporary, final_ciid) = (Ciid::generate(), Ciid::generate());
    context.add_temporary(temporary, final_ciid).unwrap();
    let resolved = service
        .resolve("c", &IdentificationMethod::ByTemporaryCiid(temporary), &mut context, &mut tx)
        .await
        .unwrap();
    assert_eq!(resolved, Some(final_ciid));
}

#[tokio::test]
async fn unknown_temporary_ciid_is_a_hard_error() {
    let p = store();
    let service = IdentificationService::new(&p);
    let mut context = MappingContext::default();
    let mut tx = p.begin().await.unwrap();
    let missing = Ciid::generate();
    let result = service
        .resolve("relation 3", &IdentificationMethod::ByTemporaryCiid(missing), &mut context, &mut tx)
        .await;
    match result {
        Err(LayerkeeperError::UnresolvedTemporaryCiid { candidate, temporary }) => {
            assert_eq!(candidate, "relation 3");
            assert_eq!(temporary, missing);
        }
        other => panic!("expected an unresolved temporary CIID, got {:?}", other),
    }
}
