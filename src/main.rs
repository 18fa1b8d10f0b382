use std::process::ExitCode;

use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use layerkeeper::construct::{CiSelection, NameSelection, TimeThreshold};
use layerkeeper::error::{LayerkeeperError, Result};
use layerkeeper::merge::MergeEngine;
use layerkeeper::persist::Persistor;
use layerkeeper::settings::Settings;
use layerkeeper::storage::Storage;

async fn run(settings: Settings) -> Result<()> {
    let persistor = Persistor::new(settings.persistence_mode())?;

    let mut tx = persistor.begin().await?;
    for layer in settings.layers() {
        if persistor.create_layer(&layer, &mut tx).await? {
            info!(layer = %layer.id(), name = layer.name(), "created layer");
        }
    }
    persistor.commit(tx).await?;

    let Some(view) = &settings.view else {
        info!("no view configured, nothing to print");
        return Ok(());
    };
    let layer_set = settings
        .layer_set(view)
        .ok_or_else(|| LayerkeeperError::Config(format!("unknown layer set '{}'", view)))?;

    let mut tx = persistor.begin().await?;
    let merged = MergeEngine::new(&persistor)
        .merged_attributes(
            &CiSelection::All,
            &NameSelection::All,
            &layer_set,
            TimeThreshold::Latest,
            &mut tx,
        )
        .await?;
    persistor.rollback(tx).await?;

    let mut ciids: Vec<_> = merged.keys().copied().collect();
    ciids.sort();
    for ciid in ciids {
        let mut attributes: Vec<_> = merged[&ciid].values().collect();
        attributes.sort_by(|a, b| a.attribute().name().cmp(b.attribute().name()));
        let line = json!({
            "ciid": ciid.to_string(),
            "attributes": attributes
                .iter()
                .map(|m| json!({
                    "name": m.attribute().name(),
                    "value": m.attribute().value().to_json(),
                    "layers": m.layer_stack_ids().iter().map(|l| l.as_str()).collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", line);
    }
    info!(view = %view, cis = merged.len(), "printed merged view");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1);
    let settings = match Settings::load(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "layerkeeper failed");
            ExitCode::FAILURE
        }
    }
}
