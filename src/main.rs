use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use tissue_volume::{
    DicomLibrary, Error, PipelineContext, Result, Settings, SortBy, TissueKind,
    analysis::EventKind,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Analyze DICOM series and build multi-tissue surface models.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory searched recursively for DICOM files
    input: PathBuf,

    /// Output directory for overlays, analyses and models
    /// (default: $TISSUE_VOLUME_ASSETS_DIR or ./assets)
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Only process this series (default: every series found)
    #[arg(long)]
    series: Option<String>,

    /// Comma-separated tissues to mesh: body, visceral_fat, subcutaneous_fat, organs
    #[arg(long, value_delimiter = ',')]
    tissues: Vec<String>,

    /// Skip 3D model generation
    #[arg(long)]
    no_model: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tissue_volume=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "tissue-volume failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let tissues = args
        .tissues
        .iter()
        .map(|name| name.parse::<TissueKind>())
        .collect::<Result<Vec<_>>>()?;

    let library = DicomLibrary::load_from_directory(&args.input, SortBy::InstanceNumber)?;
    let settings = args.assets.map_or_else(Settings::from_env, Settings::new);
    let ctx = PipelineContext::new(Arc::new(library), settings)?;
    ctx.store().scan_existing()?;

    let series: Vec<String> = match args.series {
        Some(id) => vec![id],
        None => ctx.list_series().into_iter().map(|s| s.series_uid).collect(),
    };
    info!(count = series.len(), "Processing series");

    for series_id in series {
        let mut events = ctx.analyze_streaming(&series_id)?;
        while let Some(event) = events.next().await {
            match event.kind {
                EventKind::Error => {
                    return Err(Error::Worker(format!(
                        "analysis of {series_id} failed: {}",
                        event.message
                    )));
                }
                EventKind::Complete => {
                    if let Some(result) = &event.data {
                        println!("{}", serde_json::to_string_pretty(&result.tissue_stats)?);
                    }
                }
                _ => info!(progress = event.progress, "{}", event.message),
            }
        }

        if !args.no_model {
            let manifest = ctx.generate_model(&series_id, &tissues).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
    }
    Ok(())
}
