use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use usage_ingest::logging::{init_logging, parse_level, LogFormat};
use usage_ingest::settings::StoreKind;
use usage_ingest::{
    DocumentIndex, ElasticClient, LocalReportStore, Processor, ProcessorSettings, ReportStore,
    S3ReportStore, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("usage-ingest")
        .about("Index cost and usage reports into Elasticsearch")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Configuration file, read after the standard locations")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(Arg::new("log-level").long("log-level").default_value("info"))
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .help("text or json")
                .default_value("text"),
        )
        .arg(
            Arg::new("period")
                .long("period")
                .help("Only process this billing period (repeatable)")
                .action(ArgAction::Append),
        )
        .get_matches();

    let level = parse_level(
        matches
            .get_one::<String>("log-level")
            .map_or("info", String::as_str),
    )?;
    let format: LogFormat = matches
        .get_one::<String>("log-format")
        .map_or("text", String::as_str)
        .parse()?;
    init_logging(level, format)?;

    let settings = Settings::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .context("Error reading configuration")?;
    let only: Vec<String> = matches
        .get_many::<String>("period")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    let es = ElasticClient::new(&settings.es.server, settings.ingest.request_timeout())
        .context("Couldn't build Elasticsearch client")?;
    es.ping()
        .await
        .with_context(|| format!("Couldn't reach Elasticsearch at {}", settings.es.server))?;
    let index: Arc<dyn DocumentIndex> = Arc::new(es);

    let store: Arc<dyn ReportStore> = match settings.store.kind {
        StoreKind::S3 => {
            let bucket = settings.s3.bucket.clone().unwrap_or_default();
            Arc::new(
                S3ReportStore::connect(
                    bucket,
                    &settings.s3.prefix,
                    settings.s3.region.clone(),
                    settings.s3.endpoint.clone(),
                )
                .await,
            )
        }
        StoreKind::Local => {
            let root = settings.store.path.clone().unwrap_or_default();
            Arc::new(LocalReportStore::new(root, &settings.s3.prefix))
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight periods");
            on_signal.cancel();
        }
    });

    let processor = Processor::new(store, index, ProcessorSettings::from(&settings), cancel);
    let summary = processor.run(&only).await?;

    for (period, outcome) in &summary.periods {
        if let usage_ingest::PeriodOutcome::Failed(e) = outcome {
            error!(period = %period, error = %e, "Period was not indexed");
        }
    }
    info!(
        ingested = summary.ingested(),
        skipped = summary.skipped(),
        failed = summary.failed(),
        "Run finished"
    );
    Ok(())
}
