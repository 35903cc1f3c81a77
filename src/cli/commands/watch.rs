use anyhow::Context;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::OutputFormat;
use crate::config::config;
use crate::database::PgPoolBuilder;
use crate::lease::FileCredentialSource;
use crate::rotation::{RotationPolicy, RotationReport};
use crate::services::PaymentsService;

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(long, help = "Lease file rendered by the secrets agent")]
    pub credentials_file: Option<String>,

    #[arg(long, help = "Lease mode: renew or rotate")]
    pub mode: Option<String>,

    #[arg(long, default_value_t = 10, help = "Seconds between payments checks")]
    pub poll_interval: u64,
}

pub async fn handle(args: WatchArgs, output_format: OutputFormat) -> anyhow::Result<()> {
    let app = config();
    let rotation_config = super::rotation_config(&app.rotation, args.credentials_file, args.mode)?;
    let path = rotation_config.path();
    let lease_file = rotation_config
        .credentials_file
        .clone()
        .context("no lease file configured")?;

    info!("Starting lease watch for {} in {:?} mode", path, app.environment);

    let source = Arc::new(FileCredentialSource::new().with_lease_file(path.clone(), lease_file));
    let builder = Arc::new(PgPoolBuilder::from_config(&app.database));
    let rotation = RotationPolicy::new(rotation_config, source, builder)
        .start()
        .await
        .with_context(|| format!("failed to start rotation for {}", path))?;

    let mut reports = rotation.subscribe_reports();
    let payments = PaymentsService::new(rotation.proxy());
    let mut poll = tokio::time::interval(Duration::from_secs(args.poll_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
            report = reports.recv() => match report {
                Ok(report) => print_report(&report, output_format),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} rotation reports", missed),
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => match payments.list().await {
                Ok(rows) => info!("Found {} payments", rows.len()),
                Err(e) => warn!("Payments check failed: {}", e),
            },
        }
    }

    rotation.shutdown().await;
    Ok(())
}

fn print_report(report: &RotationReport, output_format: OutputFormat) {
    match output_format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "path": report.path(),
                "report": format!("{:?}", report),
                "error_code": report.error().map(|e| e.error_code()),
            });
            println!("{}", value);
        }
        OutputFormat::Text => match report.error() {
            Some(error) => println!("[{}] {}", report.path(), error),
            None => println!("[{}] {:?}", report.path(), report),
        },
    }
}
