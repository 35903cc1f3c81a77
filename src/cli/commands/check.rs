use anyhow::{bail, Context};
use clap::Args;
use futures::StreamExt;
use std::sync::Arc;

use crate::cli::OutputFormat;
use crate::config::config;
use crate::database::{DataSource, PgPoolBuilder};
use crate::lease::{CredentialSource, FileCredentialSource};
use crate::resource::{ResourceBuilder, ResourceHandle};
use crate::services::PaymentsService;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(long, help = "Lease file rendered by the secrets agent")]
    pub credentials_file: Option<String>,
}

pub async fn handle(args: CheckArgs, output_format: OutputFormat) -> anyhow::Result<()> {
    let app = config();
    let rotation_config = super::rotation_config(&app.rotation, args.credentials_file, None)?;
    let path = rotation_config.path();
    let lease_file = rotation_config
        .credentials_file
        .clone()
        .context("no lease file configured")?;

    let source = FileCredentialSource::new().with_lease_file(path.clone(), lease_file);
    let mut events = source.subscribe(&path, rotation_config.mode).await?;
    let Some(credentials) = events.next().await.and_then(|e| e.credentials().cloned()) else {
        bail!("lease file for {} held no credentials", path);
    };

    let handle = PgPoolBuilder::from_config(&app.database)
        .verify(true)
        .build(&credentials)
        .await?;
    let handle = Arc::new(handle);

    let result = PaymentsService::new(handle.clone()).ping().await;
    let size = handle.size();
    handle.close().await;
    result.with_context(|| format!("ping failed with lease {}", credentials.lease_id()))?;

    match output_format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "path": path,
                "lease_id": credentials.lease_id(),
                "username": credentials.username(),
                "issued_at": credentials.issued().to_rfc3339(),
                "ttl_seconds": credentials.ttl().as_secs(),
                "connections": size,
                "status": "ok",
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("Lease {} for {} is usable", credentials.lease_id(), path);
            println!("  username: {}", credentials.username());
            println!("  ttl:      {}s", credentials.ttl().as_secs());
        }
    }
    Ok(())
}
