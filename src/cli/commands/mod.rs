pub mod check;
pub mod watch;

use anyhow::{bail, Context};

use crate::config::RotationConfig;
use crate::lease::LeaseMode;

/// Apply command-line overrides on top of the environment's rotation config
pub(crate) fn rotation_config(
    base: &RotationConfig,
    credentials_file: Option<String>,
    mode: Option<String>,
) -> anyhow::Result<RotationConfig> {
    let mut config = base.clone();
    if let Some(mode) = mode {
        match LeaseMode::parse(&mode) {
            Some(mode) => config.mode = mode,
            None => bail!("unknown lease mode '{}', expected renew or rotate", mode),
        }
    }
    config.credentials_file = credentials_file.or(config.credentials_file);
    config
        .credentials_file
        .as_ref()
        .context("no lease file; pass --credentials-file or set VAULT_CREDENTIALS_FILE")?;
    Ok(config)
}
