mod common;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use vault_lease_pool::lease::{
    CredentialSource, FileCredentialSource, LeaseEventKind, LeaseMode, LeaseStream, SourceError,
};

use common::PATH;

struct LeaseFile {
    path: PathBuf,
}

impl LeaseFile {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("lease-{}.json", uuid::Uuid::new_v4()));
        Self { path }
    }

    fn write(&self, lease_id: &str, username: &str, ttl: u64) -> Result<()> {
        let body = json!({
            "lease_id": lease_id,
            "lease_duration": ttl,
            "renewable": true,
            "data": { "username": username, "password": format!("pw-{}", username) }
        });
        std::fs::write(&self.path, serde_json::to_vec(&body)?)?;
        Ok(())
    }

    fn source(&self) -> FileCredentialSource {
        FileCredentialSource::new().with_lease_file(PATH, &self.path)
    }
}

impl Drop for LeaseFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn next_kind(events: &mut LeaseStream) -> Option<LeaseEventKind> {
    tokio::time::timeout(Duration::from_millis(200), events.next())
        .await
        .ok()
        .flatten()
        .map(|e| e.kind)
}

#[tokio::test]
async fn test_subscribe_issues_current_lease() -> Result<()> {
    let file = LeaseFile::new();
    file.write("lease-a", "v-app-a", 3600)?;
    let source = file.source();

    let mut events = source.subscribe(PATH, LeaseMode::Rotate).await?;

    match next_kind(&mut events).await {
        Some(LeaseEventKind::Issued(creds)) => {
            assert_eq!(creds.lease_id(), "lease-a");
            assert_eq!(creds.username(), "v-app-a");
            assert_eq!(creds.secret(), "pw-v-app-a");
            assert_eq!(creds.ttl(), Duration::from_secs(3600));
            assert!(creds.is_renewable());
        }
        other => panic!("expected Issued, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_rotation_request_reports_new_lease_only() -> Result<()> {
    let file = LeaseFile::new();
    file.write("lease-a", "v-app-a", 3600)?;
    let source = file.source();
    let mut events = source.subscribe(PATH, LeaseMode::Rotate).await?;
    next_kind(&mut events).await;

    // agent has not rotated yet: nothing to report
    source.request_rotation(PATH).await?;
    assert!(next_kind(&mut events).await.is_none());

    file.write("lease-b", "v-app-b", 3600)?;
    source.request_rotation(PATH).await?;

    match next_kind(&mut events).await {
        Some(LeaseEventKind::Rotated(creds)) => assert_eq!(creds.lease_id(), "lease-b"),
        other => panic!("expected Rotated, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_renewal_request_reports_renewed_lease() -> Result<()> {
    let file = LeaseFile::new();
    file.write("lease-a", "v-app-a", 600)?;
    let source = file.source();
    let mut events = source.subscribe(PATH, LeaseMode::Renew).await?;
    next_kind(&mut events).await;

    file.write("lease-a", "v-app-a", 1200)?;
    source.request_renewal(PATH).await?;

    match next_kind(&mut events).await {
        Some(LeaseEventKind::Renewed { lease_id, ttl }) => {
            assert_eq!(lease_id, "lease-a");
            assert_eq!(ttl, Duration::from_secs(1200));
        }
        other => panic!("expected Renewed, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_lease_expires_without_replacement() -> Result<()> {
    let file = LeaseFile::new();
    file.write("lease-short", "v-app-s", 1)?;
    let source = file.source();
    let mut events = source.subscribe(PATH, LeaseMode::Renew).await?;
    next_kind(&mut events).await;

    let event = tokio::time::timeout(Duration::from_secs(3), events.next()).await?;
    assert!(matches!(event.map(|e| e.kind), Some(LeaseEventKind::Expired)));
    Ok(())
}

#[tokio::test]
async fn test_lease_files_can_be_added_after_subscribing() -> Result<()> {
    let first = LeaseFile::new();
    first.write("lease-a", "v-app-a", 1)?;
    let second = LeaseFile::new();
    second.write("lease-r", "v-app-r", 3600)?;

    let mut source = first.source();
    let mut events = source.subscribe(PATH, LeaseMode::Rotate).await?;
    next_kind(&mut events).await;

    // the first subscription already armed an expiry timer
    source.add_lease_file("database/creds/report-role", &second.path);
    let mut reports = source.subscribe("database/creds/report-role", LeaseMode::Rotate).await?;

    match next_kind(&mut reports).await {
        Some(LeaseEventKind::Issued(creds)) => assert_eq!(creds.lease_id(), "lease-r"),
        other => panic!("expected Issued, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_path_and_bad_file_are_errors() -> Result<()> {
    let file = LeaseFile::new();
    std::fs::write(&file.path, b"{ not json")?;
    let source = file.source();

    assert!(matches!(
        source.subscribe("database/creds/other", LeaseMode::Rotate).await,
        Err(SourceError::UnknownPath(_))
    ));
    assert!(matches!(
        source.subscribe(PATH, LeaseMode::Rotate).await,
        Err(SourceError::Unavailable { .. })
    ));
    Ok(())
}
