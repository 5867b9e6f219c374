use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::policy::mime_for_name;
use courier_core::{FileMeta, Notification, NotificationKind};
use courier_pipeline::{Composition, DeliveryError, StoreUploader, UploadSummary};
use courier_store::{manifest_key, ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CliConfig;

/// Written to `compositions/<id>/manifest.json` once every file is uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub composition_id: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub storage_path: String,
}

#[derive(Debug)]
pub struct RunReport {
    pub composition_id: String,
    /// `(file, reason)` for every file refused by the allow-list or unreadable.
    pub rejected: Vec<(String, String)>,
    pub uploads: UploadSummary,
    pub manifest_key: Option<String>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.rejected.is_empty() && self.uploads.all_succeeded() && self.manifest_key.is_some()
    }
}

/// Add, upload and deliver `config.files` as a single composition.
pub async fn run(config: &CliConfig, objects: Arc<dyn ObjectStore>) -> Result<RunReport> {
    let pipeline = config.pipeline_config()?;
    let composition = Composition::new(config.composition_id(), &pipeline);
    let composition_id = composition.id().to_string();
    let logger = spawn_notification_logger(&composition);

    let mut rejected = Vec::new();
    for path in &config.files {
        let shown = path.display().to_string();
        match read_file(path).await {
            Ok(meta) => match composition.add(meta) {
                Ok(att) => info!("added {} as {} ({})", shown, att.id, att.mime_type),
                Err(e) => {
                    warn!("rejected {shown}: {e}");
                    rejected.push((shown, e.to_string()));
                }
            },
            Err(e) => {
                error!("{e:#}");
                rejected.push((shown, format!("{e:#}")));
            }
        }
    }

    let uploader = Arc::new(StoreUploader::new(objects.clone(), composition_id.clone()));
    let uploads = composition.upload_pending(uploader.clone()).await;
    info!(
        "uploads finished: {} succeeded, {} failed, {} skipped, {} abandoned",
        uploads.succeeded.len(),
        uploads.failed.len(),
        uploads.skipped.len(),
        uploads.abandoned.len()
    );

    let manifest_key = if composition.store().is_empty() {
        warn!("nothing to deliver for {composition_id}");
        None
    } else if !uploads.all_succeeded() {
        let discarded = composition.discard_unsent(uploader.as_ref()).await;
        warn!("not delivering {composition_id}: uploads failed, {discarded} attachments discarded");
        None
    } else {
        deliver(&composition, objects).await
    };

    drop(composition);
    // The notifier closes with the composition; let the logger drain.
    let _ = logger.await;

    Ok(RunReport {
        composition_id,
        rejected,
        uploads,
        manifest_key,
    })
}

async fn read_file(path: &Path) -> Result<FileMeta> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(FileMeta::from_bytes(
        name.clone(),
        mime_for_name(&name),
        data.into(),
    ))
}

async fn deliver(composition: &Composition, objects: Arc<dyn ObjectStore>) -> Option<String> {
    let key = manifest_key(composition.id());
    let attachments = composition.store().list();
    let composition_id = composition.id().to_string();
    let manifest_at = key.clone();

    let sent = composition
        .send(|paths| async move {
            let manifest = Manifest {
                composition_id,
                created_at: Utc::now(),
                attachments: attachments
                    .into_iter()
                    .zip(paths)
                    .map(|(att, storage_path)| ManifestEntry {
                        name: att.name,
                        mime_type: att.mime_type,
                        size_bytes: att.size_bytes,
                        storage_path,
                    })
                    .collect(),
            };
            let body = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| StoreError::Internal(format!("encode manifest: {e}")))?;
            objects.put(&manifest_at, body.into()).await
        })
        .await;

    match sent {
        Ok(()) => {
            info!("delivered manifest to {key}");
            Some(key)
        }
        Err(DeliveryError::Send(e)) => {
            error!("writing manifest {key} failed: {e}");
            None
        }
        Err(e) => {
            error!("cannot deliver {}: {e}", composition.id());
            None
        }
    }
}

fn spawn_notification_logger(composition: &Composition) -> JoinHandle<()> {
    let mut notes = composition.notifications();
    tokio::spawn(async move {
        loop {
            match notes.recv().await {
                Ok(note) => log_notification(&note),
                Err(RecvError::Lagged(n)) => warn!("{n} notifications dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_notification(note: &Notification) {
    let text = match &note.description {
        Some(description) => format!("{}: {description}", note.message),
        None => note.message.clone(),
    };
    match note.kind {
        NotificationKind::Error => error!("{text}"),
        NotificationKind::Warning => warn!("{text}"),
        NotificationKind::Success | NotificationKind::Info => info!("{text}"),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use courier_store::{LocalStore, StoreConfig};

    use super::*;

    fn local(dir: &Path) -> Arc<dyn ObjectStore> {
        let config = StoreConfig::default().with_local_dir(dir.to_string_lossy());
        Arc::new(LocalStore::new(&config))
    }

    #[tokio::test]
    async fn uploads_and_writes_manifest() {
        let input = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let pdf = input.path().join("invoice.pdf");
        let csv = input.path().join("emissions.csv");
        std::fs::write(&pdf, b"%PDF-1.7 body").unwrap();
        std::fs::write(&csv, b"scope,tco2e\n1,12.5\n").unwrap();

        let config = CliConfig::try_parse_from([
            "courier",
            "--composition",
            "msg-1",
            pdf.to_str().unwrap(),
            csv.to_str().unwrap(),
        ])
        .unwrap();
        let objects = local(data.path());

        let report = run(&config, objects.clone()).await.unwrap();

        assert!(report.success(), "{report:?}");
        assert_eq!(report.manifest_key.as_deref(), Some("compositions/msg-1/manifest.json"));
        let raw = objects.get("compositions/msg-1/manifest.json").await.unwrap();
        let manifest: Manifest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(manifest.composition_id, "msg-1");
        let names: Vec<_> = manifest.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["invoice.pdf", "emissions.csv"]);
        assert_eq!(manifest.attachments[1].mime_type, "text/csv");
        for entry in &manifest.attachments {
            assert!(objects.get(&entry.storage_path).await.is_ok());
        }
    }

    #[tokio::test]
    async fn rejected_file_fails_the_run_but_uploads_the_rest() {
        let input = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let ok = input.path().join("notes.txt");
        let bad = input.path().join("setup.exe");
        std::fs::write(&ok, b"hello").unwrap();
        std::fs::write(&bad, b"MZ").unwrap();
        let missing = input.path().join("gone.pdf");

        let config = CliConfig::try_parse_from([
            "courier",
            ok.to_str().unwrap(),
            bad.to_str().unwrap(),
            missing.to_str().unwrap(),
        ])
        .unwrap();

        let report = run(&config, local(data.path())).await.unwrap();

        assert!(!report.success());
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.uploads.succeeded.len(), 1);
        assert!(report.manifest_key.is_some());
    }
}
