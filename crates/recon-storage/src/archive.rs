use std::path::{Path, PathBuf};

use anyhow::Context;
use recon_core::SyncResult;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Writes one JSON document per sync run under `<root>/<YYYYMMDD>/<request_id>.json`.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn report_relative_path(result: &SyncResult) -> PathBuf {
        PathBuf::from(result.timestamp.format("%Y%m%d").to_string())
            .join(format!("{}.json", result.request_id))
    }

    /// Temp-file write followed by rename, so readers never see a partial report.
    pub async fn store_report(&self, result: &SyncResult) -> anyhow::Result<StoredReport> {
        let relative_path = Self::report_relative_path(result);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(result).context("serializing sync report")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredReport {
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use recon_core::{SyncStage, SyncStats};
    use tempfile::tempdir;

    fn sample_result() -> SyncResult {
        SyncResult {
            request_id: Uuid::new_v4(),
            timestamp: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            scope: Some("alice".into()),
            stage: SyncStage::Reported,
            stats: SyncStats {
                inserted: 2,
                ..SyncStats::default()
            },
            error_details: vec![],
            warnings: vec![],
            error: None,
            failed_stage: None,
            duration_seconds: 0.25,
        }
    }

    #[tokio::test]
    async fn reports_land_under_day_directory() {
        let dir = tempdir().expect("tempdir");
        let archive = ReportArchive::new(dir.path());
        let result = sample_result();

        let stored = archive.store_report(&result).await.expect("store");
        assert_eq!(
            stored.relative_path,
            PathBuf::from("20260224").join(format!("{}.json", result.request_id))
        );
        assert!(stored.absolute_path.exists());

        let raw = std::fs::read_to_string(&stored.absolute_path).expect("read");
        let parsed: SyncResult = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.stats.inserted, 2);
        assert_eq!(parsed.scope.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let dir = tempdir().expect("tempdir");
        let archive = ReportArchive::new(dir.path());
        archive.store_report(&sample_result()).await.expect("store");

        let day = dir.path().join("20260224");
        let leftovers = std::fs::read_dir(day)
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
