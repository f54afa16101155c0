//! Snapshot persistence + HTTP fetch utilities for the Zazi iZandi toolkit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "zazi-storage";

/// Format used for the timestamp segment of snapshot file names.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Paths produced by one snapshot write. The timestamped file is
/// authoritative; `latest` is a cache and may go stale if a crash lands
/// between the two writes.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub timestamped: PathBuf,
    pub latest: PathBuf,
}

/// File store for the pipeline's CSV snapshot outputs.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mentor_visit_dir(&self) -> PathBuf {
        self.root.join("mentor_visit_tracker")
    }

    pub fn parquet_dir(&self) -> PathBuf {
        self.root.join("parquet")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Write a timestamped snapshot plus its rolling `latest` twin under
    /// `mentor_visit_tracker/`. Writes are atomic per file (temp + rename)
    /// but not transactional across the pair.
    pub async fn write_snapshot_pair(
        &self,
        stem: &str,
        latest_name: &str,
        written_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<SnapshotPaths> {
        let dir = self.mentor_visit_dir();
        let stamp = written_at.format(SNAPSHOT_TIMESTAMP_FORMAT).to_string();
        let timestamped = dir.join(format!("{stem}_{stamp}.csv"));
        let latest = dir.join(latest_name);

        write_atomic(&timestamped, bytes).await?;
        write_atomic(&latest, bytes).await?;

        Ok(SnapshotPaths { timestamped, latest })
    }

    /// Resolve the rolling `latest` snapshot path, if one has been written.
    pub fn latest_snapshot(&self, latest_name: &str) -> Option<PathBuf> {
        let path = self.mentor_visit_dir().join(latest_name);
        path.exists().then_some(path)
    }
}

/// Write bytes via a temp file in the destination directory followed by a
/// rename, so readers never observe a half-written snapshot.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = dest
        .parent()
        .with_context(|| format!("snapshot path {} has no parent", dest.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp snapshot {} -> {}",
                temp_path.display(),
                dest.display()
            )
        });
    }
    Ok(())
}

/// Serialize a header plus rows of nullable cells into CSV bytes. A `None`
/// cell becomes an empty field, which is how nulls round-trip through the
/// snapshot files.
pub fn csv_bytes(header: &[&str], rows: &[Vec<Option<String>>]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header).context("writing CSV header")?;
    for row in rows {
        let record: Vec<&str> = row.iter().map(|cell| cell.as_deref().unwrap_or("")).collect();
        writer.write_record(&record).context("writing CSV row")?;
    }
    writer
        .into_inner()
        .context("flushing CSV writer")
}

/// Read a CSV snapshot back into a header and nullable rows. Empty fields
/// come back as `None`, the inverse of [`csv_bytes`].
pub fn read_csv_table(path: &Path) -> anyhow::Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening CSV snapshot {}", path.display()))?;
    let header = reader
        .headers()
        .with_context(|| format!("reading CSV header {}", path.display()))?
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading CSV row {}", path.display()))?;
        rows.push(
            record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect(),
        );
    }
    Ok((header, rows))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub bearer_token: Option<String>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            bearer_token: None,
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Blocking-per-request HTTP client. One outstanding request at a time; the
/// pipeline fetches pages sequentially and ordering is preserved by the
/// caller, so there is no concurrency control here.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn csv_bytes_round_trips_nulls_as_empty_fields() {
        let rows = vec![
            vec![Some("M001".to_string()), Some("Grade 1".to_string()), None],
            vec![Some("M002".to_string()), None, Some("12".to_string())],
        ];
        let bytes = csv_bytes(&["Mcode", "Grade", "Letters Known"], &rows).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, &bytes).unwrap();

        let (header, read_rows) = read_csv_table(&path).unwrap();
        assert_eq!(header, vec!["Mcode", "Grade", "Letters Known"]);
        assert_eq!(read_rows, rows);
    }

    #[tokio::test]
    async fn snapshot_pair_writes_timestamped_and_latest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let written_at = DateTime::parse_from_rfc3339("2026-03-02T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let paths = store
            .write_snapshot_pair("survey612_old", "latest_old.csv", written_at, b"a,b\n1,2\n")
            .await
            .unwrap();

        assert!(paths
            .timestamped
            .ends_with("mentor_visit_tracker/survey612_old_20260302_083000.csv"));
        assert!(paths.latest.ends_with("mentor_visit_tracker/latest_old.csv"));
        assert_eq!(std::fs::read(&paths.timestamped).unwrap(), b"a,b\n1,2\n");
        assert_eq!(std::fs::read(&paths.latest).unwrap(), b"a,b\n1,2\n");
        assert_eq!(
            store.latest_snapshot("latest_old.csv").unwrap(),
            paths.latest
        );
    }

    #[tokio::test]
    async fn latest_snapshot_is_overwritten_by_newer_runs() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let first = DateTime::parse_from_rfc3339("2026-03-02T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let second = DateTime::parse_from_rfc3339("2026-03-02T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        store
            .write_snapshot_pair("survey677_new", "latest_new.csv", first, b"old")
            .await
            .unwrap();
        let paths = store
            .write_snapshot_pair("survey677_new", "latest_new.csv", second, b"new")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&paths.latest).unwrap(), b"new");
        // Both timestamped files survive; they are the authoritative history.
        assert!(store
            .mentor_visit_dir()
            .join("survey677_new_20260302_083000.csv")
            .exists());
        assert!(store
            .mentor_visit_dir()
            .join("survey677_new_20260302_093000.csv")
            .exists());
    }
}
