use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::warn;

use crate::config::BackendConfig;
use crate::error::{OcppgError, Result};
use crate::forwarding::ForwardRecord;

/// The external system that owns business state.
///
/// `deliver` receives every forwarded envelope. `reply_for` may supply a
/// business-specific reply payload for an inbound Call; `None` means the
/// gateway answers with its protocol default.
#[async_trait]
pub trait SystemOfRecord: Send + Sync + 'static {
    async fn deliver(&self, record: &ForwardRecord) -> Result<()>;

    async fn reply_for(
        &self,
        _identity: &str,
        _action: &str,
        _payload: &Value,
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSystemOfRecord;

#[async_trait]
impl SystemOfRecord for NullSystemOfRecord {
    async fn deliver(&self, _record: &ForwardRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    identity: &'a str,
    payload: &'a Value,
}

/// System of record reached over HTTP.
///
/// Records are POSTed to `{base_url}/messages`. Reply lookups POST to
/// `{base_url}/replies/{action}` and expect `200` with a JSON payload or
/// `204` for "use the default".
#[derive(Debug, Clone)]
pub struct HttpSystemOfRecord {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSystemOfRecord {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SystemOfRecord for HttpSystemOfRecord {
    async fn deliver(&self, record: &ForwardRecord) -> Result<()> {
        let url = format!("{}/messages", self.base_url);
        let resp = self.client.post(&url).json(record).send().await?;
        if !resp.status().is_success() {
            return Err(OcppgError::Delivery(format!("{} returned {}", url, resp.status())));
        }
        Ok(())
    }

    async fn reply_for(&self, identity: &str, action: &str, payload: &Value) -> Result<Option<Value>> {
        let url = format!("{}/replies/{}", self.base_url, action);
        let resp = self
            .client
            .post(&url)
            .json(&ReplyRequest { identity, payload })
            .send()
            .await?
            .error_for_status()?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(resp.json::<Value>().await?))
    }
}

/// Policy for when journal writes are synced to disk.
#[derive(Debug, Clone)]
pub enum DurabilityPolicy {
    /// Sync after every record
    Always,
    /// Sync at most once per interval (milliseconds)
    IntervalMs(u64),
    /// Leave syncing to the OS
    Disabled,
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub directory: PathBuf,
    pub channel_capacity: usize,
    pub batch_max: usize,
    pub flush_interval_ms: u64,
    pub durability: DurabilityPolicy,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/journal"),
            channel_capacity: 8192,
            batch_max: 1024,
            flush_interval_ms: 50,
            durability: DurabilityPolicy::IntervalMs(500),
        }
    }
}

/// Append-only JSON-Lines journal, one file per charge point.
///
/// Useful as a local system of record when no backend is reachable.
#[derive(Clone)]
pub struct JournalSystemOfRecord {
    tx: mpsc::Sender<ForwardRecord>,
    cfg: JournalConfig,
}

impl JournalSystemOfRecord {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::new_with_config(JournalConfig {
            directory: directory.into(),
            ..JournalConfig::default()
        })
    }

    pub fn new_with_config(cfg: JournalConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<ForwardRecord>(cfg.channel_capacity);
        let cfg_clone = cfg.clone();
        tokio::spawn(async move {
            if let Err(e) = fs::create_dir_all(&cfg_clone.directory).await {
                warn!(directory = %cfg_clone.directory.display(), error = %e, "cannot create journal directory");
            }
            let mut queue: VecDeque<ForwardRecord> = VecDeque::with_capacity(cfg_clone.batch_max);
            let mut ticker = time::interval(Duration::from_millis(cfg_clone.flush_interval_ms));
            let mut last_sync = Instant::now();

            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(rec) => queue.push_back(rec),
                            None => {
                                flush_batch(&cfg_clone, &mut queue, &mut last_sync).await;
                                break;
                            }
                        }
                        if queue.len() >= cfg_clone.batch_max {
                            flush_batch(&cfg_clone, &mut queue, &mut last_sync).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if !queue.is_empty() {
                            flush_batch(&cfg_clone, &mut queue, &mut last_sync).await;
                        }
                    }
                }
            }
        });
        Self { tx, cfg }
    }

    pub fn journal_path(&self, identity: &str) -> PathBuf {
        self.cfg.directory.join(format!("{}.jsonl", sanitize(identity)))
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

async fn flush_batch(cfg: &JournalConfig, queue: &mut VecDeque<ForwardRecord>, last_sync: &mut Instant) {
    while let Some(rec) = queue.pop_front() {
        if let Err(e) = append_record(cfg, &rec, last_sync).await {
            warn!(identity = %rec.identity, message_id = %rec.message_id, error = %e, "journal write failed");
        }
    }
}

async fn append_record(cfg: &JournalConfig, rec: &ForwardRecord, last_sync: &mut Instant) -> Result<()> {
    let path = cfg.directory.join(format!("{}.jsonl", sanitize(&rec.identity)));
    let mut f = OpenOptions::new().create(true).append(true).open(&path).await?;
    let mut line = serde_json::to_vec(rec)?;
    line.push(b'\n');
    f.write_all(&line).await?;

    match cfg.durability {
        DurabilityPolicy::Always => f.sync_data().await?,
        DurabilityPolicy::IntervalMs(ms) => {
            if last_sync.elapsed() >= Duration::from_millis(ms) {
                f.sync_data().await?;
                *last_sync = Instant::now();
            }
        }
        DurabilityPolicy::Disabled => {}
    }
    Ok(())
}

#[async_trait]
impl SystemOfRecord for JournalSystemOfRecord {
    async fn deliver(&self, record: &ForwardRecord) -> Result<()> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| OcppgError::Delivery("journal writer stopped".into()))
    }
}

/// Builds the system of record named by the configuration.
pub fn make_backend(cfg: &BackendConfig, request_timeout: Duration) -> Result<Arc<dyn SystemOfRecord>> {
    Ok(match cfg {
        BackendConfig::Disabled => Arc::new(NullSystemOfRecord),
        BackendConfig::Journal { directory } => Arc::new(JournalSystemOfRecord::new(directory.clone())),
        BackendConfig::Http { base_url } => Arc::new(HttpSystemOfRecord::new(base_url.clone(), request_timeout)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::Direction;
    use crate::protocol::{encode, Message};
    use serde_json::json;

    fn record(identity: &str, id: &str) -> ForwardRecord {
        let msg = Message::call(id, "StatusNotification", json!({"connectorId": 1}));
        ForwardRecord::new(identity, Direction::Inbound, &msg, None, encode(&msg))
    }

    #[tokio::test]
    async fn journal_appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("ocppg-journal-{}", uuid::Uuid::new_v4()));
        let journal = JournalSystemOfRecord::new_with_config(JournalConfig {
            directory: dir.clone(),
            flush_interval_ms: 5,
            durability: DurabilityPolicy::Always,
            ..JournalConfig::default()
        });

        journal.deliver(&record("CP/001", "a")).await.unwrap();
        journal.deliver(&record("CP/001", "b")).await.unwrap();

        let path = journal.journal_path("CP/001");
        assert!(path.ends_with("CP_001.jsonl"));
        let mut lines = Vec::new();
        for _ in 0..200 {
            if let Ok(content) = fs::read_to_string(&path).await {
                lines = content.lines().map(str::to_string).collect();
                if lines.len() == 2 {
                    break;
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lines.len(), 2);
        let first: ForwardRecord = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.message_id, "a");
        assert_eq!(first.action.as_deref(), Some("StatusNotification"));

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn null_backend_has_no_reply_opinion() {
        let backend = NullSystemOfRecord;
        backend.deliver(&record("CP-1", "x")).await.unwrap();
        assert!(backend.reply_for("CP-1", "Authorize", &json!({})).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn make_backend_builds_configured_kind() {
        let http = make_backend(
            &BackendConfig::Http { base_url: "http://127.0.0.1:1/".into() },
            Duration::from_millis(200),
        )
        .unwrap();
        // Nothing listens on port 1, so the single attempt fails.
        assert!(http.deliver(&record("CP-1", "x")).await.is_err());
        assert!(make_backend(&BackendConfig::Disabled, Duration::from_secs(1)).is_ok());
    }
}
