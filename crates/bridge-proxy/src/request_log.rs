//! Per-request audit rows.
//!
//! Every inbound request produces exactly one [`LoggedRequest`] row. The row
//! is created when the request arrives, gains its outbound descriptor when a
//! forwarder sends it on, and is finalized by its response. A finalized row
//! is never changed again.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::{RequestLogKind, RequestLogSettings};
use crate::error::{ProxyError, ProxyResult};
use crate::model::{RequestDescriptor, RequestSource, ResponseDescriptor};

/// Identifier of a log row.
pub type RowId = u64;

const CHANNEL_BUFFER: usize = 1024;
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// One request as stored for the analytics surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedRequest {
    /// Row id.
    pub id: RowId,
    /// Side the request came from.
    pub source: RequestSource,
    /// Homeserver involved, once resolved.
    pub homeserver_id: Option<String>,
    /// Bridge involved, once resolved.
    pub bridge_id: Option<String>,
    /// Inbound method.
    pub method: String,
    /// Inbound path, without the source prefix.
    pub path: String,
    /// Inbound request as received.
    pub inbound_request: RequestDescriptor,
    /// Request as forwarded; an array when a transaction fanned out.
    pub outbound_request: Option<Value>,
    /// Response body returned to the caller.
    pub response: Option<Value>,
    /// Response status returned to the caller.
    pub response_status: Option<u16>,
    /// When the request arrived.
    pub inbound_at: DateTime<Utc>,
    /// When the request was forwarded.
    pub outbound_at: Option<DateTime<Utc>>,
    /// When the response was attached.
    pub response_at: Option<DateTime<Utc>>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl LoggedRequest {
    /// Whether the response has been attached.
    pub fn is_finalized(&self) -> bool {
        self.response_at.is_some()
    }
}

/// Fields known when a request arrives.
#[derive(Debug, Clone)]
pub struct NewRequestRow {
    /// Side the request came from.
    pub source: RequestSource,
    /// Inbound method.
    pub method: String,
    /// Inbound path.
    pub path: String,
    /// Inbound request descriptor.
    pub inbound_request: RequestDescriptor,
    /// Arrival time.
    pub inbound_at: DateTime<Utc>,
}

/// Fields known once a request is forwarded.
#[derive(Debug, Clone, Default)]
pub struct OutboundRecord {
    /// Bridge the request involves.
    pub bridge_id: Option<String>,
    /// Homeserver the request involves.
    pub homeserver_id: Option<String>,
    /// Outbound descriptor, or an array of descriptors.
    pub request: Value,
}

/// Filter for the read path. Results are returned newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestFilter {
    /// Only rows from this source.
    pub source: Option<RequestSource>,
    /// Only rows involving this bridge.
    pub bridge_id: Option<String>,
    /// Only rows involving this homeserver.
    pub homeserver_id: Option<String>,
    /// Lowest response status, inclusive.
    pub status_min: Option<u16>,
    /// Highest response status, inclusive.
    pub status_max: Option<u16>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl RequestFilter {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a source.
    #[must_use]
    pub fn source(mut self, source: RequestSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Restrict to a bridge.
    #[must_use]
    pub fn bridge(mut self, bridge_id: impl Into<String>) -> Self {
        self.bridge_id = Some(bridge_id.into());
        self
    }

    /// Restrict to a homeserver.
    #[must_use]
    pub fn homeserver(mut self, homeserver_id: impl Into<String>) -> Self {
        self.homeserver_id = Some(homeserver_id.into());
        self
    }

    /// Restrict to response statuses in `min..=max`.
    #[must_use]
    pub fn status_range(mut self, min: u16, max: u16) -> Self {
        self.status_min = Some(min);
        self.status_max = Some(max);
        self
    }

    /// Return at most `limit` rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` passes the filter.
    pub fn matches(&self, row: &LoggedRequest) -> bool {
        if self.source.is_some_and(|s| s != row.source) {
            return false;
        }
        if self.bridge_id.is_some() && self.bridge_id != row.bridge_id {
            return false;
        }
        if self.homeserver_id.is_some() && self.homeserver_id != row.homeserver_id {
            return false;
        }
        if self.status_min.is_some() || self.status_max.is_some() {
            let Some(status) = row.response_status else {
                return false;
            };
            if self.status_min.is_some_and(|min| status < min)
                || self.status_max.is_some_and(|max| status > max)
            {
                return false;
            }
        }
        true
    }
}

/// Sink for request rows.
#[async_trait]
pub trait RequestLogger: Send + Sync + fmt::Debug {
    /// Write the initial row and return its id.
    async fn create_initial(&self, row: NewRequestRow) -> ProxyResult<RowId>;

    /// Record the outbound request.
    async fn update_outbound(&self, id: RowId, outbound: OutboundRecord) -> ProxyResult<()>;

    /// Record the response and finalize the row.
    async fn update_response(&self, id: RowId, response: ResponseDescriptor) -> ProxyResult<()>;

    /// Rows matching `filter`, newest first.
    async fn query(&self, filter: &RequestFilter) -> ProxyResult<Vec<LoggedRequest>>;

    /// A single row.
    async fn get(&self, id: RowId) -> ProxyResult<Option<LoggedRequest>>;
}

/// Build the logger the settings ask for.
///
/// The returned handle belongs to the jsonl writer task, if one was started.
pub async fn from_settings(
    settings: &RequestLogSettings,
) -> ProxyResult<(std::sync::Arc<dyn RequestLogger>, Option<JoinHandle<()>>)> {
    match (settings.kind, &settings.path) {
        (RequestLogKind::Jsonl, Some(path)) => {
            let (logger, handle) = JsonlRequestLogger::start(path, settings.max_rows).await?;
            Ok((std::sync::Arc::new(logger), Some(handle)))
        }
        (RequestLogKind::Jsonl, None) => Err(ProxyError::configuration(
            "request_log.path is required for the jsonl request log",
        )),
        (RequestLogKind::Memory, _) => Ok((
            std::sync::Arc::new(MemoryRequestLogger::with_max_rows(settings.max_rows)),
            None,
        )),
    }
}

/// Rows kept in process memory, bounded to the newest `max_rows`.
#[derive(Debug)]
pub struct MemoryRequestLogger {
    rows: DashMap<RowId, LoggedRequest>,
    next_id: AtomicU64,
    oldest: AtomicU64,
    max_rows: usize,
}

impl Default for MemoryRequestLogger {
    fn default() -> Self {
        Self::with_max_rows(RequestLogSettings::default().max_rows)
    }
}

impl MemoryRequestLogger {
    /// Create an empty logger with the default bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty logger keeping at most `max_rows` rows.
    pub fn with_max_rows(max_rows: usize) -> Self {
        Self::starting_at(1, max_rows)
    }

    fn starting_at(first_id: RowId, max_rows: usize) -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicU64::new(first_id),
            oldest: AtomicU64::new(first_id),
            max_rows,
        }
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are held.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn insert(&self, row: NewRequestRow) -> LoggedRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let logged = LoggedRequest {
            id,
            source: row.source,
            homeserver_id: None,
            bridge_id: None,
            method: row.method,
            path: row.path,
            inbound_request: row.inbound_request,
            outbound_request: None,
            response: None,
            response_status: None,
            inbound_at: row.inbound_at,
            outbound_at: None,
            response_at: None,
            created_at: Utc::now(),
        };
        self.rows.insert(id, logged.clone());

        while self.rows.len() > self.max_rows {
            let evicted = self.oldest.fetch_add(1, Ordering::SeqCst);
            if evicted >= id {
                break;
            }
            self.rows.remove(&evicted);
        }
        logged
    }

    fn apply(
        &self,
        id: RowId,
        update: impl FnOnce(&mut LoggedRequest),
    ) -> ProxyResult<LoggedRequest> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| ProxyError::storage(format!("request row {id} not found")))?;
        if row.is_finalized() {
            return Err(ProxyError::storage(format!(
                "request row {id} is already finalized"
            )));
        }
        update(&mut *row);
        Ok(row.value().clone())
    }

    fn outbound(&self, id: RowId, outbound: OutboundRecord) -> ProxyResult<LoggedRequest> {
        self.apply(id, |row| {
            if outbound.bridge_id.is_some() {
                row.bridge_id = outbound.bridge_id;
            }
            if outbound.homeserver_id.is_some() {
                row.homeserver_id = outbound.homeserver_id;
            }
            row.outbound_request = Some(outbound.request);
            row.outbound_at = Some(Utc::now());
        })
    }

    fn response(&self, id: RowId, response: ResponseDescriptor) -> ProxyResult<LoggedRequest> {
        self.apply(id, |row| {
            row.response_status = Some(response.status);
            row.response = response.body;
            row.response_at = Some(Utc::now());
        })
    }

    fn select(&self, filter: &RequestFilter) -> Vec<LoggedRequest> {
        let mut rows: Vec<LoggedRequest> = self
            .rows
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }
}

#[async_trait]
impl RequestLogger for MemoryRequestLogger {
    async fn create_initial(&self, row: NewRequestRow) -> ProxyResult<RowId> {
        Ok(self.insert(row).id)
    }

    async fn update_outbound(&self, id: RowId, outbound: OutboundRecord) -> ProxyResult<()> {
        self.outbound(id, outbound).map(|_| ())
    }

    async fn update_response(&self, id: RowId, response: ResponseDescriptor) -> ProxyResult<()> {
        self.response(id, response).map(|_| ())
    }

    async fn query(&self, filter: &RequestFilter) -> ProxyResult<Vec<LoggedRequest>> {
        Ok(self.select(filter))
    }

    async fn get(&self, id: RowId) -> ProxyResult<Option<LoggedRequest>> {
        Ok(self.rows.get(&id).map(|r| r.value().clone()))
    }
}

/// Appends a snapshot of the row to a JSON-lines file on every change.
///
/// Readers of the file keep the last line per `id`. Reads through
/// [`RequestLogger::query`] are served from an in-memory index.
#[derive(Debug)]
pub struct JsonlRequestLogger {
    index: MemoryRequestLogger,
    tx: mpsc::Sender<LoggedRequest>,
}

impl JsonlRequestLogger {
    /// Open `path` for appending and spawn the writer task.
    ///
    /// The task exits after a final flush once the logger is dropped.
    pub async fn start(
        path: impl AsRef<Path>,
        max_rows: usize,
    ) -> ProxyResult<(Self, JoinHandle<()>)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProxyError::storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let last_id = last_row_id(path).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| ProxyError::storage(format!("failed to open {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let handle = tokio::spawn(run_writer(file, rx));

        Ok((
            Self {
                index: MemoryRequestLogger::starting_at(last_id + 1, max_rows),
                tx,
            },
            handle,
        ))
    }

    async fn append(&self, row: LoggedRequest) {
        if let Err(e) = self.tx.send(row).await {
            warn!(row_id = e.0.id, "request log writer closed, row snapshot dropped");
        }
    }
}

#[async_trait]
impl RequestLogger for JsonlRequestLogger {
    async fn create_initial(&self, row: NewRequestRow) -> ProxyResult<RowId> {
        let row = self.index.insert(row);
        let id = row.id;
        self.append(row).await;
        Ok(id)
    }

    async fn update_outbound(&self, id: RowId, outbound: OutboundRecord) -> ProxyResult<()> {
        let row = self.index.outbound(id, outbound)?;
        self.append(row).await;
        Ok(())
    }

    async fn update_response(&self, id: RowId, response: ResponseDescriptor) -> ProxyResult<()> {
        let row = self.index.response(id, response)?;
        self.append(row).await;
        Ok(())
    }

    async fn query(&self, filter: &RequestFilter) -> ProxyResult<Vec<LoggedRequest>> {
        Ok(self.index.select(filter))
    }

    async fn get(&self, id: RowId) -> ProxyResult<Option<LoggedRequest>> {
        self.index.get(id).await
    }
}

/// Highest row id already written to `path`, or 0 for a new file.
///
/// Lines that do not parse (a torn final write, for one) are skipped.
async fn last_row_id(path: &Path) -> ProxyResult<RowId> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: RowId,
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(ProxyError::storage(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut last = 0;
    let mut skipped = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ProxyError::storage(format!("failed to read {}: {e}", path.display())))?
    {
        match serde_json::from_str::<IdOnly>(&line) {
            Ok(row) => last = last.max(row.id),
            Err(_) if line.trim().is_empty() => {}
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "unreadable lines in request log");
    }
    Ok(last)
}

async fn run_writer(mut file: tokio::fs::File, mut rx: mpsc::Receiver<LoggedRequest>) {
    let mut dirty = false;
    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(row)) => {
                let mut line = match serde_json::to_vec(&row) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(row_id = row.id, error = %e, "failed to serialize request row");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    error!(row_id = row.id, error = %e, "failed to append request row");
                    continue;
                }
                dirty = true;
            }
            Ok(None) => break,
            Err(_) => {
                if dirty {
                    if let Err(e) = file.flush().await {
                        error!(error = %e, "failed to flush request log");
                    }
                    dirty = false;
                }
            }
        }
    }
    if let Err(e) = file.flush().await {
        error!(error = %e, "failed to flush request log on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use serde_json::json;

    fn new_row(source: RequestSource, path: &str) -> NewRequestRow {
        NewRequestRow {
            source,
            method: "PUT".to_string(),
            path: path.to_string(),
            inbound_request: RequestDescriptor::new(
                &Method::PUT,
                path,
                path,
                &[],
                &HeaderMap::new(),
                None,
                0,
            ),
            inbound_at: Utc::now(),
        }
    }

    fn outbound(bridge: &str) -> OutboundRecord {
        OutboundRecord {
            bridge_id: Some(bridge.to_string()),
            homeserver_id: Some("local".to_string()),
            request: json!({"url": "http://bridge"}),
        }
    }

    #[tokio::test]
    async fn test_row_lifecycle() {
        let logger = MemoryRequestLogger::new();
        let id = logger
            .create_initial(new_row(RequestSource::Homeserver, "/_matrix/app/v1/ping"))
            .await
            .unwrap();

        let row = logger.get(id).await.unwrap().unwrap();
        assert!(row.outbound_request.is_none());
        assert!(row.response_status.is_none());

        logger.update_outbound(id, outbound("1")).await.unwrap();
        logger
            .update_response(id, ResponseDescriptor::from_body(200, b"{}"))
            .await
            .unwrap();

        let row = logger.get(id).await.unwrap().unwrap();
        assert_eq!(row.bridge_id.as_deref(), Some("1"));
        assert_eq!(row.response_status, Some(200));
        assert_eq!(row.response, Some(json!({})));
        assert!(row.outbound_at.is_some());
        assert!(row.is_finalized());
    }

    #[tokio::test]
    async fn test_finalized_rows_are_immutable() {
        let logger = MemoryRequestLogger::new();
        let id = logger
            .create_initial(new_row(RequestSource::Bridge, "/x"))
            .await
            .unwrap();
        logger
            .update_response(id, ResponseDescriptor { status: 404, body: None })
            .await
            .unwrap();

        assert!(logger.update_outbound(id, outbound("1")).await.is_err());
        assert!(logger
            .update_response(id, ResponseDescriptor { status: 200, body: None })
            .await
            .is_err());
        let row = logger.get(id).await.unwrap().unwrap();
        assert_eq!(row.response_status, Some(404));
        assert!(row.bridge_id.is_none());
    }

    #[tokio::test]
    async fn test_query_filters_newest_first() {
        let logger = MemoryRequestLogger::new();
        for (source, bridge, status) in [
            (RequestSource::Bridge, "1", 200),
            (RequestSource::Homeserver, "1", 502),
            (RequestSource::Homeserver, "2", 200),
            (RequestSource::Homeserver, "1", 200),
        ] {
            let id = logger.create_initial(new_row(source, "/p")).await.unwrap();
            logger.update_outbound(id, outbound(bridge)).await.unwrap();
            logger
                .update_response(id, ResponseDescriptor { status, body: None })
                .await
                .unwrap();
        }

        let rows = logger
            .query(&RequestFilter::new().source(RequestSource::Homeserver).bridge("1"))
            .await
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 2]);

        let rows = logger
            .query(&RequestFilter::new().status_range(500, 599))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].response_status, Some(502));

        let rows = logger.query(&RequestFilter::new().limit(2)).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 3]);
    }

    #[tokio::test]
    async fn test_oldest_rows_are_evicted() {
        let logger = MemoryRequestLogger::with_max_rows(2);
        for _ in 0..3 {
            logger
                .create_initial(new_row(RequestSource::Bridge, "/p"))
                .await
                .unwrap();
        }

        assert_eq!(logger.len(), 2);
        assert!(logger.get(1).await.unwrap().is_none());
        assert!(logger.get(3).await.unwrap().is_some());
    }

    #[test]
    fn test_row_shape() {
        let logger = MemoryRequestLogger::new();
        let row = logger.insert(new_row(RequestSource::Bridge, "/p"));
        let json = serde_json::to_value(&row).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();

        assert_eq!(
            keys,
            vec![
                "bridge_id",
                "created_at",
                "homeserver_id",
                "id",
                "inbound_at",
                "inbound_request",
                "method",
                "outbound_at",
                "outbound_request",
                "path",
                "response",
                "response_at",
                "response_status",
                "source",
            ]
        );
        assert_eq!(json["source"], "bridge");
    }

    #[tokio::test]
    async fn test_jsonl_appends_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("requests.jsonl");
        let (logger, handle) = JsonlRequestLogger::start(&path, 100).await.unwrap();

        let id = logger
            .create_initial(new_row(RequestSource::Bridge, "/p"))
            .await
            .unwrap();
        logger
            .update_response(id, ResponseDescriptor { status: 404, body: None })
            .await
            .unwrap();
        assert_eq!(logger.query(&RequestFilter::new()).await.unwrap().len(), 1);

        drop(logger);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<LoggedRequest> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].response_status.is_none());
        assert_eq!(lines[1].response_status, Some(404));
        assert_eq!(lines[1].id, id);
    }

    #[tokio::test]
    async fn test_jsonl_reopen_continues_row_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");

        let (logger, handle) = JsonlRequestLogger::start(&path, 100).await.unwrap();
        let first = logger
            .create_initial(new_row(RequestSource::Bridge, "/a"))
            .await
            .unwrap();
        drop(logger);
        handle.await.unwrap();

        let (logger, handle) = JsonlRequestLogger::start(&path, 100).await.unwrap();
        let second = logger
            .create_initial(new_row(RequestSource::Homeserver, "/b"))
            .await
            .unwrap();
        drop(logger);
        handle.await.unwrap();

        assert!(second > first);
        let ids: Vec<RowId> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<LoggedRequest>(l).unwrap().id)
            .collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_last_row_id_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        assert_eq!(last_row_id(&path).await.unwrap(), 0);

        std::fs::write(&path, "{\"id\":7}\n{\"id\":3}\n\n{\"id\":").unwrap();
        assert_eq!(last_row_id(&path).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_from_settings_selects_backend() {
        let (_, handle) = from_settings(&RequestLogSettings::default()).await.unwrap();
        assert!(handle.is_none());

        let settings = RequestLogSettings {
            kind: RequestLogKind::Jsonl,
            path: None,
            max_rows: 10,
        };
        assert!(from_settings(&settings).await.is_err());
    }
}
