//! Per-node telemetry stream listeners.
//!
//! One listener task per node holds an SSE connection open against the
//! node's telemetry endpoint, frames the byte stream into lines,
//! decodes report payloads and hands the batches to the pipeline. A
//! connection that fails, goes quiet or serves garbage is torn down
//! and retried with exponential backoff; a listener never takes the
//! process down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::ListenConfig;
use crate::decode::decode_report;
use crate::model::RawBatch;

/// Connection state of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Connecting => "connecting",
            ListenerState::Streaming => "streaming",
            ListenerState::Backoff => "backoff",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters for one listener.
#[derive(Debug, Clone, Copy)]
pub struct ListenerStatus {
    pub state: ListenerState,
    pub reports: u64,
    pub records: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            state: ListenerState::Connecting,
            reports: 0,
            records: 0,
            decode_errors: 0,
            reconnects: 0,
        }
    }
}

/// Sums across all listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerTotals {
    pub listeners: usize,
    pub streaming: usize,
    pub backoff: usize,
    pub reports: u64,
    pub records: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

/// Shared status board, keyed by node address.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    inner: DashMap<String, ListenerStatus>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a listener visible before its first connection attempt.
    pub fn register(&self, addr: &str) {
        self.inner.entry(addr.to_string()).or_default();
    }

    pub fn set_state(&self, addr: &str, state: ListenerState) {
        self.update(addr, |status| status.state = state);
    }

    pub fn add_report(&self, addr: &str, records: u64) {
        self.update(addr, |status| {
            status.reports += 1;
            status.records += records;
        });
    }

    pub fn add_decode_error(&self, addr: &str) {
        self.update(addr, |status| status.decode_errors += 1);
    }

    pub fn add_reconnect(&self, addr: &str) {
        self.update(addr, |status| status.reconnects += 1);
    }

    /// Copy of every listener's status, sorted by address.
    pub fn snapshot(&self) -> Vec<(String, ListenerStatus)> {
        let mut out: Vec<(String, ListenerStatus)> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn totals(&self) -> ListenerTotals {
        let mut totals = ListenerTotals::default();
        for entry in self.inner.iter() {
            totals.listeners += 1;
            match entry.state {
                ListenerState::Streaming => totals.streaming += 1,
                ListenerState::Backoff => totals.backoff += 1,
                ListenerState::Connecting | ListenerState::Stopped => {}
            }
            totals.reports += entry.reports;
            totals.records += entry.records;
            totals.decode_errors += entry.decode_errors;
            totals.reconnects += entry.reconnects;
        }
        totals
    }

    fn update(&self, addr: &str, f: impl FnOnce(&mut ListenerStatus)) {
        let mut entry = self.inner.entry(addr.to_string()).or_default();
        f(&mut entry);
    }
}

/// One node's stream listener.
pub struct StreamListener {
    addr: String,
    url: String,
    cfg: ListenConfig,
    http: reqwest::Client,
    out: mpsc::Sender<RawBatch>,
    catalog: Arc<Catalog>,
    registry: Arc<ListenerRegistry>,
    cancel: CancellationToken,
}

impl StreamListener {
    pub fn new(
        addr: String,
        cfg: ListenConfig,
        out: mpsc::Sender<RawBatch>,
        catalog: Arc<Catalog>,
        registry: Arc<ListenerRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url = cfg.url_for(&addr);
        let http = build_client(&cfg)?;
        registry.register(&addr);

        Ok(Self {
            addr,
            url,
            cfg,
            http,
            out,
            catalog,
            registry,
            cancel,
        })
    }

    /// Runs until cancelled. All failures feed the backoff loop.
    pub async fn run(self) {
        let mut backoff = self.cfg.backoff;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.registry.set_state(&self.addr, ListenerState::Connecting);

            let mut reports = 0u64;
            match self.stream_once(&mut reports).await {
                Ok(()) => {
                    debug!(node = %self.addr, reports, "telemetry stream closed");
                }
                Err(e) => {
                    warn!(node = %self.addr, error = %e, "telemetry stream failed");
                }
            }
            if reports > 0 {
                backoff = self.cfg.backoff;
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.registry.set_state(&self.addr, ListenerState::Backoff);
            self.registry.add_reconnect(&self.addr);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.cfg.backoff_max);
        }

        self.registry.set_state(&self.addr, ListenerState::Stopped);
    }

    /// Serves one connection until EOF, idle timeout, or an error.
    /// `reports` counts the reports decoded, whether or not the
    /// connection later fails.
    async fn stream_once(&self, reports: &mut u64) -> Result<()> {
        let mut request = self
            .http
            .get(&self.url)
            .header("Accept", "text/event-stream");
        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            resp = request.send() => {
                resp.with_context(|| format!("connecting to {}", self.url))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {status} from {}", self.url);
        }

        self.registry.set_state(&self.addr, ListenerState::Streaming);
        info!(node = %self.addr, "telemetry stream connected");

        let mut response = response;
        let mut framer = SseFramer::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = tokio::time::timeout(self.cfg.idle_timeout, response.chunk()) => {
                    match read {
                        Ok(result) => result.context("reading stream chunk")?,
                        Err(_) => bail!("stream idle for {:?}", self.cfg.idle_timeout),
                    }
                }
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };

            framer.extend(&chunk);
            while let Some(line) = framer.next_line() {
                let Some(payload) = data_payload(&line) else {
                    continue;
                };

                let decoded = match decode_report(payload.as_bytes(), self.catalog.as_ref()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        self.registry.add_decode_error(&self.addr);
                        bail!("decoding report: {e}");
                    }
                };

                if decoded.skipped > 0 {
                    debug!(
                        node = %self.addr,
                        skipped = decoded.skipped,
                        "skipped malformed report entries",
                    );
                }
                if decoded.records.is_empty() {
                    continue;
                }

                *reports += 1;
                self.registry.add_report(&self.addr, decoded.records.len() as u64);

                let batch = RawBatch {
                    node_addr: self.addr.clone(),
                    records: decoded.records,
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    sent = self.out.send(batch) => {
                        // A closed queue means the pipeline is gone.
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// No whole-request timeout: that would cut long-lived streams. The
/// idle timeout around each read covers dead connections instead.
fn build_client(cfg: &ListenConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(cfg.connect_timeout);
    if cfg.accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().context("building HTTP client")
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Incremental line framer over arbitrary chunk boundaries.
///
/// A line is complete once its `\n` has arrived; the terminator and
/// any trailing `\r` are stripped.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Extracts the report payload of a stream line.
///
/// SSE control lines (comments, event names, ids, retry hints) and
/// blank separators carry no report data. A `data:` prefix is
/// stripped; anything else is treated as a bare payload line.
pub fn data_payload(line: &str) -> Option<&str> {
    if line.is_empty() {
        return None;
    }
    if line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.strip_prefix(' ').unwrap_or(rest));
    }
    if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
        return None;
    }
    Some(line)
}
