//! Replaying captured HTTP requests against the forked process.

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::ReplayConfig;
use crate::error::RpcError;
use crate::logging;
use crate::remap::RemapTable;

/// Headers the client recomputes or that only make sense hop-by-hop
const DROPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

/// File attached to a multipart request, fetched from an external URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReference {
    #[serde(default = "default_file_field")]
    pub field: String,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_file_field() -> String {
    "file".to_string()
}

/// A request as captured from the live process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    /// Path plus query string
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub multipart: bool,
    #[serde(default)]
    pub file: Option<FileReference>,
    /// Port the live process received the request on
    #[serde(default)]
    pub port: Option<u16>,
    /// Application session state to push into the child before dispatch
    #[serde(default)]
    pub session_data: Option<Value>,
}

impl CapturedRequest {
    fn effective_content_type(&self) -> Option<String> {
        self.content_type
            .clone()
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                    .map(|(_, v)| v.clone())
            })
            .map(|ct| ct.to_ascii_lowercase())
    }

    /// Multipart only when both the flag and a file reference are present
    pub fn is_multipart(&self) -> bool {
        self.multipart && self.file.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Response {
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: Value,
    },
    Cancelled,
}

/// Lower-cased headers without the ones the client sets itself
pub fn normalize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.clone()))
        .filter(|(k, _)| !k.is_empty() && !DROPPED_HEADERS.contains(&k.as_str()))
        .collect()
}

/// Port in the forked process that serves a request captured on `captured`
pub fn target_port(remap: &RemapTable, captured: Option<u16>) -> Result<u16, RpcError> {
    match captured {
        Some(port) => remap
            .get(port)
            .ok_or_else(|| RpcError::PortNotMapped(format!("port {} is not remapped", port))),
        None => {
            let mut ports = remap.iter();
            match (ports.next(), ports.next()) {
                (Some((_, reassigned)), None) => Ok(reassigned),
                (None, _) => Err(RpcError::PortNotMapped("no ports are remapped".into())),
                (Some(_), Some(_)) => Err(RpcError::PortNotMapped(format!(
                    "request has no port and {} ports are remapped",
                    remap.len()
                ))),
            }
        }
    }
}

/// One in-flight replay
pub struct ReplayEntry {
    cancel_tx: watch::Sender<bool>,
    finished: AtomicBool,
    /// Whether cancellation turned on pause skipping for this replay
    skipping: Mutex<bool>,
}

impl ReplayEntry {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Serializes cancellation and pause-skip changes against the replay
    /// finishing. Hold it while calling `cancel` or `ReplayTicket::finish`.
    pub async fn skip_state(&self) -> tokio::sync::MutexGuard<'_, bool> {
        self.skipping.lock().await
    }

    /// Returns false if the replay was already cancelled
    pub fn cancel(&self) -> bool {
        !self.cancel_tx.send_replace(true)
    }

    /// Wait for `outcome` unless the replay is cancelled first. A
    /// cancellation always wins, even over a response that already arrived.
    pub async fn race<F>(&self, outcome: F) -> Result<ReplayOutcome, RpcError>
    where
        F: Future<Output = Result<ReplayOutcome, RpcError>>,
    {
        let mut cancelled = self.cancel_tx.subscribe();
        let result = tokio::select! {
            result = outcome => result,
            true = async { cancelled.wait_for(|c| *c).await.is_ok() } => Ok(ReplayOutcome::Cancelled),
        };
        if self.is_cancelled() {
            return Ok(ReplayOutcome::Cancelled);
        }
        result
    }
}

type Entries = Arc<std::sync::Mutex<HashMap<String, Arc<ReplayEntry>>>>;

/// In-flight replays of one session, keyed by request id
#[derive(Default)]
pub struct ReplayTracker {
    entries: Entries,
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, request_id: &str) -> Result<ReplayTicket, RpcError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RpcError::Internal("replay tracker poisoned".into()))?;
        if entries.contains_key(request_id) {
            return Err(RpcError::DuplicateReplay(request_id.to_string()));
        }
        let (cancel_tx, _) = watch::channel(false);
        let entry = Arc::new(ReplayEntry {
            cancel_tx,
            finished: AtomicBool::new(false),
            skipping: Mutex::new(false),
        });
        entries.insert(request_id.to_string(), Arc::clone(&entry));
        Ok(ReplayTicket {
            request_id: request_id.to_string(),
            entry,
            entries: Arc::clone(&self.entries),
        })
    }

    /// In-flight replay registered under `request_id`
    pub fn get(&self, request_id: &str) -> Option<Arc<ReplayEntry>> {
        let entries = self.entries.lock().ok()?;
        entries.get(request_id).cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Registration of an in-flight replay; unregisters on drop
pub struct ReplayTicket {
    request_id: String,
    entry: Arc<ReplayEntry>,
    entries: Entries,
}

impl ReplayTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn entry(&self) -> &Arc<ReplayEntry> {
        &self.entry
    }

    /// Unregister and mark finished. Returns the entry so the caller can
    /// undo pause skipping.
    pub fn finish(self) -> Arc<ReplayEntry> {
        Arc::clone(&self.entry)
    }
}

impl Drop for ReplayTicket {
    fn drop(&mut self) {
        self.entry.finished.store(true, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.lock() {
            if entries
                .get(&self.request_id)
                .is_some_and(|e| Arc::ptr_eq(e, &self.entry))
            {
                entries.remove(&self.request_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct RequestReplayer {
    http: reqwest::Client,
    timeout: Duration,
    session_ack_timeout: Duration,
}

impl RequestReplayer {
    pub fn new(config: &ReplayConfig) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            timeout: config.timeout(),
            session_ack_timeout: config.session_ack_timeout(),
        }
    }

    pub fn session_ack_timeout(&self) -> Duration {
        self.session_ack_timeout
    }

    /// Send the request and wait for the response or the timeout. Runs to
    /// completion regardless of cancellation; see `ReplayEntry::race`.
    pub async fn dispatch(
        &self,
        port: u16,
        request: &CapturedRequest,
    ) -> Result<ReplayOutcome, RpcError> {
        match tokio::time::timeout(self.timeout, self.send(port, request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ReplayTimeout(self.timeout.as_secs())),
        }
    }

    async fn send(&self, port: u16, request: &CapturedRequest) -> Result<ReplayOutcome, RpcError> {
        let method = reqwest::Method::from_bytes(request.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| RpcError::InvalidArguments(format!("bad method {}", request.method)))?;
        let url = build_url(port, &request.path)?;
        logging::debug(&format!("Replaying {} {}", method, url));

        let mut headers = normalize_headers(&request.headers);
        let mut builder = self.http.request(method, url);

        let content_type = request.effective_content_type();
        if request.is_multipart() {
            headers.remove("content-type");
            let form = self.multipart_form(request).await?;
            builder = builder.multipart(form);
        } else {
            builder = match body_kind(content_type.as_deref(), &request.body) {
                BodyKind::Empty => builder,
                BodyKind::Json => {
                    headers.remove("content-type");
                    builder.json(&request.body)
                }
                BodyKind::Form => {
                    headers.remove("content-type");
                    builder.form(&flatten_form(&request.body))
                }
                BodyKind::Raw(text) => builder.body(text),
            };
        }
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RpcError::ReplayFailed(e.to_string()))?;

        let status_code = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| RpcError::ReplayFailed(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ReplayOutcome::Response {
            status_code,
            headers,
            body,
        })
    }

    async fn multipart_form(&self, request: &CapturedRequest) -> Result<Form, RpcError> {
        let mut form = Form::new();
        for (name, value) in flatten_form(&request.body) {
            form = form.text(name, value);
        }
        if let Some(file) = &request.file {
            let bytes = self.fetch_file(&file.url).await?;
            let mut part = Part::bytes(bytes).file_name(file.filename.clone());
            if let Some(ct) = &file.content_type {
                part = part
                    .mime_str(ct)
                    .map_err(|e| RpcError::InvalidArguments(e.to_string()))?;
            }
            form = form.part(file.field.clone(), part);
        }
        Ok(form)
    }

    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, RpcError> {
        let unavailable = |e: reqwest::Error| RpcError::ReplayFileUnavailable(e.to_string());
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;
        let bytes = response.bytes().await.map_err(unavailable)?;
        Ok(bytes.to_vec())
    }
}

fn build_url(port: u16, path: &str) -> Result<url::Url, RpcError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    url::Url::parse(&format!("http://127.0.0.1:{}{}", port, path))
        .map_err(|e| RpcError::InvalidArguments(format!("bad path {}: {}", path, e)))
}

#[derive(Debug, PartialEq)]
enum BodyKind {
    Empty,
    Json,
    Form,
    Raw(String),
}

fn body_kind(content_type: Option<&str>, body: &Value) -> BodyKind {
    let structured = body.is_object() || body.is_array();
    match (content_type, body) {
        (_, Value::Null) => BodyKind::Empty,
        (Some(ct), _) if ct.contains("application/x-www-form-urlencoded") && body.is_object() => {
            BodyKind::Form
        }
        (Some(ct), _) if ct.contains("json") => BodyKind::Json,
        (_, Value::String(text)) => BodyKind::Raw(text.clone()),
        _ if structured => BodyKind::Json,
        (_, other) => BodyKind::Raw(other.to_string()),
    }
}

fn flatten_form(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}
