//! Remote mirror of the active session and the push trigger for the live surface
//!
//! Writes are fire-and-forget: transitions enqueue a [`MirrorOp`] and return
//! immediately, while a single [`MirrorWorker`] applies them in submission order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TimerError},
    state::{TimerClass, TimerMode, TimerSession, TimerState},
};

/// The per-user document other devices read to show the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMirrorDocument {
    pub activity_id: String,
    pub timer_class: TimerClass,
    pub method_id: Option<String>,
    pub method_name: String,
    pub session_type: TimerMode,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteMirrorDocument {
    pub fn from_session(session: &TimerSession, now: DateTime<Utc>) -> Self {
        Self {
            activity_id: session.id.clone(),
            timer_class: session.class,
            method_id: session.method_id.clone(),
            method_name: session
                .method_name
                .clone()
                .unwrap_or_else(|| "Practice".to_string()),
            session_type: session.mode,
            started_at: session.started_at,
            duration_secs: session.total_duration.unwrap_or(0.0),
            is_paused: session.state == TimerState::Paused,
            paused_at: session.paused_at,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOp {
    Upsert(RemoteMirrorDocument),
    /// Merge-patch of top-level fields
    Patch(Map<String, Value>),
    /// Touch the document and ask the push service to refresh the surface
    ForceSync {
        activity_id: String,
        fields: Map<String, Value>,
    },
    Delete,
}

impl MirrorOp {
    fn name(&self) -> &'static str {
        match self {
            MirrorOp::Upsert(_) => "upsert",
            MirrorOp::Patch(_) => "patch",
            MirrorOp::ForceSync { .. } => "force-sync",
            MirrorOp::Delete => "delete",
        }
    }
}

#[derive(Debug)]
struct MirrorCommand {
    user_id: String,
    op: MirrorOp,
}

/// Remote store and push trigger.
pub trait MirrorBackend: Send + Sync {
    fn put(&self, user_id: String, document: RemoteMirrorDocument) -> BoxFuture<'_, Result<()>>;
    fn patch(&self, user_id: String, fields: Map<String, Value>) -> BoxFuture<'_, Result<()>>;
    fn delete(&self, user_id: String) -> BoxFuture<'_, Result<()>>;
    fn push_update(&self, activity_id: String) -> BoxFuture<'_, Result<()>>;
}

/// Mirror backed by a REST document store and a push function endpoint
#[derive(Debug, Clone)]
pub struct HttpMirrorBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMirrorBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TimerError::RemoteSync(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn document_url(&self, user_id: &str) -> String {
        format!("{}/activeTimers/{}", self.base_url, user_id)
    }

    async fn send(request: reqwest::RequestBuilder, what: &str) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| TimerError::RemoteSync(format!("{} request failed: {}", what, e)))?;
        response
            .error_for_status()
            .map_err(|e| TimerError::RemoteSync(format!("{} rejected: {}", what, e)))?;
        Ok(())
    }
}

impl MirrorBackend for HttpMirrorBackend {
    fn put(&self, user_id: String, document: RemoteMirrorDocument) -> BoxFuture<'_, Result<()>> {
        async move {
            let request = self.client.put(self.document_url(&user_id)).json(&document);
            Self::send(request, "Document upsert").await
        }
        .boxed()
    }

    fn patch(&self, user_id: String, fields: Map<String, Value>) -> BoxFuture<'_, Result<()>> {
        async move {
            let request = self.client.patch(self.document_url(&user_id)).json(&fields);
            Self::send(request, "Document patch").await
        }
        .boxed()
    }

    fn delete(&self, user_id: String) -> BoxFuture<'_, Result<()>> {
        async move {
            let request = self.client.delete(self.document_url(&user_id));
            Self::send(request, "Document delete").await
        }
        .boxed()
    }

    fn push_update(&self, activity_id: String) -> BoxFuture<'_, Result<()>> {
        async move {
            let request = self
                .client
                .post(format!("{}/updateLiveActivityTimer", self.base_url))
                .json(&serde_json::json!({ "activityId": activity_id, "action": "update" }));
            Self::send(request, "Push trigger").await
        }
        .boxed()
    }
}

/// In-process mirror used when no remote is configured, and by tests
#[derive(Debug, Default)]
pub struct MemoryMirrorBackend {
    documents: Mutex<HashMap<String, Value>>,
    pushes: Mutex<Vec<String>>,
}

impl MemoryMirrorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, user_id: &str) -> Option<Value> {
        self.documents.lock().ok()?.get(user_id).cloned()
    }

    /// Activity ids the push trigger was called with, oldest first
    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn merge(&self, user_id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|e| TimerError::RemoteSync(format!("Failed to lock mirror: {}", e)))?;
        let Some(Value::Object(document)) = documents.get_mut(user_id) else {
            return Err(TimerError::RemoteSync(format!("No document for user {}", user_id)));
        };
        document.extend(fields);
        Ok(())
    }
}

impl MirrorBackend for MemoryMirrorBackend {
    fn put(&self, user_id: String, document: RemoteMirrorDocument) -> BoxFuture<'_, Result<()>> {
        async move {
            let value = serde_json::to_value(&document)
                .map_err(|e| TimerError::json("serialize mirror document", e))?;
            if let Ok(mut documents) = self.documents.lock() {
                documents.insert(user_id, value);
            }
            Ok(())
        }
        .boxed()
    }

    fn patch(&self, user_id: String, fields: Map<String, Value>) -> BoxFuture<'_, Result<()>> {
        async move { self.merge(&user_id, fields) }.boxed()
    }

    fn delete(&self, user_id: String) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Ok(mut documents) = self.documents.lock() {
                documents.remove(&user_id);
            }
            Ok(())
        }
        .boxed()
    }

    fn push_update(&self, activity_id: String) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Ok(mut pushes) = self.pushes.lock() {
                pushes.push(activity_id);
            }
            Ok(())
        }
        .boxed()
    }
}

/// Submission side of the mirror; cheap to clone, never blocks
#[derive(Debug, Clone)]
pub struct RemoteMirror {
    tx: mpsc::UnboundedSender<MirrorCommand>,
    user_id: Option<String>,
}

impl RemoteMirror {
    /// Create the mirror handle and the worker that must be spawned to drive it
    pub fn new(user_id: Option<String>, backend: Arc<dyn MirrorBackend>) -> (Self, MirrorWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, user_id }, MirrorWorker { rx, backend })
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn record_start(&self, session: &TimerSession, now: DateTime<Utc>) {
        self.submit(MirrorOp::Upsert(RemoteMirrorDocument::from_session(session, now)));
    }

    pub fn record_pause(&self, now: DateTime<Utc>) {
        let mut fields = Map::new();
        fields.insert("isPaused".into(), Value::Bool(true));
        fields.insert("pausedAt".into(), json_time(now));
        fields.insert("updatedAt".into(), json_time(now));
        self.submit(MirrorOp::Patch(fields));
    }

    /// `session` must already carry the shifted start reference
    pub fn record_resume(&self, session: &TimerSession, now: DateTime<Utc>) {
        let mut fields = Map::new();
        fields.insert("isPaused".into(), Value::Bool(false));
        fields.insert("pausedAt".into(), Value::Null);
        fields.insert("startedAt".into(), json_time(session.started_at));
        fields.insert("updatedAt".into(), json_time(now));
        self.submit(MirrorOp::Patch(fields));
    }

    /// Used for both stop and completion
    pub fn record_end(&self) {
        self.submit(MirrorOp::Delete);
    }

    pub fn force_sync(&self, session: &TimerSession, now: DateTime<Utc>) {
        let mut fields = Map::new();
        fields.insert("updatedAt".into(), json_time(now));
        fields.insert("forcedUpdate".into(), Value::Bool(true));
        self.submit(MirrorOp::ForceSync {
            activity_id: session.id.clone(),
            fields,
        });
    }

    fn submit(&self, op: MirrorOp) {
        let Some(user_id) = self.user_id.clone() else {
            debug!("No authenticated user, skipping mirror {}", op.name());
            return;
        };
        if self.tx.send(MirrorCommand { user_id, op }).is_err() {
            warn!("Mirror worker has stopped, dropping update");
        }
    }
}

fn json_time(instant: DateTime<Utc>) -> Value {
    Value::String(instant.to_rfc3339())
}

/// Applies queued mirror operations one at a time, in order
pub struct MirrorWorker {
    rx: mpsc::UnboundedReceiver<MirrorCommand>,
    backend: Arc<dyn MirrorBackend>,
}

impl MirrorWorker {
    /// Run until every [`RemoteMirror`] handle is dropped
    pub async fn run(mut self) {
        info!("Remote mirror worker started");
        while let Some(command) = self.rx.recv().await {
            self.apply(command).await;
        }
        info!("Remote mirror worker stopped");
    }

    /// Apply everything queued so far; returns how many operations ran
    pub async fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.rx.try_recv() {
            self.apply(command).await;
            applied += 1;
        }
        applied
    }

    async fn apply(&self, command: MirrorCommand) {
        let MirrorCommand { user_id, op } = command;
        let name = op.name();
        let result = match op {
            MirrorOp::Upsert(document) => self.backend.put(user_id, document).await,
            MirrorOp::Patch(fields) => self.backend.patch(user_id, fields).await,
            MirrorOp::Delete => self.backend.delete(user_id).await,
            MirrorOp::ForceSync { activity_id, fields } => {
                match self.backend.patch(user_id, fields).await {
                    Ok(()) => self.backend.push_update(activity_id).await,
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => debug!("Mirror {} applied", name),
            Err(e) => warn!("Mirror {} failed: {}", name, e),
        }
    }
}
