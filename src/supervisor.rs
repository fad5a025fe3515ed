//! Service supervisor (spec 4.8): starts every runtime service, each
//! behind its own loopback JSON-line RPC port, then polls each for
//! health on a fixed interval.
//!
//! Startup is fail-fast: if any service's `start` returns an error, the
//! supervisor stops and propagates it rather than running in a partially
//! initialized state. Health polling runs independently of the bus/queue
//! event flow, on its own interval and with its own per-check timeout, so
//! a wedged service shows up as unhealthy instead of hanging the sweep.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::errors::ErrorKind;
use crate::types::HealthStatus;

/// Errors the supervisor can produce (spec 7).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A service failed during `start`.
    #[error("service '{0}' failed to start: {1}")]
    StartFailed(String, String),
    /// A service with this name is already registered.
    #[error("service already registered: {0}")]
    DuplicateService(String),
    /// No service is registered (or listening) under this id.
    #[error("service not found: {0}")]
    NotFound(String),
    /// The RPC round trip to a service's port failed.
    #[error("rpc transport error: {0}")]
    Rpc(String),
    /// The service handled the call but reported failure.
    #[error("rpc call failed: {0}")]
    CallFailed(String),
}

impl SupervisorError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StartFailed(..) => ErrorKind::Internal,
            Self::DuplicateService(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Rpc(_) => ErrorKind::Transient,
            Self::CallFailed(_) => ErrorKind::Permanent,
        }
    }
}

/// One line of a service's JSON-line RPC channel (spec 4.8, spec 6
/// "Service RPC").
#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// The matching response line: `{success, data_json, error}` per spec 6.
#[derive(Debug, Serialize, Deserialize)]
struct RpcResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// A runtime component the supervisor starts, polls, and exposes over a
/// loopback RPC port (spec 4.8).
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name, unique among registered services.
    fn name(&self) -> &str;

    /// Perform one-time startup work. Called once, in registration order.
    async fn start(&self) -> anyhow::Result<()>;

    /// Report current health. Called on every poll tick.
    async fn health(&self) -> HealthStatus;

    /// Handle one RPC call (spec 4.8: "a small dispatch loop handles
    /// inbound messages; each method is a named handler"). `healthcheck`
    /// is always available via the default implementation; services that
    /// expose more methods override this and fall back to `super`-like
    /// behaviour by matching `"healthcheck"` themselves.
    async fn call(&self, method: &str, _args: serde_json::Value) -> Result<serde_json::Value, String> {
        match method {
            "healthcheck" => serde_json::to_value(self.health().await).map_err(|e| e.to_string()),
            other => Err(format!("unknown method: {other}")),
        }
    }
}

/// Starts and health-polls the runtime's services (spec 4.8).
pub struct Supervisor {
    services: RwLock<Vec<Arc<dyn Service>>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    ports: RwLock<HashMap<String, u16>>,
    poll_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    rpc_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Build an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: RwLock::new(Vec::new()),
            statuses: RwLock::new(HashMap::new()),
            ports: RwLock::new(HashMap::new()),
            poll_handle: tokio::sync::Mutex::new(None),
            rpc_handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a service. Does not start it; call `start_all` once every
    /// service is registered.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::DuplicateService`] if `service.name()`
    /// is already registered.
    pub async fn register(&self, service: Arc<dyn Service>) -> Result<(), SupervisorError> {
        let mut services = self.services.write().await;
        if services.iter().any(|s| s.name() == service.name()) {
            return Err(SupervisorError::DuplicateService(service.name().to_owned()));
        }
        services.push(service);
        Ok(())
    }

    /// Start every registered service in registration order, stopping at
    /// the first failure (spec 4.8: fail-fast startup), and give each a
    /// well-known loopback RPC port.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::StartFailed`] naming the first service
    /// whose `start` or RPC listener setup failed.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        let services = self.services.read().await;
        let mut ports = self.ports.write().await;
        let mut rpc_handles = self.rpc_handles.lock().await;
        for service in services.iter() {
            service
                .start()
                .await
                .map_err(|e| SupervisorError::StartFailed(service.name().to_owned(), e.to_string()))?;

            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|e| SupervisorError::StartFailed(service.name().to_owned(), e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| SupervisorError::StartFailed(service.name().to_owned(), e.to_string()))?
                .port();
            ports.insert(service.name().to_owned(), port);
            rpc_handles.push(tokio::spawn(serve_rpc(Arc::clone(service), listener)));
        }
        Ok(())
    }

    /// Call `method` on the service registered as `service_id` over its
    /// loopback RPC channel (spec 4.8: `callService`).
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotFound`] if no such service is
    /// listening, [`SupervisorError::Rpc`] on a transport failure, or
    /// [`SupervisorError::CallFailed`] if the service itself reported an
    /// error.
    pub async fn call_service(&self, service_id: &str, method: &str, args: serde_json::Value) -> Result<serde_json::Value, SupervisorError> {
        let port = *self.ports.read().await.get(service_id).ok_or_else(|| SupervisorError::NotFound(service_id.to_owned()))?;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| SupervisorError::Rpc(e.to_string()))?;
        let mut line = serde_json::to_string(&RpcRequest { method: method.to_owned(), args }).map_err(|e| SupervisorError::Rpc(e.to_string()))?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await.map_err(|e| SupervisorError::Rpc(e.to_string()))?;

        let mut response_line = String::new();
        BufReader::new(stream).read_line(&mut response_line).await.map_err(|e| SupervisorError::Rpc(e.to_string()))?;
        let response: RpcResponse = serde_json::from_str(&response_line).map_err(|e| SupervisorError::Rpc(e.to_string()))?;
        if response.success {
            Ok(response.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(SupervisorError::CallFailed(response.error.unwrap_or_default()))
        }
    }

    /// The loopback port a started service's RPC channel is listening
    /// on, if it has been assigned one.
    pub async fn port_of(&self, service_id: &str) -> Option<u16> {
        self.ports.read().await.get(service_id).copied()
    }

    /// Run one health poll across every registered service, applying
    /// `timeout` to each individual check.
    pub async fn poll_once(&self, timeout: std::time::Duration) {
        let services = self.services.read().await;
        let mut statuses = self.statuses.write().await;
        for service in services.iter() {
            let status = match tokio::time::timeout(timeout, service.health()).await {
                Ok(status) => status,
                Err(_) => HealthStatus::failed(Utc::now(), "health check timed out"),
            };
            statuses.insert(service.name().to_owned(), status);
        }
    }

    /// Start the periodic health poll loop.
    pub async fn start_health_polling(self: &Arc<Self>, poll_interval: std::time::Duration, timeout: std::time::Duration) {
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                supervisor.poll_once(timeout).await;
            }
        });
        *self.poll_handle.lock().await = Some(handle);
    }

    /// Snapshot of the last known health per service name.
    pub async fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().await.clone()
    }

    /// Whether every service's last known status was healthy. A service
    /// never polled yet counts as unhealthy.
    pub async fn all_healthy(&self) -> bool {
        let services = self.services.read().await;
        let statuses = self.statuses.read().await;
        services.iter().all(|s| statuses.get(s.name()).is_some_and(|h| h.healthy))
    }
}

/// Accept loop for one service's RPC port: each connection gets its own
/// task so a slow caller never blocks another (spec 4.8 dispatch loop).
async fn serve_rpc(service: Arc<dyn Service>, listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = handle_rpc_connection(&service, stream).await {
                tracing::warn!(service = service.name(), error = %err, "rpc connection ended");
            }
        });
    }
}

/// Reads newline-delimited [`RpcRequest`]s from `stream` until EOF,
/// dispatching each through `service.call` and writing back one
/// [`RpcResponse`] line per request.
async fn handle_rpc_connection(service: &Arc<dyn Service>, stream: TcpStream) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => match service.call(&request.method, request.args).await {
                Ok(data) => RpcResponse { success: true, data: Some(data), error: None },
                Err(err) => RpcResponse { success: false, data: None, error: Some(err) },
            },
            Err(err) => RpcResponse { success: false, data: None, error: Some(err.to_string()) },
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}
