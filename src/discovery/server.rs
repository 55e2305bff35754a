//! Declaration capture server
//!
//! One server instance serves every function of a discovery run. Each function is
//! given its own session id; all state lives in the [`SessionTable`], where every
//! entry is only ever touched on behalf of its own session.

use super::dependencies::WorkerRole;
use super::error::DiscoveryError;
use super::health::CaptureHealth;
use super::proto::faas_service_server::{FaasService, FaasServiceServer};
use super::proto::resource_service_server::{ResourceService, ResourceServiceServer};
use super::proto::{
    client_message, resource_details_response, ApiResourceDetails, ClientMessage,
    ResourceDeclareRequest, ResourceDeclareResponse, ResourceDetailsRequest,
    ResourceDetailsResponse, ServerMessage, SESSION_METADATA_KEY,
};
use super::resources::{Declaration, ResourceKey, ResourceKind};
use super::session::{CaptureSession, SessionOutcome, SessionState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

struct SessionEntry {
    session: CaptureSession,
    waiter: Option<oneshot::Sender<SessionOutcome>>,
}

impl SessionEntry {
    fn deliver(&mut self, outcome: SessionOutcome) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome);
        }
    }
}

/// Handle the orchestrator keeps for one registered session
#[derive(Debug)]
pub struct SessionTicket {
    pub id: String,
    pub function: String,
    outcome: oneshot::Receiver<SessionOutcome>,
}

impl SessionTicket {
    /// Waits until the session is closed and returns its outcome
    pub async fn wait(&mut self) -> SessionOutcome {
        match (&mut self.outcome).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DiscoveryError::Cancelled),
        }
    }
}

/// In-flight sessions of one discovery run, keyed by session id
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, function: &str) -> SessionTicket {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(
            id.clone(),
            SessionEntry {
                session: CaptureSession::new(id.clone(), function),
                waiter: Some(tx),
            },
        );
        debug!(function, session = %id, "Registered capture session");

        SessionTicket {
            id,
            function: function.to_string(),
            outcome: rx,
        }
    }

    pub async fn state(&self, id: &str) -> Result<SessionState, DiscoveryError> {
        let sessions = self.inner.lock().await;
        sessions
            .get(id)
            .map(|entry| entry.session.state())
            .ok_or_else(|| DiscoveryError::UnknownSession(id.to_string()))
    }

    pub async fn identify(&self, id: &str, role: WorkerRole) -> Result<(), DiscoveryError> {
        let mut sessions = self.inner.lock().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::UnknownSession(id.to_string()))?;
        entry.session.identify(role)?;
        debug!(function = entry.session.function(), session = %id, "Worker identified");
        Ok(())
    }

    pub async fn declare(&self, id: &str, declaration: Declaration) -> Result<(), DiscoveryError> {
        let mut sessions = self.inner.lock().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::UnknownSession(id.to_string()))?;
        debug!(
            function = entry.session.function(),
            resource = %declaration.key(),
            "Resource declared"
        );
        entry.session.declare(declaration)
    }

    pub async fn describe(
        &self,
        id: &str,
        key: &ResourceKey,
    ) -> Result<Declaration, DiscoveryError> {
        let sessions = self.inner.lock().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| DiscoveryError::UnknownSession(id.to_string()))?;
        entry.session.describe(key).cloned()
    }

    /// Fails a session that broke the handshake contract
    pub async fn violate(&self, id: &str, reason: &str) -> DiscoveryError {
        let mut sessions = self.inner.lock().await;
        let Some(entry) = sessions.get_mut(id) else {
            return DiscoveryError::UnknownSession(id.to_string());
        };
        warn!(function = entry.session.function(), reason, "Protocol violation");
        let err = entry.session.violate(reason);
        entry.deliver(Err(err.clone()));
        err
    }

    /// Closes a session and delivers its outcome
    pub async fn close(&self, id: &str) {
        let mut sessions = self.inner.lock().await;
        if let Some(entry) = sessions.get_mut(id) {
            if entry.session.state() == SessionState::Closed {
                return;
            }
            let outcome = entry.session.close();
            debug!(
                function = entry.session.function(),
                ok = outcome.is_ok(),
                "Capture session closed"
            );
            entry.deliver(outcome);
        }
    }

    /// Forcibly closes a session that did not finish in time
    pub async fn expire(&self, id: &str, timeout: Duration) {
        self.abort(id, |function| DiscoveryError::timeout(function, timeout))
            .await;
    }

    /// Forcibly closes a session because the run was cancelled
    pub async fn abandon(&self, id: &str) {
        self.abort(id, |_| DiscoveryError::Cancelled).await;
    }

    async fn abort(&self, id: &str, error: impl FnOnce(&str) -> DiscoveryError) {
        let mut sessions = self.inner.lock().await;
        if let Some(entry) = sessions.get_mut(id) {
            if entry.session.state() == SessionState::Closed {
                return;
            }
            let err = error(entry.session.function());
            let err = entry.session.abort(err);
            entry.deliver(Err(err));
        }
    }

    pub async fn remove(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }
}

fn session_id<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .metadata()
        .get(SESSION_METADATA_KEY)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Status::unauthenticated(format!("missing {} request metadata", SESSION_METADATA_KEY))
        })
}

/// gRPC front of the session table
#[derive(Clone)]
pub struct CaptureService {
    sessions: SessionTable,
    base_url: String,
}

impl CaptureService {
    pub fn new(sessions: SessionTable, base_url: impl Into<String>) -> Self {
        Self {
            sessions,
            base_url: base_url.into(),
        }
    }
}

#[tonic::async_trait]
impl FaasService for CaptureService {
    type TriggerStreamStream = tokio_stream::Empty<Result<ServerMessage, Status>>;

    async fn trigger_stream(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> Result<Response<Self::TriggerStreamStream>, Status> {
        let id = session_id(&request)?;
        match self.sessions.state(&id).await? {
            SessionState::AwaitInit => {}
            SessionState::Identified => {
                return Err(DiscoveryError::protocol("trigger stream already opened").into())
            }
            SessionState::Closed => return Err(DiscoveryError::SessionClosed(id).into()),
        }

        let mut inbound = request.into_inner();
        let first = match inbound.message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                let reason = "stream closed before an init request was received";
                return Err(self.sessions.violate(&id, reason).await.into());
            }
            Err(status) => {
                let reason = format!("stream failed before init request: {}", status.message());
                return Err(self.sessions.violate(&id, &reason).await.into());
            }
        };

        let init = match first.content {
            Some(client_message::Content::InitRequest(init)) => init,
            _ => {
                let reason = "first message must be an init request";
                return Err(self.sessions.violate(&id, reason).await.into());
            }
        };

        let role = match WorkerRole::try_from(init) {
            Ok(role) => role,
            Err(DiscoveryError::ProtocolViolation(reason)) => {
                return Err(self.sessions.violate(&id, &reason).await.into());
            }
            Err(other) => {
                return Err(self.sessions.violate(&id, &other.to_string()).await.into());
            }
        };

        self.sessions.identify(&id, role).await?;

        // The handshake is the whole conversation: the session closes here and the
        // response stream ends without reading anything else the worker sends.
        drop(inbound);
        self.sessions.close(&id).await;

        Ok(Response::new(tokio_stream::empty()))
    }
}

#[tonic::async_trait]
impl ResourceService for CaptureService {
    async fn declare(
        &self,
        request: Request<ResourceDeclareRequest>,
    ) -> Result<Response<ResourceDeclareResponse>, Status> {
        let id = session_id(&request)?;
        let declaration = Declaration::try_from(request.into_inner()).map_err(|err| {
            warn!(session = %id, "Rejected declaration: {}", err);
            err.into_status()
        })?;
        self.sessions.declare(&id, declaration).await?;
        Ok(Response::new(ResourceDeclareResponse {}))
    }

    async fn details(
        &self,
        request: Request<ResourceDetailsRequest>,
    ) -> Result<Response<ResourceDetailsResponse>, Status> {
        let id = session_id(&request)?;
        let key = request
            .into_inner()
            .resource
            .ok_or_else(|| DiscoveryError::invalid("details request names no resource"))?
            .key()?;
        let declaration = self.sessions.describe(&id, &key).await?;

        let details = match declaration.kind() {
            ResourceKind::Api => Some(resource_details_response::Details::Api(
                ApiResourceDetails {
                    url: format!("{}/apis/{}", self.base_url, declaration.name()),
                },
            )),
            _ => None,
        };

        Ok(Response::new(ResourceDetailsResponse {
            id: declaration.name().to_string(),
            provider: "dev".to_string(),
            service: service_name(declaration.kind()).to_string(),
            details,
        }))
    }
}

fn service_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Bucket => "Bucket",
        ResourceKind::Collection => "Collection",
        ResourceKind::Queue => "Queue",
        ResourceKind::Topic => "Topic",
        ResourceKind::Secret => "Secret",
        ResourceKind::Policy => "Policy",
        ResourceKind::Api => "Api",
    }
}

/// A running capture endpoint
pub struct CaptureServer {
    local_addr: SocketAddr,
    advertise_host: String,
    sessions: SessionTable,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl CaptureServer {
    /// Binds the endpoint and starts serving in the background
    ///
    /// `advertise_host` is the host name containers use to reach this machine; the
    /// bound port is appended to it in [`CaptureServer::endpoint`].
    pub async fn start(
        bind: SocketAddr,
        advertise_host: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| DiscoveryError::Server(format!("failed to bind {}: {}", bind, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DiscoveryError::Server(e.to_string()))?;
        let advertise_host = advertise_host.into();

        let sessions = SessionTable::new();
        let service = CaptureService::new(
            sessions.clone(),
            format!("http://{}:{}", advertise_host, local_addr.port()),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = Server::builder()
            .trace_fn(|_| tracing::info_span!("capture-server"))
            .add_service(tonic_health::pb::health_server::HealthServer::new(
                CaptureHealth,
            ))
            .add_service(FaasServiceServer::new(service.clone()))
            .add_service(ResourceServiceServer::new(service));

        let task = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async {
                let _ = shutdown_rx.await;
            },
        ));

        info!(address = %local_addr, advertise = %advertise_host, "Capture server listening");

        Ok(Self {
            local_addr,
            advertise_host,
            sessions,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address injected into containers as `NIMBUS_SERVICE_ADDRESS`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.advertise_host, self.local_addr.port())
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub async fn register(&self, function: &str) -> SessionTicket {
        self.sessions.register(function).await
    }

    /// Stops accepting connections and waits briefly for the server task to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(()))) => debug!("Capture server stopped"),
                Ok(Ok(Err(e))) => warn!("Capture server error on shutdown: {}", e),
                Ok(Err(e)) => warn!("Capture server task failed: {}", e),
                Err(_) => warn!("Capture server did not stop in time"),
            }
        }
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::resources::ResourceKind;

    #[tokio::test]
    async fn test_ticket_receives_close_outcome() {
        let table = SessionTable::new();
        let mut ticket = table.register("upload").await;

        table
            .declare(
                &ticket.id,
                Declaration::Bucket {
                    name: "uploads".into(),
                },
            )
            .await
            .unwrap();
        table.identify(&ticket.id, WorkerRole::Plain).await.unwrap();
        table.close(&ticket.id).await;

        let deps = ticket.wait().await.unwrap();
        assert!(deps
            .get(&ResourceKey::new(ResourceKind::Bucket, "uploads"))
            .is_some());
    }

    #[tokio::test]
    async fn test_expire_delivers_timeout() {
        let table = SessionTable::new();
        let mut ticket = table.register("slow").await;
        table.expire(&ticket.id, Duration::from_secs(3)).await;

        assert_eq!(
            ticket.wait().await,
            Err(DiscoveryError::timeout("slow", Duration::from_secs(3)))
        );
        assert_eq!(
            table.state(&ticket.id).await.unwrap(),
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn test_expire_after_close_keeps_outcome() {
        let table = SessionTable::new();
        let mut ticket = table.register("fast").await;
        table.identify(&ticket.id, WorkerRole::Plain).await.unwrap();
        table.close(&ticket.id).await;
        table.expire(&ticket.id, Duration::from_secs(1)).await;

        assert!(ticket.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let table = SessionTable::new();
        assert_eq!(
            table.state("nope").await,
            Err(DiscoveryError::UnknownSession("nope".into()))
        );
        assert!(matches!(
            table.violate("nope", "bad").await,
            DiscoveryError::UnknownSession(_)
        ));
    }

    #[test]
    fn test_session_id_requires_metadata() {
        let request = Request::new(());
        assert_eq!(
            session_id(&request).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(SESSION_METADATA_KEY, "abc".parse().unwrap());
        assert_eq!(session_id(&request).unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_server_endpoint_uses_advertised_host() {
        let server = CaptureServer::start("127.0.0.1:0".parse().unwrap(), "host.docker.internal")
            .await
            .unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(server.endpoint(), format!("host.docker.internal:{}", port));
        server.shutdown().await;
    }
}
