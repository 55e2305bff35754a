//! Handler-side half of the capture protocol
//!
//! `WorkerClient` is what a handler SDK does during discovery, written in Rust: read
//! the injected endpoint and session id, declare resources, then open the trigger
//! stream with an init request and exit once the server closes it.

use super::proto::faas_service_client::FaasServiceClient;
use super::proto::resource_service_client::ResourceServiceClient;
use super::proto::{
    init_request, resource_details_response, ClientMessage, Resource, ResourceDeclareRequest,
    ResourceDetailsRequest, ServerMessage, SESSION_METADATA_KEY,
};
use super::resources::{Declaration, ResourceKey};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};

/// Environment variable carrying the capture endpoint (`host:port`)
pub const ENV_SERVICE_ADDRESS: &str = "NIMBUS_SERVICE_ADDRESS";
/// Environment variable carrying the capture session id
pub const ENV_SESSION_ID: &str = "NIMBUS_SESSION_ID";
/// Environment variable carrying the function name
pub const ENV_FUNCTION: &str = "NIMBUS_FUNCTION";

/// Connection metadata returned by the details query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDetails {
    pub id: String,
    pub provider: String,
    pub service: String,
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct WorkerClient {
    channel: Channel,
    session: MetadataValue<Ascii>,
}

impl WorkerClient {
    pub async fn connect(address: &str, session_id: &str) -> Result<Self> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let channel = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("Invalid capture endpoint: {}", uri))?
            .connect()
            .await
            .with_context(|| format!("Failed to connect to capture endpoint {}", uri))?;
        let session = session_id
            .parse()
            .with_context(|| format!("Invalid session id: {}", session_id))?;

        Ok(Self { channel, session })
    }

    /// Connects using the variables injected into a discovery container
    pub async fn from_env() -> Result<Self> {
        let address = std::env::var(ENV_SERVICE_ADDRESS)
            .with_context(|| format!("{} is not set", ENV_SERVICE_ADDRESS))?;
        let session = std::env::var(ENV_SESSION_ID)
            .with_context(|| format!("{} is not set", ENV_SESSION_ID))?;
        Self::connect(&address, &session).await
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(SESSION_METADATA_KEY, self.session.clone());
        request
    }

    pub async fn declare(&self, declaration: &Declaration) -> Result<(), Status> {
        self.declare_raw(ResourceDeclareRequest::from(declaration))
            .await
    }

    /// Sends a declaration exactly as given, without going through the domain types
    pub async fn declare_raw(&self, request: ResourceDeclareRequest) -> Result<(), Status> {
        let mut client = ResourceServiceClient::new(self.channel.clone());
        client.declare(self.request(request)).await?;
        Ok(())
    }

    pub async fn details(&self, key: &ResourceKey) -> Result<ResourceDetails, Status> {
        let mut client = ResourceServiceClient::new(self.channel.clone());
        let response = client
            .details(self.request(ResourceDetailsRequest {
                resource: Some(Resource::from(key)),
            }))
            .await?
            .into_inner();

        Ok(ResourceDetails {
            id: response.id,
            provider: response.provider,
            service: response.service,
            url: response.details.map(|details| match details {
                resource_details_response::Details::Api(api) => api.url,
            }),
        })
    }

    /// Opens the trigger stream and sends `first` as its first message
    pub async fn start(&self, first: ClientMessage) -> Result<TriggerHandle, Status> {
        let (tx, rx) = mpsc::channel(4);
        tx.send(first)
            .await
            .map_err(|_| Status::internal("trigger stream closed before it was opened"))?;

        let mut client = FaasServiceClient::new(self.channel.clone());
        let responses = client
            .trigger_stream(self.request(ReceiverStream::new(rx)))
            .await?
            .into_inner();

        Ok(TriggerHandle {
            sender: Some(tx),
            responses,
        })
    }

    /// Performs the handshake for the given role and waits for the server to close
    pub async fn serve(&self, worker: Option<init_request::Worker>) -> Result<(), Status> {
        self.start(ClientMessage::init(worker)).await?.finish().await
    }
}

/// An open trigger stream
pub struct TriggerHandle {
    sender: Option<mpsc::Sender<ClientMessage>>,
    responses: Streaming<ServerMessage>,
}

impl TriggerHandle {
    /// Sends another message on the stream
    pub async fn send(&self, message: ClientMessage) -> Result<(), Status> {
        match &self.sender {
            Some(sender) => sender
                .send(message)
                .await
                .map_err(|_| Status::cancelled("trigger stream is closed")),
            None => Err(Status::cancelled("trigger stream is closed")),
        }
    }

    /// Closes the worker side and drains whatever the server still sends
    pub async fn finish(mut self) -> Result<(), Status> {
        self.sender.take();
        while self.responses.message().await?.is_some() {}
        Ok(())
    }
}
