//! Wire types of the capture protocol
//!
//! Two services share one endpoint:
//! - `nimbus.faas.v1.FaasService/TriggerStream`: the identity handshake
//! - `nimbus.resource.v1.ResourceService/{Declare,Details}`: resource declarations
//!
//! The calling session is identified by the [`SESSION_METADATA_KEY`] request header.

use super::dependencies::{ApiRoute, ScheduleBinding, WorkerRole};
use super::error::DiscoveryError;
use super::resources::{
    Action as DomainAction, ApiDeclaration, Declaration, PolicyDeclaration, ResourceKey,
    ResourceKind, SecurityDefinition,
};
use std::collections::{BTreeSet, HashMap};

/// Request metadata carrying the capture session id
pub const SESSION_METADATA_KEY: &str = "x-nimbus-session";

include!(concat!(env!("OUT_DIR"), "/nimbus.faas.v1.FaasService.rs"));
include!(concat!(env!("OUT_DIR"), "/nimbus.resource.v1.ResourceService.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "client_message::Content", tags = "2, 3")]
    pub content: Option<client_message::Content>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "2")]
        InitRequest(super::InitRequest),
        #[prost(message, tag = "3")]
        TriggerResponse(super::TriggerResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "server_message::Content", tags = "2")]
    pub content: Option<server_message::Content>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "2")]
        InitResponse(super::InitResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequest {
    #[prost(oneof = "init_request::Worker", tags = "10, 11, 12")]
    pub worker: Option<init_request::Worker>,
}

pub mod init_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Worker {
        #[prost(message, tag = "10")]
        Api(super::ApiWorker),
        #[prost(message, tag = "11")]
        Subscription(super::SubscriptionWorker),
        #[prost(message, tag = "12")]
        Schedule(super::ScheduleWorker),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TriggerResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiWorker {
    #[prost(string, tag = "1")]
    pub api: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, repeated, tag = "3")]
    pub methods: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub options: Option<ApiWorkerOptions>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiWorkerOptions {
    #[prost(map = "string, message", tag = "1")]
    pub security: HashMap<String, ApiScopes>,
    #[prost(bool, tag = "2")]
    pub security_disabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiScopes {
    #[prost(string, repeated, tag = "1")]
    pub scopes: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionWorker {
    #[prost(string, tag = "1")]
    pub topic: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleWorker {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "schedule_worker::Cadence", tags = "10, 11")]
    pub cadence: Option<schedule_worker::Cadence>,
}

pub mod schedule_worker {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Cadence {
        #[prost(message, tag = "10")]
        Rate(super::ScheduleRate),
        #[prost(message, tag = "11")]
        Cron(super::ScheduleCron),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleRate {
    #[prost(string, tag = "1")]
    pub rate: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleCron {
    #[prost(string, tag = "1")]
    pub cron: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResourceType {
    Unspecified = 0,
    Bucket = 1,
    Collection = 2,
    Queue = 3,
    Topic = 4,
    Secret = 5,
    Policy = 6,
    Api = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Action {
    BucketFileList = 0,
    BucketFileGet = 1,
    BucketFilePut = 2,
    BucketFileDelete = 3,
    TopicList = 200,
    TopicDetail = 201,
    TopicEventPublish = 202,
    QueueSend = 300,
    QueueReceive = 301,
    QueueList = 302,
    QueueDetail = 303,
    CollectionDocumentRead = 400,
    CollectionDocumentWrite = 401,
    CollectionDocumentDelete = 402,
    CollectionQuery = 403,
    CollectionList = 404,
    SecretPut = 500,
    SecretAccess = 501,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(enumeration = "ResourceType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceDeclareRequest {
    #[prost(message, optional, tag = "1")]
    pub resource: Option<Resource>,
    #[prost(oneof = "resource_declare_request::Config", tags = "10, 11")]
    pub config: Option<resource_declare_request::Config>,
}

pub mod resource_declare_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Config {
        #[prost(message, tag = "10")]
        Policy(super::PolicyResource),
        #[prost(message, tag = "11")]
        Api(super::ApiResource),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceDeclareResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyResource {
    #[prost(enumeration = "Action", repeated, tag = "1")]
    pub actions: Vec<i32>,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Resource>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiResource {
    #[prost(map = "string, message", tag = "1")]
    pub security_definitions: HashMap<String, ApiSecurityDefinition>,
    #[prost(map = "string, message", tag = "2")]
    pub security: HashMap<String, ApiScopes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiSecurityDefinition {
    #[prost(oneof = "api_security_definition::Definition", tags = "1")]
    pub definition: Option<api_security_definition::Definition>,
}

pub mod api_security_definition {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Definition {
        #[prost(message, tag = "1")]
        Jwt(super::ApiSecurityDefinitionJwt),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiSecurityDefinitionJwt {
    #[prost(string, tag = "1")]
    pub issuer: String,
    #[prost(string, repeated, tag = "2")]
    pub audiences: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceDetailsRequest {
    #[prost(message, optional, tag = "1")]
    pub resource: Option<Resource>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceDetailsResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub provider: String,
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(oneof = "resource_details_response::Details", tags = "10")]
    pub details: Option<resource_details_response::Details>,
}

pub mod resource_details_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Details {
        #[prost(message, tag = "10")]
        Api(super::ApiResourceDetails),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiResourceDetails {
    #[prost(string, tag = "1")]
    pub url: String,
}

// Conversions between wire and domain types

impl From<ResourceKind> for ResourceType {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Bucket => ResourceType::Bucket,
            ResourceKind::Collection => ResourceType::Collection,
            ResourceKind::Queue => ResourceType::Queue,
            ResourceKind::Topic => ResourceType::Topic,
            ResourceKind::Secret => ResourceType::Secret,
            ResourceKind::Policy => ResourceType::Policy,
            ResourceKind::Api => ResourceType::Api,
        }
    }
}

impl Resource {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            r#type: ResourceType::from(kind) as i32,
            name: name.into(),
        }
    }

    /// Resolves the wire resource into a domain key
    ///
    /// Unknown or unspecified type values are rejected as unsupported kinds.
    pub fn key(&self) -> Result<ResourceKey, DiscoveryError> {
        let kind = match ResourceType::try_from(self.r#type) {
            Ok(ResourceType::Bucket) => ResourceKind::Bucket,
            Ok(ResourceType::Collection) => ResourceKind::Collection,
            Ok(ResourceType::Queue) => ResourceKind::Queue,
            Ok(ResourceType::Topic) => ResourceKind::Topic,
            Ok(ResourceType::Secret) => ResourceKind::Secret,
            Ok(ResourceType::Policy) => ResourceKind::Policy,
            Ok(ResourceType::Api) => ResourceKind::Api,
            Ok(ResourceType::Unspecified) | Err(_) => {
                return Err(DiscoveryError::UnsupportedResourceKind(format!(
                    "resource type {}",
                    self.r#type
                )))
            }
        };
        Ok(ResourceKey::new(kind, self.name.clone()))
    }
}

impl From<&ResourceKey> for Resource {
    fn from(key: &ResourceKey) -> Self {
        Resource::new(key.kind, key.name.clone())
    }
}

impl From<DomainAction> for Action {
    fn from(action: DomainAction) -> Self {
        match action {
            DomainAction::BucketFileList => Action::BucketFileList,
            DomainAction::BucketFileGet => Action::BucketFileGet,
            DomainAction::BucketFilePut => Action::BucketFilePut,
            DomainAction::BucketFileDelete => Action::BucketFileDelete,
            DomainAction::TopicList => Action::TopicList,
            DomainAction::TopicDetail => Action::TopicDetail,
            DomainAction::TopicEventPublish => Action::TopicEventPublish,
            DomainAction::QueueSend => Action::QueueSend,
            DomainAction::QueueReceive => Action::QueueReceive,
            DomainAction::QueueList => Action::QueueList,
            DomainAction::QueueDetail => Action::QueueDetail,
            DomainAction::CollectionDocumentRead => Action::CollectionDocumentRead,
            DomainAction::CollectionDocumentWrite => Action::CollectionDocumentWrite,
            DomainAction::CollectionDocumentDelete => Action::CollectionDocumentDelete,
            DomainAction::CollectionQuery => Action::CollectionQuery,
            DomainAction::CollectionList => Action::CollectionList,
            DomainAction::SecretPut => Action::SecretPut,
            DomainAction::SecretAccess => Action::SecretAccess,
        }
    }
}

impl From<Action> for DomainAction {
    fn from(action: Action) -> Self {
        match action {
            Action::BucketFileList => DomainAction::BucketFileList,
            Action::BucketFileGet => DomainAction::BucketFileGet,
            Action::BucketFilePut => DomainAction::BucketFilePut,
            Action::BucketFileDelete => DomainAction::BucketFileDelete,
            Action::TopicList => DomainAction::TopicList,
            Action::TopicDetail => DomainAction::TopicDetail,
            Action::TopicEventPublish => DomainAction::TopicEventPublish,
            Action::QueueSend => DomainAction::QueueSend,
            Action::QueueReceive => DomainAction::QueueReceive,
            Action::QueueList => DomainAction::QueueList,
            Action::QueueDetail => DomainAction::QueueDetail,
            Action::CollectionDocumentRead => DomainAction::CollectionDocumentRead,
            Action::CollectionDocumentWrite => DomainAction::CollectionDocumentWrite,
            Action::CollectionDocumentDelete => DomainAction::CollectionDocumentDelete,
            Action::CollectionQuery => DomainAction::CollectionQuery,
            Action::CollectionList => DomainAction::CollectionList,
            Action::SecretPut => DomainAction::SecretPut,
            Action::SecretAccess => DomainAction::SecretAccess,
        }
    }
}

fn scopes_from_wire(map: HashMap<String, ApiScopes>) -> std::collections::BTreeMap<String, BTreeSet<String>> {
    map.into_iter()
        .map(|(name, scopes)| (name, scopes.scopes.into_iter().collect()))
        .collect()
}

fn scopes_to_wire(
    map: &std::collections::BTreeMap<String, BTreeSet<String>>,
) -> HashMap<String, ApiScopes> {
    map.iter()
        .map(|(name, scopes)| {
            (
                name.clone(),
                ApiScopes {
                    scopes: scopes.iter().cloned().collect(),
                },
            )
        })
        .collect()
}

impl TryFrom<ResourceDeclareRequest> for Declaration {
    type Error = DiscoveryError;

    fn try_from(request: ResourceDeclareRequest) -> Result<Self, Self::Error> {
        let resource = request
            .resource
            .ok_or_else(|| DiscoveryError::invalid("declaration names no resource"))?;
        let key = resource.key()?;

        match (key.kind, request.config) {
            (ResourceKind::Policy, Some(resource_declare_request::Config::Policy(policy))) => {
                let actions = policy
                    .actions
                    .iter()
                    .map(|raw| {
                        Action::try_from(*raw).map(DomainAction::from).map_err(|_| {
                            DiscoveryError::invalid(format!("unknown policy action {}", raw))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let resources = policy
                    .resources
                    .iter()
                    .map(Resource::key)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Declaration::Policy(PolicyDeclaration::new(
                    Some(key.name),
                    actions,
                    resources,
                )?))
            }
            (ResourceKind::Policy, _) => Err(DiscoveryError::invalid(
                "policy declaration carries no policy configuration",
            )),
            (ResourceKind::Api, config) => {
                if key.name.is_empty() {
                    return Err(DiscoveryError::invalid("api name is empty"));
                }
                let mut api = ApiDeclaration::new(key.name);
                match config {
                    Some(resource_declare_request::Config::Api(wire)) => {
                        for (name, definition) in wire.security_definitions {
                            match definition.definition {
                                Some(api_security_definition::Definition::Jwt(jwt)) => {
                                    api.security_definitions.insert(
                                        name,
                                        SecurityDefinition::Jwt {
                                            issuer: jwt.issuer,
                                            audiences: jwt.audiences.into_iter().collect(),
                                        },
                                    );
                                }
                                None => {
                                    return Err(DiscoveryError::invalid(format!(
                                        "security definition '{}' has no scheme",
                                        name
                                    )))
                                }
                            }
                        }
                        api.security = scopes_from_wire(wire.security);
                    }
                    Some(resource_declare_request::Config::Policy(_)) => {
                        return Err(DiscoveryError::invalid(
                            "api declaration carries policy configuration",
                        ))
                    }
                    None => {}
                }
                Ok(Declaration::Api(api))
            }
            (kind, _) => Declaration::simple(kind, key.name),
        }
    }
}

impl From<&Declaration> for ResourceDeclareRequest {
    fn from(declaration: &Declaration) -> Self {
        let config = match declaration {
            Declaration::Policy(policy) => {
                Some(resource_declare_request::Config::Policy(PolicyResource {
                    actions: policy
                        .actions
                        .iter()
                        .map(|action| Action::from(*action) as i32)
                        .collect(),
                    resources: policy.resources.iter().map(Resource::from).collect(),
                }))
            }
            Declaration::Api(api) => Some(resource_declare_request::Config::Api(ApiResource {
                security_definitions: api
                    .security_definitions
                    .iter()
                    .map(|(name, definition)| {
                        let SecurityDefinition::Jwt { issuer, audiences } = definition;
                        (
                            name.clone(),
                            ApiSecurityDefinition {
                                definition: Some(api_security_definition::Definition::Jwt(
                                    ApiSecurityDefinitionJwt {
                                        issuer: issuer.clone(),
                                        audiences: audiences.iter().cloned().collect(),
                                    },
                                )),
                            },
                        )
                    })
                    .collect(),
                security: scopes_to_wire(&api.security),
            })),
            _ => None,
        };

        ResourceDeclareRequest {
            resource: Some(Resource::from(&declaration.key())),
            config,
        }
    }
}

impl TryFrom<InitRequest> for WorkerRole {
    type Error = DiscoveryError;

    fn try_from(request: InitRequest) -> Result<Self, Self::Error> {
        match request.worker {
            None => Ok(WorkerRole::Plain),
            Some(init_request::Worker::Api(api)) => {
                if api.api.is_empty() || api.path.is_empty() {
                    return Err(DiscoveryError::protocol(
                        "api worker must name an api and a path",
                    ));
                }
                let options = api.options.unwrap_or_default();
                let security = if options.security.is_empty() {
                    None
                } else {
                    Some(scopes_from_wire(options.security))
                };
                Ok(WorkerRole::Api(ApiRoute {
                    api: api.api,
                    path: api.path,
                    methods: api
                        .methods
                        .into_iter()
                        .map(|m| m.to_uppercase())
                        .collect(),
                    security,
                    security_disabled: options.security_disabled,
                }))
            }
            Some(init_request::Worker::Subscription(sub)) => {
                if sub.topic.is_empty() {
                    return Err(DiscoveryError::protocol(
                        "subscription worker must name a topic",
                    ));
                }
                Ok(WorkerRole::Subscription { topic: sub.topic })
            }
            Some(init_request::Worker::Schedule(schedule)) => {
                if schedule.key.is_empty() {
                    return Err(DiscoveryError::protocol("schedule worker must carry a key"));
                }
                let binding = match schedule.cadence {
                    Some(schedule_worker::Cadence::Rate(rate)) => {
                        ScheduleBinding::from_rate(schedule.key, &rate.rate)?
                    }
                    Some(schedule_worker::Cadence::Cron(cron)) => {
                        ScheduleBinding::from_cron(schedule.key, &cron.cron)?
                    }
                    None => {
                        return Err(DiscoveryError::protocol(
                            "schedule worker must carry a rate or a cron expression",
                        ))
                    }
                };
                Ok(WorkerRole::Schedule(binding))
            }
        }
    }
}

impl ClientMessage {
    /// Wraps an init request as the first message of a trigger stream
    pub fn init(worker: Option<init_request::Worker>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: Some(client_message::Content::InitRequest(InitRequest { worker })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::resources::AccessMode;

    #[test]
    fn test_unspecified_type_is_unsupported() {
        let request = ResourceDeclareRequest {
            resource: Some(Resource {
                r#type: 0,
                name: "x".into(),
            }),
            config: None,
        };
        assert!(matches!(
            Declaration::try_from(request),
            Err(DiscoveryError::UnsupportedResourceKind(_))
        ));

        let request = ResourceDeclareRequest {
            resource: Some(Resource {
                r#type: 42,
                name: "x".into(),
            }),
            config: None,
        };
        assert!(matches!(
            Declaration::try_from(request),
            Err(DiscoveryError::UnsupportedResourceKind(_))
        ));
    }

    #[test]
    fn test_policy_declaration_from_wire() {
        let request = ResourceDeclareRequest {
            resource: Some(Resource::new(ResourceKind::Policy, "")),
            config: Some(resource_declare_request::Config::Policy(PolicyResource {
                actions: vec![Action::BucketFilePut as i32],
                resources: vec![Resource::new(ResourceKind::Bucket, "uploads")],
            })),
        };
        let declaration = Declaration::try_from(request).unwrap();
        match declaration {
            Declaration::Policy(policy) => {
                assert!(policy.name.starts_with("policy-"));
                assert!(policy.grants().contains(&(
                    ResourceKey::new(ResourceKind::Bucket, "uploads"),
                    AccessMode::Write
                )));
            }
            other => panic!("expected policy, got {:?}", other),
        }
    }

    #[test]
    fn test_policy_with_unknown_action_is_invalid() {
        let request = ResourceDeclareRequest {
            resource: Some(Resource::new(ResourceKind::Policy, "p")),
            config: Some(resource_declare_request::Config::Policy(PolicyResource {
                actions: vec![9999],
                resources: vec![Resource::new(ResourceKind::Bucket, "uploads")],
            })),
        };
        assert!(matches!(
            Declaration::try_from(request),
            Err(DiscoveryError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_api_declaration_survives_wire() {
        let mut api = ApiDeclaration::new("main");
        api.security_definitions.insert(
            "user".into(),
            SecurityDefinition::Jwt {
                issuer: "https://issuer.example".into(),
                audiences: ["orders".to_string()].into_iter().collect(),
            },
        );
        api.security
            .insert("user".into(), ["read".to_string()].into_iter().collect());
        let declaration = Declaration::Api(api);

        let wire = ResourceDeclareRequest::from(&declaration);
        assert_eq!(Declaration::try_from(wire).unwrap(), declaration);
    }

    #[test]
    fn test_init_request_roles() {
        assert_eq!(
            WorkerRole::try_from(InitRequest { worker: None }).unwrap(),
            WorkerRole::Plain
        );

        let schedule = InitRequest {
            worker: Some(init_request::Worker::Schedule(ScheduleWorker {
                key: "nightly".into(),
                cadence: Some(schedule_worker::Cadence::Rate(ScheduleRate {
                    rate: "2 hours".into(),
                })),
            })),
        };
        match WorkerRole::try_from(schedule).unwrap() {
            WorkerRole::Schedule(binding) => assert_eq!(binding.cron, "0 */2 * * *"),
            other => panic!("expected schedule, got {:?}", other),
        }

        let missing_topic = InitRequest {
            worker: Some(init_request::Worker::Subscription(SubscriptionWorker {
                topic: String::new(),
            })),
        };
        assert!(matches!(
            WorkerRole::try_from(missing_topic),
            Err(DiscoveryError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_api_worker_methods_are_normalized() {
        let init = InitRequest {
            worker: Some(init_request::Worker::Api(ApiWorker {
                api: "main".into(),
                path: "/orders".into(),
                methods: vec!["get".into(), "POST".into()],
                options: None,
            })),
        };
        match WorkerRole::try_from(init).unwrap() {
            WorkerRole::Api(route) => {
                assert_eq!(
                    route.methods.into_iter().collect::<Vec<_>>(),
                    vec!["GET".to_string(), "POST".to_string()]
                );
                assert!(route.security.is_none());
            }
            other => panic!("expected api route, got {:?}", other),
        }
    }
}
