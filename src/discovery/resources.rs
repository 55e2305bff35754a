//! Resource kinds and the declarations a handler can make about them

use super::error::DiscoveryError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// The closed set of resource kinds a handler may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Bucket,
    Collection,
    Queue,
    Topic,
    Secret,
    Policy,
    Api,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Bucket,
        ResourceKind::Collection,
        ResourceKind::Queue,
        ResourceKind::Topic,
        ResourceKind::Secret,
        ResourceKind::Policy,
        ResourceKind::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Bucket => "bucket",
            ResourceKind::Collection => "collection",
            ResourceKind::Queue => "queue",
            ResourceKind::Topic => "topic",
            ResourceKind::Secret => "secret",
            ResourceKind::Policy => "policy",
            ResourceKind::Api => "api",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DiscoveryError::UnsupportedResourceKind(s.to_string()))
    }
}

/// Identity of a resource within a project: `(kind, name)`
///
/// Serialized as the string `kind:name` so it can key JSON and YAML maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| DiscoveryError::invalid(format!("malformed resource key '{}'", s)))?;
        if name.is_empty() {
            return Err(DiscoveryError::invalid(format!(
                "resource key '{}' has an empty name",
                s
            )));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a function intends to use a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    Delete,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Delete => "delete",
        })
    }
}

/// Permissions a policy can grant over a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    BucketFileList,
    BucketFileGet,
    BucketFilePut,
    BucketFileDelete,
    TopicList,
    TopicDetail,
    TopicEventPublish,
    QueueSend,
    QueueReceive,
    QueueList,
    QueueDetail,
    CollectionDocumentRead,
    CollectionDocumentWrite,
    CollectionDocumentDelete,
    CollectionQuery,
    CollectionList,
    SecretPut,
    SecretAccess,
}

impl Action {
    /// The resource kind this action applies to
    pub fn kind(&self) -> ResourceKind {
        match self {
            Action::BucketFileList
            | Action::BucketFileGet
            | Action::BucketFilePut
            | Action::BucketFileDelete => ResourceKind::Bucket,
            Action::TopicList | Action::TopicDetail | Action::TopicEventPublish => {
                ResourceKind::Topic
            }
            Action::QueueSend | Action::QueueReceive | Action::QueueList | Action::QueueDetail => {
                ResourceKind::Queue
            }
            Action::CollectionDocumentRead
            | Action::CollectionDocumentWrite
            | Action::CollectionDocumentDelete
            | Action::CollectionQuery
            | Action::CollectionList => ResourceKind::Collection,
            Action::SecretPut | Action::SecretAccess => ResourceKind::Secret,
        }
    }

    pub fn access_mode(&self) -> AccessMode {
        match self {
            Action::BucketFileList
            | Action::BucketFileGet
            | Action::TopicList
            | Action::TopicDetail
            | Action::QueueList
            | Action::QueueDetail
            | Action::QueueReceive
            | Action::CollectionDocumentRead
            | Action::CollectionQuery
            | Action::CollectionList
            | Action::SecretAccess => AccessMode::Read,
            Action::BucketFilePut
            | Action::TopicEventPublish
            | Action::QueueSend
            | Action::CollectionDocumentWrite
            | Action::SecretPut => AccessMode::Write,
            Action::BucketFileDelete | Action::CollectionDocumentDelete => AccessMode::Delete,
        }
    }
}

/// Grant of a set of actions over a set of resources to the declaring function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyDeclaration {
    pub name: String,
    pub actions: BTreeSet<Action>,
    pub resources: BTreeSet<ResourceKey>,
}

impl PolicyDeclaration {
    /// Builds a policy, deriving a stable name from its content when none is given
    pub fn new(
        name: Option<String>,
        actions: impl IntoIterator<Item = Action>,
        resources: impl IntoIterator<Item = ResourceKey>,
    ) -> Result<Self, DiscoveryError> {
        let actions: BTreeSet<Action> = actions.into_iter().collect();
        let resources: BTreeSet<ResourceKey> = resources.into_iter().collect();

        if actions.is_empty() {
            return Err(DiscoveryError::invalid("policy grants no actions"));
        }
        if resources.is_empty() {
            return Err(DiscoveryError::invalid("policy targets no resources"));
        }
        for action in &actions {
            if !resources.iter().any(|r| r.kind == action.kind()) {
                return Err(DiscoveryError::invalid(format!(
                    "action {:?} has no {} resource to apply to",
                    action,
                    action.kind()
                )));
            }
        }

        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => derive_policy_name(&actions, &resources),
        };

        Ok(Self {
            name,
            actions,
            resources,
        })
    }

    /// Access modes this policy grants, per target resource
    pub fn grants(&self) -> BTreeSet<(ResourceKey, AccessMode)> {
        self.resources
            .iter()
            .flat_map(|resource| {
                self.actions
                    .iter()
                    .filter(move |action| action.kind() == resource.kind)
                    .map(move |action| (resource.clone(), action.access_mode()))
            })
            .collect()
    }

    pub fn absorb(&mut self, other: &PolicyDeclaration) {
        self.actions.extend(other.actions.iter().copied());
        self.resources.extend(other.resources.iter().cloned());
    }
}

fn derive_policy_name(actions: &BTreeSet<Action>, resources: &BTreeSet<ResourceKey>) -> String {
    let mut hasher = Sha256::new();
    for action in actions {
        hasher.update(format!("{:?};", action));
    }
    for resource in resources {
        hasher.update(resource.to_string());
        hasher.update(";");
    }
    let digest = hex::encode(hasher.finalize());
    format!("policy-{}", &digest[..12])
}

/// Authentication scheme an API can require
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SecurityDefinition {
    Jwt {
        issuer: String,
        audiences: BTreeSet<String>,
    },
}

/// Security configuration attached to an API resource
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security_definitions: BTreeMap<String, SecurityDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security: BTreeMap<String, BTreeSet<String>>,
}

impl ApiDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Folds another declaration of the same API into this one
    ///
    /// Definitions already present are kept; scope requirements are unioned.
    pub fn absorb(&mut self, other: &ApiDeclaration) {
        for (name, definition) in &other.security_definitions {
            self.security_definitions
                .entry(name.clone())
                .or_insert_with(|| definition.clone());
        }
        for (name, scopes) in &other.security {
            self.security
                .entry(name.clone())
                .or_default()
                .extend(scopes.iter().cloned());
        }
    }
}

/// A single resource declaration received from a handler
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Declaration {
    Bucket { name: String },
    Collection { name: String },
    Queue { name: String },
    Topic { name: String },
    Secret { name: String },
    Policy(PolicyDeclaration),
    Api(ApiDeclaration),
}

impl Declaration {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Declaration::Bucket { .. } => ResourceKind::Bucket,
            Declaration::Collection { .. } => ResourceKind::Collection,
            Declaration::Queue { .. } => ResourceKind::Queue,
            Declaration::Topic { .. } => ResourceKind::Topic,
            Declaration::Secret { .. } => ResourceKind::Secret,
            Declaration::Policy(_) => ResourceKind::Policy,
            Declaration::Api(_) => ResourceKind::Api,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Declaration::Bucket { name }
            | Declaration::Collection { name }
            | Declaration::Queue { name }
            | Declaration::Topic { name }
            | Declaration::Secret { name } => name,
            Declaration::Policy(policy) => &policy.name,
            Declaration::Api(api) => &api.name,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.name())
    }

    /// Builds a declaration for a kind that carries no extra configuration
    pub fn simple(kind: ResourceKind, name: impl Into<String>) -> Result<Self, DiscoveryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DiscoveryError::invalid(format!("{} name is empty", kind)));
        }
        Ok(match kind {
            ResourceKind::Bucket => Declaration::Bucket { name },
            ResourceKind::Collection => Declaration::Collection { name },
            ResourceKind::Queue => Declaration::Queue { name },
            ResourceKind::Topic => Declaration::Topic { name },
            ResourceKind::Secret => Declaration::Secret { name },
            ResourceKind::Policy | ResourceKind::Api => {
                return Err(DiscoveryError::invalid(format!(
                    "{} declarations require configuration",
                    kind
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_round_trips_through_string() {
        let key = ResourceKey::new(ResourceKind::Bucket, "uploads");
        assert_eq!(key.to_string(), "bucket:uploads");
        assert_eq!("bucket:uploads".parse::<ResourceKey>().unwrap(), key);
    }

    #[test]
    fn test_resource_key_rejects_unknown_kind() {
        let err = "database:main".parse::<ResourceKey>().unwrap_err();
        assert_eq!(err, DiscoveryError::UnsupportedResourceKind("database".into()));
        assert!("bucket".parse::<ResourceKey>().is_err());
        assert!("bucket:".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_resource_key_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(ResourceKey::new(ResourceKind::Topic, "orders"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"topic:orders":1}"#);
    }

    #[test]
    fn test_policy_grants() {
        let policy = PolicyDeclaration::new(
            None,
            [Action::BucketFileGet, Action::BucketFilePut, Action::QueueSend],
            [
                ResourceKey::new(ResourceKind::Bucket, "uploads"),
                ResourceKey::new(ResourceKind::Queue, "jobs"),
            ],
        )
        .unwrap();

        let grants = policy.grants();
        assert_eq!(grants.len(), 3);
        assert!(grants.contains(&(
            ResourceKey::new(ResourceKind::Bucket, "uploads"),
            AccessMode::Read
        )));
        assert!(grants.contains(&(
            ResourceKey::new(ResourceKind::Bucket, "uploads"),
            AccessMode::Write
        )));
        assert!(grants.contains(&(
            ResourceKey::new(ResourceKind::Queue, "jobs"),
            AccessMode::Write
        )));
    }

    #[test]
    fn test_policy_name_is_derived_from_content() {
        let a = PolicyDeclaration::new(
            None,
            [Action::SecretAccess],
            [ResourceKey::new(ResourceKind::Secret, "api-key")],
        )
        .unwrap();
        let b = PolicyDeclaration::new(
            Some(String::new()),
            [Action::SecretAccess],
            [ResourceKey::new(ResourceKind::Secret, "api-key")],
        )
        .unwrap();
        assert_eq!(a.name, b.name);
        assert!(a.name.starts_with("policy-"));
    }

    #[test]
    fn test_policy_rejects_action_without_target() {
        let err = PolicyDeclaration::new(
            None,
            [Action::TopicEventPublish],
            [ResourceKey::new(ResourceKind::Bucket, "uploads")],
        )
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidDeclaration(_)));
    }

    #[test]
    fn test_simple_declaration_requires_name() {
        assert!(Declaration::simple(ResourceKind::Bucket, "").is_err());
        assert!(Declaration::simple(ResourceKind::Api, "main").is_err());
        let decl = Declaration::simple(ResourceKind::Queue, "jobs").unwrap();
        assert_eq!(decl.key(), ResourceKey::new(ResourceKind::Queue, "jobs"));
    }

    #[test]
    fn test_api_absorb_keeps_first_definition() {
        let mut first = ApiDeclaration::new("main");
        first.security_definitions.insert(
            "user".into(),
            SecurityDefinition::Jwt {
                issuer: "https://a.example".into(),
                audiences: BTreeSet::new(),
            },
        );
        let mut second = ApiDeclaration::new("main");
        second.security_definitions.insert(
            "user".into(),
            SecurityDefinition::Jwt {
                issuer: "https://b.example".into(),
                audiences: BTreeSet::new(),
            },
        );
        second
            .security
            .insert("user".into(), ["read".to_string()].into_iter().collect());

        first.absorb(&second);
        assert_eq!(
            first.security_definitions["user"],
            SecurityDefinition::Jwt {
                issuer: "https://a.example".into(),
                audiences: BTreeSet::new(),
            }
        );
        assert!(first.security["user"].contains("read"));
    }
}
