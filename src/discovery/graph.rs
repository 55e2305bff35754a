//! Project-wide dependency graph
//!
//! The graph is built in one step from the dependencies of every function that
//! completed discovery. Inputs are keyed and iterated by function name, so the
//! result does not depend on the order functions finished in, and feeding the same
//! function twice changes nothing.

use super::dependencies::{ApiRoute, FunctionDependencies, ScheduleBinding};
use super::resources::{
    AccessMode, Action, Declaration, ResourceKey, ResourceKind, SecurityDefinition,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One function's access to a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AccessGrant {
    pub function: String,
    pub mode: AccessMode,
}

impl AccessGrant {
    pub fn new(function: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            function: function.into(),
            mode,
        }
    }
}

impl fmt::Display for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, self.mode)
    }
}

/// Kind-specific content of a merged resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceDetail {
    Plain,
    Policy {
        actions: BTreeSet<Action>,
        resources: BTreeSet<ResourceKey>,
    },
    Api {
        security_definitions: BTreeMap<String, SecurityDefinition>,
        /// Function whose definition was kept, per definition name
        defined_by: BTreeMap<String, String>,
        security: BTreeMap<String, BTreeSet<String>>,
    },
}

impl ResourceDetail {
    fn empty(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Policy => ResourceDetail::Policy {
                actions: BTreeSet::new(),
                resources: BTreeSet::new(),
            },
            ResourceKind::Api => ResourceDetail::Api {
                security_definitions: BTreeMap::new(),
                defined_by: BTreeMap::new(),
                security: BTreeMap::new(),
            },
            ResourceKind::Bucket
            | ResourceKind::Collection
            | ResourceKind::Queue
            | ResourceKind::Topic
            | ResourceKind::Secret => ResourceDetail::Plain,
        }
    }
}

/// The single graph entry for a `(kind, name)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphResource {
    pub kind: ResourceKind,
    pub name: String,
    /// Functions that declared the resource
    pub claimed_by: BTreeSet<String>,
    /// Union of the access modes granted to functions through policies
    pub access: BTreeSet<AccessGrant>,
    pub detail: ResourceDetail,
}

impl GraphResource {
    fn new(key: &ResourceKey) -> Self {
        Self {
            kind: key.kind,
            name: key.name.clone(),
            claimed_by: BTreeSet::new(),
            access: BTreeSet::new(),
            detail: ResourceDetail::empty(key.kind),
        }
    }

    fn absorb(&mut self, function: &str, declaration: &Declaration, warnings: &mut BTreeSet<GraphWarning>) {
        match (declaration, &mut self.detail) {
            (Declaration::Policy(policy), ResourceDetail::Policy { actions, resources }) => {
                actions.extend(policy.actions.iter().copied());
                resources.extend(policy.resources.iter().cloned());
            }
            (
                Declaration::Api(api),
                ResourceDetail::Api {
                    security_definitions,
                    defined_by,
                    security,
                },
            ) => {
                for (name, definition) in &api.security_definitions {
                    match security_definitions.get(name) {
                        None => {
                            security_definitions.insert(name.clone(), definition.clone());
                            defined_by.insert(name.clone(), function.to_string());
                        }
                        Some(existing) if existing == definition => {}
                        Some(_) => {
                            warnings.insert(GraphWarning::ConflictingSecurityDefinition {
                                api: api.name.clone(),
                                definition: name.clone(),
                                kept_from: defined_by.get(name).cloned().unwrap_or_default(),
                                ignored_from: function.to_string(),
                            });
                        }
                    }
                }
                for (name, scopes) in &api.security {
                    security
                        .entry(name.clone())
                        .or_default()
                        .extend(scopes.iter().cloned());
                }
            }
            _ => {}
        }
    }
}

/// Trigger bindings of one function, kept function-scoped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunctionTriggers {
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub routes: BTreeSet<ApiRoute>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub schedules: BTreeSet<ScheduleBinding>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub subscriptions: BTreeSet<String>,
}

impl FunctionTriggers {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.schedules.is_empty() && self.subscriptions.is_empty()
    }
}

impl From<&FunctionDependencies> for FunctionTriggers {
    fn from(deps: &FunctionDependencies) -> Self {
        Self {
            routes: deps.routes.clone(),
            schedules: deps.schedules.values().cloned().collect(),
            subscriptions: deps.subscriptions.clone(),
        }
    }
}

/// Non-fatal findings of the merge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum GraphWarning {
    DanglingSubscription {
        function: String,
        topic: String,
    },
    DanglingApiRoute {
        function: String,
        api: String,
        path: String,
    },
    DanglingPolicyTarget {
        function: String,
        policy: String,
        resource: ResourceKey,
    },
    DuplicateSchedule {
        key: String,
        functions: BTreeSet<String>,
    },
    ConflictingSecurityDefinition {
        api: String,
        definition: String,
        kept_from: String,
        ignored_from: String,
    },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphWarning::DanglingSubscription { function, topic } => write!(
                f,
                "function '{}' subscribes to topic '{}' which no function declares",
                function, topic
            ),
            GraphWarning::DanglingApiRoute {
                function,
                api,
                path,
            } => write!(
                f,
                "function '{}' routes {} on api '{}' which no function declares",
                function, path, api
            ),
            GraphWarning::DanglingPolicyTarget {
                function,
                policy,
                resource,
            } => write!(
                f,
                "policy '{}' of function '{}' targets {} which no function declares",
                policy, function, resource
            ),
            GraphWarning::DuplicateSchedule { key, functions } => write!(
                f,
                "schedule '{}' is registered by several functions: {}",
                key,
                functions.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            GraphWarning::ConflictingSecurityDefinition {
                api,
                definition,
                kept_from,
                ignored_from,
            } => write!(
                f,
                "api '{}' security definition '{}' differs between '{}' and '{}'; keeping '{}'",
                api, definition, kept_from, ignored_from, kept_from
            ),
        }
    }
}

/// The merged, validated result of discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    resources: BTreeMap<ResourceKey, GraphResource>,
    functions: BTreeMap<String, FunctionTriggers>,
    warnings: Vec<GraphWarning>,
}

impl DependencyGraph {
    /// Merges the dependencies of every function into one graph
    ///
    /// Claims are grouped by `(kind, name)`; access grants are unioned per group.
    /// Trigger bindings stay with their function and are validated against the
    /// merged resources.
    pub fn build<'a, I>(functions: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a FunctionDependencies)>,
    {
        let mut by_function: BTreeMap<String, FunctionDependencies> = BTreeMap::new();
        for (name, deps) in functions {
            by_function.entry(name.to_string()).or_default().absorb(deps);
        }

        let mut resources: BTreeMap<ResourceKey, GraphResource> = BTreeMap::new();
        let mut warnings = BTreeSet::new();

        for (function, deps) in &by_function {
            for (key, declaration) in &deps.resources {
                let resource = resources
                    .entry(key.clone())
                    .or_insert_with(|| GraphResource::new(key));
                resource.claimed_by.insert(function.clone());
                resource.absorb(function, declaration, &mut warnings);
            }
        }

        for (function, deps) in &by_function {
            for claim in deps.claims(function) {
                let Some(mode) = claim.access else { continue };
                if let Some(resource) = resources.get_mut(&claim.key) {
                    resource.access.insert(AccessGrant::new(function.clone(), mode));
                }
            }
            for declaration in deps.resources.values() {
                if let Declaration::Policy(policy) = declaration {
                    for target in &policy.resources {
                        if !resources.contains_key(target) {
                            warnings.insert(GraphWarning::DanglingPolicyTarget {
                                function: function.clone(),
                                policy: policy.name.clone(),
                                resource: target.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut schedules: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut triggers = BTreeMap::new();
        for (function, deps) in &by_function {
            for topic in &deps.subscriptions {
                let key = ResourceKey::new(ResourceKind::Topic, topic.clone());
                if !resources.contains_key(&key) {
                    warnings.insert(GraphWarning::DanglingSubscription {
                        function: function.clone(),
                        topic: topic.clone(),
                    });
                }
            }
            for route in &deps.routes {
                let key = ResourceKey::new(ResourceKind::Api, route.api.clone());
                if !resources.contains_key(&key) {
                    warnings.insert(GraphWarning::DanglingApiRoute {
                        function: function.clone(),
                        api: route.api.clone(),
                        path: route.path.clone(),
                    });
                }
            }
            for key in deps.schedules.keys() {
                schedules
                    .entry(key.clone())
                    .or_default()
                    .insert(function.clone());
            }
            triggers.insert(function.clone(), FunctionTriggers::from(deps));
        }

        for (key, functions) in schedules {
            if functions.len() > 1 {
                warnings.insert(GraphWarning::DuplicateSchedule { key, functions });
            }
        }

        Self {
            resources,
            functions: triggers,
            warnings: warnings.into_iter().collect(),
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &GraphResource> {
        self.resources.values()
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&GraphResource> {
        self.resources.get(key)
    }

    /// Access grants of a resource, empty if the resource is not in the graph
    pub fn access(&self, key: &ResourceKey) -> BTreeSet<AccessGrant> {
        self.resources
            .get(key)
            .map(|r| r.access.clone())
            .unwrap_or_default()
    }

    pub fn functions(&self) -> &BTreeMap<String, FunctionTriggers> {
        &self.functions
    }

    pub fn triggers(&self, function: &str) -> Option<&FunctionTriggers> {
        self.functions.get(function)
    }

    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::resources::{ApiDeclaration, PolicyDeclaration};

    fn uploads() -> ResourceKey {
        ResourceKey::new(ResourceKind::Bucket, "uploads")
    }

    fn with_bucket_access(action: Action) -> FunctionDependencies {
        let mut deps = FunctionDependencies::new();
        deps.add_bucket("uploads");
        deps.add_policy(PolicyDeclaration::new(None, [action], [uploads()]).unwrap());
        deps
    }

    fn jwt(issuer: &str) -> SecurityDefinition {
        SecurityDefinition::Jwt {
            issuer: issuer.into(),
            audiences: BTreeSet::new(),
        }
    }

    #[test]
    fn test_shared_bucket_merges_access() {
        let a = with_bucket_access(Action::BucketFileGet);
        let b = with_bucket_access(Action::BucketFilePut);
        let graph = DependencyGraph::build([("a", &a), ("b", &b)]);

        let buckets: Vec<_> = graph
            .resources()
            .filter(|r| r.kind == ResourceKind::Bucket)
            .collect();
        assert_eq!(buckets.len(), 1);
        assert_eq!(
            graph.access(&uploads()),
            [
                AccessGrant::new("a", AccessMode::Read),
                AccessGrant::new("b", AccessMode::Write)
            ]
            .into_iter()
            .collect()
        );
        assert_eq!(
            buckets[0].claimed_by,
            ["a".to_string(), "b".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let a = with_bucket_access(Action::BucketFileGet);
        let mut b = with_bucket_access(Action::BucketFileDelete);
        b.add_topic("orders");
        b.add_subscription_handler("orders");
        let mut c = FunctionDependencies::new();
        c.add_subscription_handler("missing");

        let forward = DependencyGraph::build([("a", &a), ("b", &b), ("c", &c)]);
        let reverse = DependencyGraph::build([("c", &c), ("b", &b), ("a", &a)]);
        let repeated = DependencyGraph::build([("b", &b), ("a", &a), ("c", &c), ("b", &b), ("a", &a)]);

        assert_eq!(forward, reverse);
        assert_eq!(forward, repeated);
    }

    #[test]
    fn test_dangling_subscription_is_a_warning() {
        let mut worker = FunctionDependencies::new();
        worker.add_subscription_handler("orders");
        let graph = DependencyGraph::build([("worker", &worker)]);

        assert_eq!(
            graph.warnings(),
            &[GraphWarning::DanglingSubscription {
                function: "worker".into(),
                topic: "orders".into()
            }]
        );
        assert!(graph.triggers("worker").unwrap().subscriptions.contains("orders"));
    }

    #[test]
    fn test_subscription_to_topic_declared_elsewhere() {
        let mut publisher = FunctionDependencies::new();
        publisher.add_topic("orders");
        let mut worker = FunctionDependencies::new();
        worker.add_subscription_handler("orders");

        let graph = DependencyGraph::build([("publisher", &publisher), ("worker", &worker)]);
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_dangling_policy_target() {
        let mut deps = FunctionDependencies::new();
        deps.add_policy(
            PolicyDeclaration::new(Some("p".into()), [Action::BucketFileGet], [uploads()])
                .unwrap(),
        );
        let graph = DependencyGraph::build([("a", &deps)]);

        assert!(graph.resource(&uploads()).is_none());
        assert!(matches!(
            graph.warnings(),
            [GraphWarning::DanglingPolicyTarget { policy, .. }] if policy == "p"
        ));
    }

    #[test]
    fn test_duplicate_schedule_key() {
        let mut a = FunctionDependencies::new();
        a.add_schedule_handler(ScheduleBinding::from_rate("cleanup", "5 minutes").unwrap());
        let mut b = FunctionDependencies::new();
        b.add_schedule_handler(ScheduleBinding::from_rate("cleanup", "1 hour").unwrap());

        let graph = DependencyGraph::build([("a", &a), ("b", &b)]);
        assert!(matches!(
            graph.warnings(),
            [GraphWarning::DuplicateSchedule { key, functions }]
                if key == "cleanup" && functions.len() == 2
        ));
    }

    #[test]
    fn test_conflicting_security_definition_keeps_first_function() {
        let mut a_api = ApiDeclaration::new("main");
        a_api
            .security_definitions
            .insert("user".into(), jwt("https://a.example"));
        let mut a = FunctionDependencies::new();
        a.add_api(a_api);

        let mut b_api = ApiDeclaration::new("main");
        b_api
            .security_definitions
            .insert("user".into(), jwt("https://b.example"));
        let mut b = FunctionDependencies::new();
        b.add_api(b_api);

        let forward = DependencyGraph::build([("a", &a), ("b", &b)]);
        let reverse = DependencyGraph::build([("b", &b), ("a", &a)]);
        assert_eq!(forward, reverse);

        let api = forward
            .resource(&ResourceKey::new(ResourceKind::Api, "main"))
            .unwrap();
        match &api.detail {
            ResourceDetail::Api {
                security_definitions,
                defined_by,
                ..
            } => {
                assert_eq!(security_definitions["user"], jwt("https://a.example"));
                assert_eq!(defined_by["user"], "a");
            }
            other => panic!("expected api detail, got {:?}", other),
        }
        assert!(matches!(
            forward.warnings(),
            [GraphWarning::ConflictingSecurityDefinition { kept_from, ignored_from, .. }]
                if kept_from == "a" && ignored_from == "b"
        ));
    }

    #[test]
    fn test_route_to_undeclared_api() {
        let mut deps = FunctionDependencies::new();
        deps.add_api_handler(ApiRoute {
            api: "main".into(),
            path: "/orders".into(),
            methods: ["GET".to_string()].into_iter().collect(),
            security: None,
            security_disabled: false,
        });
        let graph = DependencyGraph::build([("orders", &deps)]);
        assert!(matches!(
            graph.warnings(),
            [GraphWarning::DanglingApiRoute { api, .. }] if api == "main"
        ));
    }

    #[test]
    fn test_graph_serializes_resource_keys_as_strings() {
        let a = with_bucket_access(Action::BucketFileGet);
        let graph = DependencyGraph::build([("a", &a)]);
        let json = serde_json::to_value(&graph).unwrap();
        assert!(json["resources"]["bucket:uploads"].is_object());
        assert_eq!(json["resources"]["bucket:uploads"]["detail"]["type"], "plain");
    }
}
