//! Per-function accumulator of trigger bindings and resource declarations

use super::error::DiscoveryError;
use super::resources::{
    AccessMode, ApiDeclaration, Declaration, PolicyDeclaration, ResourceKey, ResourceKind,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// An HTTP route set bound to the function by an API worker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiRoute {
    pub api: String,
    pub path: String,
    pub methods: BTreeSet<String>,
    /// Per-route security requirements; `None` inherits the API default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<BTreeMap<String, BTreeSet<String>>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub security_disabled: bool,
}

/// A scheduled trigger normalized to a cron expression
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleBinding {
    pub key: String,
    pub cron: String,
}

impl ScheduleBinding {
    pub fn from_rate(key: impl Into<String>, rate: &str) -> Result<Self, DiscoveryError> {
        Ok(Self {
            key: key.into(),
            cron: rate_to_cron(rate)?,
        })
    }

    pub fn from_cron(key: impl Into<String>, cron: &str) -> Result<Self, DiscoveryError> {
        let fields = cron.split_whitespace().count();
        if fields != 5 {
            return Err(DiscoveryError::protocol(format!(
                "cron expression '{}' must have 5 fields, found {}",
                cron, fields
            )));
        }
        Ok(Self {
            key: key.into(),
            cron: cron.split_whitespace().collect::<Vec<_>>().join(" "),
        })
    }
}

fn rate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s+(minute|minutes|hour|hours|day|days)\s*$")
            .expect("rate pattern is valid")
    })
}

/// Converts a rate such as `5 minutes` into an equivalent cron expression
pub fn rate_to_cron(rate: &str) -> Result<String, DiscoveryError> {
    let caps = rate_pattern()
        .captures(rate)
        .ok_or_else(|| DiscoveryError::protocol(format!("invalid schedule rate '{}'", rate)))?;
    let every: u32 = caps[1]
        .parse()
        .map_err(|_| DiscoveryError::protocol(format!("invalid schedule rate '{}'", rate)))?;
    if every == 0 {
        return Err(DiscoveryError::protocol(format!(
            "schedule rate '{}' must be at least 1",
            rate
        )));
    }

    Ok(match &caps[2] {
        "minute" | "minutes" => format!("*/{} * * * *", every),
        "hour" | "hours" => format!("0 */{} * * *", every),
        _ => format!("0 0 */{} * *", every),
    })
}

/// The role a worker announces in its init request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
    /// Invocable function with no trigger of its own
    Plain,
    Api(ApiRoute),
    Schedule(ScheduleBinding),
    Subscription { topic: String },
}

/// A function's claim on a resource, optionally with an access mode
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceClaim {
    pub key: ResourceKey,
    pub function: String,
    pub access: Option<AccessMode>,
}

/// Everything one function declared during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDependencies {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub routes: BTreeSet<ApiRoute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schedules: BTreeMap<String, ScheduleBinding>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub subscriptions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<ResourceKey, Declaration>,
}

impl FunctionDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_api_handler(&mut self, route: ApiRoute) {
        self.routes.insert(route);
    }

    pub fn add_schedule_handler(&mut self, schedule: ScheduleBinding) {
        self.schedules.insert(schedule.key.clone(), schedule);
    }

    pub fn add_subscription_handler(&mut self, topic: impl Into<String>) {
        self.subscriptions.insert(topic.into());
    }

    /// Records the binding carried by a worker's init request
    pub fn add_worker(&mut self, role: WorkerRole) {
        match role {
            WorkerRole::Plain => {}
            WorkerRole::Api(route) => self.add_api_handler(route),
            WorkerRole::Schedule(schedule) => self.add_schedule_handler(schedule),
            WorkerRole::Subscription { topic } => self.add_subscription_handler(topic),
        }
    }

    pub fn add_bucket(&mut self, name: impl Into<String>) {
        self.add_simple(Declaration::Bucket { name: name.into() });
    }

    pub fn add_collection(&mut self, name: impl Into<String>) {
        self.add_simple(Declaration::Collection { name: name.into() });
    }

    pub fn add_queue(&mut self, name: impl Into<String>) {
        self.add_simple(Declaration::Queue { name: name.into() });
    }

    pub fn add_topic(&mut self, name: impl Into<String>) {
        self.add_simple(Declaration::Topic { name: name.into() });
    }

    pub fn add_secret(&mut self, name: impl Into<String>) {
        self.add_simple(Declaration::Secret { name: name.into() });
    }

    fn add_simple(&mut self, declaration: Declaration) {
        self.resources.entry(declaration.key()).or_insert(declaration);
    }

    pub fn add_policy(&mut self, policy: PolicyDeclaration) {
        let key = ResourceKey::new(ResourceKind::Policy, policy.name.clone());
        match self.resources.get_mut(&key) {
            Some(Declaration::Policy(existing)) => existing.absorb(&policy),
            _ => {
                self.resources.insert(key, Declaration::Policy(policy));
            }
        }
    }

    pub fn add_api(&mut self, api: ApiDeclaration) {
        let key = ResourceKey::new(ResourceKind::Api, api.name.clone());
        match self.resources.get_mut(&key) {
            Some(Declaration::Api(existing)) => existing.absorb(&api),
            _ => {
                self.resources.insert(key, Declaration::Api(api));
            }
        }
    }

    /// Dispatches a declaration to the accumulator for its kind
    ///
    /// Re-declaring an identical resource leaves the accumulator unchanged.
    pub fn declare(&mut self, declaration: Declaration) {
        match declaration {
            Declaration::Bucket { name } => self.add_bucket(name),
            Declaration::Collection { name } => self.add_collection(name),
            Declaration::Queue { name } => self.add_queue(name),
            Declaration::Topic { name } => self.add_topic(name),
            Declaration::Secret { name } => self.add_secret(name),
            Declaration::Policy(policy) => self.add_policy(policy),
            Declaration::Api(api) => self.add_api(api),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Declaration> {
        self.resources.get(key)
    }

    pub fn trigger_count(&self) -> usize {
        self.routes.len() + self.schedules.len() + self.subscriptions.len()
    }

    /// Every claim this function makes, attributed to `function`
    ///
    /// Each declared resource yields one claim without an access mode; each grant
    /// from a declared policy yields one claim with the granted mode.
    pub fn claims(&self, function: &str) -> BTreeSet<ResourceClaim> {
        let mut claims = BTreeSet::new();
        for (key, declaration) in &self.resources {
            claims.insert(ResourceClaim {
                key: key.clone(),
                function: function.to_string(),
                access: None,
            });
            if let Declaration::Policy(policy) = declaration {
                for (target, mode) in policy.grants() {
                    claims.insert(ResourceClaim {
                        key: target,
                        function: function.to_string(),
                        access: Some(mode),
                    });
                }
            }
        }
        claims
    }

    /// Folds another accumulator for the same function into this one
    pub fn absorb(&mut self, other: &FunctionDependencies) {
        self.routes.extend(other.routes.iter().cloned());
        for schedule in other.schedules.values() {
            self.schedules
                .entry(schedule.key.clone())
                .or_insert_with(|| schedule.clone());
        }
        self.subscriptions
            .extend(other.subscriptions.iter().cloned());
        for declaration in other.resources.values() {
            self.declare(declaration.clone());
        }
    }
}
