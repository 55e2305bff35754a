//! Code-as-config discovery
//!
//! Every function handler is built into an ephemeral image and started with the
//! address of a local capture server. The handler's startup code declares the
//! resources it uses and identifies its trigger role over gRPC; the per-function
//! results are merged into a [`DependencyGraph`].

pub mod client;
mod dependencies;
mod error;
mod graph;
mod health;
mod orchestrator;
pub mod proto;
mod resources;
mod server;
mod session;

pub use dependencies::{
    rate_to_cron, ApiRoute, FunctionDependencies, ResourceClaim, ScheduleBinding, WorkerRole,
};
pub use error::DiscoveryError;
pub use graph::{
    AccessGrant, DependencyGraph, FunctionTriggers, GraphResource, GraphWarning, ResourceDetail,
};
pub use health::CaptureHealth;
pub use orchestrator::{DiscoveryFailure, DiscoveryOrchestrator, DiscoveryOutcome};
pub use resources::{
    AccessMode, Action, ApiDeclaration, Declaration, PolicyDeclaration, ResourceKey,
    ResourceKind, SecurityDefinition,
};
pub use server::{CaptureServer, CaptureService, SessionTable, SessionTicket};
pub use session::{CaptureSession, SessionOutcome, SessionState};
