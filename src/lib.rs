//! nimbus - code-as-config discovery for multi-language serverless projects
//!
//! A project's infrastructure is never written down separately: every function
//! handler declares the buckets, queues, topics, collections, secrets, policies
//! and APIs it uses, and its trigger, from its own startup code. nimbus builds
//! each handler into an ephemeral container, runs it against a local gRPC
//! capture server, and merges what the handlers declared into one dependency
//! graph.
//!
//! # Core Concepts
//!
//! - **Runtime resolution**: a handler's file extension selects its language
//!   runtime, which knows how to build and start it
//! - **Capture session**: one handler's two-phase conversation with the capture
//!   server (resource declarations, then the trigger handshake)
//! - **Dependency graph**: the merged view with one entry per resource and the
//!   triggers of every function
//!
//! # Example Usage
//!
//! ```no_run
//! use nimbus::{DiscoveryOrchestrator, NimbusConfig, Project};
//! use nimbus::engine::DockerEngine;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let project = Project::load("./shop")?;
//! let engine = Arc::new(DockerEngine::connect().await?);
//! let outcome = DiscoveryOrchestrator::new(engine, NimbusConfig::default())
//!     .discover(&project)
//!     .await?;
//!
//! for resource in outcome.graph.resources() {
//!     println!("{} {}", resource.kind, resource.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Project Structure
//!
//! - [`project`]: project layout and handler discovery
//! - [`runtime`]: language runtimes and build descriptors
//! - [`build`]: build workspace and image builds
//! - [`engine`]: container engine abstraction
//! - [`discovery`]: capture server, sessions, orchestration and the graph

pub mod build;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod progress;
pub mod project;
pub mod runtime;
pub mod util;

pub use build::{BuildReport, ImageBuilder};
pub use config::{ConfigError, NimbusConfig, Provider};
pub use discovery::{
    DependencyGraph, DiscoveryError, DiscoveryFailure, DiscoveryOrchestrator, DiscoveryOutcome,
    FunctionDependencies,
};
pub use engine::{ContainerEngine, EngineError};
pub use project::{FunctionHandler, Project, ProjectError};
pub use runtime::{RuntimeProfile, RuntimeRegistry};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "nimbus");
    }
}
