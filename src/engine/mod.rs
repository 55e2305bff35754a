//! Container engine interface
//!
//! Everything that touches images and containers goes through [`ContainerEngine`].
//! [`DockerEngine`] talks to a local Docker daemon; [`MockEngine`] runs scripted
//! workers in-process for tests.

mod docker;
mod mock;

pub use docker::DockerEngine;
pub use mock::{MockEngine, WorkerScript};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Label carrying the project name on images and containers
pub const LABEL_PROJECT: &str = "nimbus.project";
/// Label carrying the function or container name
pub const LABEL_COMPONENT: &str = "nimbus.component";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to package build context {path}: {error}")]
    Context { path: PathBuf, error: String },

    #[error("Build of {tag} failed: {diagnostic}")]
    Build { tag: String, diagnostic: String },

    #[error("Failed to run {image}: {error}")]
    Run { image: String, error: String },

    #[error("Failed to stop container {id}: {error}")]
    Stop { id: String, error: String },

    #[error("Failed to list images: {0}")]
    List(String),
}

/// One image build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build descriptor (Dockerfile) path
    pub descriptor: PathBuf,
    /// Directory sent as the build context
    pub context: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl BuildRequest {
    pub fn new(descriptor: impl Into<PathBuf>, context: impl Into<PathBuf>, tag: &str) -> Self {
        Self {
            descriptor: descriptor.into(),
            context: context.into(),
            tag: tag.to_string(),
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn build_arg(mut self, key: &str, value: &str) -> Self {
        self.build_args.insert(key.to_string(), value.to_string());
        self
    }

    /// Labels the image with its project and component
    pub fn component(mut self, project: &str, component: &str) -> Self {
        self.labels
            .insert(LABEL_PROJECT.to_string(), project.to_string());
        self.labels
            .insert(LABEL_COMPONENT.to_string(), component.to_string());
        self
    }
}

/// One container start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

/// A started container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
}

/// An image known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub id: String,
    pub tags: Vec<String>,
    pub project: String,
    pub component: String,
    pub created: Option<DateTime<Utc>>,
    pub size: i64,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Builds `request.tag` from a descriptor and context directory
    async fn build(&self, request: &BuildRequest) -> Result<(), EngineError>;

    /// Creates and starts a container
    async fn run(&self, request: &RunRequest) -> Result<ContainerHandle, EngineError>;

    /// Stops and removes a container
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    /// Images labelled with the given project and component
    async fn list_images(&self, project: &str, component: &str)
        -> Result<Vec<Image>, EngineError>;
}
