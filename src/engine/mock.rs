//! In-process container engine for tests
//!
//! Instead of starting containers, `MockEngine` plays a [`WorkerScript`] against the
//! capture server using the reference [`WorkerClient`], picking the script by the
//! `NIMBUS_FUNCTION` variable the orchestrator injects.

use super::{
    BuildRequest, ContainerEngine, ContainerHandle, EngineError, Image, RunRequest,
    LABEL_COMPONENT, LABEL_PROJECT,
};
use crate::discovery::client::{WorkerClient, ENV_FUNCTION, ENV_SERVICE_ADDRESS, ENV_SESSION_ID};
use crate::discovery::proto::{
    client_message, init_request, ClientMessage, ResourceDeclareRequest, TriggerResponse,
};
use crate::discovery::Declaration;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a scripted worker does once its container is "started"
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Sends the declarations, then performs the handshake with `worker`
    Serve {
        declarations: Vec<ResourceDeclareRequest>,
        worker: Option<init_request::Worker>,
    },
    /// Like `Serve`, but keeps the process and its side of the stream alive
    /// until the container is stopped
    Linger {
        declarations: Vec<ResourceDeclareRequest>,
        worker: Option<init_request::Worker>,
    },
    /// Sends the declarations, then opens the stream with a non-init message
    Misbehave {
        declarations: Vec<ResourceDeclareRequest>,
    },
    /// Never contacts the capture server
    Silent,
}

impl WorkerScript {
    /// A plain worker declaring `declarations`
    pub fn plain(declarations: Vec<Declaration>) -> Self {
        Self::serve(declarations, None)
    }

    pub fn serve(declarations: Vec<Declaration>, worker: Option<init_request::Worker>) -> Self {
        Self::Serve {
            declarations: declarations.iter().map(ResourceDeclareRequest::from).collect(),
            worker,
        }
    }

    pub fn linger(declarations: Vec<Declaration>, worker: Option<init_request::Worker>) -> Self {
        Self::Linger {
            declarations: declarations.iter().map(ResourceDeclareRequest::from).collect(),
            worker,
        }
    }

    /// Adds a declaration exactly as it goes over the wire
    pub fn with_raw(mut self, request: ResourceDeclareRequest) -> Self {
        match &mut self {
            Self::Serve { declarations, .. }
            | Self::Linger { declarations, .. }
            | Self::Misbehave { declarations } => declarations.push(request),
            Self::Silent => {}
        }
        self
    }
}

/// A build the mock engine received, with the descriptor as it was at build time
#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub request: BuildRequest,
    pub descriptor: String,
}

/// A declaration the capture server rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDeclaration {
    pub function: String,
    pub code: tonic::Code,
    pub message: String,
}

#[derive(Default)]
pub struct MockEngine {
    scripts: Mutex<HashMap<String, WorkerScript>>,
    failing_builds: Mutex<Vec<String>>,
    slow_builds: Mutex<Vec<(String, Duration)>>,
    failing_runs: Mutex<HashSet<String>>,
    builds: Mutex<Vec<RecordedBuild>>,
    runs: Mutex<Vec<RunRequest>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    stopped: Mutex<Vec<String>>,
    stop_delay: Mutex<Option<Duration>>,
    rejected: std::sync::Arc<Mutex<Vec<RejectedDeclaration>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for the container started for `function`; unscripted functions run
    /// as plain workers without declarations
    pub fn script(&self, function: &str, script: WorkerScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(function.to_string(), script);
    }

    /// Fails every build whose tag contains `pattern`
    pub fn fail_build(&self, pattern: &str) {
        self.failing_builds
            .lock()
            .unwrap()
            .push(pattern.to_string());
    }

    /// Makes every build whose tag contains `pattern` take `delay`
    pub fn delay_build(&self, pattern: &str, delay: Duration) {
        self.slow_builds
            .lock()
            .unwrap()
            .push((pattern.to_string(), delay));
    }

    /// Fails starting the container of `function`
    pub fn fail_run(&self, function: &str) {
        self.failing_runs
            .lock()
            .unwrap()
            .insert(function.to_string());
    }

    /// Makes every stop take `delay`, like a container that honors a grace period
    pub fn delay_stop(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.lock().unwrap().clone()
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.request.tag.clone())
            .collect()
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.runs.lock().unwrap().clone()
    }

    /// Ids of containers that were stopped
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    /// Number of started containers that have not been stopped
    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn rejected(&self) -> Vec<RejectedDeclaration> {
        self.rejected.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn build(&self, request: &BuildRequest) -> Result<(), EngineError> {
        let descriptor =
            std::fs::read_to_string(&request.descriptor).map_err(|e| EngineError::Context {
                path: request.descriptor.clone(),
                error: e.to_string(),
            })?;

        self.builds.lock().unwrap().push(RecordedBuild {
            request: request.clone(),
            descriptor,
        });

        let delay = self
            .slow_builds
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| request.tag.contains(pattern.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_builds
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| request.tag.contains(pattern.as_str()));
        if failing {
            return Err(EngineError::Build {
                tag: request.tag.clone(),
                diagnostic: "scripted build failure".to_string(),
            });
        }

        debug!(tag = %request.tag, "Mock image built");
        Ok(())
    }

    async fn run(&self, request: &RunRequest) -> Result<ContainerHandle, EngineError> {
        self.runs.lock().unwrap().push(request.clone());

        let function = request.env.get(ENV_FUNCTION).cloned().unwrap_or_default();
        if self.failing_runs.lock().unwrap().contains(&function) {
            return Err(EngineError::Run {
                image: request.image.clone(),
                error: "scripted run failure".to_string(),
            });
        }

        let address = request.env.get(ENV_SERVICE_ADDRESS).cloned();
        let session = request.env.get(ENV_SESSION_ID).cloned();
        let (address, session) = match (address, session) {
            (Some(address), Some(session)) => (address, session),
            _ => {
                return Err(EngineError::Run {
                    image: request.image.clone(),
                    error: "capture endpoint not injected".to_string(),
                })
            }
        };

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&function)
            .cloned()
            .unwrap_or_else(|| WorkerScript::plain(Vec::new()));

        let id = uuid::Uuid::new_v4().to_string();
        let rejected = self.rejected.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = play(&function, script, &address, &session, rejected).await {
                warn!(function = %function, "Scripted worker failed: {:#}", e);
            }
        });
        self.running.lock().unwrap().insert(id.clone(), task);

        Ok(ContainerHandle {
            id,
            image: request.image.clone(),
        })
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(task) = self.running.lock().unwrap().remove(&handle.id) {
            task.abort();
        }
        self.stopped.lock().unwrap().push(handle.id.clone());
        Ok(())
    }

    async fn list_images(
        &self,
        project: &str,
        component: &str,
    ) -> Result<Vec<Image>, EngineError> {
        let builds = self.builds.lock().unwrap();
        Ok(builds
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.request.labels.get(LABEL_PROJECT).map(String::as_str) == Some(project)
                    && b.request.labels.get(LABEL_COMPONENT).map(String::as_str)
                        == Some(component)
            })
            .map(|(index, b)| Image {
                id: format!("mock-{}", index),
                tags: vec![b.request.tag.clone()],
                project: project.to_string(),
                component: component.to_string(),
                created: None,
                size: 0,
            })
            .collect())
    }
}

async fn play(
    function: &str,
    script: WorkerScript,
    address: &str,
    session: &str,
    rejected: std::sync::Arc<Mutex<Vec<RejectedDeclaration>>>,
) -> anyhow::Result<()> {
    let declarations = match &script {
        WorkerScript::Silent => return Ok(()),
        WorkerScript::Serve { declarations, .. }
        | WorkerScript::Linger { declarations, .. }
        | WorkerScript::Misbehave { declarations } => declarations.clone(),
    };

    let client = WorkerClient::connect(address, session).await?;
    for request in declarations {
        if let Err(status) = client.declare_raw(request).await {
            rejected.lock().unwrap().push(RejectedDeclaration {
                function: function.to_string(),
                code: status.code(),
                message: status.message().to_string(),
            });
        }
    }

    let linger = matches!(script, WorkerScript::Linger { .. });
    let first = match script {
        WorkerScript::Serve { worker, .. } | WorkerScript::Linger { worker, .. } => {
            ClientMessage::init(worker)
        }
        _ => ClientMessage {
            id: "bogus".to_string(),
            content: Some(client_message::Content::TriggerResponse(TriggerResponse {
                data: Vec::new(),
            })),
        },
    };

    // Protocol violations surface as an error status; the worker just exits
    match client.start(first).await {
        Ok(handle) if linger => {
            let _handle = handle;
            std::future::pending::<()>().await;
        }
        Ok(handle) => {
            let _ = handle.finish().await;
        }
        Err(status) => debug!(function, "Trigger stream rejected: {}", status.message()),
    }
    Ok(())
}
