//! Discovery orchestration
//!
//! One run: start the capture server, build the shared development images (one
//! per language), then discover every function with bounded parallelism. Each
//! function goes through build, run, capture and teardown on its own task; a
//! failure is recorded against that function and the others carry on.

use super::client::{ENV_FUNCTION, ENV_SERVICE_ADDRESS, ENV_SESSION_ID};
use super::dependencies::FunctionDependencies;
use super::error::DiscoveryError;
use super::graph::DependencyGraph;
use super::server::{CaptureServer, SessionTable};
use crate::build::{BuildWorkspace, ImageBuilder};
use crate::config::NimbusConfig;
use crate::engine::{
    ContainerEngine, ContainerHandle, EngineError, RunRequest, LABEL_COMPONENT, LABEL_PROJECT,
};
use crate::progress::{NoOpHandler, ProgressEvent, ProgressHandler};
use crate::project::{FunctionHandler, Project};
use crate::runtime::{RuntimeProfile, RuntimeRegistry};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result of a finished discovery run
#[derive(Debug)]
pub struct DiscoveryOutcome {
    /// Graph merged from the functions that completed discovery
    pub graph: DependencyGraph,
    /// Per-function dependencies of the functions that completed discovery
    pub dependencies: BTreeMap<String, FunctionDependencies>,
    /// Errors of the functions that did not
    pub failures: BTreeMap<String, DiscoveryError>,
}

impl DiscoveryOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The graph if every function was discovered, or when `allow_partial` is set
    pub fn into_result(self, allow_partial: bool) -> Result<DependencyGraph, DiscoveryFailure> {
        if self.failures.is_empty() || allow_partial {
            Ok(self.graph)
        } else {
            Err(DiscoveryFailure {
                failures: self.failures,
                partial: self.graph,
            })
        }
    }
}

/// Aggregate error of a run in which some functions failed
#[derive(Debug)]
pub struct DiscoveryFailure {
    pub failures: BTreeMap<String, DiscoveryError>,
    /// Graph of the functions that did complete
    pub partial: DependencyGraph,
}

impl fmt::Display for DiscoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Discovery failed for {} function(s)", self.failures.len())?;
        for (function, error) in &self.failures {
            write!(f, "\n  {}: {}", function, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DiscoveryFailure {}

#[derive(Default)]
struct TrackerState {
    /// Starts and stops still in flight
    pending: usize,
    containers: HashMap<String, ContainerHandle>,
}

/// Every container started during a run, so that none survives it
///
/// Starts and stops run on detached tasks, so they finish even when the function
/// task waiting on them is aborted. A container is forgotten only once its stop
/// has succeeded.
#[derive(Default)]
struct ContainerTracker {
    state: Mutex<TrackerState>,
    settled: Notify,
}

impl ContainerTracker {
    async fn start(
        self: &Arc<Self>,
        engine: Arc<dyn ContainerEngine>,
        request: RunRequest,
    ) -> Result<ContainerHandle, EngineError> {
        self.lock().pending += 1;

        let tracker = self.clone();
        let image = request.image.clone();
        let task = tokio::spawn(async move {
            let result = engine.run(&request).await;
            {
                let mut state = tracker.lock();
                state.pending -= 1;
                if let Ok(handle) = &result {
                    state.containers.insert(handle.id.clone(), handle.clone());
                }
            }
            tracker.settled.notify_waiters();
            result
        });

        task.await.map_err(|e| EngineError::Run {
            image,
            error: e.to_string(),
        })?
    }

    async fn stop(self: &Arc<Self>, engine: Arc<dyn ContainerEngine>, handle: ContainerHandle) {
        self.lock().pending += 1;

        let tracker = self.clone();
        let task = tokio::spawn(async move {
            let result = engine.stop(&handle).await;
            {
                let mut state = tracker.lock();
                state.pending -= 1;
                match &result {
                    Ok(()) => {
                        state.containers.remove(&handle.id);
                    }
                    Err(e) => warn!(container = %handle.id, "Failed to stop container: {}", e),
                }
            }
            tracker.settled.notify_waiters();
        });

        if let Err(e) = task.await {
            warn!("Container stop task failed: {}", e);
        }
    }

    /// Waits for pending starts and stops, then stops every container still running
    async fn stop_all(&self, engine: &dyn ContainerEngine) {
        loop {
            let settled = self.settled.notified();
            if self.lock().pending == 0 {
                break;
            }
            settled.await;
        }

        let containers: Vec<ContainerHandle> =
            self.lock().containers.drain().map(|(_, h)| h).collect();
        for handle in containers {
            debug!(container = %handle.id, "Stopping leftover container");
            if let Err(e) = engine.stop(&handle).await {
                warn!(container = %handle.id, "Failed to stop container: {}", e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// State shared by the function tasks of one run
struct RunContext {
    project: Project,
    builder: ImageBuilder,
    engine: Arc<dyn ContainerEngine>,
    workspace: Arc<BuildWorkspace>,
    sessions: SessionTable,
    endpoint: String,
    tracker: Arc<ContainerTracker>,
    semaphore: Arc<Semaphore>,
    session_timeout: Duration,
    provider: String,
    progress: Arc<dyn ProgressHandler>,
}

pub struct DiscoveryOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    registry: RuntimeRegistry,
    config: NimbusConfig,
    progress: Arc<dyn ProgressHandler>,
}

impl DiscoveryOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: NimbusConfig) -> Self {
        Self {
            engine,
            registry: RuntimeRegistry::with_defaults(),
            config,
            progress: Arc::new(NoOpHandler),
        }
    }

    pub fn with_registry(mut self, registry: RuntimeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    fn image_builder(&self) -> ImageBuilder {
        ImageBuilder::new(
            self.engine.clone(),
            self.registry.clone(),
            self.config.provider,
            self.config.build_timeout(),
        )
        .with_max_parallel(self.config.max_parallel)
    }

    /// Discovers every function of `project`
    pub async fn discover(&self, project: &Project) -> Result<DiscoveryOutcome, DiscoveryError> {
        self.discover_until(project, std::future::pending()).await
    }

    /// Discovers every function of `project`, aborting when `cancel` completes
    ///
    /// A cancelled run stops every container it started and removes its build
    /// workspace before returning [`DiscoveryError::Cancelled`].
    pub async fn discover_until<C>(
        &self,
        project: &Project,
        cancel: C,
    ) -> Result<DiscoveryOutcome, DiscoveryError>
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        self.progress.on_progress(&ProgressEvent::Started {
            project: project.name().to_string(),
            functions: project.functions().len(),
        });

        let workspace = Arc::new(BuildWorkspace::create(project.root()).map_err(|e| {
            DiscoveryError::Server(format!("failed to create build workspace: {}", e))
        })?);
        let server =
            CaptureServer::start(self.config.capture_bind, self.config.advertise_host.clone())
                .await?;

        let context = Arc::new(RunContext {
            project: project.clone(),
            builder: self.image_builder(),
            engine: self.engine.clone(),
            workspace: workspace.clone(),
            sessions: server.sessions().clone(),
            endpoint: server.endpoint(),
            tracker: Arc::new(ContainerTracker::default()),
            semaphore: Arc::new(Semaphore::new(self.config.max_parallel.max(1))),
            session_timeout: self.config.session_timeout(),
            provider: self.config.provider.to_string(),
            progress: self.progress.clone(),
        });

        let mut tasks = JoinSet::new();
        let results = tokio::select! {
            results = self.run(context.clone(), &mut tasks) => Some(results),
            _ = cancel => None,
        };

        if results.is_none() {
            info!("Cancelling discovery");
            tasks.shutdown().await;
            for id in context.sessions.ids().await {
                context.sessions.abandon(&id).await;
            }
        }

        context.tracker.stop_all(self.engine.as_ref()).await;
        server.shutdown().await;
        drop(context);
        match Arc::try_unwrap(workspace) {
            Ok(workspace) => workspace.close(),
            Err(_) => warn!("Build workspace still in use; it is removed when released"),
        }

        let Some(results) = results else {
            self.progress.on_progress(&ProgressEvent::Cancelled);
            return Err(DiscoveryError::Cancelled);
        };

        let mut dependencies = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (function, result) in results {
            match result {
                Ok(deps) => {
                    dependencies.insert(function, deps);
                }
                Err(e) => {
                    failures.insert(function, e);
                }
            }
        }

        let graph = DependencyGraph::build(dependencies.iter().map(|(n, d)| (n.as_str(), d)));
        for warning in graph.warnings() {
            warn!("{}", warning);
        }

        self.progress.on_progress(&ProgressEvent::Completed {
            functions: project.functions().len(),
            failures: failures.len(),
            total_time: started.elapsed(),
        });

        Ok(DiscoveryOutcome {
            graph,
            dependencies,
            failures,
        })
    }

    /// Runs both passes and returns one result per function
    async fn run(
        &self,
        context: Arc<RunContext>,
        tasks: &mut JoinSet<(String, Result<FunctionDependencies, DiscoveryError>)>,
    ) -> Vec<(String, Result<FunctionDependencies, DiscoveryError>)> {
        let project = &context.project;
        let mut results = Vec::with_capacity(project.functions().len());

        // Resolve runtimes; unresolved handlers fail on their own
        let mut profiles: Vec<(FunctionHandler, RuntimeProfile)> = Vec::new();
        for handler in project.functions() {
            match self.registry.resolve(handler.source()) {
                Ok(profile) => profiles.push((handler.clone(), profile)),
                Err(e) => {
                    self.fail(handler.name(), &e);
                    results.push((handler.name().to_string(), Err(e)));
                }
            }
        }

        // Shared development images, one per language
        let dev_images = context
            .builder
            .build_dev_images(&context.workspace, project, self.progress.as_ref())
            .await;

        let total = project.functions().len();
        let mut pending: Vec<String> = Vec::new();
        for (index, (handler, profile)) in profiles.into_iter().enumerate() {
            if let Some(Err(e)) = dev_images.get(profile.language()) {
                self.fail(handler.name(), e);
                results.push((handler.name().to_string(), Err(e.clone())));
                continue;
            }

            pending.push(handler.name().to_string());
            let context = context.clone();
            tasks.spawn(async move {
                let name = handler.name().to_string();
                let result = discover_function(&context, &handler, &profile, index + 1, total).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((function, result)) => {
                    pending.retain(|p| p != &function);
                    results.push((function, result));
                }
                Err(e) => warn!("Discovery task failed: {}", e),
            }
        }

        // Tasks that panicked have no result of their own
        for function in pending {
            let error = DiscoveryError::Server("discovery task failed".to_string());
            self.fail(&function, &error);
            results.push((function, Err(error)));
        }

        results
    }

    fn fail(&self, function: &str, error: &DiscoveryError) {
        self.progress.on_progress(&ProgressEvent::FunctionFailed {
            function: function.to_string(),
            error: error.to_string(),
        });
    }
}

/// Build, run, capture and teardown for one function
async fn discover_function(
    context: &RunContext,
    handler: &FunctionHandler,
    profile: &RuntimeProfile,
    index: usize,
    total: usize,
) -> Result<FunctionDependencies, DiscoveryError> {
    let _permit = context
        .semaphore
        .acquire()
        .await
        .map_err(|_| DiscoveryError::Cancelled)?;

    let function = handler.name();
    let begun = Instant::now();
    context.progress.on_progress(&ProgressEvent::FunctionStarted {
        function: function.to_string(),
        index,
        total,
    });

    let result = capture(context, handler, profile).await;
    match &result {
        Ok(deps) => context.progress.on_progress(&ProgressEvent::FunctionComplete {
            function: function.to_string(),
            resources: deps.resources.len(),
            triggers: deps.trigger_count(),
            duration: begun.elapsed(),
        }),
        Err(e) => context.progress.on_progress(&ProgressEvent::FunctionFailed {
            function: function.to_string(),
            error: e.to_string(),
        }),
    }
    result
}

async fn capture(
    context: &RunContext,
    handler: &FunctionHandler,
    profile: &RuntimeProfile,
) -> Result<FunctionDependencies, DiscoveryError> {
    let project = &context.project;
    let function = handler.name();
    let timeout = context.session_timeout;
    let deadline = tokio::time::Instant::now() + timeout;

    let build = context
        .builder
        .build_discovery_image(&context.workspace, project, handler, profile);
    let image = match tokio::time::timeout_at(deadline, build).await {
        Ok(image) => image?,
        Err(_) => return Err(DiscoveryError::timeout(function, timeout)),
    };

    let mut ticket = context.sessions.register(function).await;
    let request = RunRequest::new(image.clone())
        .env(ENV_SERVICE_ADDRESS, context.endpoint.clone())
        .env(ENV_SESSION_ID, ticket.id.clone())
        .env(ENV_FUNCTION, function)
        .env("NIMBUS_PROVIDER", context.provider.clone())
        .label(LABEL_PROJECT, project.name())
        .label(LABEL_COMPONENT, function);

    // A start that outlives the deadline still registers its container, which
    // the end of the run stops
    let start = context.tracker.start(context.engine.clone(), request);
    let container = match tokio::time::timeout_at(deadline, start).await {
        Ok(Ok(container)) => container,
        Ok(Err(e)) => {
            context.sessions.remove(&ticket.id).await;
            return Err(DiscoveryError::RunError {
                image,
                message: e.to_string(),
            });
        }
        Err(_) => {
            context.sessions.remove(&ticket.id).await;
            return Err(DiscoveryError::timeout(function, timeout));
        }
    };
    context.progress.on_progress(&ProgressEvent::ContainerStarted {
        function: function.to_string(),
        container: container.id.clone(),
    });

    let outcome = match tokio::time::timeout_at(deadline, ticket.wait()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            context.sessions.expire(&ticket.id, timeout).await;
            ticket.wait().await
        }
    };

    context
        .tracker
        .stop(context.engine.clone(), container)
        .await;
    context.sessions.remove(&ticket.id).await;

    debug!(function, ok = outcome.is_ok(), "Capture finished");
    outcome
}
