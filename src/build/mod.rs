//! Ephemeral build harness
//!
//! Every image is built from a descriptor generated into a per-run
//! [`BuildWorkspace`]. The descriptor is owned by the build call and removed when
//! the call returns or is dropped, so no descriptor outlives its build.

mod workspace;

pub use workspace::{BuildWorkspace, EphemeralDescriptor, DESCRIPTOR_PREFIX, WORKSPACE_PREFIX};

use crate::config::Provider;
use crate::discovery::DiscoveryError;
use crate::engine::{BuildRequest, ContainerEngine, Image};
use crate::progress::{ProgressEvent, ProgressHandler};
use crate::project::{FunctionHandler, Project};
use crate::runtime::{RuntimeProfile, RuntimeRegistry};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Component name used for shared development images
const DEV_COMPONENT_PREFIX: &str = "dev-";

/// One image produced by [`ImageBuilder::create`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltImage {
    pub component: String,
    pub tag: String,
}

/// Outcome of building every deployable image of a project
#[derive(Debug, Default)]
pub struct BuildReport {
    pub images: Vec<BuiltImage>,
    pub failures: BTreeMap<String, DiscoveryError>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    registry: RuntimeRegistry,
    provider: Provider,
    build_timeout: Duration,
    max_parallel: usize,
}

impl ImageBuilder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: RuntimeRegistry,
        provider: Provider,
        build_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            provider,
            build_timeout,
            max_parallel: 1,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    /// Generates a descriptor, builds `request` from it and removes it again
    async fn build_from(
        &self,
        workspace: &BuildWorkspace,
        content: &str,
        context: &Path,
        tag: String,
        component: (&str, &str),
        build_args: &[(&str, &str)],
    ) -> Result<String, DiscoveryError> {
        let descriptor = workspace
            .descriptor(content)
            .map_err(|e| DiscoveryError::BuildError {
                image: tag.clone(),
                diagnostic: format!("failed to write build descriptor: {}", e),
            })?;

        let mut request =
            BuildRequest::new(descriptor.path(), context, &tag).component(component.0, component.1);
        for (key, value) in build_args {
            request = request.build_arg(key, value);
        }

        debug!(tag = %tag, descriptor = %descriptor.path().display(), "Building image");
        let result = tokio::time::timeout(self.build_timeout, self.engine.build(&request)).await;
        drop(descriptor);

        match result {
            Ok(Ok(())) => Ok(tag),
            Ok(Err(e)) => Err(DiscoveryError::BuildError {
                image: tag,
                diagnostic: e.to_string(),
            }),
            Err(_) => Err(DiscoveryError::BuildError {
                image: tag,
                diagnostic: format!(
                    "build timed out after {}s",
                    self.build_timeout.as_secs()
                ),
            }),
        }
    }

    /// Builds the shared development image of one runtime language
    pub async fn build_dev_image(
        &self,
        workspace: &BuildWorkspace,
        project: &Project,
        profile: &RuntimeProfile,
    ) -> Result<String, DiscoveryError> {
        let component = format!("{}{}", DEV_COMPONENT_PREFIX, profile.language());
        self.build_from(
            workspace,
            &profile.dev_dockerfile(),
            workspace.empty_context(),
            profile.dev_image(),
            (project.name(), &component),
            &[],
        )
        .await
    }

    /// Builds one development image per runtime language used by the project
    ///
    /// Handlers whose runtime cannot be resolved are skipped here; they fail
    /// individually during discovery. Results are keyed by language.
    pub async fn build_dev_images(
        &self,
        workspace: &BuildWorkspace,
        project: &Project,
        progress: &dyn ProgressHandler,
    ) -> BTreeMap<String, Result<String, DiscoveryError>> {
        let mut profiles: BTreeMap<&'static str, RuntimeProfile> = BTreeMap::new();
        for handler in project.functions() {
            if let Ok(profile) = self.registry.resolve(handler.source()) {
                profiles.entry(profile.language()).or_insert(profile);
            }
        }

        let results = stream::iter(profiles.into_values())
            .map(|profile| async move {
                let language = profile.language().to_string();
                progress.on_progress(&ProgressEvent::DevImageStarted {
                    language: language.clone(),
                });
                let begun = Instant::now();
                let result = self.build_dev_image(workspace, project, &profile).await;
                progress.on_progress(&ProgressEvent::DevImageComplete {
                    language: language.clone(),
                    duration: begun.elapsed(),
                    success: result.is_ok(),
                });
                (language, result)
            })
            .buffer_unordered(self.max_parallel)
            .collect::<Vec<_>>()
            .await;

        results.into_iter().collect()
    }

    /// Builds the ephemeral image that runs `handler` for discovery
    pub async fn build_discovery_image(
        &self,
        workspace: &BuildWorkspace,
        project: &Project,
        handler: &FunctionHandler,
        profile: &RuntimeProfile,
    ) -> Result<String, DiscoveryError> {
        self.build_from(
            workspace,
            &profile.discovery_dockerfile(&handler.source_str()),
            project.root(),
            handler.discovery_tag(project.name()),
            (project.name(), handler.name()),
            &[],
        )
        .await
    }

    /// Builds the deployable image of `handler` for the configured provider
    pub async fn build_function_image(
        &self,
        workspace: &BuildWorkspace,
        project: &Project,
        handler: &FunctionHandler,
    ) -> Result<String, DiscoveryError> {
        let profile = self.registry.resolve(handler.source())?;
        let provider = self.provider.as_str();
        self.build_from(
            workspace,
            &profile.function_dockerfile(&handler.source_str(), provider),
            project.root(),
            handler.image_tag(project.name()),
            (project.name(), handler.name()),
            &[("PROVIDER", provider)],
        )
        .await
    }

    /// Builds a pre-built container from its own Dockerfile
    async fn build_container_image(
        &self,
        project: &Project,
        name: &str,
        dockerfile: &Path,
    ) -> Result<String, DiscoveryError> {
        let tag = format!("{}:latest", crate::project::image_component(&format!(
            "{}-{}",
            project.name(),
            name
        )));
        let request = BuildRequest::new(project.root().join(dockerfile), project.root(), &tag)
            .component(project.name(), name)
            .build_arg("PROVIDER", self.provider.as_str());

        match tokio::time::timeout(self.build_timeout, self.engine.build(&request)).await {
            Ok(Ok(())) => Ok(tag),
            Ok(Err(e)) => Err(DiscoveryError::BuildError {
                image: tag,
                diagnostic: e.to_string(),
            }),
            Err(_) => Err(DiscoveryError::BuildError {
                image: tag,
                diagnostic: format!("build timed out after {}s", self.build_timeout.as_secs()),
            }),
        }
    }

    /// Builds deployable images for every function and container of the project
    pub async fn create(&self, project: &Project) -> Result<BuildReport, DiscoveryError> {
        let workspace = BuildWorkspace::create(project.root())
            .map_err(|e| DiscoveryError::Server(format!("failed to create build workspace: {}", e)))?;

        let function_results = stream::iter(project.functions())
            .map(|handler| {
                let workspace = &workspace;
                async move {
                    let result = self.build_function_image(workspace, project, handler).await;
                    (handler.name().to_string(), result)
                }
            })
            .buffer_unordered(self.max_parallel)
            .collect::<Vec<_>>()
            .await;

        let mut report = BuildReport::default();
        for (component, result) in function_results {
            match result {
                Ok(tag) => report.images.push(BuiltImage { component, tag }),
                Err(e) => {
                    warn!(function = %component, "Image build failed: {}", e);
                    report.failures.insert(component, e);
                }
            }
        }

        for container in project.containers() {
            match self
                .build_container_image(project, &container.name, &container.dockerfile)
                .await
            {
                Ok(tag) => report.images.push(BuiltImage {
                    component: container.name.clone(),
                    tag,
                }),
                Err(e) => {
                    warn!(container = %container.name, "Image build failed: {}", e);
                    report.failures.insert(container.name.clone(), e);
                }
            }
        }

        workspace.close();
        report.images.sort_by(|a, b| a.component.cmp(&b.component));
        info!(
            images = report.images.len(),
            failures = report.failures.len(),
            "Image build complete"
        );
        Ok(report)
    }

    /// Images of every function and container of the project
    pub async fn list(&self, project: &Project) -> Vec<Image> {
        let components = project
            .functions()
            .iter()
            .map(|f| f.name().to_string())
            .chain(project.containers().iter().map(|c| c.name.clone()));

        let mut images = Vec::new();
        for component in components {
            match self.engine.list_images(project.name(), &component).await {
                Ok(found) => images.extend(found),
                Err(e) => warn!(component = %component, "Failed to list images: {}", e),
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHandler(Mutex<Vec<String>>);

    impl ProgressHandler for RecordingHandler {
        fn on_progress(&self, event: &ProgressEvent) {
            let line = match event {
                ProgressEvent::DevImageStarted { language } => format!("started {}", language),
                ProgressEvent::DevImageComplete { language, .. } => {
                    format!("complete {}", language)
                }
                _ => return,
            };
            self.0.lock().unwrap().push(line);
        }
    }

    fn project_with(files: &[(&str, &str)]) -> (TempDir, Project) {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let project = Project::load(dir.path()).unwrap();
        (dir, project)
    }

    fn builder(engine: Arc<MockEngine>) -> ImageBuilder {
        ImageBuilder::new(
            engine,
            RuntimeRegistry::with_defaults(),
            Provider::Gcp,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_descriptor_removed_after_success_and_failure() {
        let (_dir, project) = project_with(&[
            ("functions/upload.ts", "export {}"),
            ("functions/resize.py", "print()"),
        ]);
        let engine = Arc::new(MockEngine::new());
        engine.fail_build("resize");
        let builder = builder(engine.clone());
        let workspace = BuildWorkspace::create(project.root()).unwrap();

        let upload = project.function("upload").unwrap();
        let resize = project.function("resize").unwrap();
        let profile = builder.registry().resolve(upload.source()).unwrap();
        assert!(builder
            .build_discovery_image(&workspace, &project, upload, &profile)
            .await
            .is_ok());

        let profile = builder.registry().resolve(resize.source()).unwrap();
        let err = builder
            .build_discovery_image(&workspace, &project, resize, &profile)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::BuildError { .. }));

        let builds = engine.builds();
        assert_eq!(builds.len(), 2);
        for build in &builds {
            assert!(!build.request.descriptor.exists());
            assert!(build.descriptor.starts_with("FROM nimbus-"));
        }
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_dev_images_deduplicated_by_language() {
        let (_dir, project) = project_with(&[
            ("functions/a.ts", "export {}"),
            ("functions/b.ts", "export {}"),
            ("functions/c.py", "print()"),
            ("functions/d.rb", "puts 1"),
            ("nimbus.yaml", "handlers: ['functions/*']\n"),
        ]);
        let engine = Arc::new(MockEngine::new());
        let builder = builder(engine.clone());
        let workspace = BuildWorkspace::create(project.root()).unwrap();

        let events = RecordingHandler::default();
        let results = builder
            .build_dev_images(&workspace, &project, &events)
            .await;

        assert_eq!(
            results.keys().cloned().collect::<Vec<_>>(),
            vec!["python".to_string(), "typescript".to_string()]
        );
        let mut tags = engine.built_tags();
        tags.sort();
        assert_eq!(tags, vec!["nimbus-python-dev", "nimbus-typescript-dev"]);

        let mut events = events.0.lock().unwrap().clone();
        events.sort();
        assert_eq!(
            events,
            vec![
                "complete python",
                "complete typescript",
                "started python",
                "started typescript"
            ]
        );
    }

    #[tokio::test]
    async fn test_create_builds_functions_and_containers_for_provider() {
        let (_dir, project) = project_with(&[
            ("functions/upload.ts", "export {}"),
            ("functions/legacy.rb", "puts 1"),
            ("worker.Dockerfile", "FROM alpine"),
            (
                "nimbus.yaml",
                "name: shop\nhandlers: ['functions/*']\ncontainers:\n  worker: worker.Dockerfile\n",
            ),
        ]);
        let engine = Arc::new(MockEngine::new());
        let report = builder(engine.clone()).create(&project).await.unwrap();

        let components: Vec<_> = report.images.iter().map(|i| i.component.as_str()).collect();
        assert_eq!(components, vec!["upload", "worker"]);
        assert!(matches!(
            report.failures.get("legacy"),
            Some(DiscoveryError::UnsupportedRuntime(_))
        ));

        let upload = engine
            .builds()
            .into_iter()
            .find(|b| b.request.tag.starts_with("shop-upload:"))
            .unwrap();
        assert_eq!(upload.request.build_args["PROVIDER"], "gcp");
        assert!(upload.descriptor.contains("ARG PROVIDER=gcp"));

        let images = builder(engine.clone()).list(&project).await;
        assert_eq!(images.len(), 2);
        assert!(fs::read_dir(project.root())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)));
    }
}
