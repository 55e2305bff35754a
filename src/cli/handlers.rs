//! Command handlers
//!
//! Each handler returns the process exit code: 0 on success, 1 on failure.

use super::commands::{BuildArgs, ConfigArgs, DiscoverArgs, ImagesArgs, OutputFormatArg};
use super::output::{DiscoveryReport, OutputFormat, OutputFormatter};
use crate::build::ImageBuilder;
use crate::config::NimbusConfig;
use crate::discovery::{DiscoveryError, DiscoveryOrchestrator};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::progress::{LoggingHandler, ProgressHandler, SpinnerHandler};
use crate::project::Project;
use crate::runtime::RuntimeRegistry;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Human on a terminal, JSON when piped
fn resolve_format(format: Option<OutputFormatArg>) -> OutputFormat {
    match format {
        Some(format) => format.into(),
        None if atty::is(atty::Stream::Stdout) => OutputFormat::Human,
        None => OutputFormat::Json,
    }
}

fn load_config(apply: impl FnOnce(&mut NimbusConfig)) -> Option<NimbusConfig> {
    let mut config = match NimbusConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return None;
        }
    };
    apply(&mut config);
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return None;
    }
    debug!("Effective configuration: {:?}", config);
    Some(config)
}

fn load_project(path: Option<&PathBuf>) -> Option<Project> {
    let root = match path {
        Some(path) => path.clone(),
        None => match env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Failed to get current directory: {}", e);
                return None;
            }
        },
    };
    debug!("Project path: {}", root.display());

    match Project::load(&root) {
        Ok(project) => {
            info!(
                "Loaded project {} with {} function(s)",
                project.name(),
                project.functions().len()
            );
            Some(project)
        }
        Err(e) => {
            error!("Failed to load project {}: {}", root.display(), e);
            None
        }
    }
}

async fn connect_engine() -> Option<Arc<dyn ContainerEngine>> {
    match DockerEngine::connect().await {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            error!("Container engine unavailable: {}", e);
            None
        }
    }
}

fn emit(output: &str, destination: Option<&Path>) -> bool {
    match destination {
        Some(path) => match fs::write(path, output) {
            Ok(()) => {
                info!("Output written to {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write output to {}: {}", path.display(), e);
                false
            }
        },
        None => {
            println!("{}", output.trim_end());
            true
        }
    }
}

pub async fn handle_discover(args: &DiscoverArgs, quiet: bool) -> i32 {
    let Some(config) = load_config(|config| {
        if let Some(provider) = args.provider {
            config.provider = provider;
        }
        if let Some(timeout) = args.timeout {
            config.session_timeout_secs = timeout;
        }
        if let Some(max_parallel) = args.max_parallel {
            config.max_parallel = max_parallel;
        }
        if let Some(host) = &args.advertise_host {
            config.advertise_host = host.clone();
        }
        if args.allow_partial {
            config.allow_partial = true;
        }
    }) else {
        return 1;
    };
    let Some(project) = load_project(args.path.as_ref()) else {
        return 1;
    };
    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let format = resolve_format(args.format);
    let spinner = (format == OutputFormat::Human && !quiet && args.output.is_none())
        .then(|| Arc::new(SpinnerHandler::new()));
    let progress: Arc<dyn ProgressHandler> = match &spinner {
        Some(spinner) => spinner.clone(),
        None => Arc::new(LoggingHandler),
    };

    let allow_partial = config.allow_partial;
    let orchestrator = DiscoveryOrchestrator::new(engine, config).with_progress(progress);
    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let result = orchestrator.discover_until(&project, cancel).await;

    if let Some(spinner) = &spinner {
        spinner.finish();
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(DiscoveryError::Cancelled) => {
            error!("Discovery cancelled");
            return 130;
        }
        Err(e) => {
            error!("Discovery failed: {}", e);
            return 1;
        }
    };

    let report = DiscoveryReport::new(project.name(), &outcome);
    let output = match OutputFormatter::new(format).format_discovery(&report) {
        Ok(output) => output,
        Err(e) => {
            error!("Failed to format output: {}", e);
            return 1;
        }
    };
    if !emit(&output, args.output.as_deref()) {
        return 1;
    }

    if outcome.is_complete() || allow_partial {
        0
    } else {
        error!(
            "Discovery failed for {} function(s)",
            outcome.failures.len()
        );
        1
    }
}

pub async fn handle_build(args: &BuildArgs) -> i32 {
    let Some(config) = load_config(|config| {
        if let Some(provider) = args.provider {
            config.provider = provider;
        }
        if let Some(timeout) = args.build_timeout {
            config.build_timeout_secs = timeout;
        }
        if let Some(max_parallel) = args.max_parallel {
            config.max_parallel = max_parallel;
        }
    }) else {
        return 1;
    };
    let Some(project) = load_project(args.path.as_ref()) else {
        return 1;
    };
    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let builder = ImageBuilder::new(
        engine,
        RuntimeRegistry::with_defaults(),
        config.provider,
        config.build_timeout(),
    )
    .with_max_parallel(config.max_parallel);

    info!("Building images for {} ({})", project.name(), config.provider);
    let report = match builder.create(&project).await {
        Ok(report) => report,
        Err(e) => {
            error!("Build failed: {}", e);
            return 1;
        }
    };

    match OutputFormatter::new(resolve_format(args.format)).format_build(&report) {
        Ok(output) => println!("{}", output.trim_end()),
        Err(e) => {
            error!("Failed to format output: {}", e);
            return 1;
        }
    }

    if report.is_success() {
        0
    } else {
        1
    }
}

pub async fn handle_images(args: &ImagesArgs) -> i32 {
    let Some(config) = load_config(|_| {}) else {
        return 1;
    };
    let Some(project) = load_project(args.path.as_ref()) else {
        return 1;
    };
    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let builder = ImageBuilder::new(
        engine,
        RuntimeRegistry::with_defaults(),
        config.provider,
        config.build_timeout(),
    );
    let images = builder.list(&project).await;

    match OutputFormatter::new(resolve_format(args.format)).format_images(&images) {
        Ok(output) => {
            println!("{}", output.trim_end());
            0
        }
        Err(e) => {
            error!("Failed to format output: {}", e);
            1
        }
    }
}

pub fn handle_config(args: &ConfigArgs) -> i32 {
    let Some(config) = load_config(|_| {}) else {
        return 1;
    };

    match OutputFormatter::new(resolve_format(args.format)).format_config(&config) {
        Ok(output) => {
            println!("{}", output.trim_end());
            0
        }
        Err(e) => {
            error!("Failed to format output: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_format_wins() {
        assert_eq!(resolve_format(Some(OutputFormatArg::Yaml)), OutputFormat::Yaml);
        assert_eq!(resolve_format(Some(OutputFormatArg::Human)), OutputFormat::Human);
    }

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        assert!(emit("{}", Some(&path)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_load_project_missing_path() {
        assert!(load_project(Some(&PathBuf::from("/nonexistent/nimbus/project"))).is_none());
    }
}
