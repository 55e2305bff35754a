//! Project loading
//!
//! A project is a directory with an optional `nimbus.yaml`:
//!
//! ```yaml
//! name: shop
//! handlers:
//!   - functions/*.ts
//! containers:
//!   worker: docker/worker.Dockerfile
//! ```
//!
//! Handler globs are matched relative to the project root, gitignore style.

mod handler;

pub use handler::{image_component, Container, FunctionHandler};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROJECT_FILE: &str = "nimbus.yaml";

pub const DEFAULT_HANDLER_GLOBS: [&str; 4] = [
    "functions/*.ts",
    "functions/*.js",
    "functions/*.py",
    "functions/*/main.go",
];

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Project directory not found: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid project file {path}: {error}")]
    InvalidConfig { path: PathBuf, error: String },

    #[error("Invalid handler glob '{glob}': {error}")]
    InvalidGlob { glob: String, error: String },

    #[error("Function name '{name}' is used by both {first} and {second}")]
    DuplicateFunction {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Dockerfile for container '{container}' not found: {path}")]
    MissingDockerfile { container: String, path: PathBuf },
}

/// Contents of `nimbus.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub handlers: Vec<String>,

    /// Container name to Dockerfile path
    #[serde(default)]
    pub containers: BTreeMap<String, PathBuf>,
}

impl ProjectConfig {
    pub fn from_file(path: &Path) -> Result<Self, ProjectError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| ProjectError::InvalidConfig {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    fn handler_globs(&self) -> Vec<String> {
        if self.handlers.is_empty() {
            DEFAULT_HANDLER_GLOBS.iter().map(|g| g.to_string()).collect()
        } else {
            self.handlers.clone()
        }
    }
}

/// A loaded project; immutable for the duration of a discovery run
#[derive(Debug, Clone)]
pub struct Project {
    name: String,
    root: PathBuf,
    functions: Vec<FunctionHandler>,
    containers: Vec<Container>,
}

impl Project {
    /// Loads the project rooted at `root`
    pub fn load(root: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(ProjectError::NotADirectory(root.to_path_buf()));
        }
        let root = root.canonicalize().map_err(|source| ProjectError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let config_path = root.join(PROJECT_FILE);
        let config = if config_path.is_file() {
            ProjectConfig::from_file(&config_path)?
        } else {
            debug!(root = %root.display(), "No {} found, using defaults", PROJECT_FILE);
            ProjectConfig::default()
        };

        let name = config
            .name
            .clone()
            .or_else(|| {
                root.file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "project".to_string());

        let functions = discover_handlers(&root, &config.handler_globs())?;

        let mut containers = Vec::new();
        for (container, dockerfile) in &config.containers {
            if !root.join(dockerfile).is_file() {
                return Err(ProjectError::MissingDockerfile {
                    container: container.clone(),
                    path: dockerfile.clone(),
                });
            }
            containers.push(Container {
                name: container.clone(),
                dockerfile: dockerfile.clone(),
            });
        }

        if functions.is_empty() {
            warn!(root = %root.display(), "No function handlers matched");
        }
        info!(
            project = %name,
            functions = functions.len(),
            containers = containers.len(),
            "Loaded project"
        );

        Ok(Self {
            name,
            root,
            functions,
            containers,
        })
    }

    /// Builds a project from already known parts
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        functions: Vec<FunctionHandler>,
        containers: Vec<Container>,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            functions,
            containers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Function handlers, ordered by source path
    pub fn functions(&self) -> &[FunctionHandler] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&FunctionHandler> {
        self.functions.iter().find(|f| f.name() == name)
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }
}

fn discover_handlers(root: &Path, globs: &[String]) -> Result<Vec<FunctionHandler>, ProjectError> {
    let mut builder = OverrideBuilder::new(root);
    for glob in globs {
        builder.add(glob).map_err(|e| ProjectError::InvalidGlob {
            glob: glob.clone(),
            error: e.to_string(),
        })?;
    }
    let overrides = builder.build().map_err(|e| ProjectError::InvalidGlob {
        glob: globs.join(", "),
        error: e.to_string(),
    })?;

    let mut sources = Vec::new();
    for result in WalkBuilder::new(root).hidden(true).git_ignore(true).build() {
        let entry = match result {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "Failed to read directory entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || !overrides.matched(path, false).is_whitelist() {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(root) {
            sources.push(relative.to_path_buf());
        }
    }
    sources.sort();

    let mut functions: Vec<FunctionHandler> = Vec::with_capacity(sources.len());
    for source in sources {
        let name = function_name(&source);
        if let Some(existing) = functions.iter().find(|f| f.name() == name) {
            return Err(ProjectError::DuplicateFunction {
                name,
                first: existing.source().to_path_buf(),
                second: source,
            });
        }
        let path = root.join(&source);
        let content = std::fs::read(&path).map_err(|source| ProjectError::Io { path, source })?;
        debug!(function = %name, source = %source.display(), "Found handler");
        functions.push(FunctionHandler::new(name, source, &content));
    }

    Ok(functions)
}

/// Go handlers are named after their package directory, others after the file stem
fn function_name(source: &Path) -> String {
    let is_go_main = source.file_name().and_then(|n| n.to_str()) == Some("main.go");
    let name = if is_go_main {
        source.parent().and_then(|p| p.file_name())
    } else {
        source.file_stem()
    };
    name.map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_with_default_globs() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "functions/upload.ts", "export {}");
        write(dir.path(), "functions/resize.py", "print()");
        write(dir.path(), "functions/orders/main.go", "package main");
        write(dir.path(), "functions/orders/util.go", "package main");
        write(dir.path(), "README.md", "# shop");

        let project = Project::load(dir.path()).unwrap();
        let names: Vec<_> = project.functions().iter().map(|f| f.name()).collect();

        assert_eq!(names, vec!["orders", "resize", "upload"]);
        assert_eq!(
            project.function("orders").unwrap().source_str(),
            "functions/orders/main.go"
        );
        assert!(project.containers().is_empty());
    }

    #[test]
    fn test_load_with_project_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            PROJECT_FILE,
            "name: shop\nhandlers:\n  - src/*.js\ncontainers:\n  worker: worker.Dockerfile\n",
        );
        write(dir.path(), "src/checkout.js", "module.exports = {}");
        write(dir.path(), "functions/ignored.ts", "export {}");
        write(dir.path(), "worker.Dockerfile", "FROM alpine");

        let project = Project::load(dir.path()).unwrap();

        assert_eq!(project.name(), "shop");
        assert_eq!(project.functions().len(), 1);
        assert_eq!(project.functions()[0].name(), "checkout");
        assert_eq!(project.containers()[0].name, "worker");
    }

    #[test]
    fn test_duplicate_function_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "functions/upload.ts", "export {}");
        write(dir.path(), "functions/upload.js", "module.exports = {}");

        match Project::load(dir.path()) {
            Err(ProjectError::DuplicateFunction { name, .. }) => assert_eq!(name, "upload"),
            other => panic!("expected duplicate function error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_container_dockerfile() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), PROJECT_FILE, "containers:\n  worker: nope.Dockerfile\n");

        assert!(matches!(
            Project::load(dir.path()),
            Err(ProjectError::MissingDockerfile { .. })
        ));
    }

    #[test]
    fn test_invalid_project_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), PROJECT_FILE, "handlerz: []\n");

        assert!(matches!(
            Project::load(dir.path()),
            Err(ProjectError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_not_a_directory() {
        assert!(matches!(
            Project::load("/definitely/not/here"),
            Err(ProjectError::NotADirectory(_))
        ));
    }
}
