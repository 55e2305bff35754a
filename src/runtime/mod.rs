//! Language runtimes and the build descriptors they produce

mod go;
mod javascript;
mod python;
mod registry;
mod typescript;

pub use go::GoRuntime;
pub use javascript::JavaScriptRuntime;
pub use python::PythonRuntime;
pub use registry::RuntimeRegistry;
pub use typescript::TypeScriptRuntime;

use std::path::Path;
use std::sync::Arc;

/// Build template for deployable function images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTemplate {
    pub build_image: String,
    pub runtime_image: String,
    /// Commands run in the build stage; `{handler}` and `{handler_dir}` are substituted
    pub build_commands: Vec<String>,
    /// Paths copied from the build stage into the runtime stage
    pub artifacts: Vec<String>,
    /// Entry command of the runtime stage
    pub entry: Vec<String>,
}

/// Shared development image used to run handlers during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevTemplate {
    pub base_image: String,
    /// Tooling installed once per language
    pub setup_commands: Vec<String>,
    /// Per-function preparation run on top of the dev image
    pub prepare_commands: Vec<String>,
    /// Command that starts the handler for discovery
    pub entry: Vec<String>,
}

/// Trait describing how one language's handlers are built and run
pub trait RuntimeDefinition: Send + Sync {
    /// Language id (e.g., "typescript")
    fn language(&self) -> &'static str;

    /// Handler file extensions this runtime accepts
    fn extensions(&self) -> &[&'static str];

    fn matches(&self, handler: &Path) -> bool {
        handler
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions().contains(&ext))
            .unwrap_or(false)
    }

    fn build_template(&self) -> BuildTemplate;

    fn dev_template(&self) -> DevTemplate;
}

/// A resolved runtime for one handler
#[derive(Clone)]
pub struct RuntimeProfile {
    definition: Arc<dyn RuntimeDefinition>,
}

impl std::fmt::Debug for RuntimeProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProfile")
            .field("language", &self.language())
            .field("dev_image", &self.dev_image())
            .finish()
    }
}

impl RuntimeProfile {
    pub fn new(definition: Arc<dyn RuntimeDefinition>) -> Self {
        Self { definition }
    }

    pub fn language(&self) -> &'static str {
        self.definition.language()
    }

    pub fn base_image(&self) -> String {
        self.definition.build_template().runtime_image
    }

    pub fn build_template(&self) -> BuildTemplate {
        self.definition.build_template()
    }

    /// Name of the shared development image for this language
    pub fn dev_image(&self) -> String {
        format!("nimbus-{}-dev", self.language())
    }

    pub fn entry_command(&self, handler: &str) -> Vec<String> {
        substitute_all(&self.build_template().entry, handler)
    }

    /// Multi-stage descriptor for the deployable image of `handler`
    pub fn function_dockerfile(&self, handler: &str, provider: &str) -> String {
        let template = self.definition.build_template();
        let mut out = String::new();

        out.push_str(&format!("FROM {} AS build\n", template.build_image));
        out.push_str("WORKDIR /app\n");
        out.push_str("COPY . .\n");
        for command in substitute_all(&template.build_commands, handler) {
            out.push_str(&format!("RUN {}\n", command));
        }
        out.push('\n');

        out.push_str(&format!("FROM {}\n", template.runtime_image));
        out.push_str(&format!("ARG PROVIDER={}\n", provider));
        out.push_str("ENV NIMBUS_PROVIDER=${PROVIDER}\n");
        out.push_str("WORKDIR /app\n");
        for artifact in substitute_all(&template.artifacts, handler) {
            out.push_str(&format!("COPY --from=build /app/{0} /app/{0}\n", artifact));
        }
        out.push_str(&format!(
            "ENTRYPOINT {}\n",
            exec_form(&substitute_all(&template.entry, handler))
        ));
        out
    }

    /// Descriptor for the shared development image
    pub fn dev_dockerfile(&self) -> String {
        let template = self.definition.dev_template();
        let mut out = format!("FROM {}\n", template.base_image);
        for command in &template.setup_commands {
            out.push_str(&format!("RUN {}\n", command));
        }
        out.push_str("WORKDIR /app\n");
        out
    }

    /// Descriptor for the ephemeral discovery image of `handler`
    pub fn discovery_dockerfile(&self, handler: &str) -> String {
        let template = self.definition.dev_template();
        let mut out = format!("FROM {}\n", self.dev_image());
        out.push_str("WORKDIR /app\n");
        out.push_str("COPY . .\n");
        for command in substitute_all(&template.prepare_commands, handler) {
            out.push_str(&format!("RUN {}\n", command));
        }
        out.push_str(&format!(
            "ENTRYPOINT {}\n",
            exec_form(&substitute_all(&template.entry, handler))
        ));
        out
    }
}

fn substitute(value: &str, handler: &str) -> String {
    let handler_dir = Path::new(handler)
        .parent()
        .map(|p| p.to_string_lossy().trim_start_matches("./").to_string())
        .filter(|p| !p.is_empty())
        .map(|p| format!("./{}", p))
        .unwrap_or_else(|| ".".to_string());
    value
        .replace("{handler_dir}", &handler_dir)
        .replace("{handler}", handler)
}

fn substitute_all(values: &[String], handler: &str) -> Vec<String> {
    values.iter().map(|v| substitute(v, handler)).collect()
}

fn exec_form(command: &[String]) -> String {
    serde_json::to_string(command).unwrap_or_else(|_| "[]".to_string())
}
