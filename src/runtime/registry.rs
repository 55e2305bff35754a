use super::{RuntimeDefinition, RuntimeProfile};
use crate::discovery::DiscoveryError;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct RuntimeRegistry {
    runtimes: Vec<Arc<dyn RuntimeDefinition>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            runtimes: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::TypeScriptRuntime));
        registry.register(Arc::new(super::JavaScriptRuntime));
        registry.register(Arc::new(super::PythonRuntime));
        registry.register(Arc::new(super::GoRuntime));
        registry
    }

    pub fn register(&mut self, runtime: Arc<dyn RuntimeDefinition>) {
        self.runtimes.push(runtime);
    }

    /// Resolves the runtime for a handler source path
    pub fn resolve(&self, handler: &Path) -> Result<RuntimeProfile, DiscoveryError> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.matches(handler))
            .map(|runtime| RuntimeProfile::new(runtime.clone()))
            .ok_or_else(|| DiscoveryError::UnsupportedRuntime(handler.display().to_string()))
    }

    pub fn get(&self, language: &str) -> Option<RuntimeProfile> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.language() == language)
            .map(|runtime| RuntimeProfile::new(runtime.clone()))
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.runtimes.iter().map(|r| r.language()).collect()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        typescript = { "functions/orders.ts", "typescript" },
        javascript = { "functions/orders.js", "javascript" },
        python = { "functions/resize.py", "python" },
        go = { "functions/orders/main.go", "go" },
    )]
    fn test_resolve(handler: &str, language: &str) {
        let registry = RuntimeRegistry::with_defaults();
        assert_eq!(registry.resolve(Path::new(handler)).unwrap().language(), language);
    }

    #[parameterized(
        ruby = { "functions/orders.rb" },
        no_extension = { "functions/orders" },
        dockerfile = { "Dockerfile" },
    )]
    fn test_resolve_unsupported(handler: &str) {
        let registry = RuntimeRegistry::with_defaults();
        assert!(matches!(
            registry.resolve(Path::new(handler)),
            Err(DiscoveryError::UnsupportedRuntime(_))
        ));
    }

    #[test]
    fn test_get_by_language() {
        let registry = RuntimeRegistry::with_defaults();
        assert!(registry.get("python").is_some());
        assert!(registry.get("cobol").is_none());
        assert_eq!(
            registry.languages(),
            vec!["typescript", "javascript", "python", "go"]
        );
    }
}
