use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// One deployable unit of function code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandler {
    name: String,
    /// Source path relative to the project root
    source: PathBuf,
    /// Content hash of the source file
    version: String,
}

impl FunctionHandler {
    /// Creates a handler and derives its version from the source content
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, content: &[u8]) -> Self {
        let source = source.into();
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(content);
        let digest = hasher.finalize();

        Self {
            name: name.into(),
            source,
            version: hex::encode(&digest[..6]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Source path with forward slashes, as used inside build descriptors
    pub fn source_str(&self) -> String {
        self.source
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Repository name of the deployable image
    pub fn image_name(&self, project: &str) -> String {
        format!("{}-{}", image_component(project), image_component(&self.name))
    }

    /// Full reference of the deployable image
    pub fn image_tag(&self, project: &str) -> String {
        format!("{}:{}", self.image_name(project), self.version)
    }

    /// Full reference of the ephemeral discovery image
    pub fn discovery_tag(&self, project: &str) -> String {
        format!("{}-discovery:{}", self.image_name(project), self.version)
    }
}

/// A pre-built container with its own Dockerfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    /// Dockerfile path relative to the project root
    pub dockerfile: PathBuf,
}

impl Container {
    pub fn image_name(&self, project: &str) -> String {
        format!("{}-{}", image_component(project), image_component(&self.name))
    }
}

/// Lowercases and replaces characters image references cannot carry
pub fn image_component(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    mapped.trim_matches(|c| c == '-' || c == '.' || c == '_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_deterministic() {
        let a = FunctionHandler::new("upload", "functions/upload.ts", b"export {}");
        let b = FunctionHandler::new("upload", "functions/upload.ts", b"export {}");
        let c = FunctionHandler::new("upload", "functions/upload.ts", b"export {};");

        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_eq!(a.version().len(), 12);
    }

    #[test]
    fn test_image_tags() {
        let handler = FunctionHandler::new("Upload", "functions/upload.ts", b"");
        let version = handler.version().to_string();

        assert_eq!(handler.image_tag("My Shop"), format!("my-shop-upload:{}", version));
        assert_eq!(
            handler.discovery_tag("shop"),
            format!("shop-upload-discovery:{}", version)
        );
    }

    #[test]
    fn test_source_str_uses_forward_slashes() {
        let handler = FunctionHandler::new(
            "orders",
            Path::new("functions").join("orders").join("main.go"),
            b"",
        );
        assert_eq!(handler.source_str(), "functions/orders/main.go");
    }
}
