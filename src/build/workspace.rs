use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

/// Name prefix of per-run build directories created in the project root
pub const WORKSPACE_PREFIX: &str = ".nimbus-build-";
/// Name prefix of ephemeral build descriptors
pub const DESCRIPTOR_PREFIX: &str = "nimbus.dynamic.Dockerfile.";

/// Scratch directory for one run's build descriptors
///
/// Lives inside the project root and is removed with everything in it when dropped.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: TempDir,
    empty_context: PathBuf,
}

impl BuildWorkspace {
    pub fn create(project_root: &Path) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(project_root)?;
        let empty_context = dir.path().join("context");
        std::fs::create_dir(&empty_context)?;
        debug!(path = %dir.path().display(), "Created build workspace");
        Ok(Self { dir, empty_context })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Empty directory used as the context of images that copy nothing in
    pub fn empty_context(&self) -> &Path {
        &self.empty_context
    }

    /// Writes `content` to a new descriptor with a random, collision-free name
    pub fn descriptor(&self, content: &str) -> std::io::Result<EphemeralDescriptor> {
        let mut file = tempfile::Builder::new()
            .prefix(DESCRIPTOR_PREFIX)
            .tempfile_in(self.dir.path())?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(EphemeralDescriptor { file })
    }

    /// Removes the workspace, logging instead of failing
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), "Failed to remove build workspace: {}", e);
        }
    }
}

/// A build descriptor that is deleted when dropped
#[derive(Debug)]
pub struct EphemeralDescriptor {
    file: NamedTempFile,
}

impl EphemeralDescriptor {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
