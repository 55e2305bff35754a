//! Docker implementation of the container engine

use super::{
    BuildRequest, ContainerEngine, ContainerHandle, EngineError, Image, RunRequest,
    LABEL_COMPONENT, LABEL_PROJECT,
};
use crate::build::WORKSPACE_PREFIX;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::Docker;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::StreamExt;
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Lets containers reach the capture server on the host
const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";
const STOP_GRACE_SECS: i64 = 5;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the local daemon and checks that it answers
    pub async fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let version = docker
            .version()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        debug!(
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "Connected to Docker"
        );
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(&self, request: &BuildRequest) -> Result<(), EngineError> {
        let context = request.context.clone();
        let descriptor = request.descriptor.clone();
        let (archive, dockerfile) =
            tokio::task::spawn_blocking(move || pack_context(&context, &descriptor))
                .await
                .map_err(|e| EngineError::Context {
                    path: request.context.clone(),
                    error: e.to_string(),
                })??;

        debug!(
            tag = %request.tag,
            context_bytes = archive.len(),
            "Sending build context"
        );

        let options = BuildImageOptions {
            dockerfile,
            t: request.tag.clone(),
            rm: true,
            forcerm: true,
            buildargs: request
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            labels: request
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(archive)));
        let mut last_lines: Vec<String> = Vec::new();

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| EngineError::Build {
                tag: request.tag.clone(),
                diagnostic: e.to_string(),
            })?;
            if let Some(error) = info.error {
                let mut diagnostic = last_lines.join("\n");
                if !diagnostic.is_empty() {
                    diagnostic.push('\n');
                }
                diagnostic.push_str(&error);
                return Err(EngineError::Build {
                    tag: request.tag.clone(),
                    diagnostic,
                });
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    trace!(tag = %request.tag, "{}", line);
                    if last_lines.len() == 10 {
                        last_lines.remove(0);
                    }
                    last_lines.push(line.to_string());
                }
            }
        }

        info!(tag = %request.tag, "Image built");
        Ok(())
    }

    async fn run(&self, request: &RunRequest) -> Result<ContainerHandle, EngineError> {
        let config = Config {
            image: Some(request.image.clone()),
            env: Some(
                request
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(
                request
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            host_config: Some(bollard::service::HostConfig {
                extra_hosts: Some(vec![HOST_GATEWAY.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| EngineError::Run {
                image: request.image.clone(),
                error: e.to_string(),
            })?;

        let handle = ContainerHandle {
            id: container.id,
            image: request.image.clone(),
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Created but never started; don't leave it behind
            let _ = self.stop(&handle).await;
            return Err(EngineError::Run {
                image: request.image.clone(),
                error: e.to_string(),
            });
        }

        debug!(container = %handle.id, image = %handle.image, "Container started");
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(&handle.id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 => {}
            Err(e) => warn!(container = %handle.id, "Failed to stop container: {}", e),
        }

        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                debug!(container = %handle.id, "Container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(EngineError::Stop {
                id: handle.id.clone(),
                error: e.to_string(),
            }),
        }
    }

    async fn list_images(
        &self,
        project: &str,
        component: &str,
    ) -> Result<Vec<Image>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{}={}", LABEL_PROJECT, project),
                format!("{}={}", LABEL_COMPONENT, component),
            ],
        );

        let summaries = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::List(e.to_string()))?;

        Ok(summaries
            .into_iter()
            .map(|summary| Image {
                id: summary.id,
                tags: summary.repo_tags,
                project: project.to_string(),
                component: component.to_string(),
                created: chrono::DateTime::from_timestamp(summary.created, 0),
                size: summary.size,
            })
            .collect())
    }
}

/// Packs `context` into a gzipped tarball honoring `.dockerignore`
///
/// The descriptor is added at the archive root under its own file name, which is
/// returned alongside the archive.
fn pack_context(context: &Path, descriptor: &Path) -> Result<(Vec<u8>, String), EngineError> {
    let context_error = |error: String| EngineError::Context {
        path: context.to_path_buf(),
        error,
    };

    let dockerfile = descriptor
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| context_error(format!("invalid descriptor {}", descriptor.display())))?;

    let mut archive = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    archive.follow_symlinks(false);

    let walker = WalkBuilder::new(context)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .add_custom_ignore_filename(".dockerignore")
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != ".git" && !name.starts_with(WORKSPACE_PREFIX)
        })
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| context_error(e.to_string()))?;
        let path = entry.path();
        if path == context || entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let relative = path
            .strip_prefix(context)
            .map_err(|e| context_error(e.to_string()))?;
        archive
            .append_path_with_name(path, relative)
            .map_err(|e| context_error(format!("{}: {}", relative.display(), e)))?;
    }

    archive
        .append_path_with_name(descriptor, &dockerfile)
        .map_err(|e| context_error(format!("{}: {}", descriptor.display(), e)))?;

    let encoder = archive
        .into_inner()
        .map_err(|e| context_error(e.to_string()))?;
    let bytes = encoder.finish().map_err(|e| context_error(e.to_string()))?;
    Ok((bytes, dockerfile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;
    use tempfile::TempDir;

    fn archive_entries(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_pack_context_honors_dockerignore() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("functions")).unwrap();
        fs::create_dir_all(root.join("node_modules/left-pad")).unwrap();
        fs::write(root.join("functions/upload.ts"), "export {}").unwrap();
        fs::write(root.join("node_modules/left-pad/index.js"), "").unwrap();
        fs::write(root.join(".dockerignore"), "node_modules\n").unwrap();

        let workspace = root.join(format!("{}abc", WORKSPACE_PREFIX));
        fs::create_dir_all(&workspace).unwrap();
        let descriptor = workspace.join("nimbus.dynamic.Dockerfile.xyz");
        fs::write(&descriptor, "FROM scratch\n").unwrap();

        let (bytes, dockerfile) = pack_context(root, &descriptor).unwrap();
        let entries = archive_entries(&bytes);

        assert_eq!(dockerfile, "nimbus.dynamic.Dockerfile.xyz");
        assert!(entries.contains(&"functions/upload.ts".to_string()));
        assert!(entries.contains(&".dockerignore".to_string()));
        assert!(entries.contains(&dockerfile));
        assert!(!entries.iter().any(|e| e.starts_with("node_modules")));
        assert!(!entries.iter().any(|e| e.starts_with(WORKSPACE_PREFIX)));
    }
}
