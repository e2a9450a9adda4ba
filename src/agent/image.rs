use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{self, AsyncWriteExt},
};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;

#[derive(Debug, Clone)]
pub struct ImageAgentConfig {
    pub image_dir: PathBuf,
}

/// Produces private, writable root-disk copies in a dedicated directory.
pub struct ImageAgent {
    image_dir: PathBuf,
}

impl ImageAgent {
    pub async fn new(config: ImageAgentConfig) -> Result<Self> {
        if !config.image_dir.exists() {
            fs::create_dir_all(&config.image_dir).await?;
        }

        Ok(Self {
            image_dir: config.image_dir,
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub async fn provision(&self, template: impl AsRef<Path>) -> Result<PathBuf, ProvisionError> {
        let template = template.as_ref();

        let metadata = match fs::metadata(template).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProvisionError::ImageNotFound(template.to_path_buf()));
            }
            Err(source) => {
                return Err(ProvisionError::ImageCopy {
                    path: template.to_path_buf(),
                    source,
                });
            }
        };

        if !metadata.is_file() {
            return Err(ProvisionError::ImageNotRegularFile(template.to_path_buf()));
        }

        let path = self
            .image_dir
            .join(format!("image-{}", uuid::Uuid::new_v4()));

        debug!("copying {} to {}", template.display(), path.display());

        if let Err(source) = copy_into_new_file(template, &path).await {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove partial image {}: {}", path.display(), e);
                }
            }

            return Err(ProvisionError::ImageCopy {
                path: template.to_path_buf(),
                source,
            });
        }

        info!("provisioned image {} from {}", path.display(), template.display());

        Ok(path)
    }

    /// Best-effort removal of a private copy.
    pub async fn discard(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        match fs::remove_file(path).await {
            Ok(()) => debug!("discarded image {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to discard image {}: {}", path.display(), e),
        }
    }
}

async fn copy_into_new_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut source = File::open(src).await?;
    let mut destination = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .await?;

    let copied = io::copy(&mut source, &mut destination).await?;
    destination.flush().await?;
    destination.sync_all().await?;

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_agent(dir: &Path) -> ImageAgent {
        ImageAgent::new(ImageAgentConfig {
            image_dir: dir.join("images"),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_provision_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let agent = create_test_agent(dir.path()).await;

        let template = dir.path().join("base.img");
        fs::write(&template, b"rootfs bytes").await.unwrap();

        let first = agent.provision(&template).await.unwrap();
        let second = agent.provision(&template).await.unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with(agent.image_dir()));
        assert_eq!(fs::read(&first).await.unwrap(), b"rootfs bytes");

        agent.discard(&first).await;
        assert!(!first.exists());
        assert!(second.exists());

        // discarding twice is fine
        agent.discard(&first).await;
    }

    #[tokio::test]
    async fn test_provision_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let agent = create_test_agent(dir.path()).await;

        let err = agent
            .provision(dir.path().join("nope.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_provision_directory_template() {
        let dir = tempfile::tempdir().unwrap();
        let agent = create_test_agent(dir.path()).await;

        let err = agent.provision(dir.path()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ImageNotRegularFile(_)));

        let mut entries = fs::read_dir(agent.image_dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
