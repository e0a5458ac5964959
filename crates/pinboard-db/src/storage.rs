use anyhow::{Result, bail};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// Bucket for pin and place images.
pub const PIN_IMAGES: &str = "pin-images";

/// On-disk object storage.
///
/// Each object lives at `{root}/{bucket}/{path}` and is served from
/// `{public_base}/{bucket}/{path}`.
pub struct ObjectStorage {
    root: PathBuf,
    public_base: String,
}

impl ObjectStorage {
    pub async fn new(root: PathBuf, public_base: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("Object storage directory: {}", root.display());
        Ok(Self {
            root,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        check_relative(bucket)?;
        check_relative(path)?;
        Ok(self.root.join(bucket).join(path))
    }

    /// Store a blob. Fails if an object already exists at that path.
    pub async fn upload(&self, bucket: &str, path: &str, blob: &[u8]) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::try_exists(&target).await? {
            bail!("object {}/{} already exists", bucket, path);
        }
        fs::write(&target, blob).await?;
        info!("Stored {} bytes at {}/{}", blob.len(), bucket, path);
        Ok(())
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.public_base, bucket, path)
    }

    /// Delete objects. Already-missing objects are not an error.
    pub async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        for path in paths {
            let target = self.object_path(bucket, path)?;
            match fs::remove_file(&target).await {
                Ok(()) => info!("Deleted object {}/{}", bucket, path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Object {}/{} already gone", bucket, path);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Object path for a URL produced by `public_url`, if it points into `bucket`.
    pub fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String> {
        let prefix = format!("{}/{}/", self.public_base, bucket);
        let path = url.strip_prefix(&prefix)?;
        let path = path.split(['?', '#']).next().unwrap_or(path);
        check_relative(path).ok()?;
        Some(path.to_string())
    }

    pub async fn read(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.object_path(bucket, path)?).await?)
    }
}

fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.is_empty() || !p.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("invalid object path '{}'", path);
    }
    Ok(())
}
