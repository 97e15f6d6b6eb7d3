use std::path::PathBuf;

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

/// Cached avatars of external feeds: `<slug>.png` plus a `<slug>.cbf`
/// holding the hex SHA-256 of the image bytes.
pub struct ExternalAvatars {
    dir: PathBuf,
}

impl ExternalAvatars {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn paths(&self, slug: &str) -> Result<(PathBuf, PathBuf)> {
        if slug.is_empty() || !slug.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            bail!("invalid avatar slug {slug:?}");
        }
        Ok((
            self.dir.join(format!("{slug}.png")),
            self.dir.join(format!("{slug}.cbf")),
        ))
    }

    pub fn image_path(&self, slug: &str) -> Result<PathBuf> {
        Ok(self.paths(slug)?.0)
    }

    pub async fn has(&self, slug: &str) -> bool {
        match self.paths(slug) {
            Ok((png, _)) => fs::try_exists(png).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn fingerprint(&self, slug: &str) -> Result<Option<String>> {
        let (_, cbf) = self.paths(slug)?;
        match fs::read_to_string(&cbf).await {
            Ok(s) => Ok(Some(s.trim().to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the image unless the stored fingerprint already matches.
    /// Returns whether anything was written.
    pub async fn store(&self, slug: &str, data: &[u8]) -> Result<bool> {
        let (png, cbf) = self.paths(slug)?;
        let mut hasher = Sha256::new();
        hasher.update(data);
        let sum = hex::encode(hasher.finalize());

        if self.fingerprint(slug).await?.as_deref() == Some(sum.as_str()) {
            debug!("Avatar {} unchanged", slug);
            return Ok(false);
        }

        fs::write(&png, data).await?;
        fs::write(&cbf, &sum).await?;
        info!("Stored external avatar {} ({} bytes)", slug, data.len());
        Ok(true)
    }
}
