use std::path::PathBuf;

use anyhow::{Result, bail};
use tokio::fs;
use tracing::{debug, info, warn};
use yarn_types::Twt;
use yarn_types::twt::HASH_LENGTH;

/// Content-addressed twt store: one JSON file per hash at `<data>/archive/<hash>`.
pub struct DiskArchive {
    dir: PathBuf,
}

impl DiskArchive {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Archive directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            bail!("invalid twt hash {hash:?}");
        }
        Ok(self.dir.join(hash))
    }

    pub async fn has(&self, hash: &str) -> bool {
        match self.path(hash) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn get(&self, hash: &str) -> Result<Option<Twt>> {
        let path = self.path(hash)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let twt: Twt = serde_json::from_slice(&data)?;
        if twt.hash() != hash {
            warn!("Archived twt {} decodes to hash {}", hash, twt.hash());
        }
        Ok(Some(twt))
    }

    /// Store a twt under its hash. Returns `false` if it was already archived.
    pub async fn archive(&self, twt: &Twt) -> Result<bool> {
        let path = self.path(twt.hash())?;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        let data = serde_json::to_vec(twt)?;
        let tmp = self.dir.join(format!(".{}.tmp", twt.hash()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Archived twt {}", twt.hash());
        Ok(true)
    }

    pub async fn del(&self, hash: &str) -> Result<()> {
        match fs::remove_file(self.path(hash)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn count(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut n = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_str().is_some_and(is_valid_hash) {
                n += 1;
            }
        }
        Ok(n)
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LENGTH
        && hash
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
}
