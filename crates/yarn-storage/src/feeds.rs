use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{FixedOffset, SubsecRound, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use yarn_types::{Twt, Twter, parse_file, parse_line};

const READ_BACK_CHUNK: u64 = 4096;

/// Authored feed files under `<data>/feeds/<nick>`.
///
/// Appends to the same feed are serialised through a per-feed lock; every
/// twt lands with a single `write` of `<line>\n`.
pub struct FeedStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FeedStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Feeds directory: {}", dir.display());
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a feed file. Rejects names that could escape the directory.
    pub fn feed_path(&self, nick: &str) -> Result<PathBuf> {
        if nick.is_empty()
            || nick.starts_with('.')
            || nick.contains(['/', '\\'])
            || nick.chars().any(char::is_whitespace)
        {
            bail!("invalid feed name {nick:?}");
        }
        Ok(self.dir.join(nick))
    }

    async fn lock(&self, nick: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(nick.to_owned()).or_default())
    }

    pub async fn exists(&self, nick: &str) -> bool {
        match self.feed_path(nick) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Ensure an (empty) feed file exists.
    pub async fn create(&self, nick: &str) -> Result<()> {
        let path = self.feed_path(nick)?;
        let lock = self.lock(nick).await;
        let _guard = lock.lock().await;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(())
    }

    pub async fn read(&self, nick: &str) -> Result<String> {
        Ok(fs::read_to_string(self.feed_path(nick)?).await?)
    }

    pub async fn size(&self, nick: &str) -> Result<u64> {
        Ok(fs::metadata(self.feed_path(nick)?).await?.len())
    }

    /// Build a twt from `text` and append it. `at` preserves an existing
    /// timestamp when editing.
    pub async fn append(
        &self,
        twter: &Twter,
        text: &str,
        at: Option<chrono::DateTime<FixedOffset>>,
    ) -> Result<Twt> {
        let at = at.unwrap_or_else(now);
        let twt = Twt::make(twter.clone(), at, text);
        self.append_twt(&twter.nick, &twt).await?;
        Ok(twt)
    }

    /// Append an already built twt to the feed named `nick`.
    pub async fn append_twt(&self, nick: &str, twt: &Twt) -> Result<()> {
        let path = self.feed_path(nick)?;
        let line = format!("{}\n", twt.literal());

        let lock = self.lock(nick).await;
        let _guard = lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended twt {} to feed {}", twt.hash(), nick);
        Ok(())
    }

    /// The feed's final twt and the byte offset its line starts at.
    pub async fn get_last_twt(&self, twter: &Twter) -> Result<Option<(Twt, u64)>> {
        let path = self.feed_path(&twter.nick)?;
        let Some((line, offset)) = read_last_line(&path).await? else {
            return Ok(None);
        };
        if line.starts_with('#') {
            return Ok(None);
        }
        match parse_line(&line, twter) {
            Some(twt) => Ok(Some((twt, offset))),
            None => bail!("last line of feed {} is not a valid twt", twter.nick),
        }
    }

    /// Truncate the feed at the start of its final twt. Returns the removed
    /// twt, or `None` when the feed has no trailing twt.
    pub async fn delete_last_twt(&self, twter: &Twter) -> Result<Option<Twt>> {
        let lock = self.lock(&twter.nick).await;
        let _guard = lock.lock().await;

        let Some((twt, offset)) = self.get_last_twt(twter).await? else {
            return Ok(None);
        };
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.feed_path(&twter.nick)?)
            .await?;
        file.set_len(offset).await?;
        info!("Deleted twt {} from feed {}", twt.hash(), twter.nick);
        Ok(Some(twt))
    }

    /// Every twt of a feed, newest-first. A missing feed has none.
    pub async fn get_all_twts(&self, twter: &Twter) -> Result<Vec<Twt>> {
        let src = match self.read(&twter.nick).await {
            Ok(src) => src,
            Err(_) if !self.exists(&twter.nick).await => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if src.trim().is_empty() {
            return Ok(Vec::new());
        }
        let feed = parse_file(&src, twter.clone())?;
        let mut twts = feed.into_twts();
        yarn_types::sort_twts(&mut twts);
        Ok(twts)
    }

    pub async fn count_twts(&self, twter: &Twter) -> Result<usize> {
        Ok(self.get_all_twts(twter).await?.len())
    }

    /// Move an oversized feed aside: `nick.N` becomes `nick.N+1`, the feed
    /// becomes `nick.1` and a fresh empty feed takes its place.
    pub async fn rotate(&self, nick: &str, limit: u64) -> Result<bool> {
        let path = self.feed_path(nick)?;
        let lock = self.lock(nick).await;
        let _guard = lock.lock().await;

        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if size <= limit {
            return Ok(false);
        }

        let mut highest = 0;
        while fs::try_exists(rotated_path(&path, highest + 1)).await? {
            highest += 1;
        }
        for n in (1..=highest).rev() {
            fs::rename(rotated_path(&path, n), rotated_path(&path, n + 1)).await?;
        }
        fs::rename(&path, rotated_path(&path, 1)).await?;
        fs::File::create(&path).await?;

        info!("Rotated feed {} ({} bytes, {} older rotations)", nick, size, highest);
        Ok(true)
    }

    /// Names of all live feeds. Rotations (`nick.1`, `nick.2`, ...) are skipped.
    pub async fn get_all_feeds(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("Skipping non UTF-8 feed name {:?}", entry.file_name());
                continue;
            };
            if is_rotation(&name) || name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

fn now() -> chrono::DateTime<FixedOffset> {
    Utc::now().trunc_subsecs(0).fixed_offset()
}

fn rotated_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn is_rotation(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && !ext.is_empty() && ext.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Final non-empty line of a file and its starting offset, reading
/// backwards from the end in fixed-size chunks.
async fn read_last_line(path: &Path) -> Result<Option<(String, u64)>> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();

    // Bytes read so far, always a suffix of the file.
    let mut tail: Vec<u8> = Vec::new();
    let mut pos = len;

    while pos > 0 {
        let step = READ_BACK_CHUNK.min(pos);
        pos -= step;
        let mut chunk = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(pos)).await?;
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        // Trailing newlines are not part of the last line.
        let Some(content_end) = tail.iter().rposition(|&b| b != b'\n').map(|i| i + 1) else {
            continue;
        };
        if let Some(nl) = tail[..content_end].iter().rposition(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&tail[nl + 1..content_end]).into_owned();
            return Ok(Some((line, pos + nl as u64 + 1)));
        }
        if pos == 0 {
            let line = String::from_utf8_lossy(&tail[..content_end]).into_owned();
            return Ok(Some((line, 0)));
        }
    }
    Ok(None)
}
