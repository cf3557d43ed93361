//! Single-slot firmware storage.
//!
//! Layout under the firmware directory:
//!
//! ```text
//! images/<sha256>.bin   immutable, content-addressed blobs
//! current.json          pointer to the published blob plus its metadata
//! .tmp-<uuid>[.json]    in-flight writes, removed once stale
//! ```
//!
//! A publish stages the blob and the new pointer as temp files, then makes
//! the image live with one rename over `current.json`. Readers never see a
//! partially written blob because blobs only appear in `images/` fully
//! written and are never modified afterwards.
//!
//! Several processes (the server and CLI publishes) may share one
//! directory; each re-reads `current.json` when it changes on disk.

use chrono::{DateTime, Local, Utc};
use std::fs::{self, File, Metadata};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stream::FirmwareDownload;
use super::verify;
use super::FirmwareImage;
use crate::engine::error::StorageError;

const POINTER_FILE: &str = "current.json";
const IMAGES_DIR: &str = "images";
const TEMP_PREFIX: &str = ".tmp-";
const DEFAULT_VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Temp files and unreferenced blobs younger than this may belong to a
/// publish still running in another process and are left alone.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Identity of `current.json` on disk. A rename over the pointer always
/// changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PointerStamp {
    modified: SystemTime,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl PointerStamp {
    fn of(meta: &Metadata) -> io::Result<Self> {
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(meta),
        })
    }
}

struct Snapshot {
    stamp: Option<PointerStamp>,
    image: Option<FirmwareImage>,
}

pub struct FirmwareStore {
    root: PathBuf,
    timeout: Duration,
    stale_after: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    publish_lock: tokio::sync::Mutex<()>,
}

impl FirmwareStore {
    /// Open the store, creating its directories and recovering the pointer
    pub fn open(root: &Path, timeout: Duration) -> Result<Self, StorageError> {
        Self::open_with_grace(root, timeout, STALE_AFTER)
    }

    /// Like `open`, with a custom age after which leftover temp files and
    /// unreferenced blobs are removed
    pub fn open_with_grace(
        root: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(root.join(IMAGES_DIR))?;
        let removed = cleanup_temp(root, stale_after)?;
        if removed > 0 {
            debug!(removed, "Removed stale temp files");
        }

        let store = Self {
            root: root.to_path_buf(),
            timeout,
            stale_after,
            snapshot: RwLock::new(None),
            publish_lock: tokio::sync::Mutex::new(()),
        };

        if let Some(image) = store.current()? {
            let blob = store.blob_path(&image);
            let size = fs::metadata(&blob)
                .map_err(|e| {
                    StorageError::Corrupt(format!("published blob {} unreadable: {}", blob.display(), e))
                })?
                .len();
            if size != image.size {
                return Err(StorageError::Corrupt(format!(
                    "published blob is {} bytes, metadata says {}",
                    size, image.size
                )));
            }
            info!(version = %image.version, hash = %image.content_hash, "Loaded published firmware");
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata of the published image, `None` if nothing was ever published.
    ///
    /// `current.json` is authoritative. Other processes sharing the directory
    /// publish into it too, so the cached copy is reused only while the
    /// pointer file is unchanged on disk.
    pub fn current(&self) -> Result<Option<FirmwareImage>, StorageError> {
        let stamp = pointer_stamp(&self.root)?;
        {
            let cached = self
                .snapshot
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(snapshot) = cached.as_ref().filter(|s| s.stamp == stamp) {
                return Ok(snapshot.image.clone());
            }
        }

        let image = load_pointer(&self.root)?;
        if let Some(image) = &image {
            debug!(version = %image.version, "Reloaded firmware pointer");
        }
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Snapshot {
            stamp,
            image: image.clone(),
        });
        Ok(image)
    }

    fn invalidate(&self) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    fn blob_path(&self, image: &FirmwareImage) -> PathBuf {
        self.root.join(IMAGES_DIR).join(image.blob_name())
    }

    /// Replace the published image.
    ///
    /// On any failure the previously published image stays live.
    pub async fn publish(
        &self,
        bytes: Vec<u8>,
        explicit_version: Option<&str>,
    ) -> Result<FirmwareImage, StorageError> {
        let _guard = self.publish_lock.lock().await;
        let previous = match self.current() {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Unreadable firmware pointer, replacing it");
                None
            }
        };

        let content_hash = verify::content_hash(&bytes);
        let version = resolve_version(explicit_version, &content_hash, Local::now());
        let image = FirmwareImage {
            version,
            content_hash,
            size: bytes.len() as u64,
            published_at: Utc::now(),
        };

        let staged = {
            let root = self.root.clone();
            let image = image.clone();
            with_timeout(self.timeout, async move {
                tokio::task::spawn_blocking(move || stage(&root, &bytes, &image))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            })
            .await?
        };

        // The commit is a single rename and is not raced against the timeout,
        // so a reported failure always means the pointer was left untouched.
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || commit(&root, &staged))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        self.invalidate();
        info!(
            version = %image.version,
            hash = %image.content_hash,
            size = image.size,
            "Published firmware"
        );

        self.prune(&image, previous.as_ref()).await;
        Ok(image)
    }

    /// Open the published blob for transfer.
    ///
    /// The returned handle carries the metadata it was opened under, so the
    /// advertised version/hash always describes the bytes being served.
    pub async fn open_download(&self) -> Result<Option<FirmwareDownload>, StorageError> {
        for _ in 0..3 {
            let Some(image) = self.current()? else {
                return Ok(None);
            };
            let path = self.blob_path(&image);

            match with_timeout(self.timeout, tokio::fs::File::open(&path)).await {
                Ok(file) => {
                    let len = with_timeout(self.timeout, file.metadata()).await?.len();
                    if len != image.size {
                        return Err(StorageError::Corrupt(format!(
                            "blob {} is {} bytes, metadata says {}",
                            image.blob_name(),
                            len,
                            image.size
                        )));
                    }
                    return Ok(Some(FirmwareDownload::new(image, file)));
                }
                Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    // Only a publish between reading the pointer and opening
                    // the blob explains a missing blob
                    if self.current()?.as_ref() == Some(&image) {
                        return Err(StorageError::Io(e));
                    }
                    debug!(hash = %image.content_hash, "Blob replaced while opening, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StorageError::Corrupt(
            "published image kept changing while opening".to_string(),
        ))
    }

    /// Re-hash the published blob and compare it with the advertised hash
    pub async fn verify_current(&self) -> Result<Option<FirmwareImage>, StorageError> {
        let Some(image) = self.current()? else {
            return Ok(None);
        };
        let path = self.blob_path(&image);
        let expected = image.content_hash.clone();
        with_timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || verify::verify_file(&path, &expected))
                .await
                .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        })
        .await?;
        Ok(Some(image))
    }

    /// Remove stale blobs other than the live one and the one it replaced.
    ///
    /// The previous blob is kept so a reader holding the old pointer can
    /// still open it. Recent blobs are kept because another process may have
    /// staged one without committing its pointer yet.
    async fn prune(&self, live: &FirmwareImage, previous: Option<&FirmwareImage>) {
        let images = self.root.join(IMAGES_DIR);
        let mut keep = vec![live.blob_name()];
        if let Some(prev) = previous {
            keep.push(prev.blob_name());
        }
        // Another process may have published since our commit
        if let Ok(Some(on_disk)) = self.current() {
            keep.push(on_disk.blob_name());
        }
        let stale_after = self.stale_after;

        let result = tokio::task::spawn_blocking(move || -> io::Result<usize> {
            let mut removed = 0;
            for entry in fs::read_dir(&images)? {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if keep.iter().any(|k| k == name) || age(&entry.metadata()?) < stale_after {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    // Pruned concurrently by another process
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(removed)
        })
        .await;

        match result {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => debug!(removed, "Pruned stale firmware blobs"),
            Ok(Err(e)) => warn!(error = %e, "Failed to prune firmware blobs"),
            Err(e) => warn!(error = %e, "Firmware prune task failed"),
        }
    }
}

/// Pick the version for a new image.
///
/// A non-blank explicit version is used exactly as given. Otherwise the
/// local publish time suffixed with the short content hash.
pub fn resolve_version(explicit: Option<&str>, content_hash: &str, now: DateTime<Local>) -> String {
    if let Some(v) = explicit.filter(|v| !v.trim().is_empty()) {
        return v.to_string();
    }
    let short = &content_hash[..content_hash.len().min(8)];
    format!("{}-{}", now.format(DEFAULT_VERSION_FORMAT), short)
}

async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StorageError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StorageError::Timeout(limit)),
    }
}

struct Staged {
    pointer_tmp: PathBuf,
}

/// Write the blob into `images/` and the new pointer into a temp file
fn stage(root: &Path, bytes: &[u8], image: &FirmwareImage) -> io::Result<Staged> {
    let blob_tmp = root.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
    let blob_final = root.join(IMAGES_DIR).join(image.blob_name());
    write_synced(&blob_tmp, bytes)
        .and_then(|_| fs::rename(&blob_tmp, &blob_final))
        .map_err(|e| {
            let _ = fs::remove_file(&blob_tmp);
            e
        })?;

    let pointer = serde_json::to_vec_pretty(image)?;
    let pointer_tmp = root.join(format!("{}{}.json", TEMP_PREFIX, Uuid::new_v4()));
    write_synced(&pointer_tmp, &pointer).map_err(|e| {
        let _ = fs::remove_file(&pointer_tmp);
        e
    })?;

    Ok(Staged { pointer_tmp })
}

fn commit(root: &Path, staged: &Staged) -> io::Result<()> {
    fs::rename(&staged.pointer_tmp, root.join(POINTER_FILE)).map_err(|e| {
        let _ = fs::remove_file(&staged.pointer_tmp);
        e
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn pointer_stamp(root: &Path) -> Result<Option<PointerStamp>, StorageError> {
    match fs::metadata(root.join(POINTER_FILE)) {
        Ok(meta) => Ok(Some(PointerStamp::of(&meta)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_pointer(root: &Path) -> Result<Option<FirmwareImage>, StorageError> {
    match fs::read(root.join(POINTER_FILE)) {
        Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn age(meta: &Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

/// Remove temp files left by publishes that died before committing
fn cleanup_temp(root: &Path, stale_after: Duration) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let is_temp = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(TEMP_PREFIX))
            .unwrap_or(false);
        if !is_temp {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() && age(&meta) >= stale_after {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(removed)
}
