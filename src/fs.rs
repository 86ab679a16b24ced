//! File system abstraction for testability, plus atomic replace and
//! destination filename helpers.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

static UNSAFE_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("valid regex"));

static CONTROL_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f-\x{9f}]").expect("valid regex"));

const MAX_FILENAME_CHARS: usize = 200;

/// Abstraction over file system operations for testability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Creates (truncating) a file and pre-allocates the specified size.
    async fn create_file(&self, path: &Path, size: u64) -> std::io::Result<()>;

    /// Opens an existing file for positioned writes without truncating it.
    async fn open_write(&self, path: &Path) -> std::io::Result<tokio::fs::File>;

    /// Renames a file, replacing the destination.
    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn create_file(&self, path: &Path, size: u64) -> std::io::Result<()> {
        let file = tokio::fs::File::create(path).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn open_write(&self, path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::OpenOptions::new().write(true).open(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// Returns the `.part` file path for a given final path.
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Replaces `path` with `contents` so that readers never see a half-written
/// file: the bytes go to a uniquely named temporary file in the same
/// directory, which is then renamed over. Concurrent writers never share a
/// temporary file.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or the
/// temporary file cannot be written or renamed.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                parent.to_path_buf()
            }
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Makes a filename safe for the destination filesystem.
///
/// Path separators and reserved characters become `_`, control characters
/// are dropped, and names over 200 characters keep their extension.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = UNSAFE_CHARS_RE.replace_all(filename, "_");
    let cleaned = CONTROL_CHARS_RE.replace_all(&cleaned, "").into_owned();

    if cleaned.chars().count() <= MAX_FILENAME_CHARS {
        return cleaned;
    }

    let (stem, ext) = match cleaned.rfind('.') {
        Some(idx) if idx > 0 => cleaned.split_at(idx),
        _ => (cleaned.as_str(), ""),
    };
    let keep = MAX_FILENAME_CHARS.saturating_sub(4);
    let stem: String = stem.chars().take(keep).collect();
    format!("{stem}{ext}")
}
