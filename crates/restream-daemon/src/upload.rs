//! Upload persistence: file-type filtering, filename sanitising and writing
//! multipart file fields to the upload directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::multipart::{Field, MultipartError};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Video container extensions accepted for relaying.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Whether `filename` has an allowed extension (case-insensitive).
pub fn allowed_file(filename: &str) -> bool {
    filename.rsplit_once('.').is_some_and(|(_, ext)| {
        ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    })
}

/// Reduce a client-supplied filename to a safe ASCII name.
///
/// Path separators become word breaks, whitespace runs become `_`, and only
/// `[A-Za-z0-9_.-]` survive. Leading and trailing `.`/`_` are stripped, so the
/// result may be empty.
pub fn secure_filename(filename: &str) -> String {
    let spaced: String = filename
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Errors from persisting an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Failed to read upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Failed to write upload {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory that holds uploaded videos while they are relayed.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the upload directory if it does not exist.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Storage path for an upload: `{unix_ts}_{stream_id}_{secure_name}`.
    pub fn stored_path(&self, stream_id: &str, filename: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.dir.join(format!(
            "{timestamp}_{stream_id}_{}",
            secure_filename(filename)
        ))
    }

    /// Stream a multipart file field to disk and return where it was written.
    ///
    /// A partially written file is removed on failure.
    pub async fn save_field(
        &self,
        mut field: Field<'_>,
        stream_id: &str,
        filename: &str,
    ) -> Result<PathBuf, UploadError> {
        let path = self.stored_path(stream_id, filename);
        let io_err = |source| UploadError::Io {
            path: path.clone(),
            source,
        };

        let mut file = File::create(&path).await.map_err(io_err)?;
        let mut written: u64 = 0;
        let result = async {
            while let Some(chunk) = field.chunk().await? {
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(io_err)?;
            Ok::<(), UploadError>(())
        }
        .await;

        if let Err(e) = result {
            drop(file);
            self.discard(&path).await;
            return Err(e);
        }
        debug!(path = %path.display(), bytes = written, "Upload saved");
        Ok(path)
    }

    /// Remove a stored upload that will not be relayed.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove upload");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn allowed_extensions_are_case_insensitive() {
        assert!(allowed_file("clip.mp4"));
        assert!(allowed_file("CLIP.MKV"));
        assert!(allowed_file("archive.tar.mov"));
        assert!(!allowed_file("notes.txt"));
        assert!(!allowed_file("mp4"));
        assert!(!allowed_file("clip.mp4.exe"));
    }

    #[test]
    fn secure_filename_strips_paths_and_odd_characters() {
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(
            secure_filename("../../../etc/passwd"),
            "etc_passwd"
        );
        assert_eq!(secure_filename("C:\\videos\\a b.mp4"), "C_videos_a_b.mp4");
        assert_eq!(secure_filename("ünïcode.mkv"), "ncode.mkv");
        assert_eq!(secure_filename("..."), "");
    }

    #[test]
    fn stored_path_embeds_id_and_sanitised_name() {
        let store = UploadStore::new("/srv/uploads");
        let path = store.stored_path("abc-123", "my clip.mp4");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(path.starts_with("/srv/uploads"));
        assert!(name.ends_with("_abc-123_my_clip.mp4"), "{name}");
        assert!(name.split('_').next().unwrap().parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn ensure_creates_nested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::new(tmp.path().join("a").join("b"));
        store.ensure().await.unwrap();
        assert!(store.dir().is_dir());
    }
}
