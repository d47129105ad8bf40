//! Per-terminal scratch notes kept as plain text files.
//!
//! Notes outlive terminals: nothing in the session lifecycle removes a note file.

use crate::errors::{SessionError, SessionResult};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

pub const MAIN_NOTE_KEY: &str = "main";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct NoteStore {
    dir: Arc<PathBuf>,
}

/// Accepts `main` or a non-empty run of ASCII digits (a terminal port).
pub fn validate_key(key: &str) -> SessionResult<()> {
    let numeric = !key.is_empty() && key.len() <= 10 && key.bytes().all(|b| b.is_ascii_digit());
    if key == MAIN_NOTE_KEY || numeric {
        Ok(())
    } else {
        Err(SessionError::InvalidRequest(format!(
            "invalid note key '{key}'; expected 'main' or a number"
        )))
    }
}

impl NoteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    fn path_for(&self, key: &str) -> SessionResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("notes_{key}.txt")))
    }

    /// Note text for `key`; a note that was never written reads as empty.
    pub async fn read(&self, key: &str) -> SessionResult<String> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn write(&self, key: &str, text: &str) -> SessionResult<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(self.dir.as_ref()).await?;

        // Unique per write so overlapping saves of one key never share a temp file.
        let tmp = self.dir.join(format!(
            ".notes_{key}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, text).await?;
        if let Err(error) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(error.into());
        }
        debug!(key, path = %path.display(), "saved note");
        Ok(())
    }
}
