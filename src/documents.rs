use crate::errors::{SessionError, SessionResult};
use crate::models::SearchHit;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_SEARCH_HITS: usize = 500;

/// Read-only text documents under one directory, searchable line by line.
#[derive(Clone, Debug)]
pub struct DocumentLibrary {
    root: Arc<PathBuf>,
}

impl DocumentLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    /// Case-insensitive substring search over every file in the library.
    pub async fn search(&self, query: &str) -> SessionResult<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(SessionError::InvalidRequest(
                "search query must not be empty".to_string(),
            ));
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || search_blocking(&root, &needle))
            .await
            .map_err(|error| SessionError::Internal(format!("search task failed: {error}")))?
    }

    pub async fn load(&self, name: &str) -> SessionResult<String> {
        let path = self.resolve(name)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| SessionError::NotFound(format!("document '{name}'")))
    }

    fn resolve(&self, name: &str) -> SessionResult<PathBuf> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            warn!(%name, "blocked document path traversal attempt");
            return Err(SessionError::Forbidden(format!(
                "document name '{name}' is not allowed"
            )));
        }

        let base = self
            .root
            .canonicalize()
            .map_err(|_| SessionError::NotFound("document directory".to_string()))?;
        let canonical = base
            .join(relative)
            .canonicalize()
            .map_err(|_| SessionError::NotFound(format!("document '{name}'")))?;

        // Symlinks inside the library must not lead out of it.
        if !canonical.starts_with(&base) {
            warn!(%name, "blocked document path traversal attempt");
            return Err(SessionError::Forbidden(format!(
                "document name '{name}' is not allowed"
            )));
        }
        Ok(canonical)
    }
}

fn search_blocking(root: &Path, needle: &str) -> SessionResult<Vec<SearchHit>> {
    if !root.is_dir() {
        return Err(SessionError::NotFound(format!(
            "document directory {}",
            root.display()
        )));
    }

    let mut hits = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(error) => {
                debug!("skipping unreadable document entry: {error}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            debug!(path = %entry.path().display(), "skipping non-text document");
            continue;
        };
        let source_name = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();

        for (index, line) in text.lines().enumerate() {
            if line.to_lowercase().contains(needle) {
                hits.push(SearchHit {
                    source_name: source_name.clone(),
                    line_number: index + 1,
                    line_text: line.trim_end().to_string(),
                });
                if hits.len() >= MAX_SEARCH_HITS {
                    return Ok(hits);
                }
            }
        }
    }

    Ok(hits)
}
