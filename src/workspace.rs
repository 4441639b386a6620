//! Per-user workspace roots and confined path resolution.
//!
//! Every user gets one directory under the configured workspaces root. All
//! caller-supplied paths are resolved lexically against that directory and
//! rejected (never clamped) when they would leave it.
//!
//! ## Resolution rules
//!
//! - Absolute paths, `..` segments that climb above the root and NUL bytes are
//!   rejected with a [`SecurityError`].
//! - After the lexical check, the longest existing ancestor of the result is
//!   canonicalized and must still lie under the canonical root, so a symlink
//!   inside the workspace cannot be used to reach the host filesystem.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

/// A path or identity that would escape a workspace.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Invalid user id '{0}': must be a single path component")]
    InvalidUserId(String),

    #[error("Invalid path '{0}': cannot access files outside workspace")]
    OutsideWorkspace(String),

    #[error("Invalid path '{0}': absolute paths are not allowed")]
    AbsolutePath(String),

    #[error("Invalid path: contains a NUL byte")]
    NulByte,
}

/// Errors from workspace resolution.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A confined path together with the workspace root it lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub root: PathBuf,
    pub path: PathBuf,
}

impl ResolvedPath {
    /// Workspace-relative form, safe to show to the model.
    pub fn display(&self) -> String {
        relative_display(&self.root, &self.path)
    }

    pub fn is_root(&self) -> bool {
        self.path == self.root
    }
}

/// Maps user ids to isolated root directories.
#[derive(Debug)]
pub struct WorkspaceResolver {
    base: PathBuf,
    roots: RwLock<HashMap<String, PathBuf>>,
}

/// Shared resolver wrapped in Arc for concurrent access.
pub type SharedWorkspaceResolver = Arc<WorkspaceResolver>;

impl WorkspaceResolver {
    /// Create a resolver rooted at `base`, creating and canonicalizing it.
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await?;
        let base = tokio::fs::canonicalize(&base).await?;
        tracing::info!(base = %base.display(), "Workspace resolver ready");
        Ok(Self {
            base,
            roots: RwLock::new(HashMap::new()),
        })
    }

    /// The directory that holds every user's workspace.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Get (creating on first use) the canonical root for a user.
    pub async fn root_for(&self, user_id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_user_id(user_id)?;

        if let Some(root) = self.roots.read().await.get(user_id) {
            return Ok(root.clone());
        }

        // create_dir_all is idempotent, so racing first calls for the same
        // user converge on the same directory.
        let root = self.base.join(user_id);
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        if !root.starts_with(&self.base) {
            tracing::warn!(user_id, root = %root.display(), "Workspace root escapes base");
            return Err(SecurityError::InvalidUserId(user_id.to_string()).into());
        }

        let mut roots = self.roots.write().await;
        let root = roots.entry(user_id.to_string()).or_insert(root).clone();
        tracing::debug!(user_id, root = %root.display(), "Workspace root ready");
        Ok(root)
    }

    /// Resolve a workspace-relative path for a user.
    pub async fn resolve(&self, user_id: &str, relative: &str) -> Result<PathBuf, WorkspaceError> {
        Ok(self.resolve_in(user_id, relative).await?.path)
    }

    /// Like [`Self::resolve`], also returning the workspace root.
    pub async fn resolve_in(&self, user_id: &str, relative: &str) -> Result<ResolvedPath, WorkspaceError> {
        let root = self.root_for(user_id).await?;
        let resolved = match confine(&root, relative) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(user_id, path = relative, "Rejected workspace path: {}", e);
                return Err(e.into());
            }
        };

        let real = canonical_ancestor(&resolved).await?;
        if !real.starts_with(&root) {
            tracing::warn!(
                user_id,
                path = relative,
                real = %real.display(),
                "Rejected workspace path: resolves outside workspace through a link"
            );
            return Err(SecurityError::OutsideWorkspace(relative.to_string()).into());
        }

        Ok(ResolvedPath {
            root,
            path: resolved,
        })
    }
}

fn validate_user_id(user_id: &str) -> Result<(), SecurityError> {
    let invalid = user_id.is_empty()
        || user_id == "."
        || user_id == ".."
        || user_id.contains(&['/', '\\', '\0'][..]);
    if invalid {
        tracing::warn!(user_id, "Rejected workspace user id");
        return Err(SecurityError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

/// Lexically join `relative` onto `root`, refusing to leave it.
pub fn confine(root: &Path, relative: &str) -> Result<PathBuf, SecurityError> {
    if relative.contains('\0') {
        return Err(SecurityError::NulByte);
    }

    let requested = Path::new(relative);
    if requested.is_absolute() {
        return Err(SecurityError::AbsolutePath(relative.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for component in requested.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment) => resolved.push(segment),
            Component::ParentDir => {
                if resolved == root || !resolved.pop() {
                    return Err(SecurityError::OutsideWorkspace(relative.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SecurityError::AbsolutePath(relative.to_string()));
            }
        }
    }

    if !resolved.starts_with(root) {
        return Err(SecurityError::OutsideWorkspace(relative.to_string()));
    }
    Ok(resolved)
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// not-yet-existing tail.
async fn canonical_ancestor(path: &Path) -> io::Result<PathBuf> {
    const MAX_DANGLING_LINKS: usize = 40;

    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    let mut links_followed = 0;
    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(mut real) => {
                for segment in tail.iter().rev() {
                    real.push(segment);
                }
                return Ok(real);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink would be followed by a later create, so
                // judge it by where it points.
                if let Ok(meta) = tokio::fs::symlink_metadata(&existing).await {
                    if meta.file_type().is_symlink() {
                        if links_followed >= MAX_DANGLING_LINKS {
                            return Err(e);
                        }
                        let target = tokio::fs::read_link(&existing).await?;
                        links_followed += 1;
                        existing = match existing.parent() {
                            Some(parent) if target.is_relative() => parent.join(target),
                            _ => target,
                        };
                        continue;
                    }
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(e);
                };
                tail.push(name);
                if !existing.pop() {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Render an in-workspace path relative to its root, `.` for the root itself.
pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string_lossy().to_string(),
    }
}
