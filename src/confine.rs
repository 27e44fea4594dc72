//! Root confinement for the server's virtual filesystem
//!
//! Every path a client names is resolved here first. A resolved path is only
//! handed back when it lies under the canonical root, so handlers never touch
//! anything outside it.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{FtpError, Result};

/// The canonical confinement root.
#[derive(Clone, Debug)]
pub struct Confinement {
    root: PathBuf,
}

/// Reject anything that is not a single plain file or directory name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') {
        return Err(FtpError::InvalidName("Cannot contain path separators"));
    }
    if name.is_empty() {
        return Err(FtpError::InvalidName("Cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(FtpError::InvalidName("Cannot be a directory reference"));
    }
    if name.contains('\0') {
        return Err(FtpError::InvalidName("Cannot contain NUL bytes"));
    }
    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem. `..` at the top of
/// an absolute path stays there.
fn lexical_normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl Confinement {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FtpError::NotFound("Root directory"),
            _ => FtpError::Io(e),
        })?;
        if !root.is_dir() {
            return Err(FtpError::NotADirectory);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, p: &Path) -> bool {
        p.starts_with(&self.root)
    }

    /// Resolve a CD target.
    ///
    /// Empty or `/` is the root, a leading `/` is root-relative, anything else
    /// is relative to `current`. The result is canonical, existing, a
    /// directory, and under the root.
    pub fn resolve_dir(&self, current: &Path, request: &str) -> Result<PathBuf> {
        if request.contains('\0') {
            return Err(FtpError::NotFound("Path"));
        }
        let joined = if request.is_empty() {
            self.root.clone()
        } else if request.starts_with('/') {
            // Any run of leading slashes means the root; joining an absolute
            // remainder would replace it
            self.root.join(request.trim_start_matches('/'))
        } else {
            current.join(request)
        };

        match joined.canonicalize() {
            Ok(canon) => {
                if !self.contains(&canon) {
                    return Err(FtpError::AccessDenied);
                }
                if !canon.is_dir() {
                    return Err(FtpError::NotADirectory);
                }
                Ok(canon)
            }
            Err(e) => {
                if !self.contains(&lexical_normalize(&joined)) {
                    return Err(FtpError::AccessDenied);
                }
                match e.kind() {
                    io::ErrorKind::NotFound => Err(FtpError::NotFound("Path")),
                    // A regular file used as an intermediate component
                    io::ErrorKind::NotADirectory => Err(FtpError::NotADirectory),
                    _ => Err(FtpError::Io(e)),
                }
            }
        }
    }

    /// Path of the entry `name` directly inside `current`. The entry itself is
    /// not followed, so callers that open it must call `ensure_within` too.
    pub fn entry(&self, current: &Path, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        if !self.contains(current) {
            return Err(FtpError::AccessDenied);
        }
        Ok(current.join(name))
    }

    /// Follow symlinks on `path` and require the target to stay under the root.
    ///
    /// A missing path is fine as long as its parent is confined (it is about
    /// to be created). A dangling symlink is refused: opening it for writing
    /// would create its target, wherever that is.
    pub fn ensure_within(&self, path: &Path) -> Result<PathBuf> {
        match std::fs::symlink_metadata(path) {
            Ok(_) => {
                let canon = path.canonicalize().map_err(|_| FtpError::AccessDenied)?;
                if !self.contains(&canon) {
                    return Err(FtpError::AccessDenied);
                }
                Ok(canon)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = path.parent().ok_or(FtpError::AccessDenied)?;
                let canon_parent = parent.canonicalize()?;
                if !self.contains(&canon_parent) {
                    return Err(FtpError::AccessDenied);
                }
                match path.file_name() {
                    Some(name) => Ok(canon_parent.join(name)),
                    None => Err(FtpError::AccessDenied),
                }
            }
            Err(e) => Err(FtpError::Io(e)),
        }
    }

    /// Root-relative display form: the root is `/`, children are `/a/b`.
    pub fn display_path(&self, p: &Path) -> String {
        let rel = match p.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) => return "/".to_string(),
        };
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }
}
