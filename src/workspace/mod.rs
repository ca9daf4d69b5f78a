//! Per-execution scratch directories.
//!
//! A [`TempWorkspace`] owns one uniquely-named directory under a base
//! directory. The source file of an execution is written into it and the
//! whole directory is removed on [`TempWorkspace::cleanup`], or on drop if
//! the owner returns early or panics.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

/// Prefix of every workspace directory name.
pub const WORKSPACE_PREFIX: &str = "sandbox-";

/// A scratch directory holding the submitted source file.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    /// Creates `base_dir` if needed, then a fresh uniquely-named directory
    /// inside it.
    ///
    /// The returned path is absolute so it can be bind-mounted as is.
    pub fn create(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref();
        let base_dir = if base_dir.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            fs::create_dir_all(base_dir)?;
            fs::canonicalize(base_dir)?
        };

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&base_dir)?;

        // Containers often run as a non-root user; they need to traverse it.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
        }

        debug!(path = %dir.path().display(), "Created workspace");
        Ok(Self { dir })
    }

    /// Absolute path of the workspace directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `content` to `name` inside the workspace and returns the
    /// absolute file path.
    ///
    /// `name` must be a plain file name; separators and `..` are rejected.
    pub fn write_file(&self, name: &str, content: &[u8], mode: u32) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid workspace file name '{name}'"),
            ));
        }

        let path = self.dir.path().join(name);
        fs::write(&path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(path)
    }

    /// Recursively removes the workspace directory.
    pub fn cleanup(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(path = %path.display(), "Removed workspace");
        Ok(())
    }
}
