//! Read-only filesystem abstraction shared by migrations, mail templates, locales and
//! the SPA tree. Assets compiled into the binary and a rooted local directory look the
//! same to callers.

use crate::error::{Error, Result};
use include_dir::{Dir, DirEntry};
use std::{
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

pub trait FileSource: Send + Sync + fmt::Debug {
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    fn exists(&self, path: &str) -> bool;

    /// File names (not paths) directly inside `dir`, sorted.
    fn list_dir(&self, dir: &str) -> Result<Vec<String>>;

    fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes)
            .map_err(|err| Error::validation(format!("{path} is not valid UTF-8: {err}")))
    }
}

pub type SharedFs = Arc<dyn FileSource>;

/// Files embedded with `include_dir!`.
#[derive(Clone, Copy)]
pub struct EmbeddedFs {
    dir: &'static Dir<'static>,
}

impl EmbeddedFs {
    #[must_use]
    pub const fn new(dir: &'static Dir<'static>) -> Self {
        Self { dir }
    }
}

impl fmt::Debug for EmbeddedFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedFs")
            .field("root", &self.dir.path())
            .finish()
    }
}

impl FileSource for EmbeddedFs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = clean(path)?;
        self.dir
            .get_file(&path)
            .map(|file| file.contents().to_vec())
            .ok_or_else(|| Error::not_found(format!("file {}", path.display())))
    }

    fn exists(&self, path: &str) -> bool {
        clean(path).is_ok_and(|path| self.dir.get_entry(&path).is_some())
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let path = clean(dir)?;
        let entries = if path.as_os_str().is_empty() {
            self.dir.entries()
        } else {
            self.dir
                .get_dir(&path)
                .ok_or_else(|| Error::not_found(format!("directory {}", path.display())))?
                .entries()
        };

        let mut names: Vec<String> = entries
            .iter()
            .filter_map(|entry| {
                let path = match entry {
                    DirEntry::Dir(dir) => dir.path(),
                    DirEntry::File(file) => file.path(),
                };
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

/// A directory on disk. Paths are resolved relative to the root; escaping it fails.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(clean(path)?))
    }
}

impl FileSource for LocalFs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("file {path}")),
            _ => Error::Io(err),
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|full| full.exists())
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let full = self.resolve(dir)?;
        let entries = std::fs::read_dir(&full).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("directory {dir}")),
            _ => Error::Io(err),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// A subdirectory of another source, seen as its own root.
#[derive(Debug, Clone)]
pub struct SubFs {
    inner: SharedFs,
    prefix: PathBuf,
}

impl SubFs {
    /// # Errors
    /// Fails when `prefix` tries to leave the parent root.
    pub fn new(inner: SharedFs, prefix: &str) -> Result<Self> {
        Ok(Self {
            inner,
            prefix: clean(prefix)?,
        })
    }

    fn join(&self, path: &str) -> Result<String> {
        Ok(self.prefix.join(clean(path)?).to_string_lossy().into_owned())
    }
}

impl FileSource for SubFs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(&self.join(path)?)
    }

    fn exists(&self, path: &str) -> bool {
        self.join(path).is_ok_and(|full| self.inner.exists(&full))
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        self.inner.list_dir(&self.join(dir)?)
    }
}

/// Normalise a relative path and reject anything that could leave the root.
fn clean(path: &str) -> Result<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!("invalid path: {path}")));
            }
        }
    }
    Ok(cleaned)
}
