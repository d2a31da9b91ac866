//! Native library discovery and memoized loading.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::panic_message;

/// Errors from loading an engine's native dependency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LibraryLoadError {
    #[error("Library {file_name} not found in {searched:?}")]
    NotFound {
        file_name: String,
        searched: Vec<PathBuf>,
    },

    #[error("Library {path} is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Library {name} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Loading {name} panicked: {reason}")]
    Panicked { name: String, reason: String },
}

/// A native dependency an engine needs before it can create sessions.
pub trait NativeLibrary: Send + Sync {
    fn name(&self) -> &str;

    /// Loads the library into the process.
    ///
    /// # Errors
    ///
    /// - `LibraryLoadError` - If the library is absent or cannot be loaded
    fn load(&self) -> Result<(), LibraryLoadError>;
}

/// Locates `{DLL_PREFIX}{name}{DLL_SUFFIX}` in a list of directories.
#[derive(Debug, Clone)]
pub struct LibraryProbe {
    name: String,
    search_dirs: Vec<PathBuf>,
}

impl LibraryProbe {
    pub fn new(name: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            search_dirs,
        }
    }

    /// Platform file name, e.g. `libtorrent4j.so` on Linux.
    pub fn file_name(&self) -> String {
        format!("{DLL_PREFIX}{}{DLL_SUFFIX}", self.name)
    }

    /// First matching file in search order.
    ///
    /// # Errors
    ///
    /// - `LibraryLoadError::NotFound` - If no search directory contains the file
    pub fn locate(&self) -> Result<PathBuf, LibraryLoadError> {
        let file_name = self.file_name();

        self.search_dirs
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| LibraryLoadError::NotFound {
                file_name,
                searched: self.search_dirs.clone(),
            })
    }
}

impl NativeLibrary for LibraryProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<(), LibraryLoadError> {
        let path = self.locate()?;

        std::fs::File::open(&path).map_err(|e| LibraryLoadError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Found native library {}", path.display());
        Ok(())
    }
}

/// Library whose availability is fixed up front, for in-process backends.
#[derive(Debug, Clone)]
pub struct StaticLibrary {
    name: String,
    unavailable_reason: Option<String>,
}

impl StaticLibrary {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unavailable_reason: None,
        }
    }

    pub fn unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unavailable_reason: Some(reason.into()),
        }
    }
}

impl NativeLibrary for StaticLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<(), LibraryLoadError> {
        match &self.unavailable_reason {
            None => Ok(()),
            Some(reason) => Err(LibraryLoadError::Unavailable {
                name: self.name.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Attempts a library load at most once and remembers the outcome.
///
/// A failed load is cached too; support checks after a failure never
/// retry. A panic inside the load is contained and counts as a failure.
pub struct LibraryLoader {
    library: Arc<dyn NativeLibrary>,
    outcome: OnceLock<Result<(), LibraryLoadError>>,
}

impl LibraryLoader {
    pub fn new(library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            library,
            outcome: OnceLock::new(),
        }
    }

    /// Loads on first call; later calls return the memoized outcome.
    ///
    /// # Errors
    ///
    /// - `LibraryLoadError` - The first load's failure, on every call
    pub fn ensure_loaded(&self) -> Result<(), LibraryLoadError> {
        self.outcome.get_or_init(|| self.attempt_load()).clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.ensure_loaded().is_ok()
    }

    pub fn library_name(&self) -> &str {
        self.library.name()
    }

    fn attempt_load(&self) -> Result<(), LibraryLoadError> {
        let name = self.library.name().to_string();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.library.load()))
            .unwrap_or_else(|payload| {
                Err(LibraryLoadError::Panicked {
                    name: name.clone(),
                    reason: panic_message(payload.as_ref()),
                })
            });

        match &result {
            Ok(()) => tracing::info!("Loaded native library {}", name),
            Err(e) => tracing::warn!("Native library {} unavailable: {}", name, e),
        }
        result
    }
}
