//! Backend selection.
//!
//! Given a weights file, the registry sniffs its leading bytes and hands the
//! file to the first backend that claims it. Fallback backends (generic or
//! slower implementations) are only consulted when no dedicated backend
//! recognizes the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info};

use super::ModelRuntime;
use crate::config::SessionParams;
use crate::engine::Session;
use crate::error::{Error, Result};

/// Number of leading bytes handed to [`Backend::recognizes`].
pub const MAGIC_LEN: usize = 8;

/// A family of model runtimes.
pub trait Backend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Whether this backend can load a file starting with `magic`.
    ///
    /// `magic` may be shorter than [`MAGIC_LEN`] for tiny files.
    fn recognizes(&self, magic: &[u8]) -> bool;

    /// Fallback backends are tried after all dedicated ones.
    fn is_fallback(&self) -> bool {
        false
    }

    /// Load weights and create a runtime context.
    fn load(&self, weights_path: &Path, params: &SessionParams) -> Result<Box<dyn ModelRuntime>>;
}

/// Ordered collection of backends.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Registration order is the lookup order within
    /// the dedicated and fallback groups.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_backend(mut self, backend: impl Backend + 'static) -> Self {
        self.register(Box::new(backend));
        self
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Find the backend responsible for a weights file.
    pub fn select(&self, weights_path: &Path) -> Result<&dyn Backend> {
        let magic = read_magic(weights_path)?;

        let dedicated = self.backends.iter().filter(|b| !b.is_fallback());
        let fallback = self.backends.iter().filter(|b| b.is_fallback());

        dedicated
            .chain(fallback)
            .find(|b| b.recognizes(&magic))
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::NoBackend(weights_path.to_path_buf()))
    }

    /// Load `weights_path` with the matching backend and wrap it in a session.
    pub fn construct(
        &self,
        weights_path: impl AsRef<Path>,
        params: SessionParams,
    ) -> Result<Session> {
        let weights_path = weights_path.as_ref();
        let params = params.resolved();
        params.validate()?;

        let backend = self.select(weights_path)?;
        info!(backend = backend.name(), path = %weights_path.display(), "loading model");

        let runtime = backend.load(weights_path, &params)?;
        Session::new(runtime, params)
    }
}

/// Read up to [`MAGIC_LEN`] leading bytes of a file.
fn read_magic(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| {
        Error::ModelLoad(format!("failed to open {}: {e}", path.display()))
    })?;

    let mut magic = Vec::with_capacity(MAGIC_LEN);
    file.take(MAGIC_LEN as u64).read_to_end(&mut magic)?;
    debug!(path = %path.display(), magic = ?magic, "read weights magic");
    Ok(magic)
}
