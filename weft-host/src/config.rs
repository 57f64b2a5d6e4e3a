//! Middleware configuration.

use std::path::Path;

use weft_core::{Result, WeftError};

use crate::instance::WasiOptions;
use crate::pool::PoolConfig;
use crate::runtime::GuestRuntimeConfig;

/// Configuration for one middleware factory call.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Name the guest is registered under, used in logs and errors.
    pub name: String,
    /// The compiled guest binary.
    pub wasm_bytes: Vec<u8>,
    /// Opaque blob surfaced verbatim to the guest via `get_config`.
    pub guest_config: Vec<u8>,
    /// Runtime configuration (memory limit, watchdog, module cache).
    pub runtime: GuestRuntimeConfig,
    /// WASI stdio/env wiring, passed through to the guest.
    pub wasi: WasiOptions,
    /// Instance pool sizing.
    pub pool: PoolConfig,
}

impl MiddlewareConfig {
    /// Configuration for a guest supplied as bytes.
    pub fn new(name: impl Into<String>, wasm_bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            wasm_bytes,
            guest_config: Vec::new(),
            runtime: GuestRuntimeConfig::default(),
            wasi: WasiOptions::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Configuration for a guest on disk, named after the file stem.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("guest")
            .to_owned();
        let wasm_bytes = std::fs::read(path).map_err(|e| WeftError::ModuleRead {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        Ok(Self::new(name, wasm_bytes))
    }

    /// Set the opaque config blob surfaced to `get_config`.
    pub fn with_guest_config(mut self, config: impl Into<Vec<u8>>) -> Self {
        self.guest_config = config.into();
        self
    }

    /// Override the runtime configuration.
    pub fn with_runtime(mut self, runtime: GuestRuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Override the WASI wiring.
    pub fn with_wasi(mut self, wasi: WasiOptions) -> Self {
        self.wasi = wasi;
        self
    }

    /// Override the pool sizing.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = MiddlewareConfig::new("redact", vec![0, 1, 2])
            .with_guest_config(b"open sesame".to_vec())
            .with_pool(PoolConfig::default().with_max_idle(2));

        assert_eq!(config.name, "redact");
        assert_eq!(config.guest_config, b"open sesame");
        assert_eq!(config.pool.max_idle, 2);
    }

    #[test]
    fn from_file_missing_is_module_read_error() {
        let err = MiddlewareConfig::from_file("/definitely/not/here.wasm").unwrap_err();
        assert!(matches!(err, WeftError::ModuleRead { .. }));
    }
}
