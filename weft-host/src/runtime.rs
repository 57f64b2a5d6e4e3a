//! Guest runtime management using Wasmtime.
//!
//! Provides engine configuration, module compilation, and caching so
//! one compiled guest can back many instances across middlewares.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use wasmtime::{Config, Engine, Module};

use weft_core::{Result, WeftError};

/// Default maximum memory pages per instance (64 KiB per page).
const DEFAULT_MAX_MEMORY_PAGES: u32 = 1024; // 64 MiB

/// Interval between watchdog epoch ticks.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Configuration for the guest runtime.
#[derive(Debug, Clone)]
pub struct GuestRuntimeConfig {
    /// Maximum memory pages an instance may grow to (64 KiB per page).
    pub max_memory_pages: u32,
    /// Watchdog deadline for a single guest invocation. `None` disables
    /// epoch interruption entirely.
    pub invocation_timeout: Option<Duration>,
    /// Whether to cache compiled modules by content hash.
    pub cache_modules: bool,
    /// Enable debug info in compiled modules.
    pub debug_info: bool,
}

impl Default for GuestRuntimeConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            invocation_timeout: Some(Duration::from_secs(10)),
            cache_modules: true,
            debug_info: false,
        }
    }
}

impl GuestRuntimeConfig {
    /// Configuration for production use.
    pub fn production() -> Self {
        Self::default()
    }

    /// Configuration for testing with tighter limits.
    pub fn testing() -> Self {
        Self {
            max_memory_pages: 256, // 16 MiB
            invocation_timeout: Some(Duration::from_secs(2)),
            cache_modules: false,
            debug_info: true,
        }
    }

    /// Set the maximum memory pages.
    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    /// Set or disable the invocation watchdog.
    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Enable or disable module caching.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_modules = enabled;
        self
    }

    /// Maximum instance memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * 64 * 1024
    }

    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();
        config.epoch_interruption(self.invocation_timeout.is_some());
        config.debug_info(self.debug_info);
        config.strategy(wasmtime::Strategy::Cranelift);
        config
    }
}

/// A compiled guest module ready for instantiation.
pub struct CompiledGuest {
    module: Module,
    hash: u64,
}

impl CompiledGuest {
    /// The underlying Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Content hash of the guest binary.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Guest runtime owning the Wasmtime engine and compiled-module cache.
///
/// When an invocation timeout is configured, a background watchdog
/// thread increments the engine epoch; stores arm a deadline before
/// each guest entry so a runaway invocation traps instead of wedging
/// the worker.
pub struct GuestRuntime {
    engine: Engine,
    config: GuestRuntimeConfig,
    module_cache: DashMap<u64, Arc<CompiledGuest>>,
    watchdog: Option<EpochWatchdog>,
}

impl GuestRuntime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: GuestRuntimeConfig) -> Result<Self> {
        let engine =
            Engine::new(&config.to_wasmtime_config()).map_err(|e| WeftError::ModuleCompile {
                name: "engine".to_string(),
                cause: e.to_string(),
            })?;

        let watchdog = config
            .invocation_timeout
            .map(|_| EpochWatchdog::start(engine.clone()));

        Ok(Self {
            engine,
            config,
            module_cache: DashMap::new(),
            watchdog,
        })
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(GuestRuntimeConfig::default())
    }

    /// The Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The runtime configuration.
    pub fn config(&self) -> &GuestRuntimeConfig {
        &self.config
    }

    /// Number of watchdog ticks granted to one guest invocation, when a
    /// timeout is configured.
    pub fn deadline_ticks(&self) -> Option<u64> {
        self.config.invocation_timeout.map(|timeout| {
            let ticks = timeout.as_nanos() / EPOCH_TICK.as_nanos();
            (ticks as u64).max(1)
        })
    }

    /// Compile guest bytes into a module, hitting the cache when
    /// enabled and the same bytes were compiled before.
    pub fn compile(&self, name: &str, wasm_bytes: &[u8]) -> Result<Arc<CompiledGuest>> {
        let hash = hash_bytes(wasm_bytes);

        if self.config.cache_modules {
            if let Some(cached) = self.module_cache.get(&hash) {
                debug!(guest = name, "compiled-module cache hit");
                return Ok(Arc::clone(&cached));
            }
        }

        let module =
            Module::new(&self.engine, wasm_bytes).map_err(|e| WeftError::ModuleCompile {
                name: name.to_string(),
                cause: e.to_string(),
            })?;

        let compiled = Arc::new(CompiledGuest { module, hash });
        if self.config.cache_modules {
            self.module_cache.insert(hash, Arc::clone(&compiled));
        }
        Ok(compiled)
    }

    /// Compile a guest from a file on disk.
    pub fn compile_file(&self, path: &std::path::Path) -> Result<Arc<CompiledGuest>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");

        let wasm_bytes = std::fs::read(path).map_err(|e| WeftError::ModuleRead {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

        self.compile(name, &wasm_bytes)
    }

    /// Validate guest bytes without caching the result.
    pub fn validate(&self, wasm_bytes: &[u8]) -> Result<()> {
        Module::validate(&self.engine, wasm_bytes).map_err(|e| WeftError::ModuleCompile {
            name: "validation".to_string(),
            cause: e.to_string(),
        })
    }

    /// Number of cached modules.
    pub fn cache_size(&self) -> usize {
        self.module_cache.len()
    }

    /// Clear the module cache.
    pub fn clear_cache(&self) {
        self.module_cache.clear();
    }
}

impl Drop for GuestRuntime {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

/// Background thread incrementing the engine epoch at a fixed period.
struct EpochWatchdog {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochWatchdog {
    fn start(engine: Engine) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("weft-epoch-watchdog".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .ok();

        Self {
            shutdown,
            handle,
        }
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Content hash used as the module-cache key. Not cryptographic.
fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
