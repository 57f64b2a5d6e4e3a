//! Instance pool.
//!
//! Guest instances are single-threaded and not re-entrant, so the pool
//! gives each in-flight request exclusive ownership of one instance for
//! the duration of its guest invocations. `acquire` never queues: it
//! hands out an idle instance or instantiates a fresh one, trading
//! memory for latency under burst load. Poisoned instances are ejected
//! on release and replaced lazily.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use weft_core::{Result, WeftError};

use crate::instance::{GuestInstance, InstanceFactory};

/// Configuration for an instance pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Instances created up front by `warm_up`.
    pub min_instances: u32,
    /// Maximum idle instances retained on release.
    pub max_idle: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_idle: 8,
        }
    }
}

impl PoolConfig {
    /// Set the number of instances created up front.
    pub fn with_min_instances(mut self, min: u32) -> Self {
        self.min_instances = min;
        self
    }

    /// Set the maximum number of idle instances retained.
    pub fn with_max_idle(mut self, max: u32) -> Self {
        self.max_idle = max;
        self
    }
}

/// Pool of identically-configured guest instances for one middleware.
pub struct InstancePool {
    factory: Arc<InstanceFactory>,
    config: PoolConfig,
    idle: Mutex<VecDeque<GuestInstance>>,
}

impl InstancePool {
    /// Create a new pool.
    pub fn new(factory: Arc<InstanceFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Pre-create `min_instances` warm instances.
    ///
    /// Also the point where guest setup errors surface: a guest that
    /// fails to instantiate or traps in init fails the first warm-up.
    pub async fn warm_up(&self) -> Result<()> {
        let needed = {
            let idle = self.idle.lock().await;
            (self.config.min_instances.max(1) as usize).saturating_sub(idle.len())
        };

        for _ in 0..needed {
            let instance = self.create().await?;
            self.idle.lock().await.push_back(instance);
        }

        debug!(
            guest = %self.factory.guest_name(),
            warmed = needed,
            "instance pool warmed"
        );
        Ok(())
    }

    /// Check out an instance, instantiating a fresh one when the pool
    /// is empty.
    pub async fn acquire(&self) -> Result<GuestInstance> {
        if let Some(instance) = self.idle.lock().await.pop_front() {
            return Ok(instance);
        }
        self.create().await
    }

    /// Return an instance after use. Poisoned instances are dropped; the
    /// pool retains at most `max_idle` idle instances.
    pub async fn release(&self, instance: GuestInstance) {
        if instance.poisoned() {
            warn!(
                guest = %self.factory.guest_name(),
                "discarding poisoned guest instance"
            );
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.max_idle as usize {
            idle.push_back(instance);
        }
    }

    /// Current number of idle instances.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn create(&self) -> Result<GuestInstance> {
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || factory.create_instance())
            .await
            .map_err(|e| WeftError::Instantiate {
                name: self.factory.guest_name().to_owned(),
                cause: format!("instantiation task failed: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::WasiOptions;
    use crate::runtime::{GuestRuntime, GuestRuntimeConfig};
    use crate::state::{RequestState, SharedState};
    use weft_core::Features;

    fn pool_for(wat: &str, config: PoolConfig) -> InstancePool {
        let runtime =
            Arc::new(GuestRuntime::new(GuestRuntimeConfig::testing()).expect("runtime"));
        let bytes = wat::parse_str(wat).expect("valid wat");
        let guest = runtime.compile("pool-guest", &bytes).expect("compile");
        let shared = Arc::new(SharedState::new("pool-guest", Vec::new()));
        let factory = Arc::new(InstanceFactory::new(
            runtime,
            guest,
            shared,
            WasiOptions::default().silent(),
        ));
        InstancePool::new(factory, config)
    }

    fn request_state() -> RequestState {
        let (parts, ()) = http::Request::builder()
            .uri("/")
            .body(())
            .unwrap()
            .into_parts();
        RequestState::new(&parts, Features::NONE, None)
    }

    const OK_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "handle_request") (result i64) (i64.const 1))
            (func (export "handle_response") (param i32 i32)))
    "#;

    const TRAP_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "handle_request") (result i64) unreachable)
            (func (export "handle_response") (param i32 i32)))
    "#;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_instances, 1);
        assert_eq!(config.max_idle, 8);
    }

    #[tokio::test]
    async fn warm_up_fills_pool() {
        let pool = pool_for(OK_GUEST, PoolConfig::default().with_min_instances(2));
        pool.warm_up().await.expect("warm up");
        assert_eq!(pool.idle_count().await, 2);
    }

    #[tokio::test]
    async fn acquire_and_release_cycle() {
        let pool = pool_for(OK_GUEST, PoolConfig::default());
        pool.warm_up().await.expect("warm up");

        let instance = pool.acquire().await.expect("acquire");
        assert_eq!(pool.idle_count().await, 0);

        pool.release(instance).await;
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn poisoned_instances_are_ejected() {
        let pool = pool_for(TRAP_GUEST, PoolConfig::default());
        let mut instance = pool.acquire().await.expect("acquire");

        assert!(instance.call_handle_request(request_state()).is_err());
        assert!(instance.poisoned());

        pool.release(instance).await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn release_respects_max_idle() {
        let pool = pool_for(OK_GUEST, PoolConfig::default().with_max_idle(1));

        let a = pool.acquire().await.expect("acquire");
        let b = pool.acquire().await.expect("acquire");
        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn warm_up_surfaces_setup_errors() {
        let pool = pool_for(
            r#"(module (memory (export "memory") 1))"#,
            PoolConfig::default(),
        );
        let err = pool.warm_up().await.unwrap_err();
        assert!(matches!(err, WeftError::MissingExport { .. }));
    }
}
