//! weft host — embed WebAssembly HTTP handlers as middleware.
//!
//! This crate is the host side of a narrow binary ABI between an HTTP
//! server and a WebAssembly guest that observes and/or rewrites
//! requests and responses. It loads and instantiates the guest, exposes
//! the `http_handler` import set, drives the guest across the request
//! lifecycle, and buffers bodies when the guest negotiates it.
//!
//! # Architecture
//!
//! - **GuestRuntime**: Wasmtime engine, compiled-module cache, watchdog
//! - **InstanceFactory / InstancePool**: instantiation, init, checkout
//! - **HostState / RequestState**: store-scoped per-request state
//! - **host functions**: the `http_handler` import set
//! - **ResponseBuffer**: capture and release of downstream responses
//! - **WasmMiddleware**: the compose-in factory and lifecycle driver
//!
//! # Guest ABI contract
//!
//! Guests must export:
//!
//! ```text
//! memory: Memory                        // linear memory, >= 1 page
//! handle_request() -> i64               // (ctx << 32) | proceed-bit
//! handle_response(ctx: i32, is_error: i32)
//! _start / _initialize                  // optional one-shot init
//! ```
//!
//! Guests may import from the `http_handler` module:
//!
//! ```text
//! enable_features(want) -> enabled
//! get_config(buf, buf_limit) -> len
//! get_method(buf, buf_limit) -> len
//! get_uri(buf, buf_limit) -> len
//! set_uri(buf, len)
//! get_protocol_version(buf, buf_limit) -> len
//! get_status_code() -> status
//! set_status_code(status)
//! get_header_names(kind, buf, buf_limit) -> (count << 32) | byte_count
//! get_header_values(kind, name, name_len, buf, buf_limit) -> (count << 32) | byte_count
//! set_header_value(kind, name, name_len, value, value_len)
//! read_body(kind, buf, buf_len) -> (eof << 32) | n
//! write_body(kind, buf, buf_len)
//! log(level, buf, buf_len)
//! log_enabled(level) -> 0|1
//! ```
//!
//! # Example
//!
//! ```ignore
//! use weft_host::{full, MiddlewareConfig, WasmMiddleware};
//!
//! let config = MiddlewareConfig::from_file("auth.wasm")?
//!     .with_guest_config(b"realm=test".to_vec());
//! let middleware = WasmMiddleware::new(config).await?;
//!
//! let response = middleware
//!     .handle(request, Box::new(|req| Box::pin(my_handler(req))))
//!     .await?;
//! ```

#![warn(missing_docs)]

pub mod body;
pub mod buffer;
pub mod config;
pub mod host;
pub mod instance;
pub mod memory;
pub mod middleware;
pub mod pool;
pub mod runtime;
pub mod state;

pub use body::{boxed, empty, full, BoxError, HttpBody, HttpRequest, HttpResponse, Next};
pub use buffer::{BufferedBody, CapturedResponse};
pub use config::MiddlewareConfig;
pub use instance::{InstanceFactory, WasiOptions};
pub use middleware::WasmMiddleware;
pub use pool::{InstancePool, PoolConfig};
pub use runtime::{CompiledGuest, GuestRuntime, GuestRuntimeConfig};
pub use state::{Phase, SharedState};

// Re-export the core types callers interact with.
pub use weft_core::{Features, ProtocolViolation, Result, WeftError};
