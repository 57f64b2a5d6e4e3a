//! The middleware factory and per-request lifecycle driver.
//!
//! [`WasmMiddleware::new`] is the compose-in factory: it compiles the
//! guest, negotiates the feature mask by running guest initialization,
//! and returns a handler. [`WasmMiddleware::handle`] then drives each
//! request through the guest:
//!
//! 1. pre-read the request body when `BUFFER_REQUEST` is negotiated;
//! 2. invoke `handle_request` on a checked-out instance;
//! 3. either assemble the guest-populated direct response, or forward
//!    the (possibly rewritten) request to the downstream handler;
//! 4. capture the downstream response when `BUFFER_RESPONSE` is in the
//!    effective mask and invoke `handle_response`;
//! 5. release the buffered response: body, then trailers, then end.
//!
//! Guest invocations are synchronous and run on blocking tasks; the
//! downstream handler is awaited in between, which is why the request
//! state travels in and out of the instance around each entry point.

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, error, info, warn};

use std::sync::Arc;

use weft_core::abi::split_ctx_next;
use weft_core::{Features, Result, WeftError};

use crate::body::{empty, full, HttpBody, HttpRequest, HttpResponse, Next};
use crate::buffer::{self, BufferedBody};
use crate::config::MiddlewareConfig;
use crate::instance::{GuestInstance, InstanceFactory};
use crate::pool::InstancePool;
use crate::runtime::GuestRuntime;
use crate::state::{RequestState, SharedState};

/// A WebAssembly guest exposed as HTTP middleware.
///
/// One `WasmMiddleware` owns one compiled guest, its negotiated feature
/// mask, and a pool of instances; it is cheap to share behind an `Arc`
/// and safe to call from many connections concurrently.
pub struct WasmMiddleware {
    shared: Arc<SharedState>,
    pool: InstancePool,
}

impl WasmMiddleware {
    /// Build middleware from a guest binary.
    ///
    /// Compilation failures, missing exports, and guest init traps all
    /// surface here — a broken guest never produces a handler.
    pub async fn new(config: MiddlewareConfig) -> Result<Self> {
        let runtime = Arc::new(GuestRuntime::new(config.runtime.clone())?);
        let guest = runtime.compile(&config.name, &config.wasm_bytes)?;
        let shared = Arc::new(SharedState::new(config.name.clone(), config.guest_config));
        let factory = Arc::new(InstanceFactory::new(
            runtime,
            guest,
            Arc::clone(&shared),
            config.wasi,
        ));

        let pool = InstancePool::new(factory, config.pool);
        // Running init eagerly both surfaces setup errors and fixes the
        // middleware-wide feature mask before the first request.
        pool.warm_up().await?;

        info!(
            guest = %shared.name(),
            features = %shared.features(),
            "wasm middleware ready"
        );

        Ok(Self { shared, pool })
    }

    /// The guest's registered name.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// The feature mask negotiated during guest initialization.
    pub fn features(&self) -> Features {
        self.shared.features()
    }

    /// Drive one request through the guest and (optionally) the
    /// downstream handler.
    pub async fn handle(&self, req: HttpRequest, next: Next) -> Result<HttpResponse> {
        let features = self.shared.features();
        let (parts, body) = req.into_parts();

        // Pre-read: materialize the request body (and any trailers the
        // stream carried) before entering the guest, which must never
        // suspend inside a host function.
        let (state, passthrough_body) = if features.contains(Features::BUFFER_REQUEST) {
            let collected = body.collect().await.map_err(|e| WeftError::BodyRead {
                direction: "request",
                cause: e.to_string(),
            })?;
            let trailers = collected.trailers().cloned().unwrap_or_default();
            let bytes = collected.to_bytes();
            let state = RequestState::new(&parts, features, Some((bytes, trailers)));
            (state, None)
        } else {
            (RequestState::new(&parts, features, None), Some(body))
        };

        let instance = self.pool.acquire().await?;
        let (instance, result) = invoke_handle_request(instance, state).await;
        let (mut state, ctx_next) = match result {
            Ok(value) => value,
            Err(err) => {
                self.release(instance).await;
                return Err(err);
            }
        };
        let instance = instance.expect("invoke_handle_request returns Some(instance) on Ok");
        let (ctx, proceed) = split_ctx_next(ctx_next);

        if !proceed {
            // The guest populated the response; the chain ends here.
            debug!(guest = %self.shared.name(), status = %state.response_status, "direct response");
            self.release(Some(instance)).await;
            return Ok(assemble_response(state));
        }

        let downstream_req = match rebuild_request(parts, &mut state, passthrough_body) {
            Ok(req) => req,
            Err(err) => {
                self.release(Some(instance)).await;
                return Err(err);
            }
        };

        let next_result = next(downstream_req).await;
        state.next_called = true;

        match next_result {
            Err(cause) => {
                // The guest is still told about the failed exchange, but
                // whatever it writes is discarded in favor of surfacing
                // the downstream error.
                state.begin_response_phase(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    None,
                );
                let (instance, callback) =
                    invoke_handle_response(instance, state, ctx, true).await;
                self.release(instance).await;
                if let Err(err) = callback {
                    warn!(
                        guest = %self.shared.name(),
                        error = %err,
                        "handle_response failed after downstream error"
                    );
                }
                Err(WeftError::Downstream {
                    cause: cause.to_string(),
                })
            }
            Ok(response) => {
                // The effective mask may have been raised during
                // handle_request; the capture decision honors it.
                if state.features.contains(Features::BUFFER_RESPONSE) {
                    let captured = match buffer::capture(response).await {
                        Ok(captured) => captured,
                        Err(err) => {
                            self.release(Some(instance)).await;
                            return Err(err);
                        }
                    };
                    state.begin_response_phase(
                        captured.status,
                        captured.headers,
                        Some((captured.body, captured.trailers)),
                    );
                    let (instance, result) =
                        invoke_handle_response(instance, state, ctx, false).await;
                    self.release(instance).await;
                    Ok(assemble_response(result?))
                } else {
                    // Unbuffered: the guest may touch status and headers,
                    // the body streams through untouched.
                    let (resp_parts, resp_body) = response.into_parts();
                    state.begin_response_phase(resp_parts.status, resp_parts.headers, None);
                    let (instance, result) =
                        invoke_handle_response(instance, state, ctx, false).await;
                    self.release(instance).await;
                    let state = result?;

                    let mut response = http::Response::new(resp_body);
                    *response.status_mut() = state.response_status;
                    *response.headers_mut() = state.response_headers;
                    *response.version_mut() = resp_parts.version;
                    Ok(response)
                }
            }
        }
    }

    /// Like [`handle`](Self::handle), but maps failures to an empty
    /// 500-class response instead of an error.
    pub async fn serve(&self, req: HttpRequest, next: Next) -> HttpResponse {
        match self.handle(req, next).await {
            Ok(response) => response,
            Err(err) => {
                error!(guest = %self.shared.name(), error = %err, "request failed");
                let mut response = http::Response::new(empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    async fn release(&self, instance: Option<GuestInstance>) {
        if let Some(instance) = instance {
            self.pool.release(instance).await;
        }
    }
}

/// Run `handle_request` on a blocking task, threading the instance and
/// state through.
async fn invoke_handle_request(
    mut instance: GuestInstance,
    state: RequestState,
) -> (Option<GuestInstance>, Result<(RequestState, u64)>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = instance.call_handle_request(state);
        (instance, result)
    })
    .await;
    match joined {
        Ok((instance, result)) => (Some(instance), result),
        Err(join_err) => (
            None,
            Err(WeftError::GuestTrap {
                entry: "handle_request",
                cause: format!("invocation task failed: {join_err}"),
            }),
        ),
    }
}

/// Run `handle_response` on a blocking task.
async fn invoke_handle_response(
    mut instance: GuestInstance,
    state: RequestState,
    ctx: u32,
    is_error: bool,
) -> (Option<GuestInstance>, Result<RequestState>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = instance.call_handle_response(state, ctx, is_error);
        (instance, result)
    })
    .await;
    match joined {
        Ok((instance, result)) => (Some(instance), result),
        Err(join_err) => (
            None,
            Err(WeftError::GuestTrap {
                entry: "handle_response",
                cause: format!("invocation task failed: {join_err}"),
            }),
        ),
    }
}

/// Reassemble the downstream request after `handle_request`: rewritten
/// URI, mutated headers, and the replacement body if the guest wrote
/// one.
fn rebuild_request(
    mut parts: http::request::Parts,
    state: &mut RequestState,
    passthrough_body: Option<HttpBody>,
) -> Result<HttpRequest> {
    let target = if state.uri.is_empty() {
        "/"
    } else {
        state.uri.as_str()
    };
    let path_and_query: http::uri::PathAndQuery =
        target.parse().map_err(|e: http::uri::InvalidUri| {
            WeftError::InvalidUri {
                uri: state.uri.clone(),
                cause: e.to_string(),
            }
        })?;
    let mut uri_parts = parts.uri.into_parts();
    uri_parts.path_and_query = Some(path_and_query);
    parts.uri = http::Uri::from_parts(uri_parts).map_err(|e| WeftError::InvalidUri {
        uri: state.uri.clone(),
        cause: e.to_string(),
    })?;

    // Headers stay readable from the guest in the response phase, so
    // they are cloned rather than taken.
    parts.headers = state.request_headers.clone();

    let body = match state.request_body.take_final() {
        Some(bytes) => full(bytes),
        None => passthrough_body.unwrap_or_else(empty),
    };

    Ok(http::Request::from_parts(parts, body))
}

/// Build the response released to the client from guest-visible state.
/// Used for both direct responses and rewritten buffered responses.
fn assemble_response(mut state: RequestState) -> HttpResponse {
    let body = state.response_body.take_final().unwrap_or_default();
    let trailers = std::mem::take(&mut state.response_trailers);
    let mut headers = std::mem::take(&mut state.response_headers);

    if trailers.is_empty() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    } else {
        // Trailers require stream framing; a stale length would cut
        // them off.
        headers.remove(CONTENT_LENGTH);
    }

    let mut response = http::Response::new(BufferedBody::new(body, trailers).into_http_body());
    *response.status_mut() = state.response_status;
    *response.headers_mut() = headers;
    response
}
