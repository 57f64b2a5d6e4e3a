//! Host function bindings for the `http_handler` import module.
//!
//! Every function the guest can import lives here. Each callback
//! resolves the in-flight request through the store data (see
//! [`crate::state`]), marshals arguments out of linear memory with the
//! checked helpers in [`crate::memory`], and enforces the ABI's
//! phase/feature/kind preconditions. A violated precondition is
//! returned as an error from the callback, which wasmtime turns into a
//! guest trap; the host never repairs a guest error.

use anyhow::Result;
use http::header::{HeaderName, HeaderValue, SET_COOKIE};
use http::{HeaderMap, StatusCode};
use tracing::Level;
use wasmtime::{Caller, Extern, Linker};

use weft_core::abi::{pack_body, BodyKind, HeaderKind, LogLevel, HTTP_HANDLER_MODULE};
use weft_core::{Features, ProtocolViolation, WeftError};

use crate::memory;
use crate::state::{HostState, Phase, RequestState};

/// Register the complete `http_handler` import set with a linker.
pub fn register_host_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    register_feature_functions(linker)?;
    register_request_functions(linker)?;
    register_header_functions(linker)?;
    register_body_functions(linker)?;
    register_logging_functions(linker)?;
    Ok(())
}

/// Borrow guest memory and host state disjointly from a caller.
fn memory_and_state<'a>(
    caller: &'a mut Caller<'_, HostState>,
) -> Result<(&'a mut [u8], &'a mut HostState)> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("guest does not export linear memory"))?;
    Ok(memory.data_and_store_mut(caller))
}

/// The in-flight request, or a trap when called outside request scope.
fn request<'a>(
    state: &'a mut HostState,
    call: &'static str,
) -> Result<&'a mut RequestState, ProtocolViolation> {
    state
        .request
        .as_mut()
        .ok_or(ProtocolViolation::NoActiveRequest { call })
}

/// Resolve a header kind to its map, enforcing phase and feature rules.
///
/// Request-side collections freeze once the downstream handler has the
/// request; trailer collections require the negotiated `trailers`
/// feature in either direction.
fn header_map<'a>(
    rs: &'a mut RequestState,
    kind: HeaderKind,
    call: &'static str,
    for_write: bool,
) -> Result<&'a mut HeaderMap, ProtocolViolation> {
    if kind.is_trailers() && !rs.features.contains(Features::TRAILERS) {
        return Err(ProtocolViolation::FeatureRequired {
            call,
            feature: "trailers",
        });
    }
    let request_side = matches!(kind, HeaderKind::Request | HeaderKind::RequestTrailers);
    if request_side && for_write && rs.phase == Phase::Response {
        return Err(ProtocolViolation::PhaseViolation {
            call,
            phase: rs.phase.as_str(),
        });
    }
    Ok(match kind {
        HeaderKind::Request => &mut rs.request_headers,
        HeaderKind::RequestTrailers => &mut rs.request_trailers,
        HeaderKind::Response => &mut rs.response_headers,
        HeaderKind::ResponseTrailers => &mut rs.response_trailers,
    })
}

fn decode_header_kind(raw: i32) -> Result<HeaderKind, ProtocolViolation> {
    HeaderKind::from_raw(raw).ok_or(ProtocolViolation::UnknownHeaderKind(raw))
}

fn decode_body_kind(raw: i32) -> Result<BodyKind, ProtocolViolation> {
    BodyKind::from_raw(raw).ok_or(ProtocolViolation::UnknownBodyKind(raw))
}

fn parse_header_name(bytes: &[u8]) -> Result<HeaderName, ProtocolViolation> {
    if bytes.is_empty() {
        return Err(ProtocolViolation::EmptyHeaderName);
    }
    HeaderName::from_bytes(bytes).map_err(|_| ProtocolViolation::InvalidHeaderName {
        name: String::from_utf8_lossy(bytes).into_owned(),
    })
}

fn register<T>(result: std::result::Result<T, wasmtime::Error>, function: &'static str) -> weft_core::Result<()> {
    result
        .map(|_| ())
        .map_err(|e| WeftError::HostFunction {
            function,
            cause: e.to_string(),
        })
}

/// `enable_features` and `get_config` — legal both during guest
/// initialization (middleware scope) and inside a request (request scope).
fn register_feature_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    // enable_features(want: i32) -> i32
    // Union the wanted features into the current scope's mask and return
    // the new mask. Bits the host does not honor are dropped.
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "enable_features",
            |mut caller: Caller<'_, HostState>, want: i32| -> i32 {
                let want = Features::from_bits(want as u32);
                let state = caller.data_mut();
                let mask = match state.request.as_mut() {
                    Some(rs) => {
                        rs.features |= want;
                        rs.features
                    }
                    None => state.shared.raise_features(want),
                };
                mask.bits() as i32
            },
        ),
        "enable_features",
    )?;

    // get_config(buf, buf_limit) -> len
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_config",
            |mut caller: Caller<'_, HostState>, buf: u32, buf_limit: u32| -> Result<u32> {
                let (mem, state) = memory_and_state(&mut caller)?;
                Ok(memory::write_if_fits(
                    mem,
                    buf,
                    buf_limit,
                    state.shared.config(),
                )?)
            },
        ),
        "get_config",
    )?;

    Ok(())
}

/// Method, URI, protocol version, and status code access.
fn register_request_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    // get_method(buf, buf_limit) -> len
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_method",
            |mut caller: Caller<'_, HostState>, buf: u32, buf_limit: u32| -> Result<u32> {
                let (mem, state) = memory_and_state(&mut caller)?;
                let rs = request(state, "get_method")?;
                Ok(memory::write_if_fits(
                    mem,
                    buf,
                    buf_limit,
                    rs.method.as_bytes(),
                )?)
            },
        ),
        "get_method",
    )?;

    // get_uri(buf, buf_limit) -> len
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_uri",
            |mut caller: Caller<'_, HostState>, buf: u32, buf_limit: u32| -> Result<u32> {
                let (mem, state) = memory_and_state(&mut caller)?;
                let rs = request(state, "get_uri")?;
                Ok(memory::write_if_fits(
                    mem,
                    buf,
                    buf_limit,
                    rs.uri.as_bytes(),
                )?)
            },
        ),
        "get_uri",
    )?;

    // set_uri(buf, len)
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "set_uri",
            |mut caller: Caller<'_, HostState>, buf: u32, len: u32| -> Result<()> {
                let (mem, state) = memory_and_state(&mut caller)?;
                let uri = memory::read_string(mem, buf, len, "set_uri")?;
                let rs = request(state, "set_uri")?;
                if rs.phase != Phase::Request {
                    return Err(ProtocolViolation::PhaseViolation {
                        call: "set_uri",
                        phase: rs.phase.as_str(),
                    }
                    .into());
                }
                if !uri.is_empty() && uri.parse::<http::uri::PathAndQuery>().is_err() {
                    return Err(ProtocolViolation::InvalidUri { uri }.into());
                }
                rs.uri = uri;
                Ok(())
            },
        ),
        "set_uri",
    )?;

    // get_protocol_version(buf, buf_limit) -> len
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_protocol_version",
            |mut caller: Caller<'_, HostState>, buf: u32, buf_limit: u32| -> Result<u32> {
                let (mem, state) = memory_and_state(&mut caller)?;
                let rs = request(state, "get_protocol_version")?;
                Ok(memory::write_if_fits(
                    mem,
                    buf,
                    buf_limit,
                    rs.protocol.as_bytes(),
                )?)
            },
        ),
        "get_protocol_version",
    )?;

    // get_status_code() -> i32
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_status_code",
            |mut caller: Caller<'_, HostState>| -> Result<u32> {
                let rs = request(caller.data_mut(), "get_status_code")?;
                Ok(u32::from(rs.response_status.as_u16()))
            },
        ),
        "get_status_code",
    )?;

    // set_status_code(code: i32)
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "set_status_code",
            |mut caller: Caller<'_, HostState>, code: u32| -> Result<()> {
                let rs = request(caller.data_mut(), "set_status_code")?;
                let status = u16::try_from(code)
                    .ok()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(ProtocolViolation::InvalidStatusCode(code))?;
                rs.response_status = status;
                Ok(())
            },
        ),
        "set_status_code",
    )?;

    Ok(())
}

/// Header and trailer access.
fn register_header_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    // get_header_names(kind, buf, buf_limit) -> (count << 32) | byte_count
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_header_names",
            |mut caller: Caller<'_, HostState>,
             kind: i32,
             buf: u32,
             buf_limit: u32|
             -> Result<u64> {
                let kind = decode_header_kind(kind)?;
                let (mem, state) = memory_and_state(&mut caller)?;
                let rs = request(state, "get_header_names")?;
                let map = header_map(rs, kind, "get_header_names", false)?;
                let names: Vec<Vec<u8>> = map
                    .keys()
                    .map(|name| name.as_str().as_bytes().to_vec())
                    .collect();
                Ok(memory::write_terminated_list(mem, buf, buf_limit, &names)?)
            },
        ),
        "get_header_names",
    )?;

    // get_header_values(kind, name, name_len, buf, buf_limit)
    //   -> (count << 32) | byte_count
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "get_header_values",
            |mut caller: Caller<'_, HostState>,
             kind: i32,
             name: u32,
             name_len: u32,
             buf: u32,
             buf_limit: u32|
             -> Result<u64> {
                let kind = decode_header_kind(kind)?;
                let (mem, state) = memory_and_state(&mut caller)?;
                let name = parse_header_name(memory::read_bytes(mem, name, name_len)?)?;
                let rs = request(state, "get_header_values")?;
                let map = header_map(rs, kind, "get_header_values", false)?;

                let values: Vec<&HeaderValue> = map.get_all(&name).iter().collect();
                // set-cookie keeps its list-of-values shape; every other
                // multi-valued header collapses to one comma-joined item.
                let items: Vec<Vec<u8>> = if values.is_empty() {
                    Vec::new()
                } else if name == SET_COOKIE {
                    values.iter().map(|v| v.as_bytes().to_vec()).collect()
                } else {
                    let joined = values
                        .iter()
                        .map(|v| v.as_bytes().to_vec())
                        .collect::<Vec<_>>()
                        .join(&b", "[..]);
                    vec![joined]
                };
                Ok(memory::write_terminated_list(mem, buf, buf_limit, &items)?)
            },
        ),
        "get_header_values",
    )?;

    // set_header_value(kind, name, name_len, value, value_len)
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "set_header_value",
            |mut caller: Caller<'_, HostState>,
             kind: i32,
             name: u32,
             name_len: u32,
             value: u32,
             value_len: u32|
             -> Result<()> {
                let kind = decode_header_kind(kind)?;
                let (mem, state) = memory_and_state(&mut caller)?;
                let header_name = parse_header_name(memory::read_bytes(mem, name, name_len)?)?;
                let header_value = HeaderValue::from_bytes(memory::read_bytes(mem, value, value_len)?)
                    .map_err(|_| ProtocolViolation::InvalidHeaderValue {
                        name: header_name.as_str().to_owned(),
                    })?;
                let rs = request(state, "set_header_value")?;
                let map = header_map(rs, kind, "set_header_value", true)?;
                map.insert(header_name, header_value);
                Ok(())
            },
        ),
        "set_header_value",
    )?;

    Ok(())
}

/// Streaming body reads and replace-then-append writes.
fn register_body_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    // read_body(kind, buf, buf_len) -> (eof << 32) | n
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "read_body",
            |mut caller: Caller<'_, HostState>,
             kind: i32,
             buf: u32,
             buf_len: u32|
             -> Result<u64> {
                let kind = decode_body_kind(kind)?;
                let (mem, state) = memory_and_state(&mut caller)?;
                let rs = request(state, "read_body")?;

                let body = match kind {
                    // An unbuffered request body was never materialized;
                    // its empty source reports immediate end-of-stream.
                    BodyKind::Request => &mut rs.request_body,
                    BodyKind::Response => {
                        if rs.phase != Phase::Response {
                            return Err(ProtocolViolation::PhaseViolation {
                                call: "read_body",
                                phase: rs.phase.as_str(),
                            }
                            .into());
                        }
                        if !rs.features.contains(Features::BUFFER_RESPONSE) {
                            return Err(ProtocolViolation::FeatureRequired {
                                call: "read_body",
                                feature: "buffer-response",
                            }
                            .into());
                        }
                        &mut rs.response_body
                    }
                };

                let (range, eof) = body.read_range(buf_len as usize);
                let n = range.len() as u32;
                memory::write_bytes(mem, buf, &body.source_slice()[range])?;
                Ok(pack_body(eof, n))
            },
        ),
        "read_body",
    )?;

    // write_body(kind, buf, buf_len)
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "write_body",
            |mut caller: Caller<'_, HostState>,
             kind: i32,
             buf: u32,
             buf_len: u32|
             -> Result<()> {
                let kind = decode_body_kind(kind)?;
                let (mem, state) = memory_and_state(&mut caller)?;
                let data = memory::read_bytes(mem, buf, buf_len)?;
                let rs = request(state, "write_body")?;

                match (kind, rs.phase) {
                    // Sticky replace-then-append on the outbound request.
                    (BodyKind::Request, Phase::Request) => rs.request_body.write(data),
                    // No phase where rewriting the request after the
                    // downstream handler ran makes sense.
                    (BodyKind::Request, Phase::Response) => {
                        return Err(ProtocolViolation::PhaseViolation {
                            call: "write_body",
                            phase: rs.phase.as_str(),
                        }
                        .into());
                    }
                    // Guest-populated direct response: the body starts
                    // empty, so writes accumulate in call order.
                    (BodyKind::Response, Phase::Request) => rs.response_body.write(data),
                    (BodyKind::Response, Phase::Response) => {
                        if !rs.features.contains(Features::BUFFER_RESPONSE) {
                            return Err(ProtocolViolation::FeatureRequired {
                                call: "write_body",
                                feature: "buffer-response",
                            }
                            .into());
                        }
                        rs.response_body.write(data);
                    }
                }
                Ok(())
            },
        ),
        "write_body",
    )?;

    Ok(())
}

/// Guest logging bridged onto the host's `tracing` subscriber.
fn register_logging_functions(linker: &mut Linker<HostState>) -> weft_core::Result<()> {
    // log(level, buf, buf_len)
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "log",
            |mut caller: Caller<'_, HostState>,
             level: i32,
             buf: u32,
             buf_len: u32|
             -> Result<()> {
                let (mem, state) = memory_and_state(&mut caller)?;
                let message = memory::read_string(mem, buf, buf_len, "log")?;
                let guest = state.shared.name();
                match LogLevel::from_raw(level) {
                    LogLevel::Debug => tracing::debug!(guest, "[guest] {}", message),
                    LogLevel::Info => tracing::info!(guest, "[guest] {}", message),
                    LogLevel::Warn => tracing::warn!(guest, "[guest] {}", message),
                    LogLevel::Error => tracing::error!(guest, "[guest] {}", message),
                    LogLevel::None => {}
                }
                Ok(())
            },
        ),
        "log",
    )?;

    // log_enabled(level) -> 0|1
    register(
        linker.func_wrap(
            HTTP_HANDLER_MODULE,
            "log_enabled",
            |_caller: Caller<'_, HostState>, level: i32| -> u32 {
                let enabled = match LogLevel::from_raw(level) {
                    LogLevel::Debug => tracing::event_enabled!(Level::DEBUG),
                    LogLevel::Info => tracing::event_enabled!(Level::INFO),
                    LogLevel::Warn => tracing::event_enabled!(Level::WARN),
                    LogLevel::Error => tracing::event_enabled!(Level::ERROR),
                    LogLevel::None => false,
                };
                u32::from(enabled)
            },
        ),
        "log_enabled",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use weft_core::Features;

    fn request_state(features: Features, body: Option<&'static [u8]>) -> RequestState {
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("/test?q=1")
            .header("accept", "text/plain")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .header("x-multi", "one")
            .body(())
            .unwrap()
            .into_parts();
        RequestState::new(
            &parts,
            features,
            body.map(|b| (Bytes::from_static(b), HeaderMap::new())),
        )
    }

    #[test]
    fn header_map_trailers_require_feature() {
        let mut rs = request_state(Features::NONE, None);
        let err = header_map(&mut rs, HeaderKind::ResponseTrailers, "get_header_names", false)
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::FeatureRequired { .. }));

        let mut rs = request_state(Features::TRAILERS, None);
        assert!(header_map(&mut rs, HeaderKind::ResponseTrailers, "get_header_names", false).is_ok());
    }

    #[test]
    fn header_map_request_side_frozen_after_next() {
        let mut rs = request_state(Features::NONE, None);
        rs.begin_response_phase(StatusCode::OK, HeaderMap::new(), None);

        // Reads stay legal, writes trap.
        assert!(header_map(&mut rs, HeaderKind::Request, "get_header_values", false).is_ok());
        let err = header_map(&mut rs, HeaderKind::Request, "set_header_value", true).unwrap_err();
        assert!(matches!(err, ProtocolViolation::PhaseViolation { .. }));

        // Response headers remain writable in the response phase.
        assert!(header_map(&mut rs, HeaderKind::Response, "set_header_value", true).is_ok());
    }

    #[test]
    fn parse_header_name_rejects_empty_and_invalid() {
        assert!(matches!(
            parse_header_name(b""),
            Err(ProtocolViolation::EmptyHeaderName)
        ));
        assert!(matches!(
            parse_header_name(b"bad header"),
            Err(ProtocolViolation::InvalidHeaderName { .. })
        ));
        assert_eq!(parse_header_name(b"X-Thing").unwrap().as_str(), "x-thing");
    }

    #[test]
    fn kind_decoding_rejects_unknown() {
        assert!(matches!(
            decode_header_kind(9),
            Err(ProtocolViolation::UnknownHeaderKind(9))
        ));
        assert!(matches!(
            decode_body_kind(2),
            Err(ProtocolViolation::UnknownBodyKind(2))
        ));
    }
}
