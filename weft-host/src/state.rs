//! Per-request and per-middleware state.
//!
//! `HostState` is the wasmtime store data, which makes it the scoping
//! mechanism for the parameterless ABI: every host function receives a
//! `Caller<'_, HostState>` and resolves the in-flight request through
//! the `request` slot. The middleware installs a [`RequestState`]
//! immediately before each guest entry point and takes it back after,
//! so a given instance always sees exactly one request at a time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use wasmtime::StoreLimits;
use wasmtime_wasi::preview1::WasiP1Ctx;

use weft_core::Features;

/// Store data for a guest instance.
pub struct HostState {
    /// WASI preview1 context (stdio wiring for the guest).
    pub(crate) wasi: WasiP1Ctx,
    /// Resource limits enforced by the store.
    pub(crate) limits: StoreLimits,
    /// Middleware-wide shared state.
    pub(crate) shared: Arc<SharedState>,
    /// The request currently in scope, if any. `None` during guest
    /// initialization.
    pub(crate) request: Option<RequestState>,
}

impl HostState {
    pub(crate) fn new(wasi: WasiP1Ctx, limits: StoreLimits, shared: Arc<SharedState>) -> Self {
        Self {
            wasi,
            limits,
            shared,
            request: None,
        }
    }
}

/// State shared by every instance of one middleware.
///
/// Created once per middleware factory call. The feature mask is raised
/// only by `enable_features` during guest initialization and is fixed
/// thereafter; per-request raises live on [`RequestState`] and never
/// write back here.
#[derive(Debug)]
pub struct SharedState {
    name: String,
    config: Vec<u8>,
    features: AtomicU32,
}

impl SharedState {
    /// Create shared state for a middleware.
    pub fn new(name: impl Into<String>, config: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            config,
            features: AtomicU32::new(0),
        }
    }

    /// The guest's registered name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opaque configuration blob surfaced to `get_config`.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    /// The negotiated middleware-wide feature mask.
    pub fn features(&self) -> Features {
        Features::from_bits(self.features.load(Ordering::Acquire))
    }

    /// Union `want` into the middleware mask and return the new mask.
    pub(crate) fn raise_features(&self, want: Features) -> Features {
        let prev = self.features.fetch_or(want.bits(), Ordering::AcqRel);
        Features::from_bits(prev).union(want)
    }
}

/// The handler currently executing, which governs which ABI operations
/// are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `handle_request` is executing; the downstream handler has not run.
    Request,
    /// `handle_response` is executing after the downstream handler.
    Response,
}

impl Phase {
    /// Diagnostic name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// A body visible to the guest.
///
/// Reads stream forward over the materialized `source` with a cursor;
/// writes accumulate into a separate `written` replacement so a guest
/// can inspect the original while rewriting it. The sticky `replaced`
/// flag makes the first `write_body` of a phase a replacement and every
/// later one an append.
#[derive(Debug, Default)]
pub(crate) struct BodyBuf {
    source: Bytes,
    cursor: usize,
    buffered: bool,
    written: BytesMut,
    replaced: bool,
}

impl BodyBuf {
    /// A body that was not materialized; reads report immediate EOF.
    pub(crate) fn unbuffered() -> Self {
        Self::default()
    }

    /// A fully materialized body.
    pub(crate) fn materialized(bytes: Bytes) -> Self {
        Self {
            source: bytes,
            buffered: true,
            ..Self::default()
        }
    }

    pub(crate) fn buffered(&self) -> bool {
        self.buffered
    }

    pub(crate) fn replaced(&self) -> bool {
        self.replaced
    }

    /// Advance the cursor by up to `max` bytes. Returns the consumed
    /// range of the source and whether its end was reached.
    pub(crate) fn read_range(&mut self, max: usize) -> (std::ops::Range<usize>, bool) {
        let start = self.cursor.min(self.source.len());
        let n = max.min(self.source.len() - start);
        self.cursor = start + n;
        (start..start + n, self.cursor == self.source.len())
    }

    /// The materialized source (for copying a read range out).
    pub(crate) fn source_slice(&self) -> &[u8] {
        &self.source
    }

    /// Sticky replace-then-append write.
    pub(crate) fn write(&mut self, data: &[u8]) {
        if !self.replaced {
            self.written.clear();
            self.replaced = true;
        }
        self.written.extend_from_slice(data);
    }

    /// The body to transmit: the replacement when the guest wrote one,
    /// else the materialized source, else `None` (stream through).
    pub(crate) fn take_final(&mut self) -> Option<Bytes> {
        if self.replaced {
            Some(std::mem::take(&mut self.written).freeze())
        } else if self.buffered {
            Some(std::mem::take(&mut self.source))
        } else {
            None
        }
    }
}

/// State for one in-flight request.
///
/// Created at request entry, torn down at request exit, and reachable
/// from every host function through the store-data slot while a guest
/// entry point is executing.
#[derive(Debug)]
pub struct RequestState {
    pub(crate) phase: Phase,
    /// Effective feature mask: inherits the middleware mask, may be
    /// raised by the guest during `handle_request`, dies with this
    /// request.
    pub(crate) features: Features,
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) protocol: &'static str,
    pub(crate) request_headers: HeaderMap,
    pub(crate) request_trailers: HeaderMap,
    pub(crate) response_status: StatusCode,
    pub(crate) response_headers: HeaderMap,
    pub(crate) response_trailers: HeaderMap,
    pub(crate) request_body: BodyBuf,
    pub(crate) response_body: BodyBuf,
    pub(crate) next_called: bool,
}

impl RequestState {
    /// Build request state from decomposed request parts.
    ///
    /// `body` is `Some` when the request body was pre-read under
    /// `BUFFER_REQUEST`, along with any trailers the stream carried.
    pub(crate) fn new(
        parts: &http::request::Parts,
        features: Features,
        body: Option<(Bytes, HeaderMap)>,
    ) -> Self {
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());

        let (request_body, request_trailers) = match body {
            Some((bytes, trailers)) => (BodyBuf::materialized(bytes), trailers),
            None => (BodyBuf::unbuffered(), HeaderMap::new()),
        };

        Self {
            phase: Phase::Request,
            features,
            method: parts.method.as_str().to_owned(),
            uri,
            protocol: protocol_version(parts.version),
            request_headers: parts.headers.clone(),
            request_trailers,
            response_status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_trailers: HeaderMap::new(),
            request_body,
            response_body: BodyBuf::unbuffered(),
            next_called: false,
        }
    }

    /// Cross into the response phase with the downstream response
    /// decomposed into parts.
    ///
    /// `body` is `Some` when the response was captured under
    /// `BUFFER_RESPONSE`. Sticky write flags and the response cursor
    /// reset here — at the phase boundary, not at the request boundary.
    pub(crate) fn begin_response_phase(
        &mut self,
        status: StatusCode,
        headers: HeaderMap,
        body: Option<(Bytes, HeaderMap)>,
    ) {
        self.phase = Phase::Response;
        self.response_status = status;
        self.response_headers = headers;
        match body {
            Some((bytes, trailers)) => {
                self.response_body = BodyBuf::materialized(bytes);
                self.response_trailers = trailers;
            }
            None => {
                self.response_body = BodyBuf::unbuffered();
                self.response_trailers = HeaderMap::new();
            }
        }
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The effective feature mask for this request.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Whether the downstream handler has executed.
    pub fn next_called(&self) -> bool {
        self.next_called
    }
}

/// Normalize an HTTP version for `get_protocol_version`.
fn protocol_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_parts(uri: &str) -> http::request::Parts {
        let (parts, ()) = http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "text/plain")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn body_buf_read_concatenates_to_full_body() {
        let mut buf = BodyBuf::materialized(Bytes::from_static(b"hello world"));
        let mut out = Vec::new();
        loop {
            let (range, eof) = buf.read_range(4);
            out.extend_from_slice(&buf.source_slice()[range]);
            if eof {
                break;
            }
        }
        assert_eq!(out, b"hello world");

        // Already at EOF: empty chunk, still EOF.
        let (range, eof) = buf.read_range(4);
        assert!(range.is_empty());
        assert!(eof);
    }

    #[test]
    fn body_buf_eof_on_final_chunk() {
        let mut buf = BodyBuf::materialized(Bytes::from_static(b"abcd"));
        let (range, eof) = buf.read_range(4);
        assert_eq!(range, 0..4);
        assert!(eof, "exact-size read must report EOF with the final chunk");
    }

    #[test]
    fn body_buf_sticky_replace_then_append() {
        let mut buf = BodyBuf::materialized(Bytes::from_static(b"original"));
        buf.write(b"new");
        buf.write(b" tail");
        assert!(buf.replaced());

        // Writes do not disturb the read side.
        let (range, _) = buf.read_range(8);
        assert_eq!(&buf.source_slice()[range], b"original");

        assert_eq!(buf.take_final().unwrap(), Bytes::from_static(b"new tail"));
    }

    #[test]
    fn body_buf_final_prefers_replacement() {
        let mut buf = BodyBuf::materialized(Bytes::from_static(b"original"));
        assert_eq!(
            buf.take_final().unwrap(),
            Bytes::from_static(b"original"),
            "untouched buffered body passes through"
        );

        let mut buf = BodyBuf::unbuffered();
        assert!(buf.take_final().is_none(), "unbuffered body streams through");

        let mut buf = BodyBuf::unbuffered();
        buf.write(b"replacement");
        assert_eq!(buf.take_final().unwrap(), Bytes::from_static(b"replacement"));
    }

    #[test]
    fn response_phase_resets_sticky_flag_and_cursor() {
        let parts = request_parts("/x");
        let mut rs = RequestState::new(&parts, Features::NONE, None);
        rs.response_body.write(b"direct");
        assert!(rs.response_body.replaced());

        rs.begin_response_phase(
            StatusCode::OK,
            HeaderMap::new(),
            Some((Bytes::from_static(b"downstream"), HeaderMap::new())),
        );
        assert_eq!(rs.phase(), Phase::Response);
        assert!(!rs.response_body.replaced());
        assert_eq!(rs.response_body.source_slice(), b"downstream");

        // First write in the new phase replaces the captured body.
        rs.response_body.write(b"rewritten");
        assert_eq!(
            rs.response_body.take_final().unwrap(),
            Bytes::from_static(b"rewritten")
        );
    }

    #[test]
    fn request_state_from_parts() {
        let parts = request_parts("/v1.0/hello?name=teddy");
        let rs = RequestState::new(&parts, Features::BUFFER_REQUEST, None);
        assert_eq!(rs.method, "POST");
        assert_eq!(rs.uri, "/v1.0/hello?name=teddy");
        assert_eq!(rs.protocol, "HTTP/1.1");
        assert_eq!(rs.response_status, StatusCode::OK);
        assert!(!rs.next_called());
        assert!(!rs.request_body.buffered());
    }

    #[test]
    fn shared_state_feature_raises_are_monotonic() {
        let shared = SharedState::new("guest", Vec::new());
        assert!(shared.features().is_empty());

        let mask = shared.raise_features(Features::BUFFER_REQUEST);
        assert_eq!(mask, Features::BUFFER_REQUEST);

        let mask = shared.raise_features(Features::TRAILERS);
        assert_eq!(mask, Features::BUFFER_REQUEST | Features::TRAILERS);
        assert_eq!(shared.features(), mask);
    }

    #[test]
    fn protocol_version_normalization() {
        assert_eq!(protocol_version(Version::HTTP_10), "HTTP/1.0");
        assert_eq!(protocol_version(Version::HTTP_11), "HTTP/1.1");
        assert_eq!(protocol_version(Version::HTTP_2), "HTTP/2.0");
    }
}
