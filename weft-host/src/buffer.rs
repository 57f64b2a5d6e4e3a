//! Response buffering.
//!
//! When `BUFFER_RESPONSE` is negotiated, the downstream response is
//! captured in full — status, headers, body bytes, trailers — before
//! the guest's `handle_response` runs, so the guest can observe a
//! materialized response and rewrite it. While captured, nothing
//! reaches the wire; release happens when the middleware returns the
//! reassembled response, and [`BufferedBody`] then emits the bytes in
//! release order: body, trailers, end-of-stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;

use weft_core::{Result, WeftError};

use crate::body::{boxed, HttpBody, HttpResponse};

/// A downstream response held back from the wire.
pub struct CapturedResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// The complete body.
    pub body: Bytes,
    /// Trailers the body stream carried, if any.
    pub trailers: HeaderMap,
}

/// Drain a response into a [`CapturedResponse`].
pub async fn capture(response: HttpResponse) -> Result<CapturedResponse> {
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.map_err(|e| WeftError::BodyRead {
        direction: "response",
        cause: e.to_string(),
    })?;
    let trailers = collected.trailers().cloned().unwrap_or_default();
    Ok(CapturedResponse {
        status: parts.status,
        headers: parts.headers,
        body: collected.to_bytes(),
        trailers,
    })
}

/// Body releasing a buffered response: one data frame, then one
/// trailers frame, then end-of-stream. Empty parts are skipped.
pub struct BufferedBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl BufferedBody {
    /// Build a release body from buffered bytes and trailers.
    pub fn new(data: Bytes, trailers: HeaderMap) -> Self {
        Self {
            data: (!data.is_empty()).then_some(data),
            trailers: (!trailers.is_empty()).then_some(trailers),
        }
    }

    /// Box into the middleware's body type.
    pub fn into_http_body(self) -> HttpBody {
        boxed(self)
    }
}

impl Body for BufferedBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let len = self.data.as_ref().map_or(0, Bytes::len) as u64;
        if self.trailers.is_some() {
            // An exact hint would let the transport pick length-delimited
            // framing, which cannot carry trailers.
            let mut hint = SizeHint::new();
            hint.set_lower(len);
            hint
        } else {
            SizeHint::with_exact(len)
        }
    }
}
