//! HTTP body and handler-chain types.
//!
//! The middleware composes with its host framework through boxed
//! bodies and a boxed "proceed to the next handler" continuation, so it
//! neither cares whether the downstream handler is a hyper service, a
//! router function, or a test closure, nor constrains how bodies are
//! produced.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Type-erased error for downstream handlers and body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type flowing through the middleware.
pub type HttpBody = UnsyncBoxBody<Bytes, BoxError>;

/// A request as seen by the middleware.
pub type HttpRequest = http::Request<HttpBody>;

/// A response as seen by the middleware.
pub type HttpResponse = http::Response<HttpBody>;

/// Future returned by a downstream handler.
pub type NextFuture = Pin<Box<dyn Future<Output = Result<HttpResponse, BoxError>> + Send>>;

/// The downstream handler: invoked at most once per request, and only
/// when the guest asks to proceed.
pub type Next = Box<dyn FnOnce(HttpRequest) -> NextFuture + Send>;

/// A complete in-memory body.
pub fn full(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into()).map_err(Into::into).boxed_unsync()
}

/// An empty body.
pub fn empty() -> HttpBody {
    Empty::<Bytes>::new().map_err(Into::into).boxed_unsync()
}

/// Box an arbitrary body into the middleware's body type.
pub fn boxed<B>(body: B) -> HttpBody
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn full_and_empty_bodies_collect() {
        let collected = full("hello").collect().await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"hello"));

        let collected = empty().collect().await.unwrap();
        assert!(collected.to_bytes().is_empty());
    }
}
