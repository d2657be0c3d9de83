//! Refresh Trigger Interceptor.
//!
//! A `tower::Layer`/`Service` pair wrapping the RPC call path, grounded
//! on `tonic::service::interceptor`'s `InterceptorFn`/`InterceptedService`
//! pair but observing the *response* instead of the request: it watches
//! for a failing `grpc-status` and, when the
//! configured predicate accepts it, fires a resolver refresh as a side
//! effect without altering the call's outcome. Response bodies are
//! wrapped the same way regardless of RPC shape (unary, client-stream,
//! server-stream, duplex) — for unary/client-stream, the body ends
//! immediately after a trailers-only error and the check fires once; for
//! server/bidi streams it fires again on every failing read.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tonic::Code;
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// An opaque predicate over a failing status code: returns whether the
/// resolver should be asked to refresh. Treated as opaque by the
/// interceptor itself.
pub type RefreshPredicate = Arc<dyn Fn(Code) -> bool + Send + Sync>;

/// An opaque "trigger a resolver refresh" action, fired at most once per
/// observed failure.
pub type RefreshAction = Arc<dyn Fn() + Send + Sync>;

/// Build the default predicate from a fixed set of status codes.
pub fn predicate_from_codes(codes: Vec<Code>) -> RefreshPredicate {
    Arc::new(move |code| codes.contains(&code))
}

/// A `tower::Layer` installing the refresh trigger on a channel's call
/// path.
#[derive(Clone)]
pub struct RefreshTriggerLayer {
    refresh: RefreshAction,
    predicate: RefreshPredicate,
}

impl RefreshTriggerLayer {
    /// Build a layer that calls `refresh` whenever `predicate` accepts an
    /// observed failure's status code.
    pub fn new(refresh: RefreshAction, predicate: RefreshPredicate) -> Self {
        Self { refresh, predicate }
    }
}

impl<S> Layer<S> for RefreshTriggerLayer {
    type Service = RefreshTrigger<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RefreshTrigger {
            inner,
            refresh: self.refresh.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

/// Wraps a call-path service, evaluating the refresh predicate against
/// every response it observes.
#[derive(Clone)]
pub struct RefreshTrigger<S> {
    inner: S,
    refresh: RefreshAction,
    predicate: RefreshPredicate,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RefreshTrigger<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    ResBody: Body,
{
    type Response = http::Response<RefreshTriggerBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        ResponseFuture {
            inner: self.inner.call(req),
            refresh: Some(self.refresh.clone()),
            predicate: self.predicate.clone(),
        }
    }
}

/// Response future for [`RefreshTrigger`].
#[pin_project]
pub struct ResponseFuture<F> {
    #[pin]
    inner: F,
    refresh: Option<RefreshAction>,
    predicate: RefreshPredicate,
}

impl<F, ResBody, E> std::future::Future for ResponseFuture<F>
where
    F: std::future::Future<Output = Result<http::Response<ResBody>, E>>,
    ResBody: Body,
{
    type Output = Result<http::Response<RefreshTriggerBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let response = match this.inner.poll(cx) {
            Poll::Ready(Ok(response)) => response,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        let refresh = this.refresh.take();
        let predicate = this.predicate.clone();

        // Trailers-only error responses carry `grpc-status` in the
        // headers: unary and client-streaming calls surface a failure
        // this way without any response body being read at all.
        if let Some(code) = status_from_headers(response.headers()) {
            maybe_trigger(&predicate, refresh.as_deref(), code);
        }

        let (parts, body) = response.into_parts();
        let body = RefreshTriggerBody::new(body, predicate, refresh);
        Poll::Ready(Ok(http::Response::from_parts(parts, body)))
    }
}

/// Wraps a response body, evaluating the refresh predicate against the
/// final `grpc-status` trailer a streaming call produces.
#[pin_project]
pub struct RefreshTriggerBody<B> {
    #[pin]
    inner: B,
    predicate: RefreshPredicate,
    refresh: Option<RefreshAction>,
}

impl<B> RefreshTriggerBody<B> {
    pub(crate) fn new(inner: B, predicate: RefreshPredicate, refresh: Option<RefreshAction>) -> Self {
        Self {
            inner,
            predicate,
            refresh,
        }
    }
}

/// Check a response's headers for a trailers-only failure and install
/// [`RefreshTriggerBody`] around its body to watch for a failing trailer
/// later on. Used by [`ResponseFuture`] when installed as a
/// `tower::Layer`, and directly by a channel that observes its own
/// response without composing through the `Layer`/`Service` pair.
pub(crate) fn wrap_response<B: Body>(
    response: http::Response<B>,
    predicate: RefreshPredicate,
    refresh: RefreshAction,
) -> http::Response<RefreshTriggerBody<B>> {
    if let Some(code) = status_from_headers(response.headers()) {
        maybe_trigger(&predicate, Some(refresh.as_ref()), code);
    }
    let (parts, body) = response.into_parts();
    let body = RefreshTriggerBody::new(body, predicate, Some(refresh));
    http::Response::from_parts(parts, body)
}

impl<B: Body> Body for RefreshTriggerBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let poll = this.inner.poll_frame(cx);

        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if let Some(trailers) = frame.trailers_ref() {
                if let Some(code) = status_from_headers(trailers) {
                    maybe_trigger(this.predicate, this.refresh.as_deref(), code);
                }
            }
        }

        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn maybe_trigger(predicate: &RefreshPredicate, refresh: Option<&(dyn Fn() + Send + Sync)>, code: Code) {
    if !predicate(code) {
        return;
    }
    debug!(?code, "refresh trigger: failure matched policy, requesting resolver refresh");
    if let Some(refresh) = refresh {
        refresh();
    }
}

fn status_from_headers(headers: &http::HeaderMap) -> Option<Code> {
    let value = headers.get("grpc-status")?;
    let value = value.to_str().ok()?;
    let code: i32 = value.parse().ok()?;
    let code = Code::from(code);
    (code != Code::Ok).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn predicate_from_codes_matches_configured_codes_only() {
        let predicate = predicate_from_codes(vec![Code::Unavailable, Code::Aborted]);
        assert!(predicate(Code::Unavailable));
        assert!(!predicate(Code::NotFound));
    }

    #[test]
    fn status_from_headers_ignores_ok_and_missing() {
        let mut headers = http::HeaderMap::new();
        assert_eq!(status_from_headers(&headers), None);
        headers.insert("grpc-status", "0".parse().unwrap());
        assert_eq!(status_from_headers(&headers), None);
        headers.insert("grpc-status", "14".parse().unwrap());
        assert_eq!(status_from_headers(&headers), Some(Code::Unavailable));
    }

    #[test]
    fn maybe_trigger_fires_refresh_exactly_when_predicate_accepts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let refresh: RefreshAction = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let predicate = predicate_from_codes(vec![Code::Unavailable]);

        maybe_trigger(&predicate, Some(refresh.as_ref()), Code::Unavailable);
        maybe_trigger(&predicate, Some(refresh.as_ref()), Code::NotFound);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
