use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

use crate::constants;
use crate::title::TitleRequest;
use crate::upstream::Cluster;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type HttpResponse = Response<Full<Bytes>>;

/// One stage of the request pipeline. Requests carry no body; everything the
/// stages need travels in headers and in a [`ClientContext`] extension.
pub trait RoundTripper: Send + Sync {
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>>;
}

pub struct RoundTripperFn<F>(pub F);

impl<F> RoundTripper for RoundTripperFn<F>
where
    F: Fn(Request<()>) -> BoxFuture<Result<HttpResponse>> + Send + Sync,
{
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        (self.0)(req)
    }
}

pub type Middleware = Arc<dyn Fn(Arc<dyn RoundTripper>) -> Arc<dyn RoundTripper> + Send + Sync>;

pub fn chain(middlewares: &[Middleware], next: Arc<dyn RoundTripper>) -> Arc<dyn RoundTripper> {
    let mut current = next;
    for mw in middlewares.iter().rev() {
        current = mw(current);
    }
    current
}

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub SocketAddr);

/// Where a request ends up: the host written into `X-Location` and the
/// address the link is signed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub ip: String,
    pub cluster: Option<Cluster>,
}

/// Request state shared by the pipeline stages.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Client URI, possibly rewritten by the quality stage.
    pub uri: String,
    pub uid: String,
    /// The proxy's own pick, used whenever hashing does not route.
    pub cache_server: String,
    pub source_ip: String,
    pub title: Option<TitleRequest>,
    /// Cleared by the lottery when the draw loses.
    pub hashing: bool,
    pub route: Option<Route>,
}

impl ClientContext {
    /// The routed server, or the proxy hint when nothing routed.
    pub fn target(&self) -> Route {
        self.route.clone().unwrap_or_else(|| Route {
            host: self.cache_server.clone(),
            ip: self.cache_server.clone(),
            cluster: None,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("missing or invalid header {0}")]
    Precondition(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("source address is blocked")]
    Blocked,
    #[error("too many requests")]
    RateLimited,
    #[error("{0}")]
    Internal(String),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::Blocked => StatusCode::FORBIDDEN,
            Rejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> HttpResponse {
        let message = self.to_string();
        let mut resp = text_response(self.status(), &message);
        if let Ok(val) = HeaderValue::from_str(&message) {
            resp.headers_mut().insert(constants::ERROR_KEY, val);
        }
        resp
    }
}

pub fn empty_response(status: StatusCode) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn text_response(status: StatusCode, body: &str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn json_response<T: serde::Serialize>(payload: &T) -> HttpResponse {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json; charset=utf-8")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}

pub mod balance;
pub mod blocklist;
pub mod limiter;
pub mod lottery;
pub mod precondition;
pub mod quality;
pub mod recovery;
pub mod sign;
