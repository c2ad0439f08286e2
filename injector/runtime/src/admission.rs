use crate::{
    core::PatchOperation,
    index::{ConfigRx, SharedNamespaceIndex},
    injection,
    k8s::is_system_namespace,
    metrics::{AdmissionMetrics, Outcome},
};
use anyhow::Result;
use bytes::{Buf, Bytes};
use futures::future;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Requests with larger bodies are rejected before they are decoded.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct Admission {
    namespaces: SharedNamespaceIndex,
    configs: ConfigRx,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<Bytes>;

// === impl Admission ===

impl<B> tower::Service<Request<B>> for Admission
where
    B: hyper::body::Body + std::fmt::Debug + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(?req);
        if let Some(rsp) = route(&req) {
            return Box::pin(future::ok(rsp));
        }

        let admission = self.clone();
        Box::pin(async move {
            let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
                Ok(body) => body.to_bytes(),
                Err(error) if error.is::<LengthLimitError>() => {
                    warn!(limit = MAX_BODY_BYTES, "Request body too large");
                    return Ok(status(http::StatusCode::PAYLOAD_TOO_LARGE));
                }
                Err(error) => return Err(Error::Request(error)),
            };
            admission.review(body)
        })
    }
}

impl Admission {
    pub fn new(
        namespaces: SharedNamespaceIndex,
        configs: ConfigRx,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            namespaces,
            configs,
            metrics,
        }
    }

    fn review(&self, body: Bytes) -> Result<Response<Body>, Error> {
        let review: AdmissionReview = match serde_json::from_reader(body.reader()) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return Ok(status(http::StatusCode::BAD_REQUEST));
            }
        };
        trace!(?review);

        let req: AdmissionRequest = match review.try_into() {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "Invalid admission request");
                return Ok(status(http::StatusCode::BAD_REQUEST));
            }
        };
        debug!(uid = %req.uid, ns = ?req.namespace, name = %req.name, "Reviewing");

        let rsp = self.admit(&req);
        debug!(?rsp);
        json_response(rsp.into_review())
    }

    fn admit(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);

        if let Some(ns) = req.namespace.as_deref().filter(|ns| is_system_namespace(ns)) {
            debug!(%ns, "Skipping system namespace");
            self.metrics.observe(Outcome::Bypassed);
            return rsp;
        }

        // Hold the namespace lock only while deciding.
        let configs = self.configs.borrow().clone();
        let decision = injection::mutate(req, &configs, &self.namespaces.read());

        let patches = match decision {
            Ok(patches) => patches,
            Err(error) => {
                info!(%error, uid = %req.uid, "Denying admission request");
                self.metrics.observe(Outcome::Denied);
                return rsp.deny(format!("{error:#}"));
            }
        };

        if patches.is_empty() {
            self.metrics.observe(Outcome::Skipped);
            return rsp;
        }

        match to_json_patch(&patches).and_then(|patch| Ok(rsp.clone().with_patch(patch)?)) {
            Ok(rsp) => {
                info!(uid = %req.uid, patches = patches.len(), "Patching pod");
                self.metrics.observe(Outcome::Patched);
                rsp
            }
            Err(error) => {
                warn!(%error, uid = %req.uid, "Failed to encode patch");
                self.metrics.observe(Outcome::Denied);
                rsp.deny(format!("failed to encode patch: {error}"))
            }
        }
    }
}

/// Answers requests that are not admission reviews, or that cannot be, without reading the body.
fn route<B>(req: &Request<B>) -> Option<Response<Body>> {
    match req.uri().path() {
        "/healthz" if req.method() == http::Method::GET => {
            return Some(
                Response::builder()
                    .status(http::StatusCode::OK)
                    .body(Body::from("ok"))
                    .expect("health response must be valid"),
            );
        }
        "/healthz" => return Some(status(http::StatusCode::METHOD_NOT_ALLOWED)),
        "/" | "/mutate" => {}
        _ => return Some(status(http::StatusCode::NOT_FOUND)),
    }

    if req.method() != http::Method::POST {
        return Some(status(http::StatusCode::METHOD_NOT_ALLOWED));
    }

    let is_json = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false);
    if !is_json {
        debug!(content_type = ?req.headers().get(http::header::CONTENT_TYPE), "Unexpected content type");
        return Some(status(http::StatusCode::BAD_REQUEST));
    }

    None
}

fn to_json_patch(ops: &[PatchOperation]) -> Result<json_patch::Patch> {
    let patch = serde_json::from_value(serde_json::to_value(ops)?)?;
    Ok(patch)
}

fn status(code: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::default())
        .expect("status response must be valid")
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
