//! The admission review endpoint.
use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use mcluster_core::{response::Status, AdmissionRequest, AdmissionResponse, AdmissionReview, PolicyEngine};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_MAX_CONCURRENT_REVIEWS, DEFAULT_MAX_REQUEST_BODY_BYTES};

/// Shared, read-only state of the review handler.
#[derive(Clone, Debug)]
pub struct AppState {
    engine: Arc<PolicyEngine>,
    request_timeout: Duration,
    evaluations: Arc<Semaphore>,
    max_body_bytes: usize,
}

impl AppState {
    /// Serve reviews with `engine`, answering each within `request_timeout`.
    pub fn new(engine: PolicyEngine, request_timeout: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            request_timeout,
            evaluations: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_REVIEWS)),
            max_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }

    /// Cap the rule evaluations running at once.
    ///
    /// A review waiting for a slot still counts against its deadline.
    #[must_use]
    pub fn with_max_concurrent_reviews(mut self, limit: usize) -> Self {
        self.evaluations = Arc::new(Semaphore::new(limit));
        self
    }

    /// Set the largest accepted review body.
    #[must_use]
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// The largest accepted review body
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }
}

/// Answer one AdmissionReview.
///
/// A body that is not a well-formed review gets HTTP 400 and no policy is evaluated.
/// Every decoded review gets HTTP 200 carrying the verdict, including reviews that
/// ran out of time, which are denied with code 504 inside the review status.
pub async fn review(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json(&headers) {
        warn!(content_type = ?headers.get(CONTENT_TYPE), "rejecting review with unsupported content type");
        return reply(
            StatusCode::BAD_REQUEST,
            AdmissionResponse::invalid("content type must be application/json").into_review(),
        );
    }

    let req = match AdmissionRequest::decode(&body) {
        Ok(req) => Arc::new(req),
        Err(err) => {
            warn!(error = %err, body_len = body.len(), "rejecting malformed admission review");
            return reply(StatusCode::BAD_REQUEST, AdmissionResponse::invalid(err).into_review());
        }
    };
    debug!(
        uid = %req.uid,
        operation = ?req.operation,
        kind = %req.kind,
        namespace = req.namespace.as_deref().unwrap_or_default(),
        name = %req.name,
        "received admission review"
    );

    let engine = state.engine.clone();
    let evaluations = state.evaluations.clone();
    let evaluated = req.clone();
    let task = async move {
        let slot = evaluations.acquire_owned().await.map_err(|err| err.to_string())?;
        tokio::task::spawn_blocking(move || {
            // held until the rule returns, even past the deadline
            let _slot = slot;
            engine.evaluate(&evaluated)
        })
        .await
        .map_err(|err| err.to_string())
    };
    let response = match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(evaluation)) => evaluation.into_response(&req),
        Ok(Err(err)) => {
            error!(uid = %req.uid, error = %err, "policy evaluation task failed");
            let message = "internal error while evaluating admission policy";
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                AdmissionResponse::from(&*req)
                    .with_status(Status::failure(message, "InternalError").with_code(500))
                    .deny(message)
                    .into_review(),
            );
        }
        Err(_) => {
            let message = format!(
                "admission review timed out after {}s",
                state.request_timeout.as_secs_f64()
            );
            warn!(uid = %req.uid, timeout = ?state.request_timeout, "admission review timed out");
            AdmissionResponse::from(&*req)
                .with_status(Status::failure(&message, "Timeout").with_code(504))
                .deny(message)
        }
    };

    log_verdict(&req, &response);
    reply(StatusCode::OK, response.into_review())
}

fn log_verdict(req: &AdmissionRequest, response: &AdmissionResponse) {
    let namespace = req.namespace.as_deref().unwrap_or_default();
    if response.allowed {
        info!(
            uid = %req.uid,
            operation = ?req.operation,
            kind = %req.kind,
            namespace,
            name = %req.name,
            dry_run = req.dry_run,
            "admission allowed"
        );
    } else {
        warn!(
            uid = %req.uid,
            operation = ?req.operation,
            kind = %req.kind,
            namespace,
            name = %req.name,
            dry_run = req.dry_run,
            reason = %response.result.message,
            "admission denied"
        );
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE) else {
        return true;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let mime = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

fn reply(status: StatusCode, review: AdmissionReview) -> Response {
    match review.to_vec() {
        Ok(body) => (
            status,
            [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode admission review");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
