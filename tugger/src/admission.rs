//! HTTP surface of the webhook
//!
//! `POST /mutate` and `POST /validate` take an `AdmissionReview` and answer with
//! one carrying the same uid. Bodies that are not a review are refused with a
//! bare status code; policy outcomes always travel inside the review.

use std::convert::Infallible;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::response::{StatusCause, StatusDetails};
use serde_json::Value;
use tracing::{Instrument, Span, debug, field, info, info_span, warn};
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::error::AdmissionError;
use crate::pipeline::{Pipeline, Verdict, Workload};

/// Status reason attached to denied reviews
pub const DENIED_REASON: &str = "Invalid";

/// Routes serving the webhook and its liveness check
pub fn routes(
    pipeline: Arc<Pipeline>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_pipeline = warp::any().map(move || pipeline.clone());

    let mutate = warp::post()
        .and(warp::path("mutate"))
        .and(warp::path::end())
        .and(with_pipeline.clone())
        .and(warp::body::bytes())
        .and_then(mutate_handler);

    let validate = warp::post()
        .and(warp::path("validate"))
        .and(warp::path::end())
        .and(with_pipeline)
        .and(warp::body::bytes())
        .and_then(validate_handler);

    let ping = warp::get()
        .and(warp::path("ping"))
        .and(warp::path::end())
        .map(|| "Ok");

    mutate
        .or(validate)
        .or(ping)
        .with(warp::trace::request())
}

async fn mutate_handler(pipeline: Arc<Pipeline>, body: Bytes) -> Result<Response, Infallible> {
    let span = info_span!("admission", endpoint = "mutate", uid = field::Empty);
    let result = review_mutation(&pipeline, &body).instrument(span).await;
    Ok(respond(result))
}

async fn validate_handler(pipeline: Arc<Pipeline>, body: Bytes) -> Result<Response, Infallible> {
    let span = info_span!("admission", endpoint = "validate", uid = field::Empty);
    let result = review_validation(&pipeline, &body).instrument(span).await;
    Ok(respond(result))
}

fn respond(result: Result<AdmissionResponse, AdmissionError>) -> Response {
    match result.and_then(review_body) {
        Ok(review) => warp::reply::json(&review).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Renders the review with the patch as a base64 string, the form the API
/// server expects
fn review_body(mut response: AdmissionResponse) -> Result<Value, AdmissionError> {
    let patch = response.patch.take();
    let mut review = serde_json::to_value(response.into_review())
        .map_err(|err| AdmissionError::Patch(err.to_string()))?;
    if let Some(patch) = patch {
        review["response"]["patch"] = Value::String(STANDARD.encode(patch));
    }
    Ok(review)
}

fn parse_request(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, AdmissionError> {
    debug!(body = %String::from_utf8_lossy(body), "received admission review");

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(AdmissionError::InvalidBody)?;
    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|err| AdmissionError::InvalidReview(format!("{err}")))?;

    Span::current().record("uid", request.uid.as_str());
    info!(
        operation = ?request.operation,
        namespace = request.namespace.as_deref().unwrap_or_default(),
        name = %request.name,
        "reviewing pod"
    );
    Ok(request)
}

/// The pod under review, or `None` when the request skips the policy
fn workload(
    pipeline: &Pipeline,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<Workload>, AdmissionError> {
    if pipeline.bypasses(request.namespace.as_deref().unwrap_or_default()) {
        return Ok(None);
    }
    request.object.as_ref().map(Workload::try_from).transpose()
}

async fn review_mutation(
    pipeline: &Pipeline,
    body: &[u8],
) -> Result<AdmissionResponse, AdmissionError> {
    let request = parse_request(body)?;
    let response = AdmissionResponse::from(&request);

    let Some(workload) = workload(pipeline, &request)? else {
        return Ok(response);
    };

    let document = pipeline.mutate(&workload).await;
    if document.is_empty() {
        debug!("no images to patch");
        return Ok(response);
    }

    response
        .with_patch(document.into_json_patch())
        .map_err(|err| AdmissionError::Patch(err.to_string()))
}

async fn review_validation(
    pipeline: &Pipeline,
    body: &[u8],
) -> Result<AdmissionResponse, AdmissionError> {
    let request = parse_request(body)?;
    let response = AdmissionResponse::from(&request);

    let Some(workload) = workload(pipeline, &request)? else {
        return Ok(response);
    };

    match pipeline.validate(&workload).await {
        Verdict::Allowed => Ok(response),
        Verdict::Denied { image, message } => {
            warn!(image = %image, "denying pod");
            Ok(deny(response, message))
        }
    }
}

/// Rejects the review with a single cause carrying `message`
fn deny(response: AdmissionResponse, message: String) -> AdmissionResponse {
    let mut response = response.deny(message.clone());
    response.result.reason = DENIED_REASON.to_string();
    response.result.details = Some(StatusDetails {
        name: String::new(),
        group: String::new(),
        kind: String::new(),
        uid: String::new(),
        causes: vec![StatusCause {
            reason: String::new(),
            message,
            field: String::new(),
        }],
        retry_after_seconds: 0,
    });
    response
}
