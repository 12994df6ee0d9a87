use crate::app_state::SharedAppState;
use crate::error::CubeflowError;
use crate::identity;
use crate::metrics::{self, SUBMITTED_REQUESTS};
use crate::models::{RequestView, SubmissionForm};
use crate::validated_json::ValidatedJson;

use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use uuid::Uuid;

/// Message recorded on requests cancelled through the API.
const CANCELLED: &str = "Cancelled by user.";

/// [tower::Service] that serves the API.
pub type Service = NormalizePath<Router>;

/// Returns a [axum::Router] for the cubeflow API
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/:application/requests", post(submit))
            .route("/requests/:id", get(status))
            .route("/requests/:id/cancel", post(cancel))
            .layer(
                ServiceBuilder::new().layer(
                    TraceLayer::new_for_http()
                        .on_request(metrics::request_counter)
                        .on_response(metrics::record_response_metrics),
                ),
            )
    }

    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/v1", v1())
        .with_state(state)
}

/// Returns a [crate::app::Service] for the cubeflow API
///
/// The service is based on the router returned by [crate::app::router], with trailing slashes
/// removed from request paths.
pub fn service(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Handler for request submission
///
/// Returns the existing request when one with the same identity was already submitted.
/// Newly created requests are dispatched before responding.
async fn submit(
    State(state): State<SharedAppState>,
    Path(application): Path<String>,
    ValidatedJson(form): ValidatedJson<SubmissionForm>,
) -> Result<Json<RequestView>, CubeflowError> {
    let kind = state.registry.get(&application)?;
    let (record, created) = identity::get_or_create(kind.as_ref(), state.store.as_ref(), &form)?;
    SUBMITTED_REQUESTS
        .with_label_values(&[&application, &created.to_string()])
        .inc();
    if created {
        if let Err(err) = state.dispatcher.dispatch(&record).await {
            tracing::event!(Level::WARN, "Request {} was not dispatched: {}", record.id, err);
        }
    }
    let record = state.store.get(record.id)?.unwrap_or(record);
    Ok(Json(RequestView::new(record, Some(created))))
}

/// Handler for request status
async fn status(
    State(state): State<SharedAppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestView>, CubeflowError> {
    let record = state
        .store
        .get(id)?
        .ok_or(CubeflowError::RequestNotFound { id })?;
    Ok(Json(RequestView::new(record, None)))
}

/// Handler for request cancellation
async fn cancel(
    State(state): State<SharedAppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestView>, CubeflowError> {
    let record = state.dispatcher.cancel(id, CANCELLED).await?;
    Ok(Json(RequestView::new(record, None)))
}
