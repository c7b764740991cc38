use super::API_PREFIX;
use super::models::{
    CompletedJobsPayload, ErrorPayload, ErrorResponse, ProgressPayload, SuccessPayload,
};
use crate::config::BrokerServerConfig;
use crate::{BrokerError, BrokerStatus, ProvingBroker, ProvingJobConsumer, ProvingJobProducer};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use epoch_prover_types::{JobLease, JobStatus, ProvingJob, ProvingJobFilter, ProvingJobId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct AppState {
    broker: Arc<ProvingBroker>,
}

struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::JobAlreadyCancelled(_) | BrokerError::DuplicateJobId(_) => {
                StatusCode::CONFLICT
            }
            BrokerError::Database(_)
            | BrokerError::Transport(_)
            | BrokerError::Serialization(_) => {
                tracing::error!(err = %self.0, "broker request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn enqueue(
    State(state): State<AppState>,
    Json(job): Json<ProvingJob>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(state.broker.enqueue_proving_job(job).await?))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(state.broker.get_proving_job_status(&id).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
) -> ApiResult<StatusCode> {
    state.broker.cancel_proving_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clean_up(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
) -> ApiResult<StatusCode> {
    state.broker.clean_up_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn completed(
    State(state): State<AppState>,
    Json(payload): Json<CompletedJobsPayload>,
) -> ApiResult<Json<Vec<ProvingJobId>>> {
    Ok(Json(state.broker.get_completed_jobs(&payload.ids).await?))
}

async fn pick(
    State(state): State<AppState>,
    Json(filter): Json<ProvingJobFilter>,
) -> ApiResult<Json<Option<JobLease>>> {
    Ok(Json(state.broker.get_proving_job(&filter).await?))
}

async fn progress(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
    Json(payload): Json<ProgressPayload>,
) -> ApiResult<Json<Option<JobLease>>> {
    Ok(Json(
        state
            .broker
            .report_proving_job_progress(&id, payload.started_at, &payload.filter)
            .await?,
    ))
}

async fn success(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
    Json(payload): Json<SuccessPayload>,
) -> ApiResult<StatusCode> {
    state
        .broker
        .report_proving_job_success(&id, payload.result_ref)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn error(
    State(state): State<AppState>,
    Path(id): Path<ProvingJobId>,
    Json(payload): Json<ErrorPayload>,
) -> ApiResult<Json<Option<JobLease>>> {
    Ok(Json(
        state
            .broker
            .report_proving_job_error(
                &id,
                payload.reason,
                payload.retryable,
                payload.filter.as_ref(),
            )
            .await?,
    ))
}

async fn status(State(state): State<AppState>) -> Json<BrokerStatus> {
    Json(state.broker.status_summary())
}

fn v1_routes() -> Router<AppState> {
    Router::new()
        // producer routes
        .route("/enqueue", post(enqueue))
        .route("/completed", post(completed))
        .route("/{id}/status", get(job_status))
        .route("/{id}/cancel", post(cancel))
        .route("/{id}/cleanup", post(clean_up))
        // agent routes
        .route("/pick", post(pick))
        .route("/{id}/progress", post(progress))
        .route("/{id}/success", post(success))
        .route("/{id}/error", post(error))
        // debugging routes
        .route("/status", get(status))
}

pub fn router(broker: Arc<ProvingBroker>, body_limit: usize) -> Router {
    Router::new()
        .nest(API_PREFIX, v1_routes())
        .with_state(AppState { broker })
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Serves the broker API on an already bound listener until `stop` fires.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<ProvingBroker>,
    body_limit: usize,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(broker, body_limit))
        .with_graceful_shutdown(stop.cancelled_owned())
        .await?;
    Ok(())
}

/// Entry point for the broker API server.
pub async fn run(
    broker: Arc<ProvingBroker>,
    config: BrokerServerConfig,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let bind_address: SocketAddr = config.address.parse()?;
    tracing::info!("starting proving broker API on {bind_address}");
    let listener = TcpListener::bind(bind_address).await?;
    serve(listener, broker, config.body_limit, stop).await
}
