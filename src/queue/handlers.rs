use super::protocol::*;
use super::service::QueueService;
use super::types::*;
use crate::error::TaskError;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use std::sync::Arc;
use std::time::Duration;

/// Builds the service router. Every route except `/health` requires the shared key.
pub fn router(service: Arc<QueueService>, key: &str) -> Router {
    let key: Arc<str> = Arc::from(key);

    let protected = Router::new()
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_SUBMIT, post(handle_submit))
        .route(ENDPOINT_DEQUEUE, post(handle_dequeue))
        .route(ENDPOINT_TASK_DONE, post(handle_task_done))
        .route(ENDPOINT_PIPELINE_JOIN, post(handle_pipeline_join))
        .route(ENDPOINT_STORE_UPDATE, post(handle_store_update))
        .route(ENDPOINT_STORE_GET, post(handle_store_get))
        .route(ENDPOINT_STORE_GET_MANY, post(handle_store_get_many))
        .route(ENDPOINT_STORE_POP, post(handle_store_pop))
        .route(ENDPOINT_STORE_LEN, get(handle_store_len))
        .route(
            &format!("{}/:process_id", ENDPOINT_FILES),
            put(handle_set_file).get(handle_get_file).delete(handle_delete_file),
        )
        .route(
            ENDPOINT_INSTANCES,
            post(handle_publish_instance).get(handle_list_instances),
        )
        .layer(middleware::from_fn_with_state(key, require_key));

    Router::new()
        .route(ENDPOINT_HEALTH, get(|| async { StatusCode::OK }))
        .merge(protected)
        .layer(Extension(service))
}

async fn require_key(State(key): State<Arc<str>>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok());

    if presented != Some(&*key) {
        tracing::warn!("Rejected request to {} with bad key", req.uri().path());
        return ApiError(StatusCode::UNAUTHORIZED, "invalid queue key".to_string())
            .into_response();
    }

    next.run(req).await
}

/// Error half of every handler: a status code plus a JSON message.
pub struct ApiError(StatusCode, String);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let status = match e.downcast_ref::<TaskError>() {
            Some(TaskError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Some(TaskError::InvalidDescriptor { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {:#}", e);
        } else {
            tracing::debug!("Request rejected: {}", e);
        }
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_process_id(raw: &str) -> ApiResult<ProcessId> {
    raw.parse()
        .map_err(|e: String| ApiError(StatusCode::BAD_REQUEST, e))
}

pub async fn handle_stats(
    Extension(service): Extension<Arc<QueueService>>,
) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(service.stats().await?))
}

pub async fn handle_submit(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    let queued = service.submit(req.record).await?;
    Ok(Json(SubmitResponse { queued }))
}

pub async fn handle_dequeue(
    Extension(service): Extension<Arc<QueueService>>,
) -> Json<DequeueResponse> {
    Json(DequeueResponse {
        process_id: service.dequeue(),
    })
}

pub async fn handle_task_done(
    Extension(service): Extension<Arc<QueueService>>,
) -> ApiResult<StatusCode> {
    service
        .task_done()
        .map_err(|e| ApiError(StatusCode::CONFLICT, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_pipeline_join(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<PipelineJoinRequest>,
) -> Json<PipelineJoinResponse> {
    let drained = service
        .pipeline_join(req.timeout_ms.map(Duration::from_millis))
        .await;
    Json(PipelineJoinResponse { drained })
}

pub async fn handle_store_update(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<StoreUpdateRequest>,
) -> ApiResult<StatusCode> {
    service.store_update(req.entries).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_store_get(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<StoreKeyRequest>,
) -> ApiResult<Json<StoreRecordResponse>> {
    let record = service.store_get(&req.process_id).await?;
    Ok(Json(StoreRecordResponse { record }))
}

pub async fn handle_store_get_many(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<StoreGetManyRequest>,
) -> ApiResult<Json<StoreRecordsResponse>> {
    let records = service.store_get_many(&req.process_ids).await?;
    Ok(Json(StoreRecordsResponse { records }))
}

pub async fn handle_store_pop(
    Extension(service): Extension<Arc<QueueService>>,
    Json(req): Json<StoreKeyRequest>,
) -> ApiResult<Json<StoreRecordResponse>> {
    let record = service.store_pop(&req.process_id).await?;
    Ok(Json(StoreRecordResponse { record }))
}

pub async fn handle_store_len(
    Extension(service): Extension<Arc<QueueService>>,
) -> ApiResult<Json<StoreLenResponse>> {
    let len = service.store_len().await?;
    Ok(Json(StoreLenResponse { len }))
}

pub async fn handle_set_file(
    Extension(service): Extension<Arc<QueueService>>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let process_id = parse_process_id(&raw_id)?;
    service.set_file_contents(&process_id, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_get_file(
    Extension(service): Extension<Arc<QueueService>>,
    Path(raw_id): Path<String>,
) -> ApiResult<Response> {
    let process_id = parse_process_id(&raw_id)?;
    match service.get_file_contents(&process_id).await? {
        Some(contents) => Ok((StatusCode::OK, contents).into_response()),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("no file for {}", process_id),
        )),
    }
}

pub async fn handle_delete_file(
    Extension(service): Extension<Arc<QueueService>>,
    Path(raw_id): Path<String>,
) -> ApiResult<StatusCode> {
    let process_id = parse_process_id(&raw_id)?;
    if service.delete_file(&process_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("no file for {}", process_id),
        ))
    }
}

pub async fn handle_publish_instance(
    Extension(service): Extension<Arc<QueueService>>,
    Json(record): Json<InstanceRecord>,
) -> StatusCode {
    service.publish_instance(record);
    StatusCode::NO_CONTENT
}

pub async fn handle_list_instances(
    Extension(service): Extension<Arc<QueueService>>,
) -> Json<InstancesResponse> {
    Json(InstancesResponse {
        instances: service.list_instances(),
    })
}
