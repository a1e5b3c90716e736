//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::types::*;
use crate::cache::PoolListing;
use crate::models::*;
use crate::orchestrator::TaskHandle;
use crate::service::{
    run_blocking, CloneImage, CopyImage, CreateImage, EditImage, EditSnapshot, ImageService,
    ServiceStatus,
};
use crate::spec::ResourceLocator;
use crate::ErrorKind;

pub type AppState = Arc<ImageService>;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;
type TaskResponse = ApiResult<(StatusCode, Json<TaskInfo>)>;

// === Health ===

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn status(State(svc): State<AppState>) -> ApiResult<Json<ServiceStatus>> {
    let status = run_blocking(move || svc.status()).await.map_err(to_api_error)?;
    Ok(Json(status))
}

// === Images ===

pub async fn list_images(
    State(svc): State<AppState>,
    Query(query): Query<PoolQuery>,
) -> ApiResult<Json<Vec<PoolListing<ImageDescriptor>>>> {
    let listings = svc.list_images(query.pool_name).await.map_err(to_api_error)?;
    Ok(Json(listings))
}

pub async fn list_pool_images(
    State(svc): State<AppState>,
    Path(pool): Path<String>,
) -> ApiResult<Json<Vec<PoolListing<ImageDescriptor>>>> {
    let listings = svc.list_images(Some(pool)).await.map_err(to_api_error)?;
    Ok(Json(listings))
}

pub async fn create_image(
    State(svc): State<AppState>,
    Json(req): Json<CreateImage>,
) -> TaskResponse {
    settle(svc.create(req)).await
}

pub async fn get_image(
    State(svc): State<AppState>,
    Path(spec): Path<String>,
) -> ApiResult<Json<ImageDescriptor>> {
    let loc = locator(&spec)?;
    let image = run_blocking(move || svc.get_image(&loc))
        .await
        .map_err(to_api_error)?;
    Ok(Json(image))
}

pub async fn edit_image(
    State(svc): State<AppState>,
    Path(spec): Path<String>,
    Json(req): Json<EditImage>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.edit(loc, req)).await
}

pub async fn delete_image(State(svc): State<AppState>, Path(spec): Path<String>) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.delete(loc)).await
}

pub async fn copy_image(
    State(svc): State<AppState>,
    Path(spec): Path<String>,
    Json(req): Json<CopyImage>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.copy(loc, req)).await
}

pub async fn flatten_image(State(svc): State<AppState>, Path(spec): Path<String>) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.flatten(loc)).await
}

pub async fn move_trash(
    State(svc): State<AppState>,
    Path(spec): Path<String>,
    req: Option<Json<MoveTrashRequest>>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    let delay = req.map(|Json(req)| req.delay).unwrap_or_default();
    settle(svc.move_to_trash(loc, delay)).await
}

pub async fn default_features(State(svc): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    let features = run_blocking(move || svc.default_features())
        .await
        .map_err(to_api_error)?;
    Ok(Json(features))
}

pub async fn clone_format_version(
    State(svc): State<AppState>,
) -> ApiResult<Json<CloneFormatResponse>> {
    let version = run_blocking(move || svc.clone_format_version())
        .await
        .map_err(to_api_error)?;
    Ok(Json(CloneFormatResponse {
        clone_format_version: version,
    }))
}

// === Snapshots ===

pub async fn create_snapshot(
    State(svc): State<AppState>,
    Path(spec): Path<String>,
    Json(req): Json<CreateSnapshotRequest>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.create_snapshot(loc, req.snapshot_name)).await
}

pub async fn edit_snapshot(
    State(svc): State<AppState>,
    Path((spec, snap)): Path<(String, String)>,
    Json(req): Json<EditSnapshot>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.edit_snapshot(loc, snap, req)).await
}

pub async fn delete_snapshot(
    State(svc): State<AppState>,
    Path((spec, snap)): Path<(String, String)>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.delete_snapshot(loc, snap)).await
}

pub async fn rollback_snapshot(
    State(svc): State<AppState>,
    Path((spec, snap)): Path<(String, String)>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.rollback_snapshot(loc, snap)).await
}

pub async fn clone_snapshot(
    State(svc): State<AppState>,
    Path((spec, snap)): Path<(String, String)>,
    Json(req): Json<CloneImage>,
) -> TaskResponse {
    let loc = locator(&spec)?;
    settle(svc.clone_image(loc, snap, req)).await
}

// === Trash ===

pub async fn list_trash(
    State(svc): State<AppState>,
    Query(query): Query<PoolQuery>,
) -> ApiResult<Json<Vec<PoolListing<TrashEntry>>>> {
    let listings = svc.list_trash(query.pool_name).await.map_err(to_api_error)?;
    Ok(Json(listings))
}

pub async fn purge_trash(
    State(svc): State<AppState>,
    Query(query): Query<PoolQuery>,
) -> TaskResponse {
    settle(svc.purge_trash(query.pool_name)).await
}

pub async fn restore_trash(
    State(svc): State<AppState>,
    Path(id_spec): Path<String>,
    Json(req): Json<RestoreTrashRequest>,
) -> TaskResponse {
    let entry = locator(&id_spec)?;
    settle(svc.restore_trash(entry, req.new_image_name)).await
}

pub async fn remove_trash(
    State(svc): State<AppState>,
    Path(id_spec): Path<String>,
    Query(query): Query<ForceQuery>,
) -> TaskResponse {
    let entry = locator(&id_spec)?;
    settle(svc.remove_trash(entry, query.force)).await
}

// === Namespaces ===

pub async fn list_namespaces(
    State(svc): State<AppState>,
    Path(pool): Path<String>,
) -> ApiResult<Json<Vec<NamespaceInfo>>> {
    let namespaces = run_blocking(move || svc.list_namespaces(&pool))
        .await
        .map_err(to_api_error)?;
    Ok(Json(namespaces))
}

pub async fn create_namespace(
    State(svc): State<AppState>,
    Path(pool): Path<String>,
    Json(req): Json<CreateNamespaceRequest>,
) -> TaskResponse {
    settle(svc.create_namespace(pool, req.namespace)).await
}

pub async fn delete_namespace(
    State(svc): State<AppState>,
    Path((pool, namespace)): Path<(String, String)>,
) -> TaskResponse {
    settle(svc.delete_namespace(pool, namespace)).await
}

// === Tasks ===

pub async fn list_tasks(
    State(svc): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Json<Vec<TaskInfo>> {
    Json(svc.orchestrator().list(query.name.as_deref()))
}

pub async fn get_task(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskInfo>> {
    let task = svc.orchestrator().get(&id).map_err(to_api_error)?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(svc): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskInfo>> {
    let task = svc.orchestrator().cancel(&id).map_err(to_api_error)?;
    Ok(Json(task))
}

// === Helpers ===

fn locator(spec: &str) -> ApiResult<ResourceLocator> {
    ResourceLocator::parse(spec).map_err(to_api_error)
}

/// Wait as long as the task asks, then answer with where it got to
async fn settle(submitted: crate::Result<TaskHandle>) -> TaskResponse {
    let mut handle = submitted.map_err(to_api_error)?;
    let info = handle.settle().await;
    if info.state == TaskState::Success {
        return Ok((StatusCode::CREATED, Json(info)));
    }
    match info.error.clone() {
        Some(err) => Err((
            status_for(err.kind),
            Json(ApiError {
                code: err.code,
                message: err.message,
                component: err.component,
                task: Some(info),
            }),
        )),
        None => Ok((StatusCode::ACCEPTED, Json(info))),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidSpec | ErrorKind::InvalidRequest | ErrorKind::RemoteEngineError => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::PoolNotFound
        | ErrorKind::NamespaceNotFound
        | ErrorKind::ImageNotFound
        | ErrorKind::SnapshotNotFound
        | ErrorKind::TrashEntryNotFound
        | ErrorKind::TaskNotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy
        | ErrorKind::ReferentialConflict
        | ErrorKind::AlreadyExists
        | ErrorKind::DuplicateInFlight
        | ErrorKind::NotExpired
        | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_api_error(e: crate::Error) -> (StatusCode, Json<ApiError>) {
    let status = status_for(e.kind());
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    (
        status,
        Json(ApiError {
            code: e.code(),
            message: e.to_string(),
            component: e.component().to_string(),
            task: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_status_mapping() {
        let (status, body) = to_api_error(Error::ImageNotFound("rbd/img".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "image_not_found");

        let (status, body) = to_api_error(Error::referential("namespace_contains_images", "busy"));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "namespace_contains_images");

        let engine = crate::engine::EngineError::new(crate::engine::errno::EINVAL, "bad");
        let (status, body) = to_api_error(Error::Engine(engine));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "EINVAL");

        assert_eq!(status_for(ErrorKind::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_locator_errors_are_bad_requests() {
        let (status, body) = locator("just-a-name").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.component, "rbd");
    }
}
