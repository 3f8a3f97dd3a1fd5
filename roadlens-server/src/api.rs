use crate::error::{ApiError, ApiResult};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bytes::Bytes;
use roadlens_common::{CctvStream, Error, TaskItem, TaskOutput, output_type};
use roadlens_store::{OutputCatalog, StreamCatalog};
use roadlens_tasks::TaskService;
use roadlens_vision::VisionError;
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone)]
pub(crate) struct AppState {
    pub streams: Arc<dyn StreamCatalog>,
    pub outputs: Arc<dyn OutputCatalog>,
    pub record: Arc<dyn TaskService>,
    pub tracking: Arc<dyn TaskService>,
    pub analysis: Arc<dyn TaskService>,
}

impl AppState {
    /// Resolve the `{kind}` path segment to a driver facade.
    fn service(&self, kind: &str) -> ApiResult<&Arc<dyn TaskService>> {
        match kind {
            "record" => Ok(&self.record),
            "tracking" => Ok(&self.tracking),
            "analysis" => Ok(&self.analysis),
            _ => Err(Error::NotFound(format!("task kind \"{kind}\"")).into()),
        }
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(list_streams).post(add_stream))
        .route("/stream/{cctvname}", delete(remove_stream))
        .route("/task/{kind}", get(list_tasks))
        .route("/task/{kind}/start", post(start_task))
        .route("/task/{kind}/stop/{taskid}", post(stop_task))
        .route("/task/{kind}/{taskid}", delete(delete_task))
        .route("/output", get(list_outputs))
        .route("/output/name/{name}", get(get_output_by_name))
        .route("/output/video/preview/{name}", get(preview_output))
        .route("/output/{taskid}", get(get_outputs_of_task).delete(delete_outputs_of_task))
        .with_state(state)
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<CctvStream>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/stream").increment(1);
    Json(state.streams.get_all())
}

#[derive(Debug, Deserialize)]
struct AddStreamQuery {
    cctvname: String,
    coordx: f64,
    coordy: f64,
}

async fn add_stream(
    State(state): State<AppState>,
    Query(query): Query<AddStreamQuery>,
) -> ApiResult<Json<CctvStream>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/stream").increment(1);
    let stream = state
        .streams
        .add(&query.cctvname, query.coordx, query.coordy)?;
    Ok(Json(stream))
}

async fn remove_stream(
    State(state): State<AppState>,
    Path(cctvname): Path<String>,
) -> ApiResult<Json<CctvStream>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/stream").increment(1);
    Ok(Json(state.streams.remove(&cctvname)?))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Vec<TaskItem>>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/task").increment(1);
    Ok(Json(state.service(&kind)?.tasks()))
}

async fn start_task(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult<Json<TaskItem>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/task").increment(1);
    Ok(Json(state.service(&kind)?.start(params)?))
}

async fn stop_task(
    State(state): State<AppState>,
    Path((kind, taskid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/task").increment(1);
    state.service(&kind)?.stop(&taskid)?;
    Ok(StatusCode::OK)
}

async fn delete_task(
    State(state): State<AppState>,
    Path((kind, taskid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/task").increment(1);
    state.service(&kind)?.delete(&taskid)?;
    Ok(StatusCode::OK)
}

async fn list_outputs(State(state): State<AppState>) -> Json<Vec<TaskOutput>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/output").increment(1);
    Json(state.outputs.get_all())
}

async fn get_output_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<TaskOutput>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/output").increment(1);
    Ok(Json(state.outputs.get_by_name(&name)?))
}

async fn get_outputs_of_task(
    State(state): State<AppState>,
    Path(taskid): Path<String>,
) -> Json<Vec<TaskOutput>> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/output").increment(1);
    Json(state.outputs.get_by_taskid(&taskid))
}

async fn delete_outputs_of_task(
    State(state): State<AppState>,
    Path(taskid): Path<String>,
) -> ApiResult<StatusCode> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/output").increment(1);
    state.outputs.delete(&taskid)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    #[serde(default)]
    random: bool,
}

async fn preview_output(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> ApiResult<Response> {
    metrics::counter!(crate::o11y::METRIC_HTTP_REQUESTS, "path" => "/output/video/preview")
        .increment(1);

    let output = state.outputs.get_by_name(&name)?;
    if output.media_type != output_type::VIDEO_MP4 {
        return Err(Error::Validation(format!(
            "output \"{name}\" is {}, previews need {}",
            output.media_type,
            output_type::VIDEO_MP4
        ))
        .into());
    }

    let path = state.outputs.outputs_dir().join(&output.name);
    let jpeg = roadlens_vision::video_frame_jpeg(&path, None, query.random)
        .await
        .map_err(|err| ApiError::from(preview_error(err)))?;

    Ok((
        [(header::CONTENT_TYPE, "image/jpeg")],
        Bytes::from(jpeg),
    )
        .into_response())
}

fn preview_error(err: VisionError) -> Error {
    match err {
        VisionError::FileNotFound(path) => {
            Error::NotFound(format!("video file \"{}\"", path.display()))
        }
        VisionError::FrameOutOfRange { requested, total } => Error::Validation(format!(
            "frame {requested} out of range, video has {total} frames"
        )),
        other => Error::external(other),
    }
}
