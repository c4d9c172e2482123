use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::relay::StatusSnapshot;
use crate::relay::job::MISSING_KEY_MESSAGE;
use crate::upload::allowed_file;

use super::AppState;
use super::error::ApiError;

/// Outcome of one uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Started,
    Error,
}

/// Per-file result of `POST /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UploadResult {
    fn error(id: Option<String>, message: String) -> Self {
        Self {
            id,
            status: UploadStatus::Error,
            title: None,
            filename: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub results: Vec<UploadResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamList {
    pub streams: Vec<StatusSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub message: String,
    /// Whether a running relay was signalled.
    pub signalled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopAllResponse {
    pub message: String,
    pub stopped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub streams: usize,
}

/// A `videos` field after it was read from the request.
enum StagedVideo {
    /// Field without a filename; ignored.
    Empty,
    Rejected { filename: String },
    Stored {
        id: String,
        filename: String,
        path: PathBuf,
    },
}

/// Fields read from an upload request, in arrival order.
#[derive(Default)]
struct UploadForm {
    videos: Vec<StagedVideo>,
    keys: Vec<String>,
    titles: Vec<String>,
}

/// `POST /upload` — store each video and start relaying it.
///
/// Fields: `videos` (files), `stream_keys` and `titles`, matched by position.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut form = UploadForm::default();
    if let Err(e) = read_form(&state, &mut multipart, &mut form).await {
        discard_all(&state, &form.videos).await;
        return Err(e);
    }
    let UploadForm {
        videos,
        mut keys,
        titles,
    } = form;

    if videos.is_empty() {
        return Err(ApiError::BadRequest("No video files provided".to_string()));
    }
    if videos.len() != keys.len() {
        discard_all(&state, &videos).await;
        return Err(ApiError::BadRequest(
            "Number of videos must match number of stream keys".to_string(),
        ));
    }

    let mut results = Vec::with_capacity(videos.len());
    for (index, video) in videos.into_iter().enumerate() {
        match video {
            StagedVideo::Empty => {}
            StagedVideo::Rejected { filename } => {
                results.push(UploadResult::error(
                    None,
                    format!("Invalid file type: {filename}"),
                ));
            }
            StagedVideo::Stored { id, filename, path } => {
                let key = std::mem::take(&mut keys[index]);
                if key.is_empty() {
                    state.uploads.discard(&path).await;
                    results.push(UploadResult::error(
                        Some(id),
                        MISSING_KEY_MESSAGE.to_string(),
                    ));
                    continue;
                }
                let title = titles
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("Stream {}", index + 1));

                let job = state
                    .registry
                    .create_with_id(id, path, key, Some(title.clone()))
                    .await?;
                state.registry.start_async(Arc::clone(&job));

                results.push(UploadResult {
                    id: Some(job.id().to_string()),
                    status: UploadStatus::Started,
                    title: Some(title),
                    filename: Some(filename),
                    message: None,
                });
            }
        }
    }

    info!(
        accepted = results
            .iter()
            .filter(|r| r.status == UploadStatus::Started)
            .count(),
        total = results.len(),
        "Upload processed"
    );
    Ok(Json(UploadResponse { results }))
}

/// Read every field, saving accepted videos as they arrive. Videos staged
/// before a failure stay in `form` so the caller can discard them.
async fn read_form(
    state: &AppState,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> Result<(), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "videos" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let staged = if filename.is_empty() {
                    StagedVideo::Empty
                } else if !allowed_file(&filename) {
                    StagedVideo::Rejected { filename }
                } else {
                    let id = uuid::Uuid::new_v4().to_string();
                    let path = state.uploads.save_field(field, &id, &filename).await?;
                    StagedVideo::Stored { id, filename, path }
                };
                form.videos.push(staged);
            }
            "stream_keys" => form.keys.push(read_text(field).await?),
            "titles" => form.titles.push(read_text(field).await?),
            other => debug!(field = other, "Ignoring unknown upload field"),
        }
    }
    Ok(())
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

async fn discard_all(state: &AppState, videos: &[StagedVideo]) {
    for video in videos {
        if let StagedVideo::Stored { path, .. } = video {
            state.uploads.discard(path).await;
        }
    }
}

/// `GET /streams`
pub async fn list_streams(State(state): State<AppState>) -> Json<StreamList> {
    Json(StreamList {
        streams: state.registry.list().await,
    })
}

/// `GET /streams/{id}`
pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    let job = state.registry.get(&id).await?;
    Ok(Json(job.snapshot().await))
}

/// `POST /streams/{id}/stop`
pub async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let signalled = state.registry.stop_one(&id).await?;
    Ok(Json(StopResponse {
        message: format!("Stream {id} stopped"),
        signalled,
    }))
}

/// `POST /streams/stop-all`
pub async fn stop_all_streams(State(state): State<AppState>) -> Json<StopAllResponse> {
    let stopped = state.registry.stop_all().await;
    Json(StopAllResponse {
        message: format!("Stopped {stopped} streams"),
        stopped,
    })
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        streams: state.registry.len().await,
    })
}
