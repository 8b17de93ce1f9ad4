use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::services::AuthUser,
    error::ApiError,
    pagination::{total_pages, PageQuery},
    state::AppState,
    storage::AttachmentUpload,
    tasks::{
        dto::{TaskListResponse, TaskQuery},
        repo::{NewTask, TaskFilter, TaskPatch},
        repo_types::Task,
        services::{collect_task_form, validate_title, TaskForm},
    },
};

pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/create", post(create_task))
        .route("/tasks", get(list_tasks).delete(delete_all_tasks))
        .route(
            "/:id",
            get(get_task).patch(update_task).delete(delete_task),
        )
        // a little headroom over the per-file ceiling for the text fields
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
}

#[instrument(skip(state, mp))]
pub async fn create_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Multipart,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let (form, upload) = collect_task_form(mp, state.config.max_upload_bytes).await?;
    let task = create_owned_task(&state, user_id, form, upload).await?;

    info!(task_id = %task.id, user_id = %user_id, "task created");
    Ok((StatusCode::CREATED, Json(task)))
}

async fn create_owned_task(
    state: &AppState,
    user_id: Uuid,
    form: TaskForm,
    upload: Option<AttachmentUpload>,
) -> Result<Task, ApiError> {
    let title = validate_title(form.title.as_deref().unwrap_or_default())?;
    let file = save_upload(state, upload).await?;

    match Task::create(
        &state.db,
        user_id,
        NewTask {
            title,
            description: form.description,
            due_date: form.due_date,
            status: form.status,
            completed: form.completed,
            priority: form.priority,
            tags: form.tags,
            file: file.clone(),
        },
    )
    .await
    {
        Ok(task) => Ok(task),
        Err(err) => {
            // the row never landed, so the stored file is unreferenced
            discard_upload(state, file.as_deref()).await;
            Err(ApiError::Internal(err))
        }
    }
}

#[instrument(skip(state))]
pub async fn list_tasks(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<TaskQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let filter = TaskFilter {
        priority: q.priority,
        status: q.status,
        completed: q.completed,
    };
    let page = PageQuery {
        page: q.page.unwrap_or(1),
        limit: q.limit.unwrap_or(10),
    }
    .normalized();

    let total = Task::count_by_owner(&state.db, user_id, &filter)
        .await
        .map_err(ApiError::Internal)?;
    let tasks = Task::list_by_owner(&state.db, user_id, &filter, page.limit, page.offset())
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(TaskListResponse {
        length: tasks.len(),
        total_tasks: total,
        total_pages: total_pages(total, page.limit),
        current_page: page.page,
        tasks,
    }))
}

#[instrument(skip(state))]
pub async fn get_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = load_owned(&state, user_id, id).await?;
    Ok(Json(task))
}

#[instrument(skip(state, mp))]
pub async fn update_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    mp: Multipart,
) -> Result<Json<Task>, ApiError> {
    let existing = load_owned(&state, user_id, id).await?;

    let (form, upload) = collect_task_form(mp, state.config.max_upload_bytes).await?;
    let task = apply_task_patch(&state, &existing, form, upload).await?;

    info!(task_id = %task.id, user_id = %user_id, "task updated");
    Ok(Json(task))
}

async fn apply_task_patch(
    state: &AppState,
    existing: &Task,
    form: TaskForm,
    upload: Option<AttachmentUpload>,
) -> Result<Task, ApiError> {
    let title = form.title.as_deref().map(validate_title).transpose()?;
    let file = save_upload(state, upload).await?;

    let task = match Task::update_partial(
        &state.db,
        existing.id,
        TaskPatch {
            title,
            description: form.description,
            due_date: form.due_date,
            status: form.status,
            completed: form.completed,
            priority: form.priority,
            tags: form.tags,
            file: file.clone(),
        },
    )
    .await
    {
        Ok(task) => task,
        Err(err) => {
            discard_upload(state, file.as_deref()).await;
            return Err(ApiError::Internal(err));
        }
    };

    // the replaced attachment is no longer referenced
    if file.is_some() {
        if let Some(old) = existing.file.as_deref() {
            if state.attachments.remove(old).await.is_err() {
                warn!(filename = %old, "failed to remove replaced attachment");
            }
        }
    }

    Ok(task)
}

async fn save_upload(
    state: &AppState,
    upload: Option<AttachmentUpload>,
) -> Result<Option<String>, ApiError> {
    match upload {
        Some(upload) => {
            state
                .attachments
                .save(&upload.stored_name, upload.body)
                .await
                .map_err(ApiError::Internal)?;
            Ok(Some(upload.stored_name))
        }
        None => Ok(None),
    }
}

async fn discard_upload(state: &AppState, filename: Option<&str>) {
    if let Some(name) = filename {
        if state.attachments.remove(name).await.is_err() {
            warn!(filename = %name, "failed to remove attachment after write error");
        }
    }
}

#[instrument(skip(state))]
pub async fn delete_task(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let task = load_owned(&state, user_id, id).await?;

    Task::delete_by_id(&state.db, id)
        .await
        .map_err(ApiError::Internal)?;
    if let Some(file) = task.file {
        if state.attachments.remove(&file).await.is_err() {
            warn!(filename = %file, "failed to remove attachment of deleted task");
        }
    }

    info!(task_id = %id, user_id = %user_id, "task deleted");
    Ok(Json(json!({ "message": "Task deleted successfully" })))
}

#[instrument(skip(state))]
pub async fn delete_all_tasks(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    // filenames first; the delete itself is one atomic statement
    let files: Vec<String> = Task::all_by_owner(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?
        .into_iter()
        .filter_map(|t| t.file)
        .collect();

    let deleted = Task::delete_all_by_owner(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?;

    for file in files {
        if state.attachments.remove(&file).await.is_err() {
            warn!(filename = %file, "failed to remove attachment of deleted task");
        }
    }

    info!(user_id = %user_id, deleted, "all tasks deleted");
    Ok(Json(
        json!({ "message": "All tasks deleted successfully", "deleted": deleted }),
    ))
}

/// Resolves the task and enforces data-level ownership: the owner always
/// passes; anyone else needs an elevated role.
async fn load_owned(state: &AppState, caller: Uuid, id: Uuid) -> Result<Task, ApiError> {
    let task = Task::find_by_id(&state.db, id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("Task not found".into()))?;

    if task.user_id != caller {
        crate::auth::services::require_elevated(&state.db, caller)
            .await
            .map_err(|_| ApiError::Forbidden("Not authorized".into()))?;
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::User;
    use crate::storage::AttachmentStore;
    use axum::async_trait;
    use bytes::Bytes;
    use sqlx::PgPool;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingStore {
        saved: Arc<Mutex<Vec<String>>>,
        removed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AttachmentStore for RecordingStore {
        async fn save(&self, filename: &str, _body: Bytes) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(filename.to_string());
            Ok(())
        }
        async fn remove(&self, filename: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(filename.to_string());
            Ok(())
        }
    }

    fn form_titled(title: &str) -> TaskForm {
        TaskForm {
            title: Some(title.into()),
            ..TaskForm::default()
        }
    }

    fn upload_named(name: &str) -> AttachmentUpload {
        AttachmentUpload {
            stored_name: name.into(),
            body: Bytes::from_static(b"body"),
        }
    }

    #[sqlx::test]
    async fn failed_insert_discards_stored_attachment(pool: PgPool) {
        let store = RecordingStore::default();
        let mut state = AppState::fake_with_db(pool.clone());
        state.attachments = Arc::new(store.clone());
        pool.close().await;

        let res = create_owned_task(
            &state,
            Uuid::new_v4(),
            form_titled("Report"),
            Some(upload_named("100-report.pdf")),
        )
        .await;

        assert!(matches!(res, Err(ApiError::Internal(_))));
        assert_eq!(store.saved.lock().unwrap().as_slice(), ["100-report.pdf"]);
        assert_eq!(store.removed.lock().unwrap().as_slice(), ["100-report.pdf"]);
    }

    #[sqlx::test]
    async fn failed_update_discards_stored_attachment(pool: PgPool) {
        let store = RecordingStore::default();
        let mut state = AppState::fake_with_db(pool.clone());
        state.attachments = Arc::new(store.clone());

        let user = User::create(&pool, "Ada", "ada@example.com", "h")
            .await
            .unwrap();
        let task = create_owned_task(&state, user.id, form_titled("Mine"), None)
            .await
            .unwrap();

        pool.close().await;
        let res = apply_task_patch(
            &state,
            &task,
            TaskForm::default(),
            Some(upload_named("200-notes.txt")),
        )
        .await;

        assert!(matches!(res, Err(ApiError::Internal(_))));
        assert_eq!(store.removed.lock().unwrap().as_slice(), ["200-notes.txt"]);
    }

    #[sqlx::test]
    async fn task_access_requires_ownership_or_elevation(pool: PgPool) {
        let state = AppState::fake_with_db(pool.clone());
        let owner = User::create(&pool, "Owner", "owner@example.com", "h")
            .await
            .unwrap();
        let other = User::create(&pool, "Other", "other@example.com", "h")
            .await
            .unwrap();
        let task = create_owned_task(&state, owner.id, form_titled("Mine"), None)
            .await
            .unwrap();

        let got = load_owned(&state, owner.id, task.id).await.unwrap();
        assert_eq!(got.id, task.id);

        let denied = load_owned(&state, other.id, task.id).await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let missing = load_owned(&state, owner.id, Uuid::new_v4()).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }
}
