use axum::extract::Multipart;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::ApiError;
use crate::storage::{stored_filename, validate_attachment, AttachmentUpload};
use crate::tasks::repo_types::{Priority, Status};

/// Text fields of a multipart task request. All optional here; the create
/// handler requires a title, the update handler merges.
#[derive(Debug, Default)]
pub struct TaskForm {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<OffsetDateTime>,
    pub status: Option<Status>,
    pub completed: Option<bool>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
}

/// Parses the multipart body exactly once: text fields into a typed form,
/// and the optional `file` part into a validated attachment descriptor.
pub async fn collect_task_form(
    mut mp: Multipart,
    max_upload_bytes: usize,
) -> Result<(TaskForm, Option<AttachmentUpload>), ApiError> {
    let mut form = TaskForm::default();
    let mut upload = None;

    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart body".into()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let original = field.file_name().unwrap_or("file").to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            let body = field
                .bytes()
                .await
                .map_err(|_| ApiError::Validation("Malformed multipart body".into()))?;
            validate_attachment(&original, &content_type, body.len(), max_upload_bytes)?;
            upload = Some(AttachmentUpload {
                stored_name: stored_filename(&original, OffsetDateTime::now_utc()),
                body,
            });
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|_| ApiError::Validation("Malformed multipart body".into()))?;
        match name.as_str() {
            "title" => form.title = Some(text),
            "description" => form.description = Some(text),
            "dueDate" | "due_date" => {
                let parsed = OffsetDateTime::parse(&text, &Rfc3339)
                    .map_err(|_| ApiError::Validation(format!("Invalid due date: {text}")))?;
                form.due_date = Some(parsed);
            }
            "status" => {
                form.status = Some(text.parse().map_err(ApiError::Validation)?);
            }
            "completed" => {
                form.completed = Some(
                    text.parse::<bool>()
                        .map_err(|_| ApiError::Validation(format!("Invalid completed: {text}")))?,
                );
            }
            "priority" => {
                form.priority = Some(text.parse().map_err(ApiError::Validation)?);
            }
            "tags" => {
                let tags = form.tags.get_or_insert_with(Vec::new);
                tags.extend(parse_tags(&text));
            }
            // unknown fields are ignored, matching form-post tolerance
            _ => {}
        }
    }

    Ok((form, upload))
}

pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Titles are required and may not be blank.
pub fn validate_title(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation("Title is required".into()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_must_not_be_blank() {
        assert!(validate_title("").is_err());
        assert!(validate_title("   ").is_err());
        assert_eq!(validate_title("  X  ").unwrap(), "X");
    }

    #[test]
    fn tags_split_and_trim() {
        assert_eq!(parse_tags("home, work ,"), vec!["home", "work"]);
        assert!(parse_tags("  ").is_empty());
    }

    #[test]
    fn due_date_must_be_rfc3339() {
        assert!(OffsetDateTime::parse("2024-05-01T12:00:00Z", &Rfc3339).is_ok());
        assert!(OffsetDateTime::parse("05/01/2024", &Rfc3339).is_err());
    }
}
