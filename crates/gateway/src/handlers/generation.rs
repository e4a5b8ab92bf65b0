//! Study card generation submission
//!
//! `POST /v1/ai/study-cards/generate` takes a multipart form:
//! - `payload`: the JSON [`GenerationRequest`]
//! - `pdfs`: zero or more PDF files
//!
//! The request is validated and stored as a queued job, then dispatched. A job
//! that cannot be dispatched is marked failed before the error is returned.
//! Generation itself never runs on the request path.

use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::AppState;
use zistudy_common::{
    auth::AuthContext,
    errors::{AppError, Result},
    generation::{GenerationRequest, JobStatus, UploadedDocument},
};

const PAYLOAD_FIELD: &str = "payload";
const PDF_FIELD: &str = "pdfs";
const PDF_CONTENT_TYPES: &[&str] = &["application/pdf", "application/x-pdf"];

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub documents: usize,
    pub links: JobLinks,
}

#[derive(Debug, Serialize)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub status: String,
    pub cancel: String,
}

impl JobLinks {
    pub fn for_job(id: Uuid) -> Self {
        Self {
            status: format!("/v1/jobs/{}", id),
            cancel: format!("/v1/jobs/{}/cancel", id),
        }
    }
}

/// Accept a generation request and return the queued job
pub async fn generate(
    State(state): State<AppState>,
    auth: AuthContext,
    multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>)> {
    let request = read_submission(multipart, state.config.server.max_body_bytes).await?;

    let job = state.orchestrator.submit(&auth.owner_id, request).await?;
    if let Err(e) = state.dispatcher.dispatch(&job).await {
        if let Err(store_err) = state.orchestrator.fail_undispatched(job.id, &e.to_string()).await {
            error!(job_id = %job.id, error = %store_err, "Failed to mark undispatched job");
        }
        return Err(e);
    }

    info!(
        job_id = %job.id,
        owner = %auth.owner_id,
        request_id = %auth.request_id,
        "Generation request accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            status: job.status,
            documents: job.request.documents.len(),
            links: JobLinks::for_job(job.id),
        }),
    ))
}

/// Collect the JSON payload and uploaded PDFs from the form
///
/// Files are appended after any documents embedded in the payload itself.
pub async fn read_submission(mut multipart: Multipart, body_limit: usize) -> Result<GenerationRequest> {
    let mut request: Option<GenerationRequest> = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, body_limit))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            PAYLOAD_FIELD => {
                let text = field.text().await.map_err(|e| multipart_error(e, body_limit))?;
                let parsed = serde_json::from_str(&text).map_err(|e| AppError::InvalidFormat {
                    message: format!("payload is not a valid generation request: {}", e),
                })?;
                request = Some(parsed);
            }
            PDF_FIELD => {
                let filename = field.file_name().map(String::from);
                let content_type = field.content_type().unwrap_or_default().to_ascii_lowercase();
                if !is_pdf(&content_type, filename.as_deref()) {
                    return Err(AppError::UnsupportedMediaType {
                        content_type: if content_type.is_empty() {
                            "unknown".to_string()
                        } else {
                            content_type
                        },
                    });
                }

                let bytes = field.bytes().await.map_err(|e| multipart_error(e, body_limit))?;
                debug!(filename = ?filename, bytes = bytes.len(), "Received PDF upload");
                uploads.push(UploadedDocument::new(filename, bytes.to_vec()));
            }
            other => {
                return Err(AppError::Validation {
                    message: format!("Unexpected form field '{}'", other),
                    field: Some(other.to_string()),
                })
            }
        }
    }

    let mut request = request.ok_or_else(|| AppError::MissingField {
        field: PAYLOAD_FIELD.to_string(),
    })?;
    request.documents.extend(uploads);
    Ok(request)
}

/// PDFs only; `application/octet-stream` passes when the file name says `.pdf`
fn is_pdf(content_type: &str, filename: Option<&str>) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if PDF_CONTENT_TYPES.contains(&essence) {
        return true;
    }
    (essence.is_empty() || essence == "application/octet-stream")
        && filename.is_some_and(|f| f.to_ascii_lowercase().ends_with(".pdf"))
}

fn multipart_error(err: MultipartError, body_limit: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge {
            size: body_limit.saturating_add(1),
            limit: body_limit,
        }
    } else {
        AppError::InvalidFormat {
            message: err.body_text(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::FromRequest, http::Request};

    const BOUNDARY: &str = "zistudy-test-boundary";

    fn part(name: &str, filename: Option<&str>, content_type: Option<&str>, body: &str) -> String {
        let mut out = format!("--{}\r\nContent-Disposition: form-data; name=\"{}\"", BOUNDARY, name);
        if let Some(filename) = filename {
            out.push_str(&format!("; filename=\"{}\"", filename));
        }
        out.push_str("\r\n");
        if let Some(content_type) = content_type {
            out.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out.push_str("\r\n");
        out
    }

    async fn multipart(parts: &[String]) -> Multipart {
        let body = format!("{}--{}--\r\n", parts.concat(), BOUNDARY);
        let request = Request::builder()
            .method("POST")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_payload_and_pdf_are_combined() {
        let form = multipart(&[
            part(PAYLOAD_FIELD, None, None, r#"{"topics": ["Sepsis"], "target_card_count": 3}"#),
            part(PDF_FIELD, Some("sepsis.pdf"), Some("application/pdf"), "%PDF-1.4 body"),
        ])
        .await;

        let request = tokio_test::assert_ok!(read_submission(form, 1024).await);
        assert_eq!(request.topics, vec!["Sepsis".to_string()]);
        assert_eq!(request.target_card_count, Some(3));
        assert_eq!(request.documents.len(), 1);
        assert_eq!(request.documents[0].filename.as_deref(), Some("sepsis.pdf"));
        assert_eq!(request.documents[0].content, b"%PDF-1.4 body".to_vec());
    }

    #[tokio::test]
    async fn test_missing_payload() {
        let form = multipart(&[part(PDF_FIELD, Some("a.pdf"), Some("application/pdf"), "%PDF")]).await;
        let err = read_submission(form, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::MissingField { field } if field == "payload"));
    }

    #[tokio::test]
    async fn test_non_pdf_upload_is_rejected() {
        let form = multipart(&[
            part(PAYLOAD_FIELD, None, None, r#"{"topics": ["Sepsis"]}"#),
            part(PDF_FIELD, Some("notes.txt"), Some("text/plain"), "hello"),
        ])
        .await;
        let err = read_submission(form, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedMediaType { content_type } if content_type == "text/plain"));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let form = multipart(&[part(PAYLOAD_FIELD, None, None, "{not json")]).await;
        let err = read_submission(form, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidFormat { .. }));
    }

    #[test]
    fn test_pdf_detection() {
        assert!(is_pdf("application/pdf", None));
        assert!(is_pdf("application/pdf; charset=binary", None));
        assert!(is_pdf("application/octet-stream", Some("Guideline.PDF")));
        assert!(!is_pdf("application/octet-stream", Some("guideline.docx")));
        assert!(!is_pdf("image/png", Some("scan.pdf")));
    }

    #[test]
    fn test_links() {
        let id = Uuid::nil();
        let links = JobLinks::for_job(id);
        assert_eq!(links.status, format!("/v1/jobs/{}", id));
        assert!(links.cancel.ends_with("/cancel"));
    }
}
