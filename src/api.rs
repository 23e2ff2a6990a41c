//! HTTP surface of the handover service.
//!
//! Thin orchestration over the stores: handlers parse the form, call into
//! the registry and stores, and map domain errors to JSON error bodies.
//! Registration and edit accept up to five guardian "slots" as multipart
//! fields (`name{i}`, `phone{i}`, `photo{i}`, plus `existing_photo{i}` and
//! `delete{i}` on edit); handover capture is a urlencoded form with the
//! guardian name and a signature-pad data URI.

use crate::config::HttpConfig;
use crate::image_store::ImageStore;
use crate::pdf::PdfExporter;
use crate::registry::{Guardian, HandoverEvent, Registry};
use crate::signature_store::{SignatureError, SignatureStore};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::{Form, Json, Router};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument, warn};

/// Guardian slots per child on the registration and edit forms
pub const MAX_GUARDIANS: usize = 5;

/// Shared handles the handlers work against
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub images: Arc<ImageStore>,
    pub signatures: Arc<SignatureStore>,
    pub pdf: Arc<PdfExporter>,
}

/// JSON error body returned by all failing endpoints
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    children: usize,
    handovers: usize,
}

#[derive(Debug, Serialize)]
struct RegisterFormDescriptor {
    max_guardians: usize,
    fields: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ChildView {
    child_id: String,
    guardians: Vec<Guardian>,
}

#[derive(Debug, Deserialize)]
pub struct HandoverForm {
    pub name: String,
    pub signature: String,
}

/// One parsed guardian slot from a multipart submission
#[derive(Default)]
struct GuardianSlot {
    name: String,
    phone: String,
    photo_upload: Option<(String, Vec<u8>)>,
    existing_photo: Option<String>,
    delete: bool,
}

/// Build the service router. CORS is attached only when enabled; a `*`
/// origin entry opens the layer up entirely.
pub fn create_router(state: AppState, config: &HttpConfig) -> Router {
    let mut router = Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/register", get(register_form).post(register_child))
        .route("/child/:child_id", get(child_page))
        .route("/handover/:child_id", get(handover_form).post(record_handover))
        .route("/edit/:child_id", get(edit_form).post(edit_guardians))
        .route("/export_pdf/:child_id", get(export_pdf))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors_enabled {
        let any_origin = config.cors_origins.is_empty()
            || config.cors_origins.iter().any(|origin| origin == "*");
        let cors = if any_origin {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        };
        router = router.layer(cors);
    }

    router
}

async fn home() -> Redirect {
    Redirect::to("/register")
}

#[instrument(skip(state))]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "nabi-handover",
        children: state.registry.child_count(),
        handovers: state.registry.handover_count(),
    })
}

/// Form descriptor so clients can render the registration form themselves
async fn register_form() -> Json<RegisterFormDescriptor> {
    Json(RegisterFormDescriptor {
        max_guardians: MAX_GUARDIANS,
        fields: vec!["name", "phone", "photo"],
    })
}

#[instrument(skip(state, multipart))]
async fn register_child(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, (StatusCode, Json<ErrorResponse>)> {
    let slots = parse_guardian_slots(&mut multipart).await?;

    let mut guardians = Vec::new();
    for slot in slots {
        // Photos are stored before the completeness check; an upload on an
        // incomplete slot stays on disk unreferenced
        let photo = store_photo(&state, slot.photo_upload)?;
        if !slot.name.is_empty() && !slot.phone.is_empty() {
            guardians.push(Guardian {
                name: slot.name,
                phone: slot.phone,
                photo,
            });
        }
    }

    let child_id = state.registry.register(guardians);
    counter!("handover.registrations").increment(1);
    Ok(Redirect::to(&format!("/child/{child_id}")))
}

#[instrument(skip(state))]
async fn child_page(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
) -> Json<ChildView> {
    let guardians = state.registry.guardians(&child_id);
    Json(ChildView {
        child_id,
        guardians,
    })
}

/// Guardian list backing the pickup form. Unlike the child view this
/// fails for an unknown identifier.
#[instrument(skip(state))]
async fn handover_form(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ChildView>, (StatusCode, Json<ErrorResponse>)> {
    let guardians = state
        .registry
        .guardians_strict(&child_id)
        .map_err(|_| child_not_found(&child_id))?;

    Ok(Json(ChildView {
        child_id,
        guardians,
    }))
}

#[instrument(skip(state, form))]
async fn record_handover(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
    Form(form): Form<HandoverForm>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    // The signature is written before the registration check; a file stored
    // for an unknown identifier stays on disk unreferenced
    let signature_file = state
        .signatures
        .save_data_uri(&form.signature)
        .map_err(signature_error)?;

    state
        .registry
        .append_handover(
            &child_id,
            HandoverEvent {
                guardian_name: form.name,
                signature_file,
            },
        )
        .map_err(|_| child_not_found(&child_id))?;

    counter!("handover.events").increment(1);
    Ok("Handover recorded. Thank you!".to_string())
}

#[instrument(skip(state))]
async fn edit_form(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
) -> Json<ChildView> {
    let guardians = state.registry.guardians(&child_id);
    Json(ChildView {
        child_id,
        guardians,
    })
}

#[instrument(skip(state, multipart))]
async fn edit_guardians(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, (StatusCode, Json<ErrorResponse>)> {
    let slots = parse_guardian_slots(&mut multipart).await?;

    let mut updated = Vec::new();
    for slot in slots {
        // Start from the echoed stored filename, if it checks out
        let mut photo = slot
            .existing_photo
            .as_deref()
            .and_then(|name| state.images.verify_existing(name));

        // A valid new upload replaces it; the old file is not deleted
        if let Some(saved) = store_photo(&state, slot.photo_upload)? {
            photo = Some(saved);
        }

        // Deletion wins over everything else on the slot, including an
        // upload that was just stored
        if slot.delete {
            continue;
        }

        if !slot.name.is_empty() && !slot.phone.is_empty() {
            updated.push(Guardian {
                name: slot.name,
                phone: slot.phone,
                photo,
            });
        }
    }

    state.registry.replace_guardians(&child_id, updated);
    Ok(Redirect::to(&format!("/child/{child_id}")))
}

#[instrument(skip(state))]
async fn export_pdf(
    Path(child_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let events = state.registry.handover_log(&child_id);

    let bytes = state.pdf.render(&child_id, &events).map_err(|e| {
        error!(child_id = %child_id, error = %e, "Failed to render handover record");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "failed to render handover record".to_string(),
                code: "EXPORT_FAILED".to_string(),
            }),
        )
    })?;

    counter!("handover.exports").increment(1);
    let headers = [
        (header::CONTENT_TYPE, "application/pdf".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"handover_{child_id}.pdf\""),
        ),
    ];
    Ok((headers, bytes))
}

/// Collect the five guardian slots from a multipart submission. Fields
/// outside the known stems or slot range are ignored.
async fn parse_guardian_slots(
    multipart: &mut Multipart,
) -> Result<Vec<GuardianSlot>, (StatusCode, Json<ErrorResponse>)> {
    let mut slots: Vec<GuardianSlot> = (0..MAX_GUARDIANS)
        .map(|_| GuardianSlot::default())
        .collect();

    while let Some(field) = multipart.next_field().await.map_err(malformed_form)? {
        let Some(field_name) = field.name().map(str::to_string) else {
            continue;
        };
        let Some((stem, index)) = slot_field(&field_name) else {
            continue;
        };
        let slot = &mut slots[index - 1];

        match stem {
            "name" => slot.name = field.text().await.map_err(malformed_form)?,
            "phone" => slot.phone = field.text().await.map_err(malformed_form)?,
            "existing_photo" => {
                let value = field.text().await.map_err(malformed_form)?;
                if !value.is_empty() {
                    slot.existing_photo = Some(value);
                }
            }
            "delete" => slot.delete = field.text().await.map_err(malformed_form)? == "on",
            "photo" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(malformed_form)?;
                if !file_name.is_empty() {
                    slot.photo_upload = Some((file_name, bytes.to_vec()));
                }
            }
            _ => {}
        }
    }

    Ok(slots)
}

/// Split a slot field name into its stem and 1-based slot index
fn slot_field(name: &str) -> Option<(&str, usize)> {
    let digits_at = name.find(|c: char| c.is_ascii_digit())?;
    let (stem, digits) = name.split_at(digits_at);
    let index: usize = digits.parse().ok()?;
    if (1..=MAX_GUARDIANS).contains(&index) {
        Some((stem, index))
    } else {
        None
    }
}

/// Store an uploaded photo if one was submitted, counting the outcome
fn store_photo(
    state: &AppState,
    upload: Option<(String, Vec<u8>)>,
) -> Result<Option<String>, (StatusCode, Json<ErrorResponse>)> {
    let Some((file_name, bytes)) = upload else {
        return Ok(None);
    };

    let saved = state.images.save_upload(&file_name, &bytes).map_err(|e| {
        error!(error = %e, "Failed to store upload");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "failed to store upload".to_string(),
                code: "STORAGE_ERROR".to_string(),
            }),
        )
    })?;

    let outcome = if saved.is_some() { "accepted" } else { "rejected" };
    counter!("handover.uploads", "outcome" => outcome).increment(1);
    Ok(saved)
}

fn child_not_found(child_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("child '{child_id}' is not registered"),
            code: "CHILD_NOT_FOUND".to_string(),
        }),
    )
}

fn signature_error(e: SignatureError) -> (StatusCode, Json<ErrorResponse>) {
    match e {
        SignatureError::MissingPayload | SignatureError::Decode(_) => {
            warn!(error = %e, "Rejected signature payload");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "INVALID_SIGNATURE".to_string(),
                }),
            )
        }
        SignatureError::CreateDir { .. } | SignatureError::Write { .. } => {
            error!(error = %e, "Failed to store signature");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to store signature".to_string(),
                    code: "STORAGE_ERROR".to_string(),
                }),
            )
        }
    }
}

fn malformed_form(e: MultipartError) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = %e, "Rejected multipart submission");
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: format!("malformed multipart form: {e}"),
            code: "MALFORMED_FORM".to_string(),
        }),
    )
}
