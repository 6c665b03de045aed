use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::{
    app_state::AppState,
    error::{ApiError, PipelineError},
    models::{AuthorizedUser, DetectedRecipient, DetectionRequest, Envelope, NormalizedField, PageImage},
    recipients::RecipientDirectory,
    store::Authorization,
    stream::{spawn_event_stream, Detected, ProgressReporter, NDJSON_CONTENT_TYPE},
};

/// Longitud máxima del contexto libre que acompaña a la detección de campos.
const MAX_CONTEXT_CHARS: usize = 2000;

// --- Payloads ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectFieldsPayload {
    #[serde(default)]
    envelope_id: String,
    team_id: i64,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRecipientsPayload {
    #[serde(default)]
    envelope_id: String,
    team_id: i64,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/detect-fields", post(detect_fields_handler))
        .route("/detect-recipients", post(detect_recipients_handler));

    if app_state.config.debug_overlay {
        router = router.nest_service("/debug", ServeDir::new(&app_state.config.debug_dir));
    }

    router.with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "aiFeaturesEnabled": state.config.ai_features_enabled,
    }))
}

#[axum::debug_handler]
async fn detect_fields_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let token = pre_auth(&state, &headers)?;
    let payload: DetectFieldsPayload = parse_body(&body)?;
    let user = authorize(&state, token, payload.team_id).await?;

    if payload.envelope_id.trim().is_empty() {
        return Err(ApiError::Validation("envelopeId es obligatorio".into()));
    }
    if let Some(context) = &payload.context {
        if context.chars().count() > MAX_CONTEXT_CHARS {
            return Err(ApiError::Validation(format!(
                "El contexto no puede superar {MAX_CONTEXT_CHARS} caracteres"
            )));
        }
    }

    let envelope = find_envelope(&state, &payload.envelope_id, user.team_id).await?;
    let entries = state.store.lookup_recipients(&envelope.id).await?;
    let directory = RecipientDirectory::new(entries)
        .ok_or_else(|| ApiError::Validation(PipelineError::NoRecipients.user_message()))?;

    let request = DetectionRequest::new(envelope.id.clone(), user.team_id, user.user_id, payload.context);
    info!(
        request_id = %request.request_id,
        envelope_id = %envelope.id,
        user_id = user.user_id,
        "Petición de detección de campos aceptada"
    );

    let policy = state.config.recipient_policy;
    let keepalive = state.pipeline.settings().keepalive_interval;
    Ok(ndjson_response::<NormalizedField, _>(keepalive, move |reporter| async move {
        let pages = render_envelope(&state, &envelope)
            .await
            .map_err(|e| fail(&request, e))?;
        state
            .pipeline
            .detect_fields(&request, &pages, &directory, policy, |p| reporter.report(p))
            .await
            .map_err(|e| fail(&request, e))
    }))
}

#[axum::debug_handler]
async fn detect_recipients_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let token = pre_auth(&state, &headers)?;
    let payload: DetectRecipientsPayload = parse_body(&body)?;
    let user = authorize(&state, token, payload.team_id).await?;

    if payload.envelope_id.trim().is_empty() {
        return Err(ApiError::Validation("envelopeId es obligatorio".into()));
    }
    let envelope = find_envelope(&state, &payload.envelope_id, user.team_id).await?;

    let request = DetectionRequest::new(envelope.id.clone(), user.team_id, user.user_id, None);
    info!(
        request_id = %request.request_id,
        envelope_id = %envelope.id,
        user_id = user.user_id,
        "Petición de detección de destinatarios aceptada"
    );

    let keepalive = state.pipeline.settings().keepalive_interval;
    Ok(ndjson_response::<DetectedRecipient, _>(keepalive, move |reporter| async move {
        let pages = render_envelope(&state, &envelope)
            .await
            .map_err(|e| fail(&request, e))?;
        state
            .pipeline
            .detect_recipients(&request, &pages, |p| reporter.report(p))
            .await
            .map_err(|e| fail(&request, e))
    }))
}

// --- Comprobaciones previas al stream ---

/// IA habilitada y token Bearer presente.
fn pre_auth<'h>(state: &AppState, headers: &'h HeaderMap) -> Result<&'h str, ApiError> {
    if !state.config.ai_features_enabled {
        return Err(ApiError::NotConfigured);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Cuerpo de la petición inválido: {e}")))
}

/// Pertenencia al equipo y límite de peticiones del usuario.
async fn authorize(state: &AppState, token: &str, team_id: i64) -> Result<AuthorizedUser, ApiError> {
    let user = match state.store.authorize(token, team_id).await? {
        Authorization::Granted(user) => user,
        Authorization::UnknownToken => return Err(ApiError::Unauthorized),
        Authorization::NotAMember => {
            warn!(team_id, "Acceso denegado: el usuario no pertenece al equipo");
            return Err(ApiError::Forbidden);
        }
    };

    if let Err(retry_after) = state.rate_limiter.check(user.user_id).await {
        warn!(user_id = user.user_id, retry_after, "Límite de peticiones de IA alcanzado");
        return Err(ApiError::RateLimited { retry_after });
    }
    Ok(user)
}

async fn find_envelope(state: &AppState, envelope_id: &str, team_id: i64) -> Result<Envelope, ApiError> {
    let envelope = state
        .store
        .find_envelope(envelope_id, team_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Sobre no encontrado: {envelope_id}")))?;
    if envelope.items.is_empty() {
        return Err(ApiError::Validation("El sobre no contiene documentos".into()));
    }
    Ok(envelope)
}

// --- Stream ---

fn ndjson_response<T, Fut>(
    keepalive: Duration,
    work: impl FnOnce(ProgressReporter) -> Fut,
) -> Response
where
    T: Detected,
    Fut: std::future::Future<Output = Result<Vec<T>, String>> + Send + 'static,
{
    let stream = spawn_event_stream(keepalive, work);
    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Renderiza los items del sobre en orden y concatena sus páginas.
async fn render_envelope(state: &AppState, envelope: &Envelope) -> Result<Vec<PageImage>, PipelineError> {
    let mut items = envelope.items.clone();
    items.sort_by_key(|item| item.order);

    let mut pages = Vec::new();
    for item in &items {
        let rendered = state
            .pages
            .render_document_pages(item)
            .await
            .map_err(|e| PipelineError::Render(format!("item {}: {e:#}", item.id)))?;
        pages.extend(rendered);
    }
    Ok(pages)
}

/// Registra el error completo y devuelve sólo el mensaje normalizado.
fn fail(request: &DetectionRequest, err: PipelineError) -> String {
    match &err {
        PipelineError::Render(_) | PipelineError::AllPagesFailed { .. } => {
            error!(request_id = %request.request_id, "Detección fallida: {}", err)
        }
        _ => warn!(request_id = %request.request_id, "Detección rechazada: {}", err),
    }
    err.user_message()
}
