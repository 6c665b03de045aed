//! Taxonomía de errores del pipeline de detección y de la API HTTP.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::RecipientId;

/// Fallo al invocar el modelo multimodal o al validar su respuesta.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("error invocando el modelo: {0}")]
    Invocation(String),
    #[error("la respuesta del modelo no cumple el esquema: {0}")]
    SchemaValidation(String),
}

/// Fallo de detección de una página concreta.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{operation} falló en la página {page_number}: {cause}")]
pub struct DetectionFailure {
    pub operation: &'static str,
    pub page_number: u32,
    #[source]
    pub cause: ModelError,
}

/// El modelo asignó un campo a un destinatario que no pertenece al directorio.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("destinatario {recipient_id} inválido para el campo '{field_label}'")]
pub struct InvalidRecipientAssignment {
    pub recipient_id: RecipientId,
    pub field_label: String,
}

/// Errores que abortan una petición completa de detección.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("el documento no tiene destinatarios")]
    NoRecipients,
    #[error("el documento no tiene páginas")]
    NoPages,
    #[error("la detección falló en todas las páginas ({failed})")]
    AllPagesFailed { failed: usize },
    #[error("error renderizando el documento: {0}")]
    Render(String),
    #[error(transparent)]
    InvalidRecipientAssignment(#[from] InvalidRecipientAssignment),
}

impl PipelineError {
    /// Mensaje normalizado para el usuario final (nunca texto del proveedor).
    pub fn user_message(&self) -> String {
        match self {
            Self::NoRecipients => {
                "Añade al menos un destinatario antes de detectar campos.".to_string()
            }
            Self::NoPages => "El documento no contiene páginas.".to_string(),
            Self::AllPagesFailed { .. } => {
                "No se pudieron detectar campos en el documento. Inténtalo de nuevo.".to_string()
            }
            Self::Render(_) => "No se pudo procesar el documento.".to_string(),
            Self::InvalidRecipientAssignment(_) => {
                "La IA asignó un campo a un destinatario desconocido. Inténtalo de nuevo."
                    .to_string()
            }
        }
    }
}

/// Errores previos a abrir el stream: se devuelven como JSON normal.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("autenticación requerida")]
    Unauthorized,
    #[error("no tienes acceso a este equipo")]
    Forbidden,
    #[error("las funciones de IA no están habilitadas")]
    NotConfigured,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("demasiadas peticiones, inténtalo de nuevo en un minuto")]
    RateLimited { retry_after: u64 },
    #[error("error interno del servidor")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotConfigured | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::RateLimited { retry_after } => {
                json!({ "error": self.to_string(), "retry_after": retry_after })
            }
            Self::Internal(detail) => {
                tracing::error!("Error interno en la API: {}", detail);
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Línea del stream que no se pudo interpretar como evento.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamProtocolError {
    #[error("línea no es JSON válido: {0}")]
    InvalidJson(String),
    #[error("evento sin campo 'type'")]
    MissingType,
    #[error("tipo de evento desconocido: {0}")]
    UnknownType(String),
    #[error("evento '{kind}' mal formado: {reason}")]
    MalformedEvent { kind: String, reason: String },
}

/// Errores del cliente de detección.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rechazo previo al stream: respuesta JSON normal con código HTTP.
    #[error("la API respondió {status}: {message}")]
    Api { status: u16, message: String },
    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL inválida: {0}")]
    Url(#[from] url::ParseError),
    #[error("el stream terminó sin evento final")]
    StreamEnded,
    #[error("detección cancelada")]
    Aborted,
    /// Evento `error` recibido dentro del stream.
    #[error("{0}")]
    Remote(String),
}

impl ClientError {
    /// Código HTTP asociado, si el fallo lo tiene.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_http_status() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotConfigured.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::RateLimited { retry_after: 30 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn client_errors_expose_status() {
        let limited = ClientError::Api {
            status: 429,
            message: "demasiadas peticiones".into(),
        };
        assert!(limited.is_rate_limited());
        assert_eq!(ClientError::Remote("x".into()).status(), None);
        assert!(!ClientError::Aborted.is_rate_limited());
    }

    #[test]
    fn user_messages_hide_internal_detail() {
        let err = PipelineError::Render("pdfium: segfault at 0x0".into());
        assert!(!err.user_message().contains("pdfium"));
    }

    #[test]
    fn detection_failure_names_page_and_cause() {
        let failure = DetectionFailure {
            operation: "detect-fields",
            page_number: 4,
            cause: ModelError::Invocation("timeout".into()),
        };
        let text = failure.to_string();
        assert!(text.contains("página 4"));
        assert!(text.contains("timeout"));
    }
}
