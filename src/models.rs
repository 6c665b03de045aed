//! Modelos de dominio del pipeline de detección (páginas, destinatarios y campos).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identificador numérico de un destinatario del sobre.
pub type RecipientId = i64;

/// Petición de detección aceptada por el servidor. Inmutable una vez creada.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub request_id: Uuid,
    pub document_id: String,
    pub team_id: i64,
    pub user_id: i64,
    pub context: Option<String>,
}

impl DetectionRequest {
    pub fn new(document_id: String, team_id: i64, user_id: i64, context: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            document_id,
            team_id,
            user_id,
            context: context.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Sobre de firma: contenedor ordenado de documentos (items).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub team_id: i64,
    pub items: Vec<EnvelopeItem>,
}

#[derive(Debug, Clone)]
pub struct EnvelopeItem {
    pub id: String,
    pub title: String,
    pub order: i64,
}

/// Página rasterizada por el renderizador externo (1-indexada).
#[derive(Clone)]
pub struct PageImage {
    pub envelope_item_id: String,
    pub page_number: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub raster_bytes: Vec<u8>,
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("envelope_item_id", &self.envelope_item_id)
            .field("page_number", &self.page_number)
            .field("pixel_width", &self.pixel_width)
            .field("pixel_height", &self.pixel_height)
            .field("raster_bytes", &self.raster_bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientRole {
    Signer,
    Approver,
    Cc,
}

impl RecipientRole {
    /// Prioridad usada al ordenar el directorio: SIGNER < APPROVER < CC.
    pub fn priority(self) -> u8 {
        match self {
            Self::Signer => 0,
            Self::Approver => 1,
            Self::Cc => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signer => "SIGNER",
            Self::Approver => "APPROVER",
            Self::Cc => "CC",
        }
    }

    /// Interpreta el rol que devuelve el modelo o la base de datos.
    /// Cualquier valor desconocido se trata como firmante.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "APPROVER" => Self::Approver,
            "CC" | "VIEWER" => Self::Cc,
            _ => Self::Signer,
        }
    }
}

/// Entrada del directorio de destinatarios conocido para una petición.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientDirectoryEntry {
    pub id: RecipientId,
    pub display_name: String,
    pub email: Option<String>,
    pub role: RecipientRole,
    pub signing_order: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Signature,
    Initials,
    Name,
    Email,
    Date,
    Text,
    Number,
    Checkbox,
    Radio,
    Dropdown,
}

impl FieldType {
    pub const ALL: [FieldType; 10] = [
        Self::Signature,
        Self::Initials,
        Self::Name,
        Self::Email,
        Self::Date,
        Self::Text,
        Self::Number,
        Self::Checkbox,
        Self::Radio,
        Self::Dropdown,
    ];

    /// Campos cuya pista visual es una línea horizontal y que hay que expandir.
    pub fn is_line_based(self) -> bool {
        !matches!(self, Self::Checkbox | Self::Radio | Self::Dropdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signature => "SIGNATURE",
            Self::Initials => "INITIALS",
            Self::Name => "NAME",
            Self::Email => "EMAIL",
            Self::Date => "DATE",
            Self::Text => "TEXT",
            Self::Number => "NUMBER",
            Self::Checkbox => "CHECKBOX",
            Self::Radio => "RADIO",
            Self::Dropdown => "DROPDOWN",
        }
    }
}

/// Caja `[ymin, xmin, ymax, xmax]` en la escala 0..1000 que devuelve el modelo.
pub type BoundingBox = [f64; 4];

/// Campo tal cual lo devuelve el modelo para una página.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawDetectedField {
    /// `[ymin, xmin, ymax, xmax]`, cada valor entre 0 y 1000.
    pub bounding_box: BoundingBox,
    pub field_type: FieldType,
    #[serde(default)]
    pub recipient_id: Option<RecipientId>,
    /// Etiqueta visible junto al campo ("Firma del cliente", "Fecha"...).
    #[serde(default)]
    pub label: Option<String>,
    /// Confianza del modelo entre 0 y 1.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Campo listo para revisión en el cliente. Posición y tamaño en fracción de página.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub position_x: f64,
    pub position_y: f64,
    pub width: f64,
    pub height: f64,
    pub page_number: u32,
    pub confidence: f64,
    pub recipient_id: RecipientId,
    pub envelope_item_id: String,
}

/// Destinatario propuesto por el flujo de detección de destinatarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRecipient {
    pub name: String,
    pub email: Option<String>,
    pub role: RecipientRole,
    pub signing_order: Option<i64>,
}

/// Usuario autenticado y autorizado sobre un equipo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedUser {
    pub user_id: i64,
    pub team_id: i64,
}
