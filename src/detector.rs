//! Detector de página: una invocación del modelo por imagen y validación de la
//! forma de su respuesta. No reintenta; la política de reintentos es del orquestador.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DetectionFailure, ModelError};
use crate::llm::{schema_for, ModelImage, StructuredPrompt, VisionModel};
use crate::models::{DetectedRecipient, RawDetectedField, RecipientRole};

pub const DETECT_FIELDS_OPERATION: &str = "detect-fields";
pub const DETECT_RECIPIENTS_OPERATION: &str = "detect-recipients";

/// Forma esperada de la respuesta de detección de campos.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageFieldsOutput {
    pub fields: Vec<RawDetectedField>,
}

/// Destinatario tal cual lo devuelve el modelo.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawDetectedRecipient {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// SIGNER, APPROVER o CC.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub signing_order: Option<i64>,
}

/// Forma esperada de la respuesta de detección de destinatarios.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageRecipientsOutput {
    pub recipients: Vec<RawDetectedRecipient>,
}

/// Detecta los campos de una página.
pub async fn detect_page_fields(
    model: &dyn VisionModel,
    instructions: &str,
    page_number: u32,
    image: ModelImage,
) -> Result<Vec<RawDetectedField>, DetectionFailure> {
    let output: PageFieldsOutput =
        invoke_and_validate(model, DETECT_FIELDS_OPERATION, instructions, page_number, image)
            .await?;
    Ok(output.fields)
}

/// Detecta los destinatarios mencionados en una página.
pub async fn detect_page_recipients(
    model: &dyn VisionModel,
    instructions: &str,
    page_number: u32,
    image: ModelImage,
) -> Result<Vec<DetectedRecipient>, DetectionFailure> {
    let output: PageRecipientsOutput = invoke_and_validate(
        model,
        DETECT_RECIPIENTS_OPERATION,
        instructions,
        page_number,
        image,
    )
    .await?;

    Ok(output
        .recipients
        .into_iter()
        .map(|r| DetectedRecipient {
            name: r.name,
            email: r.email,
            role: r
                .role
                .as_deref()
                .map(RecipientRole::parse_lenient)
                .unwrap_or(RecipientRole::Signer),
            signing_order: r.signing_order.filter(|o| *o > 0),
        })
        .collect())
}

async fn invoke_and_validate<T>(
    model: &dyn VisionModel,
    operation: &'static str,
    instructions: &str,
    page_number: u32,
    image: ModelImage,
) -> Result<T, DetectionFailure>
where
    T: DeserializeOwned + JsonSchema,
{
    let failure = |cause| DetectionFailure {
        operation,
        page_number,
        cause,
    };

    let value = model
        .generate(StructuredPrompt {
            instructions: instructions.to_string(),
            schema: schema_for::<T>(),
            image,
        })
        .await
        .map_err(failure)?;

    serde_json::from_value::<T>(value)
        .map_err(|e| failure(ModelError::SchemaValidation(e.to_string())))
}


#[cfg(test)]
mod tests {
    use super::fakes::ScriptedModel;
    use super::*;
    use crate::llm::ImageFormat;
    use crate::models::FieldType;
    use serde_json::json;

    fn image(page: u8) -> ModelImage {
        ModelImage {
            bytes: vec![page],
            format: ImageFormat::Jpeg,
        }
    }

    #[tokio::test]
    async fn valid_field_output_is_parsed() {
        let model = ScriptedModel::default().with(
            1,
            Ok(json!({"fields": [
                {"boundingBox": [400, 200, 500, 600], "fieldType": "SIGNATURE", "recipientId": 1},
                {"boundingBox": [10, 10, 20, 20], "fieldType": "CHECKBOX", "label": "Acepto", "confidence": 0.8}
            ]})),
        );
        let fields = detect_page_fields(&model, "prompt", 1, image(1)).await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_type, FieldType::Signature);
        assert_eq!(fields[0].recipient_id, Some(1));
        assert_eq!(fields[1].label.as_deref(), Some("Acepto"));
    }

    #[tokio::test]
    async fn wrong_shape_is_schema_validation_failure() {
        let model = ScriptedModel::default().with(
            3,
            Ok(json!({"fields": [{"boundingBox": [1, 2, 3], "fieldType": "SIGNATURE"}]})),
        );
        let err = detect_page_fields(&model, "prompt", 3, image(3)).await.unwrap_err();
        assert_eq!(err.page_number, 3);
        assert_eq!(err.operation, DETECT_FIELDS_OPERATION);
        assert!(matches!(err.cause, ModelError::SchemaValidation(_)));
    }

    #[tokio::test]
    async fn unknown_field_type_is_schema_validation_failure() {
        let model = ScriptedModel::default().with(
            1,
            Ok(json!({"fields": [{"boundingBox": [1, 2, 3, 4], "fieldType": "STAMP"}]})),
        );
        let err = detect_page_fields(&model, "prompt", 1, image(1)).await.unwrap_err();
        assert!(matches!(err.cause, ModelError::SchemaValidation(_)));
    }

    #[tokio::test]
    async fn invocation_errors_are_wrapped_with_page() {
        let model = ScriptedModel::default()
            .with(2, Err(ModelError::Invocation("503 upstream".into())));
        let err = detect_page_fields(&model, "prompt", 2, image(2)).await.unwrap_err();
        assert_eq!(err.page_number, 2);
        assert_eq!(err.cause, ModelError::Invocation("503 upstream".into()));
    }

    #[tokio::test]
    async fn recipient_roles_are_read_leniently() {
        let model = ScriptedModel::default().with(
            1,
            Ok(json!({"recipients": [
                {"name": "Ana", "role": "approver", "signingOrder": 2},
                {"name": "Luis", "signingOrder": 0},
                {"name": "Marta", "role": "cc", "email": "marta@example.com"}
            ]})),
        );
        let recipients = detect_page_recipients(&model, "prompt", 1, image(1))
            .await
            .unwrap();
        assert_eq!(recipients[0].role, RecipientRole::Approver);
        assert_eq!(recipients[1].role, RecipientRole::Signer);
        assert_eq!(recipients[1].signing_order, None);
        assert_eq!(recipients[2].role, RecipientRole::Cc);
    }
}
