//! Abstracción sobre Rig para invocar modelos multimodales con salida estructurada.
//! Implementado para OpenAI y Gemini; Ollama queda preparado para el futuro.

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use rig::completion::message::{ImageMediaType, Message, UserContent};
use rig::completion::Prompt;
use rig::OneOrMany;
use schemars::JsonSchema;
use serde_json::Value;
use tracing::debug;

use crate::config::{AppConfig, LlmProvider};
use crate::error::ModelError;

/// Formato de la imagen que se adjunta al modelo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

/// Imagen de página ya comprimida para el modelo.
#[derive(Debug, Clone)]
pub struct ModelImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

/// Petición de generación estructurada: instrucciones, esquema esperado e imagen.
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    pub instructions: String,
    pub schema: Value,
    pub image: ModelImage,
}

/// Colaborador que invoca al modelo y devuelve el objeto JSON generado.
///
/// La validación de forma la hace quien llama; aquí sólo se exige JSON.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, prompt: StructuredPrompt) -> Result<Value, ModelError>;
}

/// Esquema JSON de un tipo de salida, listo para incrustar en las instrucciones.
pub fn schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// Gestor de LLMs con capacidad de visión.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub vision_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            vision_model: cfg.llm_vision_model.clone(),
        }
    }

    fn preamble(prompt: &StructuredPrompt) -> String {
        let schema = serde_json::to_string_pretty(&prompt.schema).unwrap_or_default();
        format!(
            "{}\n\nLa salida DEBE ser un único objeto JSON válido que cumpla este JSON Schema:\n{}\n\nNo incluyas explicaciones, solo el JSON.",
            prompt.instructions, schema
        )
    }

    async fn prompt_with_openai(&self, preamble: &str, message: Message) -> Result<String, ModelError> {
        use rig::client::{CompletionClient as _, ProviderClient as _};
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let agent = client.agent(&self.vision_model).preamble(preamble).build();
        agent
            .prompt(message)
            .await
            .map_err(|e| ModelError::Invocation(e.to_string()))
    }

    async fn prompt_with_gemini(&self, preamble: &str, message: Message) -> Result<String, ModelError> {
        use rig::client::{CompletionClient as _, ProviderClient as _};
        use rig::providers::gemini;

        let client = gemini::Client::from_env();
        let agent = client.agent(&self.vision_model).preamble(preamble).build();
        agent
            .prompt(message)
            .await
            .map_err(|e| ModelError::Invocation(e.to_string()))
    }
}

#[async_trait]
impl VisionModel for LlmManager {
    async fn generate(&self, prompt: StructuredPrompt) -> Result<Value, ModelError> {
        let preamble = Self::preamble(&prompt);
        let message = build_image_message(&prompt.image)?;

        let response = match self.provider {
            LlmProvider::OpenAI => self.prompt_with_openai(&preamble, message).await?,
            LlmProvider::Gemini => self.prompt_with_gemini(&preamble, message).await?,
            ref other => {
                return Err(ModelError::Invocation(format!(
                    "Proveedor LLM {:?} aún no implementado para visión",
                    other
                )))
            }
        };

        debug!(chars = response.len(), "Respuesta del modelo recibida");
        parse_model_json(&response)
    }
}

fn build_image_message(image: &ModelImage) -> Result<Message, ModelError> {
    let media_type = match image.format {
        ImageFormat::Jpeg => ImageMediaType::JPEG,
        ImageFormat::Png => ImageMediaType::PNG,
    };
    let content = OneOrMany::many(vec![
        UserContent::text("Analiza esta página del documento y responde sólo con el JSON."),
        UserContent::image_base64(BASE64_STANDARD.encode(&image.bytes), Some(media_type), None),
    ])
    .map_err(|e| ModelError::Invocation(e.to_string()))?;
    Ok(Message::User { content })
}

/// Limpia la respuesta del LLM (bloques ```json) y la interpreta como JSON.
pub fn parse_model_json(response: &str) -> Result<Value, ModelError> {
    let json_response = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str::<Value>(json_response)
        .map_err(|e| ModelError::SchemaValidation(format!("JSON inválido: {e}")))
}
