//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + detección).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::recipients::RecipientResolutionPolicy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Parámetros del pipeline de detección que no dependen de la infraestructura.
#[derive(Clone, Debug)]
pub struct DetectionSettings {
    /// Intervalo entre líneas `keepalive` del stream NDJSON.
    pub keepalive_interval: Duration,
    /// Lado mayor (px) de la imagen que se envía al modelo.
    pub model_image_max_dimension: u32,
    pub model_image_jpeg_quality: u8,
    /// La detección de destinatarios sólo analiza las primeras N páginas.
    pub recipient_max_pages: usize,
    pub placeholder_email_domain: String,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            model_image_max_dimension: 1000,
            model_image_jpeg_quality: 80,
            recipient_max_pages: 3,
            placeholder_email_domain: "recipient.invalid".to_string(),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub ai_features_enabled: bool,
    pub llm_provider: LlmProvider,
    pub llm_vision_model: String,

    pub pages_dir: PathBuf,
    pub rate_limit_per_minute: u64,
    /// Política ante destinatarios inventados por el modelo (estricta por defecto).
    pub recipient_policy: RecipientResolutionPolicy,
    pub debug_overlay: bool,
    pub debug_dir: PathBuf,

    pub detection: DetectionSettings,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let ai_features_enabled = parse_var("AI_FEATURES_ENABLED", true)?;

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_vision_model =
            env::var("LLM_VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let pages_dir = env::var("PAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./pages"));

        let defaults = DetectionSettings::default();
        let detection = DetectionSettings {
            keepalive_interval: Duration::from_secs(parse_var(
                "KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval.as_secs(),
            )?),
            model_image_max_dimension: parse_var(
                "MODEL_IMAGE_MAX_DIMENSION",
                defaults.model_image_max_dimension,
            )?,
            model_image_jpeg_quality: parse_var(
                "MODEL_IMAGE_JPEG_QUALITY",
                defaults.model_image_jpeg_quality,
            )?,
            recipient_max_pages: parse_var(
                "RECIPIENT_DETECTION_MAX_PAGES",
                defaults.recipient_max_pages,
            )?,
            placeholder_email_domain: env::var("PLACEHOLDER_EMAIL_DOMAIN")
                .unwrap_or(defaults.placeholder_email_domain),
        };

        if detection.keepalive_interval.is_zero() {
            return Err(anyhow!("KEEPALIVE_INTERVAL_SECS debe ser mayor que 0"));
        }

        let rate_limit_per_minute = parse_var("AI_RATE_LIMIT_PER_MINUTE", 10u64)?;
        let recipient_policy = if parse_var("AI_LENIENT_RECIPIENTS", false)? {
            RecipientResolutionPolicy::Lenient
        } else {
            RecipientResolutionPolicy::Strict
        };
        let debug_overlay = parse_var("AI_DEBUG_OVERLAY", false)?;
        let debug_dir = match env::var("AI_DEBUG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join("firma-detect")
                .join("debug"),
        };

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            ai_features_enabled,
            llm_provider,
            llm_vision_model,
            pages_dir,
            rate_limit_per_minute,
            recipient_policy,
            debug_overlay,
            debug_dir,
            detection,
        })
    }
}

/// Lee una variable opcional; si existe pero no se puede interpretar es un error.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {name} ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}
