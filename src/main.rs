use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use firma_detect::{
    api,
    app_state::{AppState, RateLimiter},
    config::AppConfig,
    debug_overlay::DebugOverlay,
    llm::LlmManager,
    orchestrator::DetectionPipeline,
    render::DirectoryPageSource,
    store::{self, Neo4jStore},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = store::connect_from_config(&cfg)
        .await
        .context("Error conectando a Neo4j")?;
    store::ensure_schema(&graph)
        .await
        .context("Error asegurando el esquema de Neo4j")?;

    // 4. Modelo de visión y pipeline de detección
    let llm_manager = LlmManager::from_config(&cfg);
    info!(
        provider = ?llm_manager.provider,
        model = %llm_manager.vision_model,
        "Modelo de visión configurado"
    );
    if !cfg.ai_features_enabled {
        warn!("AI_FEATURES_ENABLED=false: las rutas de detección responderán 400");
    }

    let overlay = if cfg.debug_overlay {
        std::fs::create_dir_all(&cfg.debug_dir).with_context(|| {
            format!("No se pudo crear el directorio de depuración {}", cfg.debug_dir.display())
        })?;
        info!("Superposiciones de depuración en {}", cfg.debug_dir.display());
        Some(DebugOverlay::new(&cfg.debug_dir))
    } else {
        None
    };
    let pipeline = DetectionPipeline::new(Arc::new(llm_manager), cfg.detection.clone())
        .with_overlay(overlay);

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store: Arc::new(Neo4jStore::new(Arc::new(graph))),
        pages: Arc::new(DirectoryPageSource::new(&cfg.pages_dir)),
        pipeline,
        rate_limiter: Arc::new(RateLimiter::per_minute(cfg.rate_limit_per_minute)),
    };

    // 6. Configurar el router de la API
    let app = Router::new().merge(api::create_router(app_state)).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
