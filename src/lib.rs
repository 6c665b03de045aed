//! Detección asistida por IA de campos de firma y destinatarios en sobres
//! de documentos, con progreso en streaming NDJSON.

pub mod api;
pub mod app_state;
pub mod client;
pub mod config;
pub mod debug_overlay;
pub mod decoder;
pub mod detector;
pub mod dialog;
pub mod error;
pub mod geometry;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod recipients;
pub mod render;
pub mod store;
pub mod stream;
