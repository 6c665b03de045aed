//! Stream de progreso NDJSON: una línea JSON por evento, terminada en `\n`.
//!
//! Por cada petición el servidor abre el stream, emite `progress` y
//! `keepalive` mientras trabaja y cierra con exactamente un evento terminal
//! (`complete` o `error`).

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use futures::channel::mpsc as stream_mpsc;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::StreamProtocolError;
use crate::models::{DetectedRecipient, NormalizedField};
use crate::orchestrator::PageProgress;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Resultado que viaja en el evento `complete`. Cada variante del protocolo
/// usa sus propias claves para el contador y la lista.
pub trait Detected: Serialize + DeserializeOwned + Send + 'static {
    const COUNT_KEY: &'static str;
    const LIST_KEY: &'static str;
}

impl Detected for NormalizedField {
    const COUNT_KEY: &'static str = "fieldsDetected";
    const LIST_KEY: &'static str = "fields";
}

impl Detected for DetectedRecipient {
    const COUNT_KEY: &'static str = "recipientsDetected";
    const LIST_KEY: &'static str = "recipients";
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Progress(PageProgress),
    Keepalive,
    Complete(Vec<T>),
    Error(String),
}

impl<T: Detected> StreamEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    /// Serializa el evento como una línea NDJSON.
    pub fn to_line(&self) -> String {
        let value = match self {
            Self::Progress(p) => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("progress"));
                obj.insert("pagesProcessed".into(), json!(p.pages_processed));
                obj.insert("totalPages".into(), json!(p.total_pages));
                obj.insert(T::COUNT_KEY.into(), json!(p.detected_so_far));
                Value::Object(obj)
            }
            Self::Keepalive => json!({ "type": "keepalive" }),
            Self::Complete(items) => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("complete"));
                obj.insert(
                    T::LIST_KEY.into(),
                    serde_json::to_value(items).unwrap_or_else(|_| Value::Array(Vec::new())),
                );
                Value::Object(obj)
            }
            Self::Error(message) => json!({ "type": "error", "message": message }),
        };
        format!("{value}\n")
    }

    /// Interpreta una línea (sin el `\n`) como evento tipado.
    pub fn from_line(line: &str) -> Result<Self, StreamProtocolError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| StreamProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(StreamProtocolError::MissingType)?;

        let malformed = |reason: String| StreamProtocolError::MalformedEvent {
            kind: kind.to_string(),
            reason,
        };
        let count = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| malformed(format!("falta '{key}'")))
        };

        match kind {
            "progress" => Ok(Self::Progress(PageProgress {
                pages_processed: count("pagesProcessed")?,
                total_pages: count("totalPages")?,
                detected_so_far: count(T::COUNT_KEY)?,
            })),
            "keepalive" => Ok(Self::Keepalive),
            "complete" => {
                let items = value
                    .get(T::LIST_KEY)
                    .cloned()
                    .ok_or_else(|| malformed(format!("falta '{}'", T::LIST_KEY)))?;
                serde_json::from_value(items)
                    .map(Self::Complete)
                    .map_err(|e| malformed(e.to_string()))
            }
            "error" => value
                .get("message")
                .and_then(Value::as_str)
                .map(|m| Self::Error(m.to_string()))
                .ok_or_else(|| malformed("falta 'message'".to_string())),
            other => Err(StreamProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Canal por el que el trabajo informa del progreso de cada página.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<PageProgress>,
}

impl ProgressReporter {
    pub fn report(&self, progress: PageProgress) {
        // Si el stream ya se cerró no hay a quién avisar.
        let _ = self.tx.send(progress);
    }
}

/// Ejecuta `work` en una tarea propia y devuelve el cuerpo NDJSON.
///
/// El temporizador de keepalive vive dentro de la tarea y se libera en
/// cualquier salida. Si el cliente se desconecta la tarea termina y el
/// trabajo en curso se cancela.
pub fn spawn_event_stream<T, F, Fut>(
    keepalive_interval: Duration,
    work: F,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static
where
    T: Detected,
    F: FnOnce(ProgressReporter) -> Fut,
    Fut: Future<Output = Result<Vec<T>, String>> + Send + 'static,
{
    let (line_tx, line_rx) = stream_mpsc::unbounded::<String>();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let work = work(ProgressReporter { tx: progress_tx });

    tokio::spawn(async move {
        let send = |event: StreamEvent<T>| line_tx.unbounded_send(event.to_line());

        tokio::pin!(work);
        let mut keepalive = interval_at(Instant::now() + keepalive_interval, keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                Some(progress) = progress_rx.recv() => {
                    if send(StreamEvent::Progress(progress)).is_err() {
                        debug!("Cliente desconectado; se cancela la detección");
                        return;
                    }
                }
                _ = keepalive.tick() => {
                    if send(StreamEvent::Keepalive).is_err() {
                        debug!("Cliente desconectado; se cancela la detección");
                        return;
                    }
                }
            }
        };
        drop(keepalive);

        while let Ok(progress) = progress_rx.try_recv() {
            let _ = send(StreamEvent::Progress(progress));
        }

        let terminal = match outcome {
            Ok(items) => StreamEvent::Complete(items),
            Err(message) => StreamEvent::Error(message),
        };
        let _ = send(terminal);
    });

    line_rx.map(Ok)
}
