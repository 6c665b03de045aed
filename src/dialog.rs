//! Máquina de estados del diálogo de detección en el cliente.
//!
//! `PROMPT → PROCESSING → REVIEW | ERROR | RATE_LIMITED`, y de vuelta a
//! `PROMPT` al confirmar, cancelar o cerrar.

use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{
    AbortSignal, DetectFieldsParams, DetectRecipientsParams, DetectionClient, StreamHandler,
};
use crate::error::ClientError;
use crate::models::{DetectedRecipient, NormalizedField};
use crate::orchestrator::PageProgress;

/// Mensajes rotatorios mientras se procesa. Sólo presentación.
pub const PROCESSING_MESSAGES: [&str; 5] = [
    "Leyendo el documento...",
    "Buscando líneas de firma...",
    "Identificando campos rellenables...",
    "Asignando destinatarios...",
    "Ajustando posiciones...",
];

const RATE_LIMITED_STATUS: u16 = 429;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Prompt,
    Processing,
    Review,
    Error,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DialogEvent<T> {
    /// El usuario lanza la detección.
    Start,
    Progress(PageProgress),
    Completed(Vec<T>),
    /// Evento `error` del stream o excepción, con su código HTTP si lo hay.
    Failed { status: Option<u16>, message: String },
    Confirm,
    Cancel,
    Retry,
    Close,
}

impl<T> DialogEvent<T> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress(_) => "progress",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialogError {
    #[error("transición ilegal: '{event}' en el estado {from:?}")]
    IllegalTransition {
        from: DialogState,
        event: &'static str,
    },
}

/// Función de transición pura.
pub fn next_state<T>(from: DialogState, event: &DialogEvent<T>) -> Result<DialogState, DialogError> {
    use DialogState as S;
    let to = match (from, event) {
        (S::Prompt, DialogEvent::Start) => Some(S::Processing),
        (S::Processing, DialogEvent::Progress(_)) => Some(S::Processing),
        (S::Processing, DialogEvent::Completed(_)) => Some(S::Review),
        (S::Processing, DialogEvent::Failed { status, .. }) => {
            if *status == Some(RATE_LIMITED_STATUS) {
                Some(S::RateLimited)
            } else {
                Some(S::Error)
            }
        }
        (S::Processing, DialogEvent::Cancel) => Some(S::Prompt),
        (S::Review, DialogEvent::Confirm | DialogEvent::Cancel) => Some(S::Prompt),
        (S::Error | S::RateLimited, DialogEvent::Retry) => Some(S::Processing),
        (S::Error | S::RateLimited, DialogEvent::Close) => Some(S::Prompt),
        _ => None,
    };
    to.ok_or(DialogError::IllegalTransition {
        from,
        event: event.name(),
    })
}

/// Diálogo de detección: estado más los datos que muestra cada pantalla.
#[derive(Debug)]
pub struct DetectionDialog<T> {
    state: DialogState,
    results: Option<Vec<T>>,
    progress: Option<PageProgress>,
    error_message: Option<String>,
}

impl<T> Default for DetectionDialog<T> {
    fn default() -> Self {
        Self {
            state: DialogState::Prompt,
            results: None,
            progress: None,
            error_message: None,
        }
    }
}

impl<T> DetectionDialog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    /// Resultados pendientes de revisión.
    pub fn results(&self) -> Option<&[T]> {
        self.results.as_deref()
    }

    /// Último `pagesProcessed/totalPages` recibido.
    pub fn progress(&self) -> Option<PageProgress> {
        self.progress
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Mensaje rotatorio para el paso `tick` del temporizador de la interfaz.
    pub fn processing_message(&self, tick: usize) -> Option<&'static str> {
        (self.state == DialogState::Processing)
            .then(|| PROCESSING_MESSAGES[tick % PROCESSING_MESSAGES.len()])
    }

    /// Aplica un evento. Al confirmar devuelve los resultados revisados.
    pub fn apply(&mut self, event: DialogEvent<T>) -> Result<Option<Vec<T>>, DialogError> {
        let to = next_state(self.state, &event)?;
        debug!(from = ?self.state, to = ?to, event = event.name(), "Transición del diálogo");

        let mut confirmed = None;
        match event {
            DialogEvent::Start | DialogEvent::Retry => {
                self.progress = None;
                self.error_message = None;
                self.results = None;
            }
            DialogEvent::Progress(progress) => self.progress = Some(progress),
            DialogEvent::Completed(items) => self.results = Some(items),
            DialogEvent::Failed { message, .. } => self.error_message = Some(message),
            DialogEvent::Confirm => confirmed = self.results.take(),
            DialogEvent::Cancel | DialogEvent::Close => {}
        }

        self.state = to;
        if to == DialogState::Prompt {
            self.results = None;
            self.progress = None;
            self.error_message = None;
        }
        Ok(confirmed)
    }

    fn begin(&mut self) -> Result<(), DialogError> {
        let event = match self.state {
            DialogState::Error | DialogState::RateLimited => DialogEvent::Retry,
            _ => DialogEvent::Start,
        };
        self.apply(event).map(|_| ())
    }

    fn settle(&mut self, outcome: Result<Vec<T>, ClientError>) -> Result<DialogState, DialogError> {
        let event = match outcome {
            Ok(items) => DialogEvent::Completed(items),
            Err(ClientError::Aborted) => DialogEvent::Cancel,
            Err(err) => {
                warn!("Detección fallida en el cliente: {}", err);
                DialogEvent::Failed {
                    status: err.status(),
                    message: user_message(&err),
                }
            }
        };
        self.apply(event)?;
        Ok(self.state)
    }
}

impl<T> StreamHandler<T> for DetectionDialog<T> {
    fn on_progress(&mut self, progress: PageProgress) {
        if let Err(e) = self.apply(DialogEvent::Progress(progress)) {
            debug!("Progreso ignorado: {}", e);
        }
    }
}

impl DetectionDialog<NormalizedField> {
    /// Lanza (o reintenta) la detección de campos y lleva el diálogo hasta
    /// `REVIEW`, `ERROR`, `RATE_LIMITED` o, si se cancela, `PROMPT`.
    pub async fn run_fields(
        &mut self,
        client: &DetectionClient,
        params: &DetectFieldsParams,
        abort: &AbortSignal,
    ) -> Result<DialogState, DialogError> {
        self.begin()?;
        let outcome = client.detect_fields(params, self, abort).await;
        self.settle(outcome)
    }
}

impl DetectionDialog<DetectedRecipient> {
    pub async fn run_recipients(
        &mut self,
        client: &DetectionClient,
        params: &DetectRecipientsParams,
        abort: &AbortSignal,
    ) -> Result<DialogState, DialogError> {
        self.begin()?;
        let outcome = client.detect_recipients(params, self, abort).await;
        self.settle(outcome)
    }
}

/// Mensaje para el usuario: nunca texto interno del transporte.
fn user_message(err: &ClientError) -> String {
    match err {
        e if e.is_rate_limited() => {
            "Has alcanzado el límite de detecciones. Inténtalo de nuevo en un minuto.".to_string()
        }
        ClientError::Api { message, .. } | ClientError::Remote(message) => message.clone(),
        _ => "No se pudo completar la detección. Inténtalo de nuevo.".to_string(),
    }
}
