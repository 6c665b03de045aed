//! Cliente HTTP de la API de detección: consume el stream NDJSON y despacha
//! los eventos a un `StreamHandler`.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::decoder::NdjsonDecoder;
use crate::error::ClientError;
use crate::models::{DetectedRecipient, NormalizedField};
use crate::orchestrator::PageProgress;
use crate::stream::{Detected, StreamEvent};

/// Receptor de los eventos de un stream de detección.
pub trait StreamHandler<T> {
    fn on_progress(&mut self, _progress: PageProgress) {}

    fn on_complete(&mut self, _items: &[T]) {}

    fn on_error(&mut self, _message: &str) {}
}

/// Handler que ignora todos los eventos.
impl<T> StreamHandler<T> for () {}

/// Lado que dispara la cancelación.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Señal de cancelación que observa el lector del stream.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn pair() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
    }

    /// Señal que nunca se dispara.
    pub fn never() -> AbortSignal {
        let (_tx, rx) = watch::channel(false);
        AbortSignal { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Se completa cuando se cancela. Si el `AbortHandle` desaparece sin
    /// cancelar, no se completa nunca.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectFieldsParams {
    pub envelope_id: String,
    pub team_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRecipientsParams {
    pub envelope_id: String,
    pub team_id: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Cliente de la API de detección.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    http: reqwest::Client,
    base_url: Url,
    api_token: String,
}

impl DetectionClient {
    /// `base_url` como `http://localhost:3322`; la barra final es opcional.
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Result<Self, ClientError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_token: api_token.into(),
        })
    }

    pub async fn detect_fields(
        &self,
        params: &DetectFieldsParams,
        handler: &mut impl StreamHandler<NormalizedField>,
        abort: &AbortSignal,
    ) -> Result<Vec<NormalizedField>, ClientError> {
        self.stream("detect-fields", params, handler, abort).await
    }

    pub async fn detect_recipients(
        &self,
        params: &DetectRecipientsParams,
        handler: &mut impl StreamHandler<DetectedRecipient>,
        abort: &AbortSignal,
    ) -> Result<Vec<DetectedRecipient>, ClientError> {
        self.stream("detect-recipients", params, handler, abort).await
    }

    /// Abre el stream y despacha eventos hasta el primero terminal.
    ///
    /// El cuerpo de la respuesta se suelta en cualquier salida: terminal,
    /// error de red o cancelación.
    async fn stream<T, B>(
        &self,
        route: &str,
        params: &B,
        handler: &mut impl StreamHandler<T>,
        abort: &AbortSignal,
    ) -> Result<Vec<T>, ClientError>
    where
        T: Detected,
        B: Serialize + ?Sized,
    {
        let url = self.base_url.join(route)?;
        info!(url = %url, "Iniciando detección");

        let mut abort = abort.clone();
        if abort.is_aborted() {
            return Err(ClientError::Aborted);
        }

        let resp = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(ClientError::Aborted),
            resp = self.http.post(url).bearer_auth(&self.api_token).json(params).send() => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        read_events(resp.bytes_stream(), handler, &mut abort).await
    }
}

/// Lee el cuerpo NDJSON y despacha eventos hasta el primero terminal.
///
/// La cancelación se comprueba entre trozos y también entre eventos de un
/// mismo trozo: tras cancelar no se despacha nada más.
async fn read_events<T, S, B, E>(
    body: S,
    handler: &mut impl StreamHandler<T>,
    abort: &mut AbortSignal,
) -> Result<Vec<T>, ClientError>
where
    T: Detected,
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ClientError>,
{
    futures::pin_mut!(body);
    let mut decoder = NdjsonDecoder::<T>::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.aborted() => {
                debug!("Lectura del stream cancelada");
                return Err(ClientError::Aborted);
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.push(bytes.as_ref()) {
                    if abort.is_aborted() {
                        debug!("Lectura del stream cancelada");
                        return Err(ClientError::Aborted);
                    }
                    if let Some(done) = dispatch(event, handler) {
                        return done;
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                if let Some(done) = decoder.finish().and_then(|e| dispatch(e, handler)) {
                    return done;
                }
                warn!("El servidor cerró el stream sin evento final");
                return Err(ClientError::StreamEnded);
            }
        }
    }
}

/// Entrega un evento al handler. Devuelve `Some` si el evento es terminal.
fn dispatch<T>(
    event: StreamEvent<T>,
    handler: &mut impl StreamHandler<T>,
) -> Option<Result<Vec<T>, ClientError>> {
    match event {
        StreamEvent::Progress(progress) => {
            handler.on_progress(progress);
            None
        }
        StreamEvent::Keepalive => None,
        StreamEvent::Complete(items) => {
            handler.on_complete(&items);
            Some(Ok(items))
        }
        StreamEvent::Error(message) => {
            handler.on_error(&message);
            Some(Err(ClientError::Remote(message)))
        }
    }
}
