//! Flujo completo: servidor axum en un puerto efímero con colaboradores
//! falsos, consumido con `DetectionClient` y `DetectionDialog`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use firma_detect::{
    api,
    app_state::{AppState, RateLimiter},
    client::{
        AbortHandle, AbortSignal, DetectFieldsParams, DetectRecipientsParams, DetectionClient,
        StreamHandler,
    },
    config::{AppConfig, DetectionSettings, LlmProvider},
    dialog::{DetectionDialog, DialogEvent, DialogState},
    error::{ClientError, ModelError},
    llm::{StructuredPrompt, VisionModel},
    models::{
        AuthorizedUser, DetectedRecipient, Envelope, EnvelopeItem, NormalizedField, PageImage,
        RecipientDirectoryEntry, RecipientRole,
    },
    orchestrator::{DetectionPipeline, PageProgress},
    recipients::RecipientResolutionPolicy,
    render::{encode_png, PageSource},
    store::{Authorization, EnvelopeStore},
};
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{json, Value};

const TEAM: i64 = 10;

struct FakeStore {
    envelopes: HashMap<String, Envelope>,
    recipients: HashMap<String, Vec<RecipientDirectoryEntry>>,
}

impl FakeStore {
    fn new() -> Self {
        let item = |id: &str, order| EnvelopeItem {
            id: id.into(),
            title: "Contrato".into(),
            order,
        };
        let envelope = |id: &str, items| Envelope {
            id: id.into(),
            team_id: TEAM,
            items,
        };
        let envelopes = HashMap::from([
            ("env_1".to_string(), envelope("env_1", vec![item("item_b", 2), item("item_a", 1)])),
            ("env_sin_destinatarios".to_string(), envelope("env_sin_destinatarios", vec![item("item_a", 1)])),
            ("env_roto".to_string(), envelope("env_roto", vec![item("roto", 1)])),
        ]);
        let signer = |id, name: &str, order| RecipientDirectoryEntry {
            id,
            display_name: name.into(),
            email: Some(format!("{}@example.com", name.to_lowercase())),
            role: RecipientRole::Signer,
            signing_order: Some(order),
        };
        let recipients = HashMap::from([
            ("env_1".to_string(), vec![signer(2, "Luis", 2), signer(1, "Ana", 1)]),
            ("env_roto".to_string(), vec![signer(1, "Ana", 1)]),
        ]);
        Self { envelopes, recipients }
    }
}

#[async_trait]
impl EnvelopeStore for FakeStore {
    async fn authorize(&self, api_token: &str, team_id: i64) -> anyhow::Result<Authorization> {
        Ok(match api_token {
            "tok-ana" if team_id == TEAM => Authorization::Granted(AuthorizedUser { user_id: 1, team_id }),
            "tok-ana" => Authorization::NotAMember,
            _ => Authorization::UnknownToken,
        })
    }

    async fn find_envelope(&self, envelope_id: &str, team_id: i64) -> anyhow::Result<Option<Envelope>> {
        Ok(self
            .envelopes
            .get(envelope_id)
            .filter(|e| e.team_id == team_id)
            .cloned())
    }

    async fn lookup_recipients(&self, envelope_id: &str) -> anyhow::Result<Vec<RecipientDirectoryEntry>> {
        Ok(self.recipients.get(envelope_id).cloned().unwrap_or_default())
    }
}

/// Dos páginas blancas por item; el item `roto` falla al renderizar.
struct FakePages;

#[async_trait]
impl PageSource for FakePages {
    async fn render_document_pages(&self, item: &EnvelopeItem) -> anyhow::Result<Vec<PageImage>> {
        if item.id == "roto" {
            anyhow::bail!("pdfium: documento corrupto");
        }
        (1..=2)
            .map(|page_number| {
                let img = RgbaImage::from_pixel(120, 160, Rgba([255, 255, 255, 255]));
                Ok::<_, anyhow::Error>(PageImage {
                    envelope_item_id: item.id.clone(),
                    page_number,
                    pixel_width: 120,
                    pixel_height: 160,
                    raster_bytes: encode_png(&DynamicImage::ImageRgba8(img))?,
                })
            })
            .collect()
    }
}

/// Responde según el esquema pedido, con un pequeño retardo para que el
/// servidor llegue a emitir keepalives.
struct FakeModel;

#[async_trait]
impl VisionModel for FakeModel {
    async fn generate(&self, prompt: StructuredPrompt) -> Result<Value, ModelError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if prompt.schema.to_string().contains("boundingBox") {
            Ok(json!({"fields": [
                {"boundingBox": [400, 200, 500, 600], "fieldType": "SIGNATURE", "recipientId": 1},
                {"boundingBox": [700, 200, 710, 400], "fieldType": "DATE"}
            ]}))
        } else {
            Ok(json!({"recipients": [
                {"name": "Ana Pérez", "email": "ana@example.com", "role": "SIGNER", "signingOrder": 1},
                {"name": "Gestoría", "role": "CC"}
            ]}))
        }
    }
}

fn config(ai_features_enabled: bool) -> AppConfig {
    AppConfig {
        neo4j_uri: "neo4j://localhost:7687".into(),
        neo4j_user: "neo4j".into(),
        neo4j_password: "secret".into(),
        server_addr: "127.0.0.1:0".into(),
        ai_features_enabled,
        llm_provider: LlmProvider::OpenAI,
        llm_vision_model: "gpt-4o-mini".into(),
        pages_dir: PathBuf::from("./pages"),
        rate_limit_per_minute: 100,
        recipient_policy: RecipientResolutionPolicy::Strict,
        debug_overlay: false,
        debug_dir: std::env::temp_dir(),
        detection: DetectionSettings {
            keepalive_interval: Duration::from_millis(10),
            ..DetectionSettings::default()
        },
    }
}

async fn spawn_server(cfg: AppConfig) -> String {
    let state = AppState {
        pipeline: DetectionPipeline::new(Arc::new(FakeModel), cfg.detection.clone()),
        rate_limiter: Arc::new(RateLimiter::per_minute(cfg.rate_limit_per_minute)),
        store: Arc::new(FakeStore::new()),
        pages: Arc::new(FakePages),
        config: cfg,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::create_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn fields_params(envelope_id: &str, team_id: i64) -> DetectFieldsParams {
    DetectFieldsParams {
        envelope_id: envelope_id.into(),
        team_id,
        context: Some("Contrato de arrendamiento".into()),
    }
}

#[tokio::test]
async fn field_detection_reaches_review_and_confirms() {
    let base = spawn_server(config(true)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let mut dialog = DetectionDialog::<NormalizedField>::new();

    let state = dialog
        .run_fields(&client, &fields_params("env_1", TEAM), &AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(state, DialogState::Review);
    let progress = dialog.progress().unwrap();
    assert_eq!(progress.total_pages, 4);
    assert_eq!(progress.pages_processed, 4);

    let fields = dialog.results().unwrap().to_vec();
    assert_eq!(fields.len(), 8);
    // Items en orden del sobre (item_a antes que item_b) y páginas en orden.
    let order: Vec<_> = fields
        .iter()
        .map(|f| (f.envelope_item_id.as_str(), f.page_number))
        .collect();
    assert_eq!(&order[..4], &[("item_a", 1), ("item_a", 1), ("item_a", 2), ("item_a", 2)]);
    assert!(fields.iter().all(|f| f.recipient_id == 1 || f.recipient_id == 2));
    let signature = &fields[0];
    assert!((signature.position_y + signature.height - 0.5).abs() < 1e-9);

    let confirmed = dialog.apply(DialogEvent::Confirm).unwrap().unwrap();
    assert_eq!(confirmed, fields);
    assert_eq!(dialog.state(), DialogState::Prompt);
}

#[tokio::test]
async fn recipient_detection_merges_first_pages() {
    let base = spawn_server(config(true)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let mut dialog = DetectionDialog::<DetectedRecipient>::new();

    let params = DetectRecipientsParams {
        envelope_id: "env_1".into(),
        team_id: TEAM,
    };
    let state = dialog
        .run_recipients(&client, &params, &AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(state, DialogState::Review);
    assert_eq!(dialog.progress().unwrap().total_pages, 3);
    let recipients = dialog.results().unwrap();
    assert_eq!(recipients.len(), 2);
    assert_eq!(recipients[0].email.as_deref(), Some("ana@example.com"));
    assert_eq!(recipients[1].role, RecipientRole::Cc);
    assert!(recipients[1].email.as_deref().unwrap().ends_with("@recipient.invalid"));
}

#[tokio::test]
async fn pre_stream_rejections_carry_http_status() {
    let base = spawn_server(config(true)).await;
    let abort = AbortSignal::never();

    let status_of = |result: Result<Vec<NormalizedField>, ClientError>| match result {
        Err(ClientError::Api { status, message }) => (status, message),
        other => panic!("se esperaba un rechazo HTTP: {other:?}"),
    };

    let anonymous = DetectionClient::new(&base, "desconocido").unwrap();
    let (status, _) = status_of(
        anonymous
            .detect_fields(&fields_params("env_1", TEAM), &mut (), &abort)
            .await,
    );
    assert_eq!(status, 401);

    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let (status, _) = status_of(client.detect_fields(&fields_params("env_1", 99), &mut (), &abort).await);
    assert_eq!(status, 403);

    let (status, _) = status_of(client.detect_fields(&fields_params("env_x", TEAM), &mut (), &abort).await);
    assert_eq!(status, 404);

    let (status, message) = status_of(
        client
            .detect_fields(&fields_params("env_sin_destinatarios", TEAM), &mut (), &abort)
            .await,
    );
    assert_eq!(status, 400);
    assert!(message.contains("destinatario"));

    let (status, _) = status_of(client.detect_fields(&fields_params("  ", TEAM), &mut (), &abort).await);
    assert_eq!(status, 400);
}

#[tokio::test]
async fn disabled_ai_is_a_configuration_error() {
    let base = spawn_server(config(false)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let err = client
        .detect_fields(&fields_params("env_1", TEAM), &mut (), &AbortSignal::never())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn rate_limit_lands_in_dedicated_state_and_retry_is_allowed() {
    let mut cfg = config(true);
    cfg.rate_limit_per_minute = 1;
    let base = spawn_server(cfg).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let params = fields_params("env_1", TEAM);
    let abort = AbortSignal::never();

    let mut dialog = DetectionDialog::<NormalizedField>::new();
    assert_eq!(dialog.run_fields(&client, &params, &abort).await.unwrap(), DialogState::Review);
    dialog.apply(DialogEvent::Cancel).unwrap();

    assert_eq!(
        dialog.run_fields(&client, &params, &abort).await.unwrap(),
        DialogState::RateLimited
    );
    // Reintentar vuelve a pasar por PROCESSING; sigue limitado dentro de la ventana.
    assert_eq!(
        dialog.run_fields(&client, &params, &abort).await.unwrap(),
        DialogState::RateLimited
    );
}

#[tokio::test]
async fn render_failure_is_a_terminal_error_event() {
    let base = spawn_server(config(true)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let mut dialog = DetectionDialog::<NormalizedField>::new();

    let state = dialog
        .run_fields(&client, &fields_params("env_roto", TEAM), &AbortSignal::never())
        .await
        .unwrap();

    assert_eq!(state, DialogState::Error);
    let message = dialog.error_message().unwrap();
    assert!(!message.contains("pdfium"));
}

#[tokio::test]
async fn aborting_returns_dialog_to_prompt() {
    let base = spawn_server(config(true)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let (handle, abort) = AbortSignal::pair();
    handle.abort();

    let mut dialog = DetectionDialog::<NormalizedField>::new();
    let state = dialog
        .run_fields(&client, &fields_params("env_1", TEAM), &abort)
        .await
        .unwrap();
    assert_eq!(state, DialogState::Prompt);
}

/// Reenvía los eventos al diálogo y cancela tras el primer progreso.
struct CancelAfterFirstProgress<'a> {
    dialog: &'a mut DetectionDialog<NormalizedField>,
    handle: AbortHandle,
    progress_calls: usize,
    complete_calls: usize,
}

impl StreamHandler<NormalizedField> for CancelAfterFirstProgress<'_> {
    fn on_progress(&mut self, progress: PageProgress) {
        self.progress_calls += 1;
        self.dialog.on_progress(progress);
        self.handle.abort();
    }

    fn on_complete(&mut self, items: &[NormalizedField]) {
        self.complete_calls += 1;
        self.dialog.on_complete(items);
    }
}

#[tokio::test]
async fn aborting_mid_stream_stops_events_and_returns_to_prompt() {
    let base = spawn_server(config(true)).await;
    let client = DetectionClient::new(&base, "tok-ana").unwrap();
    let (handle, abort) = AbortSignal::pair();

    let mut dialog = DetectionDialog::<NormalizedField>::new();
    dialog.apply(DialogEvent::Start).unwrap();
    let mut handler = CancelAfterFirstProgress {
        dialog: &mut dialog,
        handle,
        progress_calls: 0,
        complete_calls: 0,
    };

    let outcome = client
        .detect_fields(&fields_params("env_1", TEAM), &mut handler, &abort)
        .await;

    assert!(matches!(outcome, Err(ClientError::Aborted)));
    assert_eq!(handler.progress_calls, 1);
    assert_eq!(handler.complete_calls, 0);

    assert_eq!(dialog.state(), DialogState::Processing);
    assert_eq!(dialog.progress().unwrap().pages_processed, 1);
    dialog.apply(DialogEvent::Cancel).unwrap();
    assert_eq!(dialog.state(), DialogState::Prompt);
    assert!(dialog.results().is_none());
}

#[tokio::test]
async fn health_reports_ai_flag() {
    let base = spawn_server(config(false)).await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "ok", "aiFeaturesEnabled": false}));
}
