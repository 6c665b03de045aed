//! Orquestador multi-página: lanza una detección por página de forma
//! concurrente, espera a que todas terminen (con éxito o error) y agrega los
//! resultados de las que funcionaron.
//!
//! Un fallo en una página se registra y esa página simplemente no aporta
//! campos; la petición sólo falla si la entrada es inválida, si fallan todas
//! las páginas o si la política estricta rechaza una asignación.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::config::DetectionSettings;
use crate::debug_overlay::DebugOverlay;
use crate::detector::{detect_page_fields, detect_page_recipients};
use crate::error::{DetectionFailure, PipelineError};
use crate::geometry::{normalize_box, ExpansionRules, PageDimensions};
use crate::llm::{ModelImage, VisionModel};
use crate::models::{
    DetectedRecipient, DetectionRequest, NormalizedField, PageImage, RawDetectedField,
};
use crate::prompt::{build_field_detection_prompt, build_recipient_detection_prompt};
use crate::recipients::{merge_detected_recipients, RecipientDirectory, RecipientResolutionPolicy};
use crate::render::compress_for_model_input;

/// Confianza asignada cuando el modelo no la devuelve.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Progreso emitido cada vez que una página termina.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress {
    pub pages_processed: usize,
    pub total_pages: usize,
    pub detected_so_far: usize,
}

/// Error de una página concreta; nunca aborta la petición.
#[derive(Debug)]
enum PageError {
    Compress(String),
    Detect(DetectionFailure),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compress(e) => write!(f, "error comprimiendo la página: {e}"),
            Self::Detect(e) => write!(f, "{e}"),
        }
    }
}

/// Pipeline de detección completo para una petición.
#[derive(Clone)]
pub struct DetectionPipeline {
    model: Arc<dyn VisionModel>,
    settings: DetectionSettings,
    rules: ExpansionRules,
    overlay: Option<DebugOverlay>,
}

impl DetectionPipeline {
    pub fn new(model: Arc<dyn VisionModel>, settings: DetectionSettings) -> Self {
        Self {
            model,
            settings,
            rules: ExpansionRules::default(),
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Option<DebugOverlay>) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Detecta campos en todas las páginas y devuelve la lista agregada,
    /// ordenada por página y posición.
    pub async fn detect_fields(
        &self,
        request: &DetectionRequest,
        pages: &[PageImage],
        directory: &RecipientDirectory,
        policy: RecipientResolutionPolicy,
        mut on_progress: impl FnMut(PageProgress),
    ) -> Result<Vec<NormalizedField>, PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::NoPages);
        }

        let prompt = build_field_detection_prompt(Some(directory), request.context.as_deref());
        let prompt = prompt.as_str();
        let total_pages = pages.len();
        info!(
            request_id = %request.request_id,
            total_pages,
            recipients = directory.entries().len(),
            "Iniciando detección de campos"
        );

        let mut fields: Vec<(usize, NormalizedField)> = Vec::new();
        let mut processed = 0;
        let mut skipped_boxes = 0;

        let failed = settle_pages(
            pages,
            |page| async move {
                let image = self.compress(page).await?;
                detect_page_fields(self.model.as_ref(), prompt, page.page_number, image)
                    .await
                    .map_err(PageError::Detect)
            },
            |index, page, outcome| {
                processed += 1;
                if let Ok(raws) = outcome {
                    let (page_fields, skipped) =
                        self.normalize_page(page, &raws, directory, policy)?;
                    skipped_boxes += skipped;
                    self.write_overlay(request, page, raws, page_fields.clone());
                    fields.extend(page_fields.into_iter().map(|f| (index, f)));
                }
                on_progress(PageProgress {
                    pages_processed: processed,
                    total_pages,
                    detected_so_far: fields.len(),
                });
                Ok(())
            },
        )
        .await?;

        if failed == total_pages {
            return Err(PipelineError::AllPagesFailed { failed });
        }

        fields.sort_by(|(ia, a), (ib, b)| {
            ia.cmp(ib)
                .then(a.position_y.total_cmp(&b.position_y))
                .then(a.position_x.total_cmp(&b.position_x))
        });

        info!(
            request_id = %request.request_id,
            fields = fields.len(),
            failed_pages = failed,
            skipped_boxes,
            "Detección de campos completada"
        );
        Ok(fields.into_iter().map(|(_, f)| f).collect())
    }

    /// Detecta destinatarios en las primeras páginas del documento.
    pub async fn detect_recipients(
        &self,
        request: &DetectionRequest,
        pages: &[PageImage],
        mut on_progress: impl FnMut(PageProgress),
    ) -> Result<Vec<DetectedRecipient>, PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::NoPages);
        }

        let analysed = &pages[..pages.len().min(self.settings.recipient_max_pages.max(1))];
        let total_pages = analysed.len();
        let prompt = build_recipient_detection_prompt();
        let prompt = prompt.as_str();
        let domain = self.settings.placeholder_email_domain.clone();
        info!(
            request_id = %request.request_id,
            total_pages,
            document_pages = pages.len(),
            "Iniciando detección de destinatarios"
        );

        let mut per_page: Vec<(usize, Vec<DetectedRecipient>)> = Vec::new();
        let mut processed = 0;

        let failed = settle_pages(
            analysed,
            |page| async move {
                let image = self.compress(page).await?;
                detect_page_recipients(self.model.as_ref(), prompt, page.page_number, image)
                    .await
                    .map_err(PageError::Detect)
            },
            |index, _page, outcome| {
                processed += 1;
                if let Ok(recipients) = outcome {
                    per_page.push((index, recipients));
                }
                let so_far = merge_detected_recipients(
                    per_page.iter().map(|(_, r)| r.clone()).collect(),
                    &domain,
                )
                .len();
                on_progress(PageProgress {
                    pages_processed: processed,
                    total_pages,
                    detected_so_far: so_far,
                });
                Ok(())
            },
        )
        .await?;

        if failed == total_pages {
            return Err(PipelineError::AllPagesFailed { failed });
        }

        // Las páginas terminan en cualquier orden; se fusionan en orden de documento.
        per_page.sort_by_key(|(index, _)| *index);
        let recipients =
            merge_detected_recipients(per_page.into_iter().map(|(_, r)| r).collect(), &domain);

        info!(
            request_id = %request.request_id,
            recipients = recipients.len(),
            failed_pages = failed,
            "Detección de destinatarios completada"
        );
        Ok(recipients)
    }

    async fn compress(&self, page: &PageImage) -> Result<ModelImage, PageError> {
        let bytes = page.raster_bytes.clone();
        let max_dimension = self.settings.model_image_max_dimension;
        let quality = self.settings.model_image_jpeg_quality;
        tokio::task::spawn_blocking(move || {
            compress_for_model_input(&bytes, max_dimension, quality)
        })
        .await
        .map_err(|e| PageError::Compress(e.to_string()))?
        .map_err(|e| PageError::Compress(e.to_string()))
    }

    /// Normaliza y asigna destinatario a los campos de una página.
    /// Devuelve los campos válidos y cuántas cajas se descartaron.
    fn normalize_page(
        &self,
        page: &PageImage,
        raws: &[RawDetectedField],
        directory: &RecipientDirectory,
        policy: RecipientResolutionPolicy,
    ) -> Result<(Vec<NormalizedField>, usize), PipelineError> {
        let dims = PageDimensions {
            pixel_width: page.pixel_width,
            pixel_height: page.pixel_height,
        };
        let mut fields = Vec::with_capacity(raws.len());
        let mut skipped = 0;

        for (i, raw) in raws.iter().enumerate() {
            let obstructions: Vec<_> = raws
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, other)| other.bounding_box)
                .collect();

            let geometry = match normalize_box(
                &raw.bounding_box,
                raw.field_type,
                dims,
                &obstructions,
                &self.rules,
            ) {
                Ok(g) => g,
                Err(reason) => {
                    skipped += 1;
                    warn!(
                        page = page.page_number,
                        field_type = raw.field_type.as_str(),
                        bbox = ?raw.bounding_box,
                        "Caja descartada: {}",
                        reason
                    );
                    continue;
                }
            };

            let label = raw
                .label
                .clone()
                .unwrap_or_else(|| format!("{} (página {})", raw.field_type.as_str(), page.page_number));
            let recipient_id = directory.resolve(raw.recipient_id, &label, policy)?;

            fields.push(NormalizedField {
                field_type: raw.field_type,
                position_x: geometry.position_x,
                position_y: geometry.position_y,
                width: geometry.width,
                height: geometry.height,
                page_number: page.page_number,
                confidence: raw
                    .confidence
                    .filter(|c| c.is_finite())
                    .map(|c| c.clamp(0.0, 1.0))
                    .unwrap_or(DEFAULT_CONFIDENCE),
                recipient_id,
                envelope_item_id: page.envelope_item_id.clone(),
            });
        }

        Ok((fields, skipped))
    }

    fn write_overlay(
        &self,
        request: &DetectionRequest,
        page: &PageImage,
        raws: Vec<RawDetectedField>,
        fields: Vec<NormalizedField>,
    ) {
        let Some(overlay) = self.overlay.clone() else {
            return;
        };
        if raws.is_empty() {
            return;
        }
        let request_id = request.request_id;
        let page = page.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = overlay.write_page(request_id, &page, &raws, &fields) {
                warn!(page = page.page_number, "No se pudo escribir la superposición de depuración: {}", e);
            }
        });
    }
}

/// Lanza `detect` para todas las páginas a la vez y entrega cada resultado a
/// `on_settled` según van terminando. Devuelve cuántas páginas fallaron.
///
/// `on_settled` puede abortar el conjunto devolviendo un error; las páginas
/// pendientes se cancelan al soltar sus futuros.
async fn settle_pages<'p, T, Fut>(
    pages: &'p [PageImage],
    detect: impl Fn(&'p PageImage) -> Fut,
    mut on_settled: impl FnMut(usize, &'p PageImage, Result<T, PageError>) -> Result<(), PipelineError>,
) -> Result<usize, PipelineError>
where
    Fut: Future<Output = Result<T, PageError>>,
{
    let detect = &detect;
    let mut pending: FuturesUnordered<_> = pages
        .iter()
        .enumerate()
        .map(|(index, page)| {
            let fut = detect(page);
            async move { (index, page, fut.await) }
        })
        .collect();

    let mut failed = 0;
    while let Some((index, page, outcome)) = pending.next().await {
        if let Err(e) = &outcome {
            failed += 1;
            warn!(
                page = page.page_number,
                item = %page.envelope_item_id,
                "Fallo de detección en la página: {}",
                e
            );
        }
        on_settled(index, page, outcome)?;
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::fakes::ScriptedModel;
    use crate::error::ModelError;
    use crate::models::{FieldType, RecipientDirectoryEntry, RecipientRole};
    use crate::render::encode_png;
    use image::{DynamicImage, Rgba, RgbaImage};
    use serde_json::json;

    fn directory() -> RecipientDirectory {
        RecipientDirectory::new(vec![
            RecipientDirectoryEntry {
                id: 1,
                display_name: "Ana".into(),
                email: None,
                role: RecipientRole::Signer,
                signing_order: Some(1),
            },
            RecipientDirectoryEntry {
                id: 2,
                display_name: "Luis".into(),
                email: None,
                role: RecipientRole::Signer,
                signing_order: Some(2),
            },
        ])
        .unwrap()
    }

    fn request() -> DetectionRequest {
        DetectionRequest::new("env_1".into(), 1, 1, None)
    }

    /// Cada página tiene un ancho distinto (100 + número) para que el modelo
    /// falso pueda reconocerla tras la compresión.
    fn numbered_page(number: u32) -> PageImage {
        let width = 100 + number;
        let img = RgbaImage::from_pixel(width, 140, Rgba([255, 255, 255, 255]));
        PageImage {
            envelope_item_id: "item_1".into(),
            page_number: number,
            pixel_width: width,
            pixel_height: 140,
            raster_bytes: encode_png(&DynamicImage::ImageRgba8(img)).unwrap(),
        }
    }

    /// Modelo falso que decodifica la imagen y usa `ancho - 100` como página.
    struct ByWidth(ScriptedModel);

    #[async_trait::async_trait]
    impl VisionModel for ByWidth {
        async fn generate(
            &self,
            mut prompt: crate::llm::StructuredPrompt,
        ) -> Result<serde_json::Value, ModelError> {
            let width = image::load_from_memory(&prompt.image.bytes)
                .map(|i| image::GenericImageView::width(&i))
                .unwrap_or(100);
            prompt.image.bytes = vec![(width - 100) as u8];
            self.0.generate(prompt).await
        }
    }

    fn signature_on(recipient: i64) -> serde_json::Value {
        json!({"fields": [
            {"boundingBox": [400, 200, 500, 600], "fieldType": "SIGNATURE", "recipientId": recipient}
        ]})
    }

    fn pipeline(model: ScriptedModel) -> DetectionPipeline {
        DetectionPipeline::new(Arc::new(ByWidth(model)), DetectionSettings::default())
    }

    #[tokio::test]
    async fn single_page_signature_matches_expected_geometry() {
        let pipeline = pipeline(ScriptedModel::default().with(1, Ok(signature_on(1))));
        let fields = pipeline
            .detect_fields(
                &request(),
                &[numbered_page(1)],
                &directory(),
                RecipientResolutionPolicy::Strict,
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(fields.len(), 1);
        let f = &fields[0];
        assert!(f.position_y <= 0.40);
        assert!((f.position_y + f.height - 0.50).abs() < 1e-9);
        assert!(f.height >= 0.03);
        assert_eq!(f.recipient_id, 1);
        assert_eq!(f.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(f.envelope_item_id, "item_1");
    }

    #[tokio::test]
    async fn failed_pages_are_omitted_from_aggregate() {
        let model = ScriptedModel::default()
            .with(1, Ok(signature_on(1)))
            .with(2, Err(ModelError::Invocation("timeout".into())))
            .with(3, Ok(signature_on(2)))
            .with(4, Ok(json!({"unexpected": true})))
            .with(5, Ok(signature_on(1)));
        let pages: Vec<_> = (1..=5).map(numbered_page).collect();
        let mut progress = Vec::new();

        let fields = pipeline(model)
            .detect_fields(
                &request(),
                &pages,
                &directory(),
                RecipientResolutionPolicy::Strict,
                |p| progress.push(p),
            )
            .await
            .unwrap();

        let page_numbers: Vec<_> = fields.iter().map(|f| f.page_number).collect();
        assert_eq!(page_numbers, vec![1, 3, 5]);
        assert_eq!(progress.len(), 5);
        assert_eq!(progress.last().unwrap().pages_processed, 5);
        assert_eq!(progress.last().unwrap().total_pages, 5);
        assert_eq!(progress.last().unwrap().detected_so_far, 3);
    }

    #[tokio::test]
    async fn all_pages_failing_is_fatal() {
        let model = ScriptedModel::default()
            .with(1, Err(ModelError::Invocation("boom".into())))
            .with(2, Err(ModelError::SchemaValidation("bad".into())));
        let err = pipeline(model)
            .detect_fields(
                &request(),
                &[numbered_page(1), numbered_page(2)],
                &directory(),
                RecipientResolutionPolicy::Strict,
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AllPagesFailed { failed: 2 }));
    }

    #[tokio::test]
    async fn strict_policy_aborts_on_unknown_recipient() {
        let model = ScriptedModel::default().with(1, Ok(signature_on(999_999)));
        let err = pipeline(model)
            .detect_fields(
                &request(),
                &[numbered_page(1)],
                &directory(),
                RecipientResolutionPolicy::Strict,
                |_| {},
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::InvalidRecipientAssignment(e) => assert_eq!(e.recipient_id, 999_999),
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lenient_policy_corrects_unknown_recipient() {
        let model = ScriptedModel::default().with(1, Ok(signature_on(999_999)));
        let fields = pipeline(model)
            .detect_fields(
                &request(),
                &[numbered_page(1)],
                &directory(),
                RecipientResolutionPolicy::Lenient,
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(fields[0].recipient_id, 1);
    }

    #[tokio::test]
    async fn degenerate_boxes_are_skipped_not_fatal() {
        let model = ScriptedModel::default().with(
            1,
            Ok(json!({"fields": [
                {"boundingBox": [500, 200, 400, 600], "fieldType": "TEXT", "recipientId": 1},
                {"boundingBox": [100, 100, 120, 120], "fieldType": "CHECKBOX", "recipientId": 2, "confidence": 3.0}
            ]})),
        );
        let fields = pipeline(model)
            .detect_fields(
                &request(),
                &[numbered_page(1)],
                &directory(),
                RecipientResolutionPolicy::Strict,
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field_type, FieldType::Checkbox);
        assert_eq!(fields[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let err = pipeline(ScriptedModel::default())
            .detect_fields(
                &request(),
                &[],
                &directory(),
                RecipientResolutionPolicy::Strict,
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoPages));
    }

    #[tokio::test]
    async fn recipient_detection_only_reads_first_pages() {
        let found = |name: &str| json!({"recipients": [{"name": name, "role": "SIGNER"}]});
        let model = ScriptedModel::default()
            .with(1, Ok(found("Ana")))
            .with(2, Err(ModelError::Invocation("timeout".into())))
            .with(3, Ok(found("Luis")))
            .with(4, Ok(found("Nunca")));
        let pages: Vec<_> = (1..=4).map(numbered_page).collect();
        let mut last = None;

        let recipients = pipeline(model)
            .detect_recipients(&request(), &pages, |p| last = Some(p))
            .await
            .unwrap();

        let names: Vec<_> = recipients.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Luis"]);
        assert!(recipients.iter().all(|r| r.email.is_some()));
        let last = last.unwrap();
        assert_eq!((last.pages_processed, last.total_pages, last.detected_so_far), (3, 3, 2));
    }
}
