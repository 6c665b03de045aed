//! Páginas rasterizadas de los documentos y compresión de imágenes para el modelo.
//!
//! La rasterización del PDF ocurre fuera de este servicio: cada item del sobre
//! tiene un directorio `PAGES_DIR/<envelopeItemId>/` con una imagen por página
//! (`page-1.png`, `page-2.png`, ...).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat as RasterFormat};
use mime_guess::MimeGuess;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::llm::{ImageFormat, ModelImage};
use crate::models::{EnvelopeItem, PageImage};

/// Colaborador que produce las páginas rasterizadas de un item del sobre.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn render_document_pages(&self, item: &EnvelopeItem) -> Result<Vec<PageImage>>;
}

/// Lee páginas pre-rasterizadas desde disco.
#[derive(Debug, Clone)]
pub struct DirectoryPageSource {
    root: PathBuf,
}

impl DirectoryPageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PageSource for DirectoryPageSource {
    async fn render_document_pages(&self, item: &EnvelopeItem) -> Result<Vec<PageImage>> {
        if item.id.contains('/') || item.id.contains('\\') || item.id.contains("..") {
            return Err(anyhow!("Identificador de item inválido: {}", item.id));
        }
        let dir = self.root.join(&item.id);
        let item_id = item.id.clone();

        tokio::task::spawn_blocking(move || load_pages_from_dir(&dir, &item_id))
            .await
            .map_err(|e| anyhow!("Error en la tarea de renderizado: {e}"))?
    }
}

fn load_pages_from_dir(dir: &Path, item_id: &str) -> Result<Vec<PageImage>> {
    if !dir.is_dir() {
        return Err(anyhow!(
            "No existen páginas renderizadas para el item {item_id} en {}",
            dir.display()
        ));
    }

    let mut numbered: Vec<(u32, PathBuf)> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            MimeGuess::from_path(e.path())
                .first()
                .map(|m| m.type_() == mime_guess::mime::IMAGE)
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let path = e.path().to_path_buf();
            match page_number_from_path(&path) {
                Some(n) => Some((n, path)),
                None => {
                    warn!("Imagen sin número de página, se ignora: {}", path.display());
                    None
                }
            }
        })
        .collect();

    numbered.sort_by_key(|(n, _)| *n);

    let mut pages = Vec::with_capacity(numbered.len());
    for (page_number, path) in numbered {
        let raster_bytes = std::fs::read(&path)
            .with_context(|| format!("No se pudo leer {}", path.display()))?;
        let (pixel_width, pixel_height) = image::load_from_memory(&raster_bytes)
            .with_context(|| format!("Imagen de página corrupta: {}", path.display()))?
            .dimensions();
        pages.push(PageImage {
            envelope_item_id: item_id.to_string(),
            page_number,
            pixel_width,
            pixel_height,
            raster_bytes,
        });
    }

    info!("Item {}: {} páginas cargadas", item_id, pages.len());
    Ok(pages)
}

/// Número de página: el último grupo de dígitos del nombre (`page-12.png` → 12).
fn page_number_from_path(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_string_lossy();
    let digits: String = stem
        .chars()
        .rev()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

/// Reduce la página (sin ampliar nunca) y la recodifica como JPEG para el modelo.
pub fn compress_for_model_input(
    raster_bytes: &[u8],
    max_dimension: u32,
    jpeg_quality: u8,
) -> Result<ModelImage> {
    let img = image::load_from_memory(raster_bytes).context("Imagen de página ilegible")?;
    let (w, h) = img.dimensions();

    let img = if w.max(h) > max_dimension && max_dimension > 0 {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut bytes = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, jpeg_quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .context("No se pudo codificar la página como JPEG")?;

    Ok(ModelImage {
        bytes,
        format: ImageFormat::Jpeg,
    })
}

/// Codifica una imagen RGBA en PNG (usado por las superposiciones de depuración y los tests).
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), RasterFormat::Png)
        .context("No se pudo codificar PNG")?;
    Ok(bytes)
}
