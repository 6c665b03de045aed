//! Superposiciones de depuración: dibuja sobre la página las cajas que
//! devolvió el modelo y los campos normalizados, junto a un JSON con la
//! geometría de ambos. Sólo se activa con `AI_DEBUG_OVERLAY=true`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::geometry::{FieldGeometry, PageDimensions, SCALE};
use crate::models::{FieldType, NormalizedField, PageImage, RawDetectedField};

const GRID_STEP: f64 = 100.0;
const GRID_COLOR: Rgba<u8> = Rgba([120, 120, 120, 60]);

/// Escritor de superposiciones en un directorio raíz (`<raíz>/<request_id>/`).
#[derive(Debug, Clone)]
pub struct DebugOverlay {
    root: PathBuf,
}

impl DebugOverlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Escribe `<item>-page-<n>.png` y su `.json` para una página.
    pub fn write_page(
        &self,
        request_id: Uuid,
        page: &PageImage,
        raws: &[RawDetectedField],
        fields: &[NormalizedField],
    ) -> Result<PathBuf> {
        let dir = self.root.join(request_id.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("No se pudo crear {}", dir.display()))?;

        let mut img = image::load_from_memory(&page.raster_bytes)
            .context("Imagen de página ilegible")?
            .to_rgba8();

        draw_grid(&mut img);
        let dims = PageDimensions {
            pixel_width: img.width(),
            pixel_height: img.height(),
        };

        for raw in raws {
            let color = field_color(raw.field_type);
            let [ymin, xmin, ymax, xmax] = raw.bounding_box.map(|v| v.clamp(0.0, SCALE));
            let (x0, y0) = to_pixels(&img, xmin, ymin);
            let (x1, y1) = to_pixels(&img, xmax, ymax);
            draw_rect_outline(&mut img, x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0), with_alpha(color, 140), 1);
        }

        for field in fields {
            let color = field_color(field.field_type);
            let (x0, y0, w, h) = FieldGeometry {
                position_x: field.position_x,
                position_y: field.position_y,
                width: field.width,
                height: field.height,
            }
            .to_pixel_rect(dims);
            let (x1, y1) = (x0 + w, y0 + h);
            fill_rect_alpha(&mut img, x0, y0, x1, y1, with_alpha(color, 40));
            draw_rect_outline(&mut img, x0, y0, w, h, color, 3);
            let label = format!("{} #{}", field.field_type.as_str(), field.recipient_id);
            draw_bitmap_text(&mut img, x0 as i32 + 4, y0 as i32 + 4, &label, color, 1);
        }

        let stem = format!("{}-page-{}", page.envelope_item_id, page.page_number);
        let png_path = dir.join(format!("{stem}.png"));
        DynamicImage::ImageRgba8(img)
            .save(&png_path)
            .with_context(|| format!("No se pudo guardar {}", png_path.display()))?;

        let sidecar = json!({
            "requestId": request_id,
            "envelopeItemId": page.envelope_item_id,
            "pageNumber": page.page_number,
            "pixelWidth": page.pixel_width,
            "pixelHeight": page.pixel_height,
            "generatedAt": Utc::now().to_rfc3339(),
            "raw": raws,
            "normalized": fields,
        });
        let json_path = dir.join(format!("{stem}.json"));
        fs::write(&json_path, serde_json::to_vec_pretty(&sidecar)?)
            .with_context(|| format!("No se pudo guardar {}", json_path.display()))?;

        debug!("Superposición de depuración escrita en {}", png_path.display());
        Ok(png_path)
    }
}

fn field_color(field_type: FieldType) -> Rgba<u8> {
    match field_type {
        FieldType::Signature | FieldType::Initials => Rgba([220, 38, 38, 255]),
        FieldType::Name | FieldType::Email => Rgba([37, 99, 235, 255]),
        FieldType::Date => Rgba([217, 119, 6, 255]),
        FieldType::Text | FieldType::Number => Rgba([22, 163, 74, 255]),
        FieldType::Checkbox | FieldType::Radio | FieldType::Dropdown => Rgba([147, 51, 234, 255]),
    }
}

fn with_alpha(color: Rgba<u8>, alpha: u8) -> Rgba<u8> {
    Rgba([color[0], color[1], color[2], alpha])
}

/// Convierte coordenadas 0..1000 a píxeles de la imagen.
fn to_pixels(img: &RgbaImage, x: f64, y: f64) -> (u32, u32) {
    let px = (x / SCALE * f64::from(img.width())).round() as u32;
    let py = (y / SCALE * f64::from(img.height())).round() as u32;
    (
        px.min(img.width().saturating_sub(1)),
        py.min(img.height().saturating_sub(1)),
    )
}

fn draw_grid(img: &mut RgbaImage) {
    let mut v = GRID_STEP;
    while v < SCALE {
        let (x, y) = to_pixels(img, v, v);
        for yy in 0..img.height() {
            let dst = *img.get_pixel(x, yy);
            img.put_pixel(x, yy, blend_pixel(dst, GRID_COLOR));
        }
        for xx in 0..img.width() {
            let dst = *img.get_pixel(xx, y);
            img.put_pixel(xx, y, blend_pixel(dst, GRID_COLOR));
        }
        v += GRID_STEP;
    }
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) + f64::from(src[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn draw_rect_outline(
    img: &mut RgbaImage,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    color: Rgba<u8>,
    thickness: u32,
) {
    if w == 0 || h == 0 || img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_x = img.width() - 1;
    let max_y = img.height() - 1;

    let x0 = x.min(max_x);
    let y0 = y.min(max_y);
    let x1 = (x + w.saturating_sub(1)).min(max_x);
    let y1 = (y + h.saturating_sub(1)).min(max_y);

    for t in 0..thickness.max(1) {
        let tx0 = x0.saturating_sub(t);
        let ty0 = y0.saturating_sub(t);
        let tx1 = (x1 + t).min(max_x);
        let ty1 = (y1 + t).min(max_y);

        for xx in tx0..=tx1 {
            for yy in [ty0, ty1] {
                let dst = *img.get_pixel(xx, yy);
                img.put_pixel(xx, yy, blend_pixel(dst, color));
            }
        }
        for yy in ty0..=ty1 {
            for xx in [tx0, tx1] {
                let dst = *img.get_pixel(xx, yy);
                img.put_pixel(xx, yy, blend_pixel(dst, color));
            }
        }
    }
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_x = img.width() - 1;
    let max_y = img.height() - 1;
    for y in y0.min(y1).min(max_y)..=y0.max(y1).min(max_y) {
        for x in x0.min(x1).min(max_x)..=x0.max(x1).min(max_x) {
            let dst = *img.get_pixel(x, y);
            img.put_pixel(x, y, blend_pixel(dst, color));
        }
    }
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x += 8 * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        let (tx, ty) = (px + sx, py + sy);
                        if tx >= 0 && ty >= 0 && tx < img.width() as i32 && ty < img.height() as i32 {
                            let dst = *img.get_pixel(tx as u32, ty as u32);
                            img.put_pixel(tx as u32, ty as u32, blend_pixel(dst, color));
                        }
                    }
                }
            }
        }
        cursor_x += 8 * scale_i;
    }
}
