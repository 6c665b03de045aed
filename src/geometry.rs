//! Normalización de coordenadas: de la caja 0..1000 del modelo a posición y
//! tamaño en fracción de página, con la expansión heurística de campos de línea.
//!
//! Los campos de línea (firma, nombre, fecha...) se detectan sobre una raya
//! fina; el borde inferior se mantiene y el superior se sube hacia el espacio
//! en blanco disponible hasta el siguiente obstáculo.

use thiserror::Error;

use crate::models::{BoundingBox, FieldType};

/// Escala de coordenadas que usa el modelo.
pub const SCALE: f64 = 1000.0;

/// Constantes empíricas de la expansión de campos de línea (unidades 0..1000).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpansionRules {
    /// Fracción del espacio en blanco superior que ocupa el campo (0.6–0.8).
    pub whitespace_fill_ratio: f64,
    /// Distancia máxima que se mira hacia arriba buscando espacio libre.
    pub max_whitespace_lookup: f64,
    pub min_height: f64,
    pub min_width: f64,
}

pub const DEFAULT_EXPANSION_RULES: ExpansionRules = ExpansionRules {
    whitespace_fill_ratio: 0.7,
    max_whitespace_lookup: 100.0,
    min_height: 30.0,
    min_width: 36.0,
};

impl Default for ExpansionRules {
    fn default() -> Self {
        DEFAULT_EXPANSION_RULES
    }
}

/// Dimensiones en píxeles de la página renderizada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDimensions {
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// Posición y tamaño de un campo en fracción de página (0..1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldGeometry {
    pub position_x: f64,
    pub position_y: f64,
    pub width: f64,
    pub height: f64,
}

impl FieldGeometry {
    /// Rectángulo en píxeles `(x, y, w, h)` para la página dada.
    pub fn to_pixel_rect(&self, page: PageDimensions) -> (u32, u32, u32, u32) {
        let w = f64::from(page.pixel_width);
        let h = f64::from(page.pixel_height);
        (
            (self.position_x * w).round() as u32,
            (self.position_y * h).round() as u32,
            (self.width * w).round().max(1.0) as u32,
            (self.height * h).round().max(1.0) as u32,
        )
    }
}

/// Motivo por el que una caja se descarta sin normalizar.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeometryRejection {
    #[error("coordenadas no finitas")]
    NonFinite,
    #[error("página sin dimensiones")]
    EmptyPage,
    #[error("caja degenerada tras recortar (ancho {width}, alto {height})")]
    Degenerate { width: f64, height: f64 },
}

/// Caja recortada al rango 0..1000, en el orden `[ymin, xmin, ymax, xmax]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ClampedBox {
    ymin: f64,
    xmin: f64,
    ymax: f64,
    xmax: f64,
}

impl ClampedBox {
    fn from_raw(bbox: &BoundingBox) -> Result<Self, GeometryRejection> {
        if bbox.iter().any(|v| !v.is_finite()) {
            return Err(GeometryRejection::NonFinite);
        }
        let clamp = |v: f64| v.clamp(0.0, SCALE);
        let b = Self {
            ymin: clamp(bbox[0]),
            xmin: clamp(bbox[1]),
            ymax: clamp(bbox[2]),
            xmax: clamp(bbox[3]),
        };
        let (width, height) = (b.xmax - b.xmin, b.ymax - b.ymin);
        if width <= 0.0 || height <= 0.0 {
            return Err(GeometryRejection::Degenerate { width, height });
        }
        Ok(b)
    }

    fn overlaps_horizontally(&self, other: &ClampedBox) -> bool {
        other.xmin < self.xmax && other.xmax > self.xmin
    }
}

/// Normaliza una caja detectada.
///
/// `obstructions` son el resto de cajas detectadas en la misma página; sólo
/// se usan para limitar cuánto puede crecer hacia arriba un campo de línea.
pub fn normalize_box(
    bbox: &BoundingBox,
    field_type: FieldType,
    page: PageDimensions,
    obstructions: &[BoundingBox],
    rules: &ExpansionRules,
) -> Result<FieldGeometry, GeometryRejection> {
    if page.pixel_width == 0 || page.pixel_height == 0 {
        return Err(GeometryRejection::EmptyPage);
    }

    let mut b = ClampedBox::from_raw(bbox)?;

    if field_type.is_line_based() {
        b.ymin = expanded_top(&b, obstructions, rules);
        b = enforce_min_width(b, rules.min_width);
    }

    Ok(FieldGeometry {
        position_x: b.xmin / SCALE,
        position_y: b.ymin / SCALE,
        width: (b.xmax - b.xmin) / SCALE,
        height: (b.ymax - b.ymin) / SCALE,
    })
}

/// Nuevo `ymin` de un campo de línea. Nunca baja respecto al detectado.
fn expanded_top(b: &ClampedBox, obstructions: &[BoundingBox], rules: &ExpansionRules) -> f64 {
    let obstacle_bottom = obstructions
        .iter()
        .filter_map(|o| ClampedBox::from_raw(o).ok())
        .filter(|o| o.ymax <= b.ymin && b.overlaps_horizontally(o))
        .map(|o| o.ymax)
        .fold(0.0_f64, f64::max);

    let floor = obstacle_bottom.max(b.ymin - rules.max_whitespace_lookup).max(0.0);
    let available = (b.ymin - floor).max(0.0);
    let mut top = b.ymin - rules.whitespace_fill_ratio * available;

    if b.ymax - top < rules.min_height {
        top = b.ymax - rules.min_height;
    }
    top.max(0.0).min(b.ymin)
}

fn enforce_min_width(mut b: ClampedBox, min_width: f64) -> ClampedBox {
    if b.xmax - b.xmin >= min_width {
        return b;
    }
    let center = (b.xmin + b.xmax) / 2.0;
    b.xmin = (center - min_width / 2.0).max(0.0);
    b.xmax = b.xmin + min_width;
    if b.xmax > SCALE {
        b.xmax = SCALE;
        b.xmin = SCALE - min_width;
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: PageDimensions = PageDimensions {
        pixel_width: 1240,
        pixel_height: 1754,
    };

    fn normalize(bbox: BoundingBox, field_type: FieldType) -> FieldGeometry {
        normalize_box(&bbox, field_type, PAGE, &[], &DEFAULT_EXPANSION_RULES).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn signature_line_keeps_bottom_and_grows_upwards() {
        let g = normalize([400.0, 200.0, 500.0, 600.0], FieldType::Signature);
        assert!(g.position_y <= 0.40);
        assert!(approx(g.position_y + g.height, 0.50));
        assert!(g.height >= 0.03);
        assert!(approx(g.position_x, 0.2));
        assert!(approx(g.width, 0.4));
    }

    #[test]
    fn checkbox_passes_through_unchanged() {
        let g = normalize([100.0, 50.0, 120.0, 70.0], FieldType::Checkbox);
        assert!(approx(g.position_y, 0.1));
        assert!(approx(g.position_x, 0.05));
        assert!(approx(g.width, 0.02));
        assert!(approx(g.height, 0.02));
    }

    #[test]
    fn thin_line_gets_minimum_dimensions() {
        let g = normalize([700.0, 500.0, 702.0, 510.0], FieldType::Date);
        assert!(g.height + 1e-12 >= 0.03);
        assert!(g.width + 1e-12 >= 0.036);
        assert!(approx(g.position_y + g.height, 0.702));
    }

    #[test]
    fn expansion_stops_at_obstruction_above() {
        let label_above = [380.0, 150.0, 395.0, 650.0];
        let g = normalize_box(
            &[400.0, 200.0, 410.0, 600.0],
            FieldType::Name,
            PAGE,
            &[label_above],
            &DEFAULT_EXPANSION_RULES,
        )
        .unwrap();
        // Sólo hay 5 unidades libres; manda el alto mínimo.
        assert!(approx(g.position_y, 0.38));
        assert!(approx(g.position_y + g.height, 0.41));
    }

    #[test]
    fn obstruction_outside_horizontal_span_is_ignored() {
        let far_left = [380.0, 0.0, 395.0, 100.0];
        let with = normalize_box(
            &[400.0, 200.0, 500.0, 600.0],
            FieldType::Text,
            PAGE,
            &[far_left],
            &DEFAULT_EXPANSION_RULES,
        )
        .unwrap();
        let without = normalize([400.0, 200.0, 500.0, 600.0], FieldType::Text);
        assert_eq!(with, without);
    }

    #[test]
    fn top_clamps_at_page_edge() {
        let g = normalize([10.0, 100.0, 40.0, 400.0], FieldType::Initials);
        assert!(g.position_y >= 0.0);
        assert!(approx(g.position_y + g.height, 0.04));
    }

    #[test]
    fn narrow_line_at_right_edge_stays_on_page() {
        let g = normalize([500.0, 990.0, 510.0, 1000.0], FieldType::Number);
        assert!(approx(g.position_x + g.width, 1.0));
        assert!(approx(g.width, 0.036));
    }

    #[test]
    fn degenerate_boxes_are_rejected() {
        let inverted = normalize_box(
            &[500.0, 200.0, 400.0, 600.0],
            FieldType::Signature,
            PAGE,
            &[],
            &DEFAULT_EXPANSION_RULES,
        );
        assert!(matches!(inverted, Err(GeometryRejection::Degenerate { .. })));

        let off_page = normalize_box(
            &[1200.0, 200.0, 1300.0, 600.0],
            FieldType::Checkbox,
            PAGE,
            &[],
            &DEFAULT_EXPANSION_RULES,
        );
        assert!(matches!(off_page, Err(GeometryRejection::Degenerate { .. })));

        let nan = normalize_box(
            &[f64::NAN, 0.0, 1.0, 1.0],
            FieldType::Text,
            PAGE,
            &[],
            &DEFAULT_EXPANSION_RULES,
        );
        assert_eq!(nan, Err(GeometryRejection::NonFinite));
    }

    #[test]
    fn normalization_is_idempotent_and_monotonic() {
        let boxes = [
            [0.0, 0.0, 5.0, 5.0],
            [120.0, 40.0, 125.0, 300.0],
            [333.0, 333.0, 444.0, 444.0],
            [900.0, 10.0, 990.0, 990.0],
            [995.0, 500.0, 1000.0, 505.0],
        ];
        for bbox in boxes {
            for field_type in FieldType::ALL {
                let first = normalize(bbox, field_type);
                let second = normalize(bbox, field_type);
                assert_eq!(first, second);
                if field_type.is_line_based() {
                    let raw_height = (bbox[2] - bbox[0]) / SCALE;
                    assert!(first.height + 1e-12 >= raw_height);
                    assert!(approx(first.position_y + first.height, bbox[2] / SCALE));
                    assert!(first.width + 1e-12 >= 0.036);
                    if bbox[2] >= DEFAULT_EXPANSION_RULES.min_height {
                        assert!(first.height + 1e-12 >= 0.03);
                    }
                }
            }
        }
    }

    #[test]
    fn pixel_rect_scales_with_page() {
        let g = normalize([100.0, 50.0, 120.0, 70.0], FieldType::Checkbox);
        let (x, y, w, h) = g.to_pixel_rect(PageDimensions {
            pixel_width: 1000,
            pixel_height: 2000,
        });
        assert_eq!((x, y, w, h), (50, 200, 20, 40));
    }
}
