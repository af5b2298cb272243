//! Draws match results onto a copy of the source image.

use crate::types::MatchResult;
use ab_glyph::FontArc;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

const KNOWN_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_OFFSET: i32 = 10;

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// DejaVu Sans, compiled into the binary.
pub fn bundled_font() -> Option<FontArc> {
    match FontArc::try_from_slice(BUNDLED_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "bundled annotation font unusable; labels disabled");
            None
        }
    }
}

/// `"<name> (<pct>%)"`, followed by `" [<models>]"` when any model voted.
pub fn label_for(result: &MatchResult) -> String {
    let mut label = format!("{} ({:.0}%)", result.name(), result.confidence * 100.0);
    if !result.models.is_empty() {
        label.push_str(&format!(" [{}]", result.models.join(", ")));
    }
    label
}

/// Box-and-label renderer. Labels use the bundled font unless another is given.
#[derive(Clone)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(bundled_font())
    }
}

impl Annotator {
    /// `None` draws boxes only.
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Return a copy of `image` with one box and label per result.
    pub fn annotate(&self, image: &RgbImage, results: &[MatchResult]) -> RgbImage {
        let mut canvas = image.clone();

        for result in results {
            let colour = if result.is_known() { KNOWN_COLOUR } else { UNKNOWN_COLOUR };
            let area = result.area;

            for inset in 0..BOX_THICKNESS {
                let w = area.w.saturating_sub(2 * inset);
                let h = area.h.saturating_sub(2 * inset);
                if w == 0 || h == 0 {
                    break;
                }
                let rect = Rect::at((area.x + inset) as i32, (area.y + inset) as i32).of_size(w, h);
                draw_hollow_rect_mut(&mut canvas, rect, colour);
            }

            if let Some(font) = &self.font {
                let y = (area.y as i32 - LABEL_OFFSET - LABEL_SCALE as i32).max(0);
                draw_text_mut(&mut canvas, colour, area.x as i32, y, LABEL_SCALE, font, &label_for(result));
            }
        }

        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceBox, FaceId};

    fn result(identity: Option<&str>, confidence: f32, models: &[&str], area: FaceBox) -> MatchResult {
        MatchResult {
            identity: identity.map(String::from),
            confidence,
            face_id: FaceId::new(0, &area),
            area,
            models: models.iter().map(|m| m.to_string()).collect(),
            detection_confidence: 0.99,
        }
    }

    #[test]
    fn test_label_known() {
        let r = result(Some("alice"), 0.874, &["ArcFace", "Facenet"], FaceBox { x: 0, y: 0, w: 5, h: 5 });
        assert_eq!(label_for(&r), "alice (87%) [ArcFace, Facenet]");
    }

    #[test]
    fn test_label_unknown() {
        let r = result(None, 0.0, &[], FaceBox { x: 0, y: 0, w: 5, h: 5 });
        assert_eq!(label_for(&r), "Unknown (0%)");
    }

    #[test]
    fn test_annotate_draws_coloured_boxes_on_copy() {
        let original = RgbImage::from_pixel(100, 100, Rgb([10, 10, 10]));
        let results = vec![
            result(Some("alice"), 0.9, &["ArcFace"], FaceBox { x: 10, y: 20, w: 30, h: 30 }),
            result(None, 0.0, &[], FaceBox { x: 60, y: 60, w: 20, h: 20 }),
        ];

        let annotated = Annotator::new(None).annotate(&original, &results);

        assert_eq!(annotated.dimensions(), original.dimensions());
        assert_eq!(annotated.get_pixel(10, 20), &KNOWN_COLOUR);
        assert_eq!(annotated.get_pixel(11, 25), &KNOWN_COLOUR, "second pixel of the border");
        assert_eq!(annotated.get_pixel(25, 35), &Rgb([10, 10, 10]), "box interior untouched");
        assert_eq!(annotated.get_pixel(79, 79), &UNKNOWN_COLOUR);

        assert!(original.pixels().all(|p| *p == Rgb([10, 10, 10])), "input must not be modified");
    }

    #[test]
    fn test_annotate_without_results_is_identical() {
        let original = RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8, y as u8, 0]));
        let annotated = Annotator::default().annotate(&original, &[]);
        assert_eq!(annotated, original);
    }

    #[test]
    fn test_bundled_font_loads() {
        assert!(bundled_font().is_some());
    }

    #[test]
    fn test_default_annotator_draws_label_above_box() {
        let background = Rgb([10, 10, 10]);
        let original = RgbImage::from_pixel(200, 200, background);
        let results = vec![result(Some("alice"), 0.9, &["ArcFace"], FaceBox { x: 20, y: 100, w: 60, h: 60 })];

        let annotated = Annotator::default().annotate(&original, &results);

        let label_pixels = (0..100)
            .flat_map(|y| (0..200).map(move |x| (x, y)))
            .filter(|&(x, y)| *annotated.get_pixel(x, y) != background)
            .count();
        assert!(label_pixels > 0, "label should be drawn above the box");
    }

    #[test]
    fn test_boxes_only_leaves_band_above_untouched() {
        let background = Rgb([10, 10, 10]);
        let original = RgbImage::from_pixel(200, 200, background);
        let results = vec![result(Some("alice"), 0.9, &["ArcFace"], FaceBox { x: 20, y: 100, w: 60, h: 60 })];

        let annotated = Annotator::new(None).annotate(&original, &results);

        assert!((0..100).all(|y| (0..200).all(|x| *annotated.get_pixel(x, y) == background)));
    }

    #[test]
    fn test_annotate_tiny_box() {
        let original = RgbImage::new(10, 10);
        let results = vec![result(None, 0.0, &[], FaceBox { x: 8, y: 8, w: 2, h: 2 })];
        let annotated = Annotator::new(None).annotate(&original, &results);
        assert_eq!(annotated.get_pixel(9, 9), &UNKNOWN_COLOUR);
    }
}
