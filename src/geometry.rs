//! Mapping OCR geometry onto page canvases.
//!
//! OCR boxes are normalized to `[0, 1]` relative to the page, with the origin
//! at the top left. We scale them onto whatever canvas we're drawing on: page
//! images in pixels, or output pages in PDF points.

use serde::{Deserialize, Serialize};

/// A bounding box normalized to the page, as reported by the OCR service.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NormalizedBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// An absolute rectangle on a canvas, top-left origin, `y` growing downwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    /// Scale a normalized box onto a canvas of the given size.
    pub fn from_normalized(
        normalized: &NormalizedBox,
        canvas_width: f64,
        canvas_height: f64,
    ) -> Self {
        let left = normalized.left * canvas_width;
        let top = normalized.top * canvas_height;
        Self {
            left,
            top,
            right: left + normalized.width * canvas_width,
            bottom: top + normalized.height * canvas_height,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}
