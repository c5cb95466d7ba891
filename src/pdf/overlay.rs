//! Stamping OCR words onto rasterized pages as positioned text.

use lopdf::{Object, StringFormat, content::Operation};

use super::{
    font::{FONT_RESOURCE, encode_win_ansi, font_size_for_width},
    raster::{ImagePdf, INVISIBLE_TEXT_STATE, VISIBLE_TEXT_STATE, real},
};
use crate::{geometry::BoundingBox, ocr::blocks::OcrBlocks, prelude::*};

/// Crimson, used for visible text and debug word boxes.
const DEBUG_RGB: [f64; 3] = [220.0 / 255.0, 20.0 / 255.0, 60.0 / 255.0];

/// Line width for debug word boxes, in points.
const DEBUG_BOX_LINE_WIDTH: f64 = 0.7;

/// Debugging switches for the overlay.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayOptions {
    /// Outline each word's bounding box.
    pub add_word_bbox: bool,
    /// Make the text visible.
    pub show_characters: bool,
}

/// Places every OCR word on its page, sized to span its bounding box.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOverlayEngine {
    options: OverlayOptions,
}

impl TextOverlayEngine {
    pub fn new(options: OverlayOptions) -> Self {
        Self { options }
    }

    /// Add text for every WORD in `blocks`. Returns how many words were placed.
    ///
    /// Fails without partial results if any word can't be placed, such as a
    /// word on a page the document doesn't have.
    #[instrument(level = "debug", skip_all, fields(pages = pdf.page_count()))]
    pub fn apply(&self, pdf: &mut ImagePdf, blocks: &OcrBlocks) -> Result<usize> {
        // Check everything before we touch any page.
        let page_count = pdf.page_count();
        if let Some(word) = blocks.words().find(|w| w.page_number() > page_count) {
            return Err(anyhow!(
                "word {} is on page {} but the document has {} pages",
                word.id,
                word.page_number(),
                page_count
            ));
        }

        let mut placed = 0;
        for word in blocks.words() {
            let (Some(text), Some(geometry)) = (word.text.as_deref(), word.geometry.as_ref())
            else {
                trace!(id = %word.id, "Skipping word without text or geometry");
                continue;
            };
            let page = pdf
                .page_mut(word.page_number())
                .ok_or_else(|| anyhow!("no page {} for word {}", word.page_number(), word.id))?;
            let bbox = BoundingBox::from_normalized(&geometry.bounding_box, page.width, page.height);
            let operations = self.word_operations(text, &bbox, page.height);
            if operations.is_empty() {
                continue;
            }
            page.push_operations(operations);
            placed += 1;
        }
        debug!(placed, "Placed OCR words");
        Ok(placed)
    }

    /// Content operations for one word, or nothing if it has no width.
    fn word_operations(&self, text: &str, bbox: &BoundingBox, page_height: f64) -> Vec<Operation> {
        let text = text.trim();
        let encoded = encode_win_ansi(text);
        if encoded.is_empty() {
            return vec![];
        }
        let Some(font_size) = font_size_for_width(&encoded, bbox.width()) else {
            return vec![];
        };

        // PDF space grows upwards from the bottom of the page.
        let x = bbox.left;
        let y = page_height - bbox.bottom;
        let state = if self.options.show_characters {
            VISIBLE_TEXT_STATE
        } else {
            INVISIBLE_TEXT_STATE
        };

        let mut ops = vec![
            Operation::new("q", vec![]),
            Operation::new("gs", vec![Object::Name(state.into())]),
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![Object::Name(FONT_RESOURCE.into()), i64::from(font_size).into()],
            ),
            Operation::new("Td", vec![real(x), real(y)]),
        ];
        if self.options.show_characters {
            let [r, g, b] = DEBUG_RGB;
            ops.push(Operation::new("rg", vec![real(r), real(g), real(b)]));
        }
        ops.extend([
            Operation::new(
                "Tj",
                vec![Object::String(encoded, StringFormat::Hexadecimal)],
            ),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ]);

        if self.options.add_word_bbox {
            let [r, g, b] = DEBUG_RGB;
            ops.extend([
                Operation::new("q", vec![]),
                Operation::new("RG", vec![real(r), real(g), real(b)]),
                Operation::new("w", vec![real(DEBUG_BOX_LINE_WIDTH)]),
                Operation::new(
                    "re",
                    vec![real(x), real(y), real(bbox.width()), real(bbox.height())],
                ),
                Operation::new("S", vec![]),
                Operation::new("Q", vec![]),
            ]);
        }
        ops
    }
}
