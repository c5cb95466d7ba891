//! Per-page markdown export of OCR results.
//!
//! This is the text-only view of a document that downstream search and
//! graph tooling ingests next to the page images.

use super::blocks::{BlockKind, OcrBlocks};

/// The markdown for a single page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageMarkdown {
    pub page_number: u32,
    pub markdown: String,
}

/// Average confidence over the page's blocks, or 100 when nothing on the
/// page reports one.
fn page_confidence(blocks: &OcrBlocks, page: u32) -> f64 {
    let confidences = blocks
        .page_blocks(page)
        .filter_map(|block| block.confidence)
        .collect::<Vec<_>>();
    if confidences.is_empty() {
        100.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    }
}

/// Render one page. Returns an empty string for pages with no blocks.
pub fn page_markdown(blocks: &OcrBlocks, document_id: &str, page: u32) -> String {
    if blocks.page_blocks(page).next().is_none() {
        return String::new();
    }

    let mut lines = vec![
        format!("# Page {page}"),
        String::new(),
        format!("<!-- DOCUMENT_ID: {document_id} -->"),
        format!("<!-- PAGE_NUMBER: {page} -->"),
        format!("<!-- IMAGE_FILE: page_{page}.png -->"),
        String::new(),
    ];
    lines.push(format!(
        "<!-- CONFIDENCE: {:.1}% -->",
        page_confidence(blocks, page)
    ));
    lines.push(String::new());

    for block in blocks.page_blocks(page) {
        match block.block_type {
            BlockKind::Line => {
                let text = blocks.block_text(block);
                if !text.trim().is_empty() {
                    lines.push(text);
                    lines.push(String::new());
                }
            }
            BlockKind::Table => {
                let table = blocks.table_markdown(block);
                if !table.is_empty() {
                    lines.push(format!("<!-- TABLE: {} -->", block.id));
                    lines.push(table);
                    lines.push(String::new());
                }
            }
            _ => {}
        }
    }
    lines.join("\n")
}

/// Render every page that has blocks, in page order.
pub fn document_markdown(blocks: &OcrBlocks, document_id: &str) -> Vec<PageMarkdown> {
    blocks
        .page_numbers()
        .into_iter()
        .map(|page_number| PageMarkdown {
            page_number,
            markdown: page_markdown(blocks, document_id, page_number),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::NormalizedBox,
        ocr::blocks::tests::{parent, word},
    };

    #[test]
    fn renders_header_lines_and_confidence() {
        let mut w1 = word("w1", 2, "Invoice", NormalizedBox::default());
        w1.confidence = Some(90.0);
        let mut w2 = word("w2", 2, "42", NormalizedBox::default());
        w2.confidence = Some(80.0);
        let blocks = OcrBlocks::new(vec![
            parent("l1", BlockKind::Line, 2, &["w1", "w2"]),
            w1,
            w2,
        ]);

        let markdown = page_markdown(&blocks, "doc-1", 2);
        let expected = "\
# Page 2

<!-- DOCUMENT_ID: doc-1 -->
<!-- PAGE_NUMBER: 2 -->
<!-- IMAGE_FILE: page_2.png -->

<!-- CONFIDENCE: 85.0% -->

Invoice 42
";
        assert_eq!(markdown, expected);
        assert_eq!(page_markdown(&blocks, "doc-1", 1), "");
    }

    #[test]
    fn pages_without_confidence_default_to_100() {
        let blocks = OcrBlocks::new(vec![parent("l1", BlockKind::Line, 1, &[])]);
        let pages = document_markdown(&blocks, "d");
        assert_eq!(pages.len(), 1);
        assert!(pages[0].markdown.contains("<!-- CONFIDENCE: 100.0% -->"));
    }
}
