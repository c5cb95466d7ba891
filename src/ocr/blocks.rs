//! The OCR block graph.
//!
//! Blocks are stored in the same shape the OCR service returns them, so a
//! saved dump (`{"Blocks": [...]}`) can be read back without conversion.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{geometry::NormalizedBox, prelude::*};

/// Largest row or column index we will lay out in a table grid.
const MAX_TABLE_INDEX: u32 = 500;

/// The kind of an [`OcrBlock`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum BlockKind {
    Page,
    Line,
    Word,
    Table,
    Cell,
    /// Block types we carry through but never interpret, like
    /// `SELECTION_ELEMENT` or `LAYOUT_TEXT`.
    Other(String),
}

impl From<String> for BlockKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PAGE" => BlockKind::Page,
            "LINE" => BlockKind::Line,
            "WORD" => BlockKind::Word,
            "TABLE" => BlockKind::Table,
            "CELL" => BlockKind::Cell,
            _ => BlockKind::Other(value),
        }
    }
}

impl From<BlockKind> for String {
    fn from(value: BlockKind) -> Self {
        value.as_str().to_owned()
    }
}

impl BlockKind {
    pub fn as_str(&self) -> &str {
        match self {
            BlockKind::Page => "PAGE",
            BlockKind::Line => "LINE",
            BlockKind::Word => "WORD",
            BlockKind::Table => "TABLE",
            BlockKind::Cell => "CELL",
            BlockKind::Other(other) => other,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block geometry. We only use the axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockGeometry {
    pub bounding_box: NormalizedBox,
}

/// A typed edge to other blocks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Relationship {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

impl Relationship {
    pub fn is_child(&self) -> bool {
        self.kind == "CHILD"
    }
}

/// One node of the OCR output.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OcrBlock {
    pub id: String,
    pub block_type: BlockKind,
    /// 1-based page number. Single-page results may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<BlockGeometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_index: Option<u32>,
}

impl OcrBlock {
    /// The page this block belongs to.
    pub fn page_number(&self) -> u32 {
        self.page.unwrap_or(1)
    }

    /// Ids of child blocks, in relationship order.
    pub fn child_ids(&self) -> impl Iterator<Item = &str> {
        self.relationships
            .iter()
            .filter(|rel| rel.is_child())
            .flat_map(|rel| rel.ids.iter().map(String::as_str))
    }
}

/// Serialized form of a block dump.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BlockDump {
    blocks: Vec<OcrBlock>,
}

/// Dumps come either wrapped in an object or as a bare list.
#[derive(Deserialize)]
#[serde(untagged)]
enum BlockDumpInput {
    Wrapped(BlockDump),
    Bare(Vec<OcrBlock>),
}

/// An immutable, indexed list of OCR blocks.
#[derive(Debug, Clone, Default)]
pub struct OcrBlocks {
    blocks: Vec<OcrBlock>,
    by_id: HashMap<String, usize>,
}

impl OcrBlocks {
    pub fn new(blocks: Vec<OcrBlock>) -> Self {
        let by_id = blocks
            .iter()
            .enumerate()
            .map(|(idx, block)| (block.id.clone(), idx))
            .collect();
        Self { blocks, by_id }
    }

    /// Parse a block dump.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let input: BlockDumpInput =
            serde_json::from_slice(data).context("could not parse OCR block dump")?;
        Ok(match input {
            BlockDumpInput::Wrapped(dump) => Self::new(dump.blocks),
            BlockDumpInput::Bare(blocks) => Self::new(blocks),
        })
    }

    /// Serialize as `{"Blocks": [...]}`.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct BlockDumpRef<'a> {
            blocks: &'a [OcrBlock],
        }
        serde_json::to_vec(&BlockDumpRef {
            blocks: &self.blocks,
        })
        .context("could not serialize OCR blocks")
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OcrBlock> {
        self.blocks.iter()
    }

    pub fn get(&self, id: &str) -> Option<&OcrBlock> {
        self.by_id.get(id).map(|&idx| &self.blocks[idx])
    }

    /// All WORD blocks, in output order.
    pub fn words(&self) -> impl Iterator<Item = &OcrBlock> {
        self.blocks
            .iter()
            .filter(|block| block.block_type == BlockKind::Word)
    }

    /// Every page number mentioned by any block.
    pub fn page_numbers(&self) -> BTreeSet<u32> {
        self.blocks.iter().map(OcrBlock::page_number).collect()
    }

    /// Blocks on a page, in output order.
    pub fn page_blocks(&self, page: u32) -> impl Iterator<Item = &OcrBlock> {
        self.blocks
            .iter()
            .filter(move |block| block.page_number() == page)
    }

    /// Resolve the child blocks of `block`, skipping dangling ids.
    pub fn children<'a>(
        &'a self,
        block: &'a OcrBlock,
    ) -> impl Iterator<Item = &'a OcrBlock> + 'a {
        block.child_ids().filter_map(move |id| {
            let child = self.get(id);
            if child.is_none() {
                trace!(parent = %block.id, child = %id, "Dangling OCR relationship");
            }
            child
        })
    }

    /// Space-joined text of the child WORDs of `block`.
    fn child_word_text(&self, block: &OcrBlock) -> String {
        self.children(block)
            .filter(|child| child.block_type == BlockKind::Word)
            .map(|child| child.text.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The displayed text of a block.
    ///
    /// LINEs are rebuilt from their WORD children. Other blocks use their own
    /// text.
    pub fn block_text(&self, block: &OcrBlock) -> String {
        match block.block_type {
            BlockKind::Line if block.child_ids().next().is_some() => {
                self.child_word_text(block)
            }
            _ => block.text.clone().unwrap_or_default(),
        }
    }

    /// Render a TABLE as a markdown grid. The first row is treated as the
    /// header. Missing cells become empty cells.
    pub fn table_markdown(&self, table: &OcrBlock) -> String {
        let mut cells = BTreeMap::new();
        let mut max_row = 0;
        let mut max_col = 0;
        for cell in self.children(table) {
            if cell.block_type != BlockKind::Cell {
                continue;
            }
            let row = cell.row_index.unwrap_or(1);
            let col = cell.column_index.unwrap_or(1);
            if row > MAX_TABLE_INDEX || col > MAX_TABLE_INDEX {
                warn!(
                    table = %table.id,
                    cell = %cell.id,
                    row,
                    col,
                    "Skipping table cell with an implausible index"
                );
                continue;
            }
            max_row = max_row.max(row);
            max_col = max_col.max(col);
            cells.insert((row, col), self.child_word_text(cell));
        }
        if max_row == 0 || max_col == 0 {
            return String::new();
        }

        let mut lines = Vec::with_capacity(max_row as usize + 1);
        for row in 1..=max_row {
            let row_cells = (1..=max_col)
                .map(|col| cells.get(&(row, col)).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>();
            lines.push(format!("| {} |", row_cells.join(" | ")));
            if row == 1 {
                lines.push(format!("|{}|", vec!["---"; max_col as usize].join("|")));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a WORD block.
    pub(crate) fn word(id: &str, page: u32, text: &str, bbox: NormalizedBox) -> OcrBlock {
        OcrBlock {
            id: id.to_owned(),
            block_type: BlockKind::Word,
            page: Some(page),
            geometry: Some(BlockGeometry { bounding_box: bbox }),
            text: Some(text.to_owned()),
            relationships: vec![],
            confidence: Some(99.0),
            row_index: None,
            column_index: None,
        }
    }

    /// Build a block with children.
    pub(crate) fn parent(id: &str, kind: BlockKind, page: u32, children: &[&str]) -> OcrBlock {
        OcrBlock {
            id: id.to_owned(),
            block_type: kind,
            page: Some(page),
            geometry: None,
            text: None,
            relationships: vec![Relationship {
                kind: "CHILD".to_owned(),
                ids: children.iter().map(|&id| id.to_owned()).collect(),
            }],
            confidence: None,
            row_index: None,
            column_index: None,
        }
    }

    fn cell(id: &str, row: u32, col: u32, children: &[&str]) -> OcrBlock {
        OcrBlock {
            row_index: Some(row),
            column_index: Some(col),
            ..parent(id, BlockKind::Cell, 1, children)
        }
    }

    fn w(id: &str, text: &str) -> OcrBlock {
        word(id, 1, text, NormalizedBox::default())
    }

    #[test]
    fn line_text_joins_child_words_in_order() {
        let blocks = OcrBlocks::new(vec![
            parent("l1", BlockKind::Line, 1, &["w2", "w1", "missing"]),
            w("w1", "world"),
            w("w2", "hello"),
        ]);
        let line = blocks.get("l1").unwrap();
        assert_eq!(blocks.block_text(line), "hello world");
    }

    #[test]
    fn table_with_missing_cell_keeps_its_column() {
        // Rows 1-3, columns 1-2, with (2, 2) missing.
        let blocks = OcrBlocks::new(vec![
            parent("t", BlockKind::Table, 1, &["c11", "c12", "c21", "c31", "c32"]),
            cell("c11", 1, 1, &["a"]),
            cell("c12", 1, 2, &["b"]),
            cell("c21", 2, 1, &["c"]),
            cell("c31", 3, 1, &["d"]),
            cell("c32", 3, 2, &["e1", "e2"]),
            w("a", "Name"),
            w("b", "Qty"),
            w("c", "Apples"),
            w("d", "Pears"),
            w("e1", "4"),
            w("e2", "kg"),
        ]);
        let markdown = blocks.table_markdown(blocks.get("t").unwrap());
        let lines = markdown.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "| Name | Qty |",
                "|---|---|",
                "| Apples |  |",
                "| Pears | 4 kg |",
            ]
        );
        // 3 data rows plus the separator, 2 columns each.
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|line| line.matches('|').count() == 3));
    }

    #[test]
    fn implausible_cell_indexes_are_skipped() {
        let blocks = OcrBlocks::new(vec![
            parent("t", BlockKind::Table, 1, &["c11", "huge"]),
            cell("c11", 1, 1, &["a"]),
            cell("huge", u32::MAX, u32::MAX, &["b"]),
            w("a", "Total"),
            w("b", "junk"),
        ]);
        assert_eq!(
            blocks.table_markdown(blocks.get("t").unwrap()),
            "| Total |\n|---|"
        );
    }

    #[test]
    fn blocks_without_a_page_belong_to_page_one() {
        let mut unpaged = w("u", "Caption");
        unpaged.page = None;
        let blocks = OcrBlocks::new(vec![unpaged, word("p2", 2, "Body", NormalizedBox::default())]);
        assert_eq!(blocks.page_numbers().into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            blocks.page_blocks(1).map(|block| block.id.as_str()).collect::<Vec<_>>(),
            vec!["u"]
        );
    }

    #[test]
    fn empty_table_renders_nothing() {
        let blocks = OcrBlocks::new(vec![parent("t", BlockKind::Table, 1, &[])]);
        assert_eq!(blocks.table_markdown(blocks.get("t").unwrap()), "");
    }

    #[test]
    fn dump_round_trips_service_json() {
        let json = br#"{"Blocks": [
            {"BlockType": "PAGE", "Id": "p", "Page": 1,
             "Relationships": [{"Type": "CHILD", "Ids": ["w"]}]},
            {"BlockType": "WORD", "Id": "w", "Page": 1, "Text": "Hi",
             "Confidence": 98.5, "TextType": "PRINTED",
             "Geometry": {"BoundingBox": {"Width": 0.1, "Height": 0.02,
                                          "Left": 0.2, "Top": 0.3},
                          "Polygon": []}},
            {"BlockType": "SELECTION_ELEMENT", "Id": "s", "Page": 1}
        ]}"#;
        let blocks = OcrBlocks::from_json(json).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks.words().count(), 1);
        assert_eq!(
            blocks.get("s").unwrap().block_type,
            BlockKind::Other("SELECTION_ELEMENT".to_owned())
        );

        let again = OcrBlocks::from_json(&blocks.to_json().unwrap()).unwrap();
        assert_eq!(again.get("w"), blocks.get("w"));
        assert_eq!(again.get("s").unwrap().block_type.as_str(), "SELECTION_ELEMENT");
    }

    #[test]
    fn bare_block_lists_are_accepted() {
        let blocks = OcrBlocks::from_json(br#"[{"BlockType": "WORD", "Id": "w"}]"#).unwrap();
        assert_eq!(blocks.words().next().unwrap().page_number(), 1);
    }
}
