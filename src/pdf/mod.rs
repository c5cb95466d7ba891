//! Reading source PDFs and writing rasterized ones.

use std::collections::BTreeMap;

use lopdf::{Document, Object, ObjectId};

use crate::prelude::*;

pub mod dpi;
pub mod font;
pub mod overlay;
pub mod raster;

/// Points per inch.
pub const POINTS_PER_INCH: f64 = 72.0;

/// Page dimensions in PDF points, as displayed (after rotation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

/// A parsed input PDF. We never modify it.
pub struct SourcePdf {
    doc: Document,
    pages: BTreeMap<u32, ObjectId>,
}

impl SourcePdf {
    /// Parse a PDF held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc = Document::load_mem(bytes).context("failed to parse PDF")?;
        let pages = doc.get_pages();
        if pages.is_empty() {
            return Err(anyhow!("PDF has no pages"));
        }
        Ok(Self { doc, pages })
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// 1-based page numbers, in order.
    pub fn page_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.keys().copied()
    }

    pub(crate) fn document(&self) -> &Document {
        &self.doc
    }

    pub(crate) fn page_id(&self, page_number: u32) -> Result<ObjectId> {
        self.pages
            .get(&page_number)
            .copied()
            .ok_or_else(|| anyhow!("page {} is out of range", page_number))
    }

    /// The visible size of a page: its CropBox (or MediaBox), swapped for
    /// quarter-turn rotations.
    pub fn page_size(&self, page_number: u32) -> Result<PageSize> {
        let page_id = self.page_id(page_number)?;
        let rect = match resolve_inherited(&self.doc, page_id, b"CropBox")? {
            Some(obj) => obj,
            None => resolve_inherited(&self.doc, page_id, b"MediaBox")?
                .ok_or_else(|| anyhow!("page {} has no MediaBox", page_number))?,
        };
        let rect = resolve(&self.doc, rect)?
            .as_array()
            .with_context(|| format!("page {} box is not an array", page_number))?;
        if rect.len() != 4 {
            return Err(anyhow!(
                "page {} box has {} entries, expected 4",
                page_number,
                rect.len()
            ));
        }
        let coords = rect
            .iter()
            .map(|obj| object_to_f64(resolve(&self.doc, obj)?))
            .collect::<Result<Vec<_>>>()?;
        let width = (coords[2] - coords[0]).abs();
        let height = (coords[3] - coords[1]).abs();

        let rotate = match resolve_inherited(&self.doc, page_id, b"Rotate")? {
            Some(obj) => resolve(&self.doc, obj)?.as_i64().unwrap_or(0),
            None => 0,
        };
        if rotate.rem_euclid(180) == 90 {
            Ok(PageSize {
                width: height,
                height: width,
            })
        } else {
            Ok(PageSize { width, height })
        }
    }
}

/// Convert a numeric PDF object to `f64`.
pub(crate) fn object_to_f64(obj: &Object) -> Result<f64> {
    match obj {
        Object::Integer(i) => Ok(*i as f64),
        Object::Real(f) => Ok(f64::from(*f)),
        _ => Err(anyhow!("expected a number, got {:?}", obj)),
    }
}

/// Follow an indirect reference, if `obj` is one.
pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object> {
    match obj {
        Object::Reference(id) => doc
            .get_object(*id)
            .with_context(|| format!("dangling reference {} {} R", id.0, id.1)),
        other => Ok(other),
    }
}

/// Look up a page attribute, walking up the page tree through `/Parent`.
pub(crate) fn resolve_inherited<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<Option<&'a Object>> {
    let mut current = page_id;
    // Page trees are shallow. A long chain means a cycle.
    for _ in 0..64 {
        let dict = doc
            .get_object(current)
            .and_then(|obj| obj.as_dict())
            .context("page tree node is not a dictionary")?;
        if let Ok(value) = dict.get(key) {
            return Ok(Some(value));
        }
        match dict.get(b"Parent") {
            Ok(parent) => {
                current = parent
                    .as_reference()
                    .context("/Parent is not a reference")?;
            }
            Err(_) => return Ok(None),
        }
    }
    Err(anyhow!("page tree is too deep (cycle in /Parent?)"))
}

#[cfg(test)]
pub(crate) mod tests {
    use lopdf::{Dictionary, Stream, content::Content, content::Operation, dictionary};

    use super::*;

    /// An image XObject to place on a test page.
    pub(crate) struct TestImage {
        pub pixel_width: i64,
        pub pixel_height: i64,
        /// `[a b c d e f]` for the `cm` before `Do`, or `None` to list the
        /// image in the resources without drawing it.
        pub placement: Option<[f32; 6]>,
    }

    /// Build a PDF with one page per entry of `(media_box, rotate, images)`.
    pub(crate) fn test_pdf(pages: &[([f32; 4], i64, Vec<TestImage>)]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = vec![];
        for (media_box, rotate, images) in pages {
            let mut xobjects = Dictionary::new();
            let mut operations = vec![];
            for (i, image) in images.iter().enumerate() {
                let name = format!("Im{i}");
                let image_id = doc.add_object(Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => image.pixel_width,
                        "Height" => image.pixel_height,
                        "ColorSpace" => "DeviceGray",
                        "BitsPerComponent" => 8,
                    },
                    // Nothing we test reads the samples.
                    vec![],
                ));
                xobjects.set(name.as_bytes().to_vec(), image_id);
                if let Some(m) = image.placement {
                    operations.push(Operation::new("q", vec![]));
                    operations.push(Operation::new(
                        "cm",
                        m.iter().map(|v| Object::Real(*v)).collect(),
                    ));
                    operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
                    operations.push(Operation::new("Q", vec![]));
                }
            }
            let content = Content { operations }.encode().unwrap();
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => media_box.iter().map(|v| Object::Real(*v)).collect::<Vec<_>>(),
                "Rotate" => *rotate,
                "Contents" => content_id,
                "Resources" => dictionary! { "XObject" => xobjects },
            });
            kids.push(Object::Reference(page_id));
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = vec![];
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    pub(crate) const LETTER: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

    /// Give one page of a test PDF a CropBox.
    pub(crate) fn with_crop_box(pdf: &[u8], page_number: u32, crop_box: [f32; 4]) -> Vec<u8> {
        let mut doc = Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page_number];
        doc.get_object_mut(page_id)
            .and_then(Object::as_dict_mut)
            .unwrap()
            .set(
                "CropBox",
                crop_box.iter().map(|v| Object::Real(*v)).collect::<Vec<_>>(),
            );
        let mut bytes = vec![];
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn crop_box_wins_over_media_box() -> Result<()> {
        let pdf = with_crop_box(
            &test_pdf(&[(LETTER, 0, vec![]), (LETTER, 0, vec![])]),
            2,
            [36.0, 36.0, 324.0, 396.0],
        );
        let pdf = SourcePdf::from_bytes(&pdf)?;
        assert_eq!(
            pdf.page_size(1)?,
            PageSize {
                width: 612.0,
                height: 792.0
            }
        );
        assert_eq!(
            pdf.page_size(2)?,
            PageSize {
                width: 288.0,
                height: 360.0
            }
        );
        Ok(())
    }

    #[test]
    fn page_sizes_honor_rotation() -> Result<()> {
        let pdf = SourcePdf::from_bytes(&test_pdf(&[
            (LETTER, 0, vec![]),
            (LETTER, 90, vec![]),
            ([10.0, 20.0, 310.0, 420.0], -270, vec![]),
        ]))?;
        assert_eq!(pdf.page_count(), 3);
        assert_eq!(pdf.page_numbers().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            pdf.page_size(1)?,
            PageSize {
                width: 612.0,
                height: 792.0
            }
        );
        assert_eq!(
            pdf.page_size(2)?,
            PageSize {
                width: 792.0,
                height: 612.0
            }
        );
        assert_eq!(
            pdf.page_size(3)?,
            PageSize {
                width: 400.0,
                height: 300.0
            }
        );
        assert!(pdf.page_size(4).is_err());
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(SourcePdf::from_bytes(b"not a pdf").is_err());
    }
}
