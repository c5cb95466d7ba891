//! Estimating the resolution a page was scanned at.
//!
//! Scanned pages carry their scan as an embedded image, drawn at some size on
//! the page. Comparing the image's pixel size with its drawn size tells us the
//! scan DPI, which is the resolution we want to re-render at.

use std::collections::BTreeMap;

use lopdf::{Dictionary, Document, Object, ObjectId, content::Content, content::Operation};

use super::{POINTS_PER_INCH, PageSize, SourcePdf, object_to_f64, resolve, resolve_inherited};
use crate::prelude::*;

pub const MIN_DPI: u32 = 72;
pub const MAX_DPI: u32 = 400;

/// Used when estimation fails, and for pages with no images that don't look
/// like US Letter scans.
pub const DEFAULT_DPI: u32 = 150;

/// Assumed for image-free pages of roughly US Letter size.
pub const LETTER_SCAN_DPI: u32 = 300;

/// How deeply we follow nested form XObjects.
const MAX_FORM_DEPTH: usize = 8;

/// An affine transform `[a b c d e f]`, as used by `cm`.
type Matrix = [f64; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// Compute `m × ctm`, the new CTM after `m cm`.
fn concat(m: &Matrix, ctm: &Matrix) -> Matrix {
    [
        m[0] * ctm[0] + m[1] * ctm[2],
        m[0] * ctm[1] + m[1] * ctm[3],
        m[2] * ctm[0] + m[3] * ctm[2],
        m[2] * ctm[1] + m[3] * ctm[3],
        m[4] * ctm[0] + m[5] * ctm[2] + ctm[4],
        m[4] * ctm[1] + m[5] * ctm[3] + ctm[5],
    ]
}

fn matrix_from_objects(doc: &Document, objects: &[Object]) -> Result<Matrix> {
    if objects.len() != 6 {
        return Err(anyhow!("expected 6 matrix entries, got {}", objects.len()));
    }
    let mut matrix = IDENTITY;
    for (slot, obj) in matrix.iter_mut().zip(objects) {
        *slot = object_to_f64(resolve(doc, obj)?)?;
    }
    Ok(matrix)
}

/// Estimate the DPI to render a page at. Never fails: anything unexpected in
/// the page falls back to [`DEFAULT_DPI`].
#[instrument(level = "debug", skip(pdf))]
pub fn estimate_page_dpi(pdf: &SourcePdf, page_number: u32) -> u32 {
    match try_estimate_page_dpi(pdf, page_number) {
        Ok(dpi) => {
            debug!(dpi, "Estimated page DPI");
            dpi
        }
        Err(err) => {
            warn!(
                page_number,
                "Could not estimate page DPI, using {}: {:#}", DEFAULT_DPI, err
            );
            DEFAULT_DPI
        }
    }
}

fn try_estimate_page_dpi(pdf: &SourcePdf, page_number: u32) -> Result<u32> {
    let doc = pdf.document();
    let page_id = pdf.page_id(page_number)?;
    let size = pdf.page_size(page_number)?;
    let resources = match resolve_inherited(doc, page_id, b"Resources")? {
        Some(obj) => Some(resolve(doc, obj)?.as_dict()?),
        None => None,
    };

    let mut walker = ImageWalker {
        doc,
        drawn: BTreeMap::new(),
    };
    let content = Content::decode(&page_content(doc, page_id)?)
        .with_context(|| format!("could not parse content of page {}", page_number))?;
    walker.walk(&content.operations, resources, IDENTITY, 0)?;

    let mut samples = walker.drawn.values().filter_map(|dpi| *dpi).collect::<Vec<_>>();
    let mut image_count = walker.drawn.len();

    // Images the page lists but that we never saw drawn: assume they span the
    // page height.
    if let Some(xobjects) = xobject_dict(doc, resources)? {
        for (_, obj) in xobjects.iter() {
            let Object::Reference(id) = obj else { continue };
            if walker.drawn.contains_key(id) {
                continue;
            }
            if let Some((_, pixel_height)) = image_pixel_size(doc, *id)? {
                image_count += 1;
                samples.push(pixel_height / size.height * POINTS_PER_INCH);
            }
        }
    }

    Ok(dpi_from_samples(samples, image_count > 0, size))
}

/// Combine per-image estimates into one page DPI. The page-size guess is
/// only for pages without images; a page whose images all gave unusable
/// estimates gets [`DEFAULT_DPI`].
pub(crate) fn dpi_from_samples(mut samples: Vec<f64>, has_images: bool, size: PageSize) -> u32 {
    samples.retain(|dpi| dpi.is_finite() && *dpi > 0.0);
    if samples.is_empty() {
        return if has_images {
            DEFAULT_DPI
        } else {
            dpi_from_page_size(size)
        };
    }
    samples.sort_by(f64::total_cmp);
    let median = samples[samples.len() / 2];
    median.clamp(f64::from(MIN_DPI), f64::from(MAX_DPI)) as u32
}

/// Guess for pages without images.
pub(crate) fn dpi_from_page_size(size: PageSize) -> u32 {
    let letterish = 400.0 < size.width
        && size.width < 700.0
        && 500.0 < size.height
        && size.height < 900.0;
    if letterish { LETTER_SCAN_DPI } else { DEFAULT_DPI }
}

/// Concatenated, decompressed content streams of a page.
fn page_content(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>> {
    let page = doc.get_object(page_id)?.as_dict()?;
    let Ok(contents) = page.get(b"Contents") else {
        return Ok(vec![]);
    };
    let refs = match contents {
        Object::Reference(id) => match doc.get_object(*id)? {
            Object::Array(items) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Object::Array(items) => items.clone(),
        other => return Err(anyhow!("unexpected /Contents {:?}", other)),
    };
    let mut content = vec![];
    for item in &refs {
        let stream = resolve(doc, item)?
            .as_stream()
            .context("/Contents entry is not a stream")?;
        if !content.is_empty() {
            content.push(b'\n');
        }
        content.extend_from_slice(&stream_bytes(stream)?);
    }
    Ok(content)
}

fn stream_bytes(stream: &lopdf::Stream) -> Result<Vec<u8>> {
    if stream.dict.get(b"Filter").is_ok() {
        Ok(stream
            .decompressed_content()
            .context("could not decompress content stream")?)
    } else {
        Ok(stream.content.clone())
    }
}

fn xobject_dict<'a>(
    doc: &'a Document,
    resources: Option<&'a Dictionary>,
) -> Result<Option<&'a Dictionary>> {
    let Some(resources) = resources else {
        return Ok(None);
    };
    match resources.get(b"XObject") {
        Ok(obj) => Ok(Some(resolve(doc, obj)?.as_dict()?)),
        Err(_) => Ok(None),
    }
}

/// `(width, height)` in pixels, if `id` is an image XObject.
fn image_pixel_size(doc: &Document, id: ObjectId) -> Result<Option<(f64, f64)>> {
    let Ok(stream) = doc.get_object(id)?.as_stream() else {
        return Ok(None);
    };
    if !matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(name)) if name == b"Image") {
        return Ok(None);
    }
    let width = object_to_f64(resolve(doc, stream.dict.get(b"Width")?)?)?;
    let height = object_to_f64(resolve(doc, stream.dict.get(b"Height")?)?)?;
    Ok(Some((width, height)))
}

/// Follows the graphics state through a content stream, noting where each
/// image is drawn.
struct ImageWalker<'a> {
    doc: &'a Document,
    /// DPI of each image at its first placement, or `None` if that placement
    /// was degenerate.
    drawn: BTreeMap<ObjectId, Option<f64>>,
}

impl<'a> ImageWalker<'a> {
    fn walk(
        &mut self,
        operations: &[Operation],
        resources: Option<&'a Dictionary>,
        mut ctm: Matrix,
        depth: usize,
    ) -> Result<()> {
        let mut saved = vec![];
        for op in operations {
            match op.operator.as_str() {
                "q" => saved.push(ctm),
                "Q" => ctm = saved.pop().unwrap_or(ctm),
                "cm" => ctm = concat(&matrix_from_objects(self.doc, &op.operands)?, &ctm),
                "Do" => {
                    if let Some(Object::Name(name)) = op.operands.first() {
                        self.draw(name, resources, &ctm, depth)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn draw(
        &mut self,
        name: &[u8],
        resources: Option<&'a Dictionary>,
        ctm: &Matrix,
        depth: usize,
    ) -> Result<()> {
        let Some(xobjects) = xobject_dict(self.doc, resources)? else {
            return Ok(());
        };
        let Ok(Object::Reference(id)) = xobjects.get(name) else {
            return Ok(());
        };
        let stream = self.doc.get_object(*id)?.as_stream()?;
        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(subtype)) if subtype == b"Image" => {
                if self.drawn.contains_key(id) {
                    return Ok(());
                }
                let Some((pixel_width, pixel_height)) = image_pixel_size(self.doc, *id)? else {
                    return Ok(());
                };
                // Images are drawn into the unit square, so the CTM's column
                // lengths are the drawn size in points.
                let width = ctm[0].hypot(ctm[1]);
                let height = ctm[2].hypot(ctm[3]);
                let dpi = (width > 0.0 && height > 0.0).then(|| {
                    let dpi_x = pixel_width / (width / POINTS_PER_INCH);
                    let dpi_y = pixel_height / (height / POINTS_PER_INCH);
                    (dpi_x + dpi_y) / 2.0
                });
                self.drawn.insert(*id, dpi);
            }
            Ok(Object::Name(subtype)) if subtype == b"Form" && depth < MAX_FORM_DEPTH => {
                let matrix = match stream.dict.get(b"Matrix") {
                    Ok(obj) => matrix_from_objects(self.doc, resolve(self.doc, obj)?.as_array()?)?,
                    Err(_) => IDENTITY,
                };
                let form_resources = match stream.dict.get(b"Resources") {
                    Ok(obj) => Some(resolve(self.doc, obj)?.as_dict()?),
                    Err(_) => resources,
                };
                let content = Content::decode(&stream_bytes(stream)?)
                    .context("could not parse form XObject content")?;
                self.walk(
                    &content.operations,
                    form_resources,
                    concat(&matrix, ctm),
                    depth + 1,
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}
