//! Rendering pages to images, and assembling images back into a PDF.

use std::{fmt, io::Write as _, str::FromStr, sync::LazyLock};

use flate2::{Compression, write::ZlibEncoder};
use image::ImageFormat;
use lopdf::{Document, Object, Stream, content::Content, content::Operation, dictionary};
use regex::Regex;
use tokio::process::Command;

use super::font::{BASE_FONT, FONT_RESOURCE};
use crate::{
    async_utils::{
        check_for_command_failure, matches_default_error_regex,
        spawn_blocking_propagating_panics,
    },
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Graphics state that hides overlay text.
pub const INVISIBLE_TEXT_STATE: &str = "GS0";

/// Graphics state that shows overlay text.
pub const VISIBLE_TEXT_STATE: &str = "GS1";

/// Resource name of each page's image.
const PAGE_IMAGE_RESOURCE: &str = "Im0";

/// Poppler reports some recoverable problems as errors.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of `pdftocairo` output indicate a real failure?
fn is_error_line(line: &str) -> bool {
    matches_default_error_regex(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Pixel format for rendered pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    Rgb,
    #[default]
    Gray,
}

impl ColorSpace {
    /// The matching PDF color space name.
    fn pdf_name(self) -> &'static str {
        match self {
            ColorSpace::Rgb => "DeviceRGB",
            ColorSpace::Gray => "DeviceGray",
        }
    }
}

impl FromStr for ColorSpace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RGB" => Ok(ColorSpace::Rgb),
            "GRAY" | "GREY" => Ok(ColorSpace::Gray),
            _ => Err(anyhow!("unknown color space {:?} (expected RGB or GRAY)", s)),
        }
    }
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorSpace::Rgb => write!(f, "RGB"),
            ColorSpace::Gray => write!(f, "GRAY"),
        }
    }
}

/// Renders single PDF pages to PNG.
#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Render 1-based `page_number` of the PDF at `pdf_path`, returning PNG
    /// data.
    async fn render_page(
        &self,
        pdf_path: &Path,
        page_number: u32,
        dpi: u32,
        color_space: ColorSpace,
    ) -> Result<Vec<u8>>;
}

/// Renders pages with Poppler's `pdftocairo`.
#[derive(Debug, Default)]
pub struct PdftocairoRenderer;

#[async_trait]
impl PageRenderer for PdftocairoRenderer {
    #[instrument(level = "debug", skip(self, pdf_path), fields(path = %pdf_path.display()))]
    async fn render_page(
        &self,
        pdf_path: &Path,
        page_number: u32,
        dpi: u32,
        color_space: ColorSpace,
    ) -> Result<Vec<u8>> {
        let tmpdir = tempfile::TempDir::with_prefix("page")?;
        // With `-singlefile`, pdftocairo appends only the extension.
        let out_base = tmpdir.path().join("page");

        // `pdftocairo` will use a whole core, so take a CPU permit.
        let mut cmd = pdftocairo_command(pdf_path, &out_base, page_number, dpi, color_space);
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", pdf_path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let png_path = out_base.with_extension("png");
        let png = tokio::fs::read(&png_path).await.with_context(|| {
            format!("pdftocairo did not write {:?}", png_path.display())
        })?;
        if let Err(err) = tmpdir.close() {
            warn!("failed to delete temporary directory: {}", err);
        }
        Ok(png)
    }
}

/// Build the `pdftocairo` invocation for one page. We render the CropBox,
/// since that is the rectangle the output page is sized from.
fn pdftocairo_command(
    pdf_path: &Path,
    out_base: &Path,
    page_number: u32,
    dpi: u32,
    color_space: ColorSpace,
) -> Command {
    let page = page_number.to_string();
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-cropbox")
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-f")
        .arg(&page)
        .arg("-l")
        .arg(&page)
        .arg("-singlefile");
    if color_space == ColorSpace::Gray {
        cmd.arg("-gray");
    }
    cmd.arg(pdf_path).arg(out_base);
    cmd
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageRaster {
    pub page_number: u32,
    pub dpi: u32,
    pub color_space: ColorSpace,
    pub width: u32,
    pub height: u32,
    /// The page as PNG. Kept for exporting page images.
    png: Vec<u8>,
    /// Raw samples in `color_space`, zlib-compressed for `/FlateDecode`.
    samples: Vec<u8>,
}

impl PageRaster {
    /// Decode a PNG into raw samples for embedding.
    pub async fn from_png(
        page_number: u32,
        dpi: u32,
        color_space: ColorSpace,
        png: Vec<u8>,
    ) -> Result<Self> {
        spawn_blocking_propagating_panics(move || {
            Self::from_png_sync(page_number, dpi, color_space, png)
        })
        .await
    }

    fn from_png_sync(
        page_number: u32,
        dpi: u32,
        color_space: ColorSpace,
        png: Vec<u8>,
    ) -> Result<Self> {
        let image = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .with_context(|| format!("could not decode image of page {}", page_number))?;
        let (width, height, raw) = match color_space {
            ColorSpace::Gray => {
                let buffer = image.to_luma8();
                (buffer.width(), buffer.height(), buffer.into_raw())
            }
            ColorSpace::Rgb => {
                let buffer = image.to_rgb8();
                (buffer.width(), buffer.height(), buffer.into_raw())
            }
        };
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let samples = encoder.finish()?;
        Ok(Self {
            page_number,
            dpi,
            color_space,
            width,
            height,
            png,
            samples,
        })
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }
}

/// A page of an [`ImagePdf`]: a full-page image plus overlay operations.
pub struct ImagePage {
    /// Width in points.
    pub width: f64,
    /// Height in points.
    pub height: f64,
    image_width: u32,
    image_height: u32,
    color_space: ColorSpace,
    samples: Vec<u8>,
    overlay: Vec<Operation>,
}

impl ImagePage {
    /// Append content drawn over the page image.
    pub fn push_operations(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.overlay.extend(operations);
    }

    pub fn overlay(&self) -> &[Operation] {
        &self.overlay
    }
}

/// A PDF made of one full-page image per page, under construction.
#[derive(Default)]
pub struct ImagePdf {
    pages: Vec<ImagePage>,
}

impl ImagePdf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a page of `width` × `height` points, filled by `raster`.
    pub fn add_page(&mut self, width: f64, height: f64, raster: PageRaster) {
        self.pages.push(ImagePage {
            width,
            height,
            image_width: raster.width,
            image_height: raster.height,
            color_space: raster.color_space,
            samples: raster.samples,
            overlay: vec![],
        });
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Get a 1-based page.
    pub fn page_mut(&mut self, page_number: u32) -> Option<&mut ImagePage> {
        let index = usize::try_from(page_number).ok()?.checked_sub(1)?;
        self.pages.get_mut(index)
    }

    /// Serialize the document.
    #[instrument(level = "debug", skip_all, fields(pages = self.pages.len()))]
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => BASE_FONT,
            "Encoding" => "WinAnsiEncoding",
        });
        let invisible_id = doc.add_object(dictionary! {
            "Type" => "ExtGState",
            "ca" => 0,
        });
        let visible_id = doc.add_object(dictionary! {
            "Type" => "ExtGState",
            "ca" => 1,
        });

        let mut kids = Vec::with_capacity(self.pages.len());
        for page in self.pages {
            let image_id = doc.add_object(
                Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => i64::from(page.image_width),
                        "Height" => i64::from(page.image_height),
                        "ColorSpace" => page.color_space.pdf_name(),
                        "BitsPerComponent" => 8,
                        "Filter" => "FlateDecode",
                    },
                    page.samples,
                )
                .with_compression(false),
            );

            let mut operations = vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        real(page.width),
                        0.into(),
                        0.into(),
                        real(page.height),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(PAGE_IMAGE_RESOURCE.into())]),
                Operation::new("Q", vec![]),
            ];
            operations.extend(page.overlay);
            let content = Content { operations }
                .encode()
                .context("could not encode page content")?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));

            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), real(page.width), real(page.height)],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => dictionary! { PAGE_IMAGE_RESOURCE => image_id },
                    "Font" => dictionary! { FONT_RESOURCE => font_id },
                    "ExtGState" => dictionary! {
                        INVISIBLE_TEXT_STATE => invisible_id,
                        VISIBLE_TEXT_STATE => visible_id,
                    },
                },
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
        doc.compress();

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).context("could not write PDF")?;
        Ok(bytes)
    }
}

/// A PDF real number.
pub(crate) fn real(value: f64) -> Object {
    Object::Real(value as f32)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, GrayImage, Luma};

    use super::*;
    use crate::pdf::{
        SourcePdf, resolve_inherited,
        tests::{LETTER, test_pdf, with_crop_box},
    };

    /// A small PNG with a dark top-left pixel.
    pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
        let mut image = GrayImage::from_pixel(width, height, Luma([255]));
        image.put_pixel(0, 0, Luma([0]));
        let mut png = vec![];
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn parses_color_spaces() {
        assert_eq!("rgb".parse::<ColorSpace>().unwrap(), ColorSpace::Rgb);
        assert_eq!("GRAY".parse::<ColorSpace>().unwrap(), ColorSpace::Gray);
        assert!("cmyk".parse::<ColorSpace>().is_err());
        assert_eq!(ColorSpace::default().to_string(), "GRAY");
    }

    #[test]
    fn poppler_xref_warnings_are_not_errors() {
        assert!(is_error_line("Syntax Error: Couldn't read xref table"));
        assert!(!is_error_line("Syntax Error: xref num 12 not found but needed"));
        assert!(!is_error_line("all good"));
    }

    #[tokio::test]
    async fn decodes_png_in_either_color_space() -> Result<()> {
        let gray = PageRaster::from_png(1, 150, ColorSpace::Gray, test_png(8, 4)).await?;
        assert_eq!((gray.width, gray.height), (8, 4));
        assert!(!gray.png().is_empty());
        let rgb = PageRaster::from_png(1, 150, ColorSpace::Rgb, test_png(8, 4)).await?;
        assert_eq!((rgb.width, rgb.height), (8, 4));

        assert!(PageRaster::from_png(1, 150, ColorSpace::Gray, b"nope".to_vec()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn image_pdf_has_one_full_page_image_per_page() -> Result<()> {
        let mut pdf = ImagePdf::new();
        for (page_number, (w, h)) in [(612.0, 792.0), (792.0, 612.0)].into_iter().enumerate() {
            let raster =
                PageRaster::from_png(page_number as u32 + 1, 72, ColorSpace::Gray, test_png(20, 10)).await?;
            pdf.add_page(w, h, raster);
        }
        assert!(pdf.page_mut(0).is_none());
        assert!(pdf.page_mut(3).is_none());
        pdf.page_mut(2)
            .unwrap()
            .push_operations([Operation::new("n", vec![])]);

        let bytes = pdf.finish()?;
        let written = SourcePdf::from_bytes(&bytes)?;
        assert_eq!(written.page_count(), 2);
        assert_eq!(written.page_size(2)?.width, 792.0);

        let doc = written.document();
        let page_id = written.page_id(2)?;
        let content = Content::decode(&doc.get_page_content(page_id)?)?;
        let operators = content
            .operations
            .iter()
            .map(|op| op.operator.as_str())
            .collect::<Vec<_>>();
        assert_eq!(operators, vec!["q", "cm", "Do", "Q", "n"]);

        let resources = resolve_inherited(doc, page_id, b"Resources")?.unwrap();
        let xobjects = resources.as_dict()?.get(b"XObject")?.as_dict()?;
        let image = doc
            .get_object(xobjects.get(b"Im0")?.as_reference()?)?
            .as_stream()?;
        assert_eq!(image.dict.get(b"Width")?.as_i64()?, 20);
        assert!(matches!(
            image.dict.get(b"ColorSpace")?,
            Object::Name(name) if name == b"DeviceGray"
        ));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires pdftocairo"]
    async fn pdftocairo_renders_one_page() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("render")?;
        let path = dir.path().join("in.pdf");
        tokio::fs::write(&path, test_pdf(&[(LETTER, 0, vec![]), (LETTER, 0, vec![])])).await?;
        let png = PdftocairoRenderer
            .render_page(&path, 2, 72, ColorSpace::Gray)
            .await?;
        let raster = PageRaster::from_png(2, 72, ColorSpace::Gray, png).await?;
        assert_eq!((raster.width, raster.height), (612, 792));
        Ok(())
    }

    #[test]
    fn pdftocairo_renders_the_crop_box() {
        let cmd = pdftocairo_command(
            Path::new("in.pdf"),
            Path::new("out/page"),
            3,
            150,
            ColorSpace::Rgb,
        );
        let args = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            [
                "-png", "-cropbox", "-r", "150", "-f", "3", "-l", "3", "-singlefile", "in.pdf",
                "out/page"
            ]
        );
    }

    #[tokio::test]
    #[ignore = "Requires pdftocairo"]
    async fn pdftocairo_output_matches_crop_box_size() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("render")?;
        let path = dir.path().join("in.pdf");
        let pdf = with_crop_box(&test_pdf(&[(LETTER, 0, vec![])]), 1, [0.0, 0.0, 288.0, 360.0]);
        tokio::fs::write(&path, &pdf).await?;

        let size = SourcePdf::from_bytes(&pdf)?.page_size(1)?;
        let png = PdftocairoRenderer
            .render_page(&path, 1, 150, ColorSpace::Gray)
            .await?;
        let raster = PageRaster::from_png(1, 150, ColorSpace::Gray, png).await?;
        assert_eq!(
            (f64::from(raster.width), f64::from(raster.height)),
            (size.width * 150.0 / 72.0, size.height * 150.0 / 72.0)
        );
        assert_eq!((raster.width, raster.height), (600, 750));
        Ok(())
    }
}
