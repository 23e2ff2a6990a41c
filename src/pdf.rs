//! Handover record export as PDF.
//!
//! Builds a single-page A4 document per child: a header line with the child
//! id, then one block per handover event with the guardian's name and their
//! signature image. Text is set in an embedded TrueType font via a
//! CID-keyed (Identity-H) encoding, so any script the configured font
//! covers renders correctly. Signature files that are missing or unreadable
//! are skipped; the export itself still succeeds.
//!
//! Content streams are left uncompressed. Only the signature bitmaps are
//! deflate-coded, as DeviceRGB image XObjects.

use crate::font::TrueTypeFont;
use crate::registry::HandoverEvent;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

// A4 geometry and the fixed layout of the record, in PDF points
const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN_X: i64 = 100;
const HEADER_Y: i64 = 800;
const FIRST_EVENT_Y: i64 = 760;
const EVENT_STEP: i64 = 120;
const SIGNATURE_WIDTH: i64 = 150;
const SIGNATURE_HEIGHT: i64 = 50;
const SIGNATURE_DROP: i64 = 60;
const FONT_SIZE: i64 = 12;

/// Errors raised while producing an export
#[derive(Error, Debug)]
pub enum PdfError {
    #[error("failed to encode page content: {0}")]
    Content(String),

    #[error("failed to serialize PDF document: {0}")]
    Serialize(String),
}

/// Renders handover logs into downloadable PDF documents
pub struct PdfExporter {
    font: TrueTypeFont,
    upload_dir: PathBuf,
}

impl PdfExporter {
    /// Build an exporter around a loaded font. Signature images are
    /// resolved against `upload_dir`.
    pub fn new(font: TrueTypeFont, upload_dir: PathBuf) -> Self {
        Self { font, upload_dir }
    }

    /// Render the handover record for one child.
    ///
    /// Unknown children simply produce a header-only document; the caller
    /// decides whether an empty log is worth exporting.
    pub fn render(&self, child_id: &str, events: &[HandoverEvent]) -> Result<Vec<u8>, PdfError> {
        let header = format!("Handover Record - Child ID: {child_id}");
        let guardian_lines: Vec<String> = events
            .iter()
            .map(|event| format!("Guardian: {}", event.guardian_name))
            .collect();

        // Glyphs actually used drive the width array and ToUnicode map
        let mut glyph_chars: BTreeMap<u16, char> = BTreeMap::new();
        for text in std::iter::once(&header).chain(guardian_lines.iter()) {
            for c in text.chars() {
                let gid = self.font.glyph_id(c);
                if gid != 0 {
                    glyph_chars.entry(gid).or_insert(c);
                }
            }
        }

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = self.embed_font(&mut doc, &glyph_chars);

        let mut operations = Vec::new();
        let mut xobjects = Dictionary::new();
        self.push_text(&mut operations, &header, MARGIN_X, HEADER_Y);

        let mut y = FIRST_EVENT_Y;
        let mut images_drawn = 0usize;
        for (i, event) in events.iter().enumerate() {
            self.push_text(&mut operations, &guardian_lines[i], MARGIN_X, y);

            if let Some(stream) = self.load_signature_image(&event.signature_file) {
                let image_id = doc.add_object(stream);
                let name = format!("Im{i}");
                xobjects.set(name.clone(), image_id);

                operations.push(Operation::new("q", vec![]));
                operations.push(Operation::new(
                    "cm",
                    vec![
                        SIGNATURE_WIDTH.into(),
                        0.into(),
                        0.into(),
                        SIGNATURE_HEIGHT.into(),
                        MARGIN_X.into(),
                        (y - SIGNATURE_DROP).into(),
                    ],
                ));
                operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
                operations.push(Operation::new("Q", vec![]));
                images_drawn += 1;
            }

            y -= EVENT_STEP;
        }

        let content = Content { operations };
        let content_bytes = content
            .encode()
            .map_err(|e| PdfError::Content(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, content_bytes));

        let mut resources = Dictionary::new();
        resources.set("Font", dictionary! { "F1" => font_id });
        if !xobjects.is_empty() {
            resources.set("XObject", xobjects);
        }

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            "Resources" => resources,
        });

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)
            .map_err(|e| PdfError::Serialize(e.to_string()))?;

        debug!(
            child_id = %child_id,
            events = events.len(),
            images = images_drawn,
            size_bytes = bytes.len(),
            "Rendered handover record"
        );
        Ok(bytes)
    }

    /// One BT..ET block per string, Identity-H encoded as a hex string.
    fn push_text(&self, operations: &mut Vec<Operation>, text: &str, x: i64, y: i64) {
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), FONT_SIZE.into()]));
        operations.push(Operation::new("Td", vec![x.into(), y.into()]));
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(
                self.font.encode_text(text),
                StringFormat::Hexadecimal,
            )],
        ));
        operations.push(Operation::new("ET", vec![]));
    }

    /// Embed the font as a Type0/CIDFontType2 pair with the used-glyph
    /// width array and a ToUnicode map for text extraction.
    fn embed_font(&self, doc: &mut Document, glyph_chars: &BTreeMap<u16, char>) -> ObjectId {
        let base_name = self
            .font
            .postscript_name()
            .unwrap_or("EmbeddedFont")
            .to_string();

        let font_file_id = doc.add_object(Stream::new(
            dictionary! { "Length1" => self.font.data().len() as i64 },
            self.font.data().to_vec(),
        ));

        let bbox = self.font.bbox();
        let descriptor_id = doc.add_object(dictionary! {
            "Type" => "FontDescriptor",
            "FontName" => Object::Name(base_name.clone().into_bytes()),
            "Flags" => 4,
            "FontBBox" => vec![
                self.scaled(bbox[0]).into(),
                self.scaled(bbox[1]).into(),
                self.scaled(bbox[2]).into(),
                self.scaled(bbox[3]).into(),
            ],
            "ItalicAngle" => 0,
            "Ascent" => self.scaled(self.font.ascender()),
            "Descent" => self.scaled(self.font.descender()),
            "CapHeight" => self.scaled(self.font.cap_height()),
            "StemV" => 80,
            "FontFile2" => font_file_id,
        });

        let mut widths: Vec<Object> = Vec::with_capacity(glyph_chars.len() * 2);
        for &gid in glyph_chars.keys() {
            let advance = self.font.advance(gid) as i64 * 1000 / self.font.units_per_em() as i64;
            widths.push(i64::from(gid).into());
            widths.push(Object::Array(vec![advance.into()]));
        }

        let cid_font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "CIDFontType2",
            "BaseFont" => Object::Name(base_name.clone().into_bytes()),
            "CIDSystemInfo" => dictionary! {
                "Registry" => Object::string_literal("Adobe"),
                "Ordering" => Object::string_literal("Identity"),
                "Supplement" => 0,
            },
            "FontDescriptor" => descriptor_id,
            "DW" => 1000,
            "W" => Object::Array(widths),
            "CIDToGIDMap" => "Identity",
        });

        let to_unicode_id = doc.add_object(Stream::new(
            dictionary! {},
            to_unicode_cmap(glyph_chars),
        ));

        doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type0",
            "BaseFont" => Object::Name(base_name.into_bytes()),
            "Encoding" => "Identity-H",
            "DescendantFonts" => vec![cid_font_id.into()],
            "ToUnicode" => to_unicode_id,
        })
    }

    /// Load a signature file and package it as a DeviceRGB image XObject.
    /// Transparency is flattened onto white. Returns `None` when the file
    /// is absent or undecodable; the record is rendered without it.
    fn load_signature_image(&self, filename: &str) -> Option<Stream> {
        let path = self.upload_dir.join(filename);
        if !path.is_file() {
            warn!(file = %filename, "Signature file missing, skipping image");
            return None;
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %filename, error = %e, "Signature file unreadable, skipping image");
                return None;
            }
        };
        let img = match image::load_from_memory(&bytes) {
            Ok(img) => img,
            Err(e) => {
                warn!(file = %filename, error = %e, "Signature file undecodable, skipping image");
                return None;
            }
        };

        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
        for pixel in rgba.pixels() {
            let alpha = pixel[3] as u32;
            for channel in 0..3 {
                let value = pixel[channel] as u32;
                rgb.push(((value * alpha + 255 * (255 - alpha)) / 255) as u8);
            }
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&rgb).ok()?;
        let compressed = encoder.finish().ok()?;

        Some(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            compressed,
        ))
    }

    fn scaled(&self, value: i16) -> i64 {
        value as i64 * 1000 / self.font.units_per_em() as i64
    }
}

/// ToUnicode CMap covering the glyphs used in this document, so text
/// extraction recovers the original characters.
fn to_unicode_cmap(glyph_chars: &BTreeMap<u16, char>) -> Vec<u8> {
    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n\
         12 dict begin\n\
         begincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n\
         /CMapType 2 def\n\
         1 begincodespacerange\n\
         <0000> <FFFF>\n\
         endcodespacerange\n",
    );

    let entries: Vec<(&u16, &char)> = glyph_chars.iter().collect();
    for chunk in entries.chunks(100) {
        cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
        for &(gid, c) in chunk {
            let mut units = [0u16; 2];
            let encoded = c.encode_utf16(&mut units);
            let target: String = encoded.iter().map(|u| format!("{u:04X}")).collect();
            cmap.push_str(&format!("<{gid:04X}> <{target}>\n"));
        }
        cmap.push_str("endbfchar\n");
    }

    cmap.push_str(
        "endcmap\n\
         CMapName currentdict /CMap defineresource pop\n\
         end\n\
         end\n",
    );
    cmap.into_bytes()
}
