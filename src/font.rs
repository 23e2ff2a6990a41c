//! Minimal TrueType parser backing PDF font embedding.
//!
//! Reads just the sfnt tables the exporter needs: `cmap` for char-to-glyph
//! lookup, `hmtx`/`hhea`/`maxp` for advance widths, `head` and `OS/2` for
//! descriptor metrics, and `name` for the PostScript name. TrueType
//! collections (`ttcf`) are handled by rebuilding the first subfont as a
//! standalone font, since a PDF FontFile2 stream must hold a single font.
//!
//! CFF-flavoured OpenType (`OTTO`) is rejected; glyph outlines are embedded
//! as-is and only TrueType outlines fit a CIDFontType2 program.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const SFNT_TRUETYPE: u32 = 0x0001_0000;
const SFNT_APPLE_TRUE: u32 = u32::from_be_bytes(*b"true");
const SFNT_OTTO: u32 = u32::from_be_bytes(*b"OTTO");
const SFNT_TTC: u32 = u32::from_be_bytes(*b"ttcf");

const TAG_HEAD: u32 = u32::from_be_bytes(*b"head");
const TAG_HHEA: u32 = u32::from_be_bytes(*b"hhea");
const TAG_MAXP: u32 = u32::from_be_bytes(*b"maxp");
const TAG_HMTX: u32 = u32::from_be_bytes(*b"hmtx");
const TAG_CMAP: u32 = u32::from_be_bytes(*b"cmap");
const TAG_OS2: u32 = u32::from_be_bytes(*b"OS/2");
const TAG_NAME: u32 = u32::from_be_bytes(*b"name");

/// Errors raised while loading or parsing a font file
#[derive(Error, Debug)]
pub enum FontError {
    #[error("failed to read font file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("font data is truncated at offset {0}")]
    Truncated(usize),

    #[error("unsupported font format: {0}")]
    Unsupported(String),

    #[error("font is missing required table '{0}'")]
    MissingTable(&'static str),

    #[error("font has no usable unicode character map")]
    NoCharacterMap,
}

/// A parsed TrueType font ready for CID-keyed PDF embedding
#[derive(Debug)]
pub struct TrueTypeFont {
    data: Vec<u8>,
    units_per_em: u16,
    ascender: i16,
    descender: i16,
    cap_height: i16,
    bbox: [i16; 4],
    num_glyphs: u16,
    advances: Vec<u16>,
    cmap: HashMap<char, u16>,
    postscript_name: Option<String>,
}

impl TrueTypeFont {
    /// Read and parse a font file from disk.
    pub fn load(path: &Path) -> Result<Self, FontError> {
        let data = fs::read(path).map_err(|source| FontError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let font = Self::from_bytes(data)?;
        debug!(
            path = %path.display(),
            glyphs = font.num_glyphs,
            mapped_chars = font.cmap.len(),
            "Loaded font"
        );
        Ok(font)
    }

    /// Parse font data. Collection files are reduced to their first subfont.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FontError> {
        let version = read_u32(&data, 0)?;
        match version {
            SFNT_TTC => Self::parse(extract_first_collection_font(&data)?),
            SFNT_TRUETYPE | SFNT_APPLE_TRUE => Self::parse(data),
            SFNT_OTTO => Err(FontError::Unsupported(
                "CFF outlines (OTTO) cannot be embedded as a TrueType program".to_string(),
            )),
            other => Err(FontError::Unsupported(format!(
                "unrecognized sfnt version 0x{other:08X}"
            ))),
        }
    }

    fn parse(data: Vec<u8>) -> Result<Self, FontError> {
        let tables = read_table_directory(&data)?;
        let table = |tag: u32, name: &'static str| {
            tables.get(&tag).copied().ok_or(FontError::MissingTable(name))
        };

        let (head, _) = table(TAG_HEAD, "head")?;
        let units_per_em = read_u16(&data, head + 18)?;
        if units_per_em == 0 {
            return Err(FontError::Unsupported("unitsPerEm is zero".to_string()));
        }
        let bbox = [
            read_i16(&data, head + 36)?,
            read_i16(&data, head + 38)?,
            read_i16(&data, head + 40)?,
            read_i16(&data, head + 42)?,
        ];

        let (hhea, _) = table(TAG_HHEA, "hhea")?;
        let mut ascender = read_i16(&data, hhea + 4)?;
        let mut descender = read_i16(&data, hhea + 6)?;
        let num_h_metrics = read_u16(&data, hhea + 34)? as usize;

        let (maxp, _) = table(TAG_MAXP, "maxp")?;
        let num_glyphs = read_u16(&data, maxp + 4)?;

        let (hmtx, _) = table(TAG_HMTX, "hmtx")?;
        let mut advances = Vec::with_capacity(num_glyphs as usize);
        for i in 0..num_h_metrics.min(num_glyphs as usize) {
            advances.push(read_u16(&data, hmtx + i * 4)?);
        }
        // Monospaced tails share the last explicit advance
        let last = advances.last().copied().unwrap_or(0);
        advances.resize(num_glyphs as usize, last);

        let mut cap_height = ascender;
        if let Some(&(os2, len)) = tables.get(&TAG_OS2) {
            let version = read_u16(&data, os2)?;
            ascender = read_i16(&data, os2 + 68)?;
            descender = read_i16(&data, os2 + 70)?;
            if version >= 2 && len >= 90 {
                cap_height = read_i16(&data, os2 + 88)?;
            }
        }

        let (cmap, _) = table(TAG_CMAP, "cmap")?;
        let cmap = parse_cmap(&data, cmap)?;

        let postscript_name = tables
            .get(&TAG_NAME)
            .and_then(|&(name, _)| parse_postscript_name(&data, name));

        Ok(Self {
            data,
            units_per_em,
            ascender,
            descender,
            cap_height,
            bbox,
            num_glyphs,
            advances,
            cmap,
            postscript_name,
        })
    }

    /// Raw font program bytes, suitable for a FontFile2 stream
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn units_per_em(&self) -> u16 {
        self.units_per_em
    }

    pub fn ascender(&self) -> i16 {
        self.ascender
    }

    pub fn descender(&self) -> i16 {
        self.descender
    }

    pub fn cap_height(&self) -> i16 {
        self.cap_height
    }

    /// Font bounding box in font units: [xMin, yMin, xMax, yMax]
    pub fn bbox(&self) -> [i16; 4] {
        self.bbox
    }

    pub fn num_glyphs(&self) -> u16 {
        self.num_glyphs
    }

    pub fn postscript_name(&self) -> Option<&str> {
        self.postscript_name.as_deref()
    }

    /// Glyph id for a character; 0 (.notdef) when unmapped
    pub fn glyph_id(&self, c: char) -> u16 {
        self.cmap.get(&c).copied().unwrap_or(0)
    }

    /// Advance width of a glyph in font units
    pub fn advance(&self, glyph_id: u16) -> u16 {
        self.advances.get(glyph_id as usize).copied().unwrap_or(0)
    }

    /// Encode text as big-endian glyph ids, the byte form an Identity-H
    /// encoded PDF string expects.
    pub fn encode_text(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() * 2);
        for c in text.chars() {
            out.extend_from_slice(&self.glyph_id(c).to_be_bytes());
        }
        out
    }
}

/// Table directory as tag -> (absolute offset, length)
fn read_table_directory(data: &[u8]) -> Result<HashMap<u32, (usize, usize)>, FontError> {
    let num_tables = read_u16(data, 4)? as usize;
    let mut tables = HashMap::with_capacity(num_tables);
    for i in 0..num_tables {
        let record = 12 + i * 16;
        let tag = read_u32(data, record)?;
        let offset = read_u32(data, record + 8)? as usize;
        let length = read_u32(data, record + 12)? as usize;
        if offset.checked_add(length).map_or(true, |end| end > data.len()) {
            return Err(FontError::Truncated(offset));
        }
        tables.insert(tag, (offset, length));
    }
    Ok(tables)
}

/// Rebuild the first subfont of a TrueType collection as a standalone font.
///
/// Table offsets in a collection are absolute within the whole file, so the
/// tables are copied out and the directory rewritten with fresh offsets.
/// Per-table checksums are carried over unchanged.
fn extract_first_collection_font(data: &[u8]) -> Result<Vec<u8>, FontError> {
    let num_fonts = read_u32(data, 8)?;
    if num_fonts == 0 {
        return Err(FontError::Unsupported("empty font collection".to_string()));
    }
    let first = read_u32(data, 12)? as usize;

    let sfnt_version = read_u32(data, first)?;
    let num_tables = read_u16(data, first + 4)? as usize;
    if num_tables == 0 {
        return Err(FontError::Unsupported(
            "collection subfont has no tables".to_string(),
        ));
    }

    let mut records = Vec::with_capacity(num_tables);
    for i in 0..num_tables {
        let record = first + 12 + i * 16;
        let tag = read_u32(data, record)?;
        let checksum = read_u32(data, record + 4)?;
        let offset = read_u32(data, record + 8)? as usize;
        let length = read_u32(data, record + 12)? as usize;
        if offset.checked_add(length).map_or(true, |end| end > data.len()) {
            return Err(FontError::Truncated(offset));
        }
        records.push((tag, checksum, offset, length));
    }

    let max_pow2 = 1usize << (usize::BITS - 1 - num_tables.leading_zeros());
    let search_range = (max_pow2 * 16) as u16;
    let entry_selector = max_pow2.trailing_zeros() as u16;
    let range_shift = (num_tables * 16) as u16 - search_range;

    let mut out = Vec::new();
    out.extend_from_slice(&sfnt_version.to_be_bytes());
    out.extend_from_slice(&(num_tables as u16).to_be_bytes());
    out.extend_from_slice(&search_range.to_be_bytes());
    out.extend_from_slice(&entry_selector.to_be_bytes());
    out.extend_from_slice(&range_shift.to_be_bytes());

    let mut next_offset = 12 + num_tables * 16;
    let mut table_bytes = Vec::new();
    for &(tag, checksum, offset, length) in &records {
        out.extend_from_slice(&tag.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&(next_offset as u32).to_be_bytes());
        out.extend_from_slice(&(length as u32).to_be_bytes());

        table_bytes.extend_from_slice(&data[offset..offset + length]);
        let padded = (length + 3) & !3;
        table_bytes.resize(table_bytes.len() + (padded - length), 0);
        next_offset += padded;
    }
    out.extend_from_slice(&table_bytes);
    Ok(out)
}

/// Pick the best unicode subtable and build the char -> glyph map.
/// Full-repertoire subtables (format 12) win over BMP-only (format 4).
fn parse_cmap(data: &[u8], cmap: usize) -> Result<HashMap<char, u16>, FontError> {
    let num_subtables = read_u16(data, cmap + 2)? as usize;

    let mut candidates = Vec::new();
    for i in 0..num_subtables {
        let record = cmap + 4 + i * 8;
        let platform = read_u16(data, record)?;
        let encoding = read_u16(data, record + 2)?;
        let offset = cmap + read_u32(data, record + 4)? as usize;

        let rank = match (platform, encoding) {
            (3, 10) | (0, 4) | (0, 6) => 2,
            (3, 1) | (0, 0..=3) => 1,
            _ => continue,
        };
        candidates.push((rank, offset));
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, offset) in candidates {
        let map = match read_u16(data, offset)? {
            4 => parse_cmap_format4(data, offset)?,
            12 => parse_cmap_format12(data, offset)?,
            _ => continue,
        };
        if !map.is_empty() {
            return Ok(map);
        }
    }
    Err(FontError::NoCharacterMap)
}

/// Format 4: segmented BMP mapping
fn parse_cmap_format4(data: &[u8], f: usize) -> Result<HashMap<char, u16>, FontError> {
    let seg_count = read_u16(data, f + 6)? as usize / 2;
    let end_base = f + 14;
    let start_base = f + 16 + seg_count * 2;
    let delta_base = f + 16 + seg_count * 4;
    let range_base = f + 16 + seg_count * 6;

    let mut map = HashMap::new();
    for seg in 0..seg_count {
        let end = read_u16(data, end_base + seg * 2)?;
        let start = read_u16(data, start_base + seg * 2)?;
        let delta = read_i16(data, delta_base + seg * 2)?;
        let range_offset = read_u16(data, range_base + seg * 2)? as usize;

        for code in start..=end {
            if code == 0xFFFF {
                continue;
            }
            let glyph = if range_offset == 0 {
                (code as i16).wrapping_add(delta) as u16
            } else {
                let addr = range_base + seg * 2 + range_offset + (code - start) as usize * 2;
                let raw = read_u16(data, addr)?;
                if raw == 0 {
                    0
                } else {
                    (raw as i16).wrapping_add(delta) as u16
                }
            };
            if glyph != 0 {
                if let Some(c) = char::from_u32(code as u32) {
                    map.insert(c, glyph);
                }
            }
        }
    }
    Ok(map)
}

/// Format 12: sequential groups covering the full unicode range
fn parse_cmap_format12(data: &[u8], f: usize) -> Result<HashMap<char, u16>, FontError> {
    let num_groups = read_u32(data, f + 12)? as usize;

    let mut map = HashMap::new();
    for g in 0..num_groups {
        let group = f + 16 + g * 12;
        let start = read_u32(data, group)?;
        let end = read_u32(data, group + 4)?;
        let start_glyph = read_u32(data, group + 8)?;
        if end < start || end > 0x10_FFFF {
            continue;
        }

        for (i, code) in (start..=end).enumerate() {
            if let Some(c) = char::from_u32(code) {
                map.insert(c, (start_glyph as usize + i) as u16);
            }
        }
    }
    Ok(map)
}

/// PostScript name (name id 6) from the `name` table, preferring the
/// Windows UTF-16BE record over the Macintosh one.
fn parse_postscript_name(data: &[u8], name: usize) -> Option<String> {
    let count = read_u16(data, name + 2).ok()? as usize;
    let string_base = name + read_u16(data, name + 4).ok()? as usize;

    let mut mac_fallback = None;
    for i in 0..count {
        let record = name + 6 + i * 12;
        let platform = read_u16(data, record).ok()?;
        let name_id = read_u16(data, record + 6).ok()?;
        if name_id != 6 {
            continue;
        }
        let length = read_u16(data, record + 8).ok()? as usize;
        let offset = string_base + read_u16(data, record + 10).ok()? as usize;
        let bytes = data.get(offset..offset + length)?;

        match platform {
            3 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                return String::from_utf16(&units).ok();
            }
            1 if mac_fallback.is_none() => {
                mac_fallback = Some(
                    bytes
                        .iter()
                        .filter(|b| b.is_ascii())
                        .map(|&b| b as char)
                        .collect(),
                );
            }
            _ => {}
        }
    }
    mac_fallback
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, FontError> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(FontError::Truncated(offset))
}

fn read_i16(data: &[u8], offset: usize) -> Result<i16, FontError> {
    read_u16(data, offset).map(|v| v as i16)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, FontError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FontError::Truncated(offset))
}
