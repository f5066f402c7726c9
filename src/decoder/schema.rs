//! Sheet-level metadata: THF descriptor, SCD semantic schema, GEO
//! coordinate reference.
//!
//! # CRS identification
//!
//! The GEO file names its projection with an IGN token (`LAMB93`,
//! `RGF93CC46`, `GUAD48UTM20`, …). Only the well-known French set is
//! accepted; anything else rejects the whole archive with
//! [`DecodeError::UnsupportedCrs`], because no downstream transform could
//! make sense of the coordinates.

use std::collections::HashMap;

use encoding_rs::Encoding;

use crate::decoder::records::{blocks, scan};
use crate::error::DecodeError;

/// Projection tokens found in GEO files, mapped to EPSG codes.
///
/// Covers metropolitan Lambert 93, the RGF93 conic-conformal zones, the
/// legacy NTF Lambert zones, the four overseas UTM systems and plain WGS84.
const CRS_TOKENS: &[(&str, u32)] = &[
    ("LAMB93", 2154),
    ("RGF93CC42", 3942),
    ("RGF93CC43", 3943),
    ("RGF93CC44", 3944),
    ("RGF93CC45", 3945),
    ("RGF93CC46", 3946),
    ("RGF93CC47", 3947),
    ("RGF93CC48", 3948),
    ("RGF93CC49", 3949),
    ("RGF93CC50", 3950),
    ("LAMB1", 27561),
    ("LAMB2", 27562),
    ("LAMB3", 27563),
    ("LAMB4", 27564),
    ("LAMBE", 27572),
    ("GUAD48UTM20", 2971),
    ("MART38UTM20", 2973),
    ("RGFG95UTM22", 2972),
    ("RGR92UTM40S", 2975),
    ("RGR92UTM", 2975),
    ("WGS84", 4326),
];

/// The coordinate reference declared by a sheet.
#[derive(Debug, Clone)]
pub struct Crs {
    pub epsg: u32,
    /// The raw IGN token, kept for diagnostics.
    pub token: String,
}

/// Extracts the CRS from a GEO file.
pub fn parse_geo(input: &str) -> Result<Crs, DecodeError> {
    // The projection token is the REL record value; fall back to a full
    // scan for sheets that embed it in another record.
    for record in scan(input) {
        if record.tag == "REL" {
            let token = record.value.trim();
            return match_token(token)
                .ok_or_else(|| DecodeError::UnsupportedCrs(token.to_string()));
        }
    }

    for record in scan(input) {
        if let Some(crs) = match_token(record.value.trim()) {
            return Ok(crs);
        }
    }

    Err(DecodeError::UnsupportedCrs("no projection declared".into()))
}

fn match_token(token: &str) -> Option<Crs> {
    CRS_TOKENS
        .iter()
        .find(|(name, _)| token.eq_ignore_ascii_case(name))
        .map(|&(name, epsg)| Crs {
            epsg,
            token: name.to_string(),
        })
}

/// THF descriptor content: text encoding and sheet year.
#[derive(Debug)]
pub struct Descriptor {
    pub encoding: &'static Encoding,
    pub year: u16,
}

/// Extracts the character set (`CSE` record) and the transfer year (`TDA`
/// record) from a THF file. French cadastral sheets default to Latin-9.
pub fn parse_thf(data: &[u8]) -> Descriptor {
    let text = String::from_utf8_lossy(data);
    let mut encoding = encoding_rs::ISO_8859_15;
    let mut year = 0u16;

    for record in scan(&text) {
        match record.tag {
            "CSE" => encoding = charset_encoding(record.value.trim()),
            "TDA" => {
                let value = record.value.trim();
                if value.len() >= 4 {
                    if let Ok(y) = value[..4].parse::<u16>() {
                        year = y;
                    }
                }
            }
            _ => {}
        }
    }

    Descriptor { encoding, year }
}

fn charset_encoding(cset: &str) -> &'static Encoding {
    match cset.to_ascii_uppercase().as_str() {
        // IRV and 8859-1 both show up on sheets that actually carry Latin-9.
        "IRV" | "646-FRANCE" | "8859-1" | "8859-15" => encoding_rs::ISO_8859_15,
        "8859-2" => encoding_rs::ISO_8859_2,
        "8859-4" => encoding_rs::ISO_8859_4,
        "8859-5" => encoding_rs::ISO_8859_5,
        "8859-7" => encoding_rs::ISO_8859_7,
        _ => encoding_rs::ISO_8859_15,
    }
}

/// The semantic schema of a sheet: declared object kinds and attribute
/// descriptors.
#[derive(Debug, Default)]
pub struct SemanticSchema {
    /// Object kinds declared by `OBJ` blocks, upper-cased (`PARCELLE_ID`, …).
    pub kinds: Vec<String>,
    /// Attribute descriptor id → attribute name (upper-cased, `_ID` suffix
    /// stripped). Used to resolve `ATP` references in VEC files.
    pub attributes: HashMap<String, String>,
}

impl SemanticSchema {
    /// Resolves an attribute descriptor reference to its declared name,
    /// falling back to deriving the name from the reference itself.
    pub fn attribute_name(&self, descriptor_id: &str) -> String {
        self.attributes
            .get(descriptor_id)
            .cloned()
            .unwrap_or_else(|| derive_attribute_name(descriptor_id))
    }
}

/// Parses an SCD file into the set of object kinds and attribute names.
pub fn parse_scd(input: &str) -> SemanticSchema {
    let mut schema = SemanticSchema::default();

    for block in blocks(input) {
        match block.kind {
            "OBJ" => {
                if !block.id.is_empty() {
                    schema.kinds.push(block.id.to_uppercase());
                }
            }
            "ATT" => {
                if !block.id.is_empty() {
                    schema
                        .attributes
                        .insert(block.id.to_string(), derive_attribute_name(block.id));
                }
            }
            _ => {}
        }
    }

    schema
}

fn derive_attribute_name(descriptor_id: &str) -> String {
    descriptor_id
        .trim()
        .trim_end_matches("_id")
        .trim_end_matches("_ID")
        .to_uppercase()
}
