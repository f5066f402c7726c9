//! EDIGEO sheet decoder.
//!
//! Turns the five-file bundle of one cadastral sheet into typed features
//! with assembled geometries:
//!
//! ```text
//! SheetBundle ──▶ THF (encoding, year)
//!            ──▶ GEO (CRS)            ─┐
//!            ──▶ SCD (kinds, attrs)    ├─▶ SheetGraph ──▶ Features
//!            ──▶ QAL (quality dates)   │   (primitives)   + Relations
//!            ──▶ VEC × n ──────────────┘
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`records`] | line scanner: `(tag, value)` records and `RTY` blocks |
//! | [`schema`] | THF descriptor, SCD semantic schema, GEO → EPSG |
//! | [`primitives`] | per-sheet arena of nodes, arcs, faces, objects, links |
//! | [`geometry`] | polygon/line/point assembly from the primitive graph |
//! | [`features`] | object ↔ geometry join, relation pairs, kind filter |
//!
//! Decoding is infallible past the metadata stage: a feature whose
//! geometry cannot be assembled is dropped and its error recorded in
//! [`DecodedSheet::errors`], so one bad parcel never costs the sheet.

pub mod features;
pub mod geometry;
pub mod primitives;
pub mod records;
pub mod schema;

use std::collections::HashMap;

pub use features::{Feature, KindFilter, RelationEnd, RelationPair};
pub use schema::Crs;

use crate::archive::SheetBundle;
use crate::error::DecodeError;

/// A fully decoded sheet.
#[derive(Debug)]
pub struct DecodedSheet {
    /// Features grouped by upper-cased kind (`PARCELLE_ID`, …).
    pub features: HashMap<String, Vec<Feature>>,
    /// Object↔object relation records.
    pub relations: Vec<RelationPair>,
    /// Coordinate reference declared by the GEO file.
    pub crs: Crs,
    /// Sheet year from the THF descriptor (0 when absent).
    pub year: u16,
    /// Non-fatal per-feature decode errors.
    pub errors: Vec<DecodeError>,
    /// Features discarded because no configured table wants their kind.
    pub skipped_kinds: usize,
}

impl DecodedSheet {
    /// The IDU of the sheet's first feature of `kind`, if any. Used by the
    /// orchestrator to extract the `commune_id` / `section_id` constants.
    pub fn first_idu(&self, kind: &str) -> Option<&str> {
        self.features
            .get(kind)?
            .first()?
            .attributes
            .get("IDU")
            .map(String::as_str)
    }
}

/// Decodes one sheet bundle into features.
///
/// `wanted` limits the decoded kinds to those the table configuration
/// references; pass `None` to keep everything.
///
/// # Errors
///
/// Fatal only for metadata problems: an unreadable bundle or an
/// unsupported CRS. Per-feature geometry failures are recorded in the
/// returned [`DecodedSheet::errors`] instead.
pub fn decode_sheet(
    bundle: &SheetBundle,
    wanted: &KindFilter,
) -> Result<DecodedSheet, DecodeError> {
    let descriptor = schema::parse_thf(&bundle.thf);

    let geo_text = decode_text(&bundle.geo, descriptor.encoding);
    let crs = schema::parse_geo(&geo_text)?;

    let scd_text = decode_text(&bundle.scd, descriptor.encoding);
    let semantic = schema::parse_scd(&scd_text);

    let qal_text = decode_text(&bundle.qal, descriptor.encoding);
    let quality = primitives::parse_qal(&qal_text);

    let mut graph = primitives::SheetGraph::default();
    for vec_data in &bundle.vec {
        let vec_text = decode_text(vec_data, descriptor.encoding);
        graph.absorb(&vec_text, &semantic);
    }

    let built = features::build_features(&graph, &quality, wanted);

    Ok(DecodedSheet {
        features: built.features,
        relations: built.relations,
        crs,
        year: descriptor.year,
        errors: built.errors,
        skipped_kinds: built.skipped_kinds,
    })
}

fn decode_text(data: &[u8], encoding: &'static encoding_rs::Encoding) -> String {
    let (text, _, _) = encoding.decode(data);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> SheetBundle {
        SheetBundle {
            thf: b"CSETS07:8859-1\r\nTDASD08:20250101\r\n".to_vec(),
            scd: b"RTYSA03:OBJ\r\nRIDSA11:PARCELLE_id\r\nRTYSA03:ATT\r\nRIDSA06:IDU_id\r\n"
                .to_vec(),
            geo: b"RELSA06:LAMB93\r\n".to_vec(),
            qal: Vec::new(),
            vec: vec![b"RTYSA03:PNO\r\nRIDSA06:Node_1\r\nCORCC20:+881824.5;+6663821.1;\r\n\
                RTYSA03:FEA\r\nRIDSA07:Objet_1\r\n\
                SCPCP28:EDAB;SeSD;OBJ;NUMVOIE_id\r\n\
                ATPCP25:EDAB;SeSD;ATT;TEX_id\r\nATVST03:12b\r\n\
                RTYSA03:LNK\r\nRIDSA06:Lien_1\r\n\
                SCPCP26:EDAB;SeSD;REL;ID_S_OBJ\r\n\
                FTPCP24:EDAB;SeSV;FEA;Objet_1\r\n\
                FTPCP24:EDAB;SeSV;PNO;Node_1\r\n"
                .to_vec()],
        }
    }

    #[test]
    fn test_decode_sheet_end_to_end() {
        let sheet = decode_sheet(&bundle(), &None).unwrap();
        assert_eq!(sheet.crs.epsg, 2154);
        assert_eq!(sheet.year, 2025);
        let numvoie = &sheet.features["NUMVOIE_ID"];
        assert_eq!(numvoie.len(), 1);
        assert_eq!(numvoie[0].attributes["TEX"], "12b");
        assert!(sheet.errors.is_empty());
    }

    #[test]
    fn test_decode_sheet_unsupported_crs_is_fatal() {
        let mut b = bundle();
        b.geo = b"RELSA07:MERC41\r\n".to_vec();
        assert!(matches!(
            decode_sheet(&b, &None),
            Err(DecodeError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn test_decode_sheet_no_vec_yields_empty() {
        let mut b = bundle();
        b.vec.clear();
        let sheet = decode_sheet(&b, &None).unwrap();
        assert!(sheet.features.is_empty());
    }
}
