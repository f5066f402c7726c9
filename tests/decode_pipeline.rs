//! End-to-end decode + transform tests over a synthetic EDIGEO sheet.
//!
//! Builds a real `.tar.bz2` bundle (commune, section, parcel, street
//! number, one numvoie↔parcelle relation) in Lambert 93, then drives it
//! through the archive reader, the decoder and the transform engine the
//! same way the orchestrator does.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use cadastre_ingest::archive::read_sheet;
use cadastre_ingest::config::Config;
use cadastre_ingest::decoder::{decode_sheet, DecodedSheet};
use cadastre_ingest::department;
use cadastre_ingest::reproject::Reprojector;
use cadastre_ingest::transform::{
    self, millesime_year, ArchiveContext, SqlValue,
};
use geo::winding_order::Winding;
use geo::Geometry;

const THF: &str = "CSETS07:8859-1\r\nTDASD08:20250101\r\n";

const SCD: &str = "RTYSA03:OBJ\r\nRIDSA11:PARCELLE_id\r\n\
RTYSA03:OBJ\r\nRIDSA10:COMMUNE_id\r\n\
RTYSA03:OBJ\r\nRIDSA10:SECTION_id\r\n\
RTYSA03:OBJ\r\nRIDSA10:NUMVOIE_id\r\n\
RTYSA03:ATT\r\nRIDSA06:IDU_id\r\n\
RTYSA03:ATT\r\nRIDSA06:TEX_id\r\n\
RTYSA03:ATT\r\nRIDSA07:SUPF_id\r\n";

const GEO: &str = "RELSA06:LAMB93\r\n";

const QAL: &str = "RTYSA03:QUP\r\nRIDSA09:Qualite_1\r\nODASD08:20240110\r\nUDASD08:20240312\r\n";

fn vec_file() -> String {
    let mut v = String::new();

    // Street-number node at the Lambert 93 false origin.
    v.push_str("RTYSA03:PNO\r\nRIDSA06:Node_1\r\nCORCC24:+700000.00;+6600000.00;\r\n");

    // Parcel boundary: four chained arcs forming a 100 m square.
    for (id, a, b) in [
        ("Arc_P1", (700000.0, 6600000.0), (700100.0, 6600000.0)),
        ("Arc_P2", (700100.0, 6600000.0), (700100.0, 6600100.0)),
        ("Arc_P3", (700100.0, 6600100.0), (700000.0, 6600100.0)),
        ("Arc_P4", (700000.0, 6600100.0), (700000.0, 6600000.0)),
    ] {
        v.push_str(&format!(
            "RTYSA03:PAR\r\nRIDSA06:{}\r\nCORCC24:+{:.2};+{:.2};\r\nCORCC24:+{:.2};+{:.2};\r\n",
            id, a.0, a.1, b.0, b.1
        ));
    }

    // Commune and section boundaries: self-closing rings.
    v.push_str(
        "RTYSA03:PAR\r\nRIDSA05:Arc_C\r\n\
         CORCC24:+699000.00;+6599000.00;\r\nCORCC24:+701000.00;+6599000.00;\r\n\
         CORCC24:+701000.00;+6601000.00;\r\nCORCC24:+699000.00;+6601000.00;\r\n\
         CORCC24:+699000.00;+6599000.00;\r\n",
    );
    v.push_str(
        "RTYSA03:PAR\r\nRIDSA05:Arc_S\r\n\
         CORCC24:+699500.00;+6599500.00;\r\nCORCC24:+700500.00;+6599500.00;\r\n\
         CORCC24:+700500.00;+6600500.00;\r\nCORCC24:+699500.00;+6600500.00;\r\n\
         CORCC24:+699500.00;+6599500.00;\r\n",
    );

    for face in ["Face_C", "Face_S", "Face_P"] {
        v.push_str(&format!("RTYSA03:PFE\r\nRIDSA06:{}\r\n", face));
    }

    // Semantic objects.
    v.push_str(
        "RTYSA03:FEA\r\nRIDSA09:Commune_1\r\n\
         SCPCP27:EDAB;SeSD;OBJ;COMMUNE_id\r\n\
         ATPCP24:EDAB;SeSD;ATT;IDU_id\r\nATVST03:003\r\n\
         ATPCP24:EDAB;SeSD;ATT;TEX_id\r\nATVST08:La Motte\r\n",
    );
    v.push_str(
        "RTYSA03:FEA\r\nRIDSA09:Section_1\r\n\
         SCPCP27:EDAB;SeSD;OBJ;SECTION_id\r\n\
         ATPCP24:EDAB;SeSD;ATT;IDU_id\r\nATVST09:0030000AB\r\n\
         ATPCP24:EDAB;SeSD;ATT;TEX_id\r\nATVST02:AB\r\n",
    );
    v.push_str(
        "RTYSA03:FEA\r\nRIDSA10:Parcelle_1\r\n\
         SCPCP28:EDAB;SeSD;OBJ;PARCELLE_id\r\n\
         ATPCP24:EDAB;SeSD;ATT;IDU_id\r\nATVST13:0030000AB0012\r\n\
         ATPCP24:EDAB;SeSD;ATT;TEX_id\r\nATVST02:12\r\n\
         ATPCP25:EDAB;SeSD;ATT;SUPF_id\r\nATVST06:+1234.\r\n\
         QAPCP26:EDAB;SeSQ;QUP;Qualite_1\r\n",
    );
    v.push_str(
        "RTYSA03:FEA\r\nRIDSA09:Numvoie_1\r\n\
         SCPCP27:EDAB;SeSD;OBJ;NUMVOIE_id\r\n\
         ATPCP24:EDAB;SeSD;ATT;TEX_id\r\nATVST04:4bis\r\n",
    );

    // Face composition: one link per (face, arc) pair.
    for (i, arc) in ["Arc_P1", "Arc_P2", "Arc_P3", "Arc_P4"].iter().enumerate() {
        v.push_str(&format!(
            "RTYSA03:LNK\r\nRIDSA07:Lien_F{}\r\n\
             SCPCP30:EDAB;SeSD;REL;ID_S_RCO_FAC\r\n\
             FTPCP24:EDAB;SeSV;PFE;Face_P\r\n\
             FTPCP24:EDAB;SeSV;PAR;{}\r\n",
            i, arc
        ));
    }
    v.push_str(
        "RTYSA03:LNK\r\nRIDSA08:Lien_FC\r\n\
         SCPCP30:EDAB;SeSD;REL;ID_S_RCO_FAC\r\n\
         FTPCP24:EDAB;SeSV;PFE;Face_C\r\n\
         FTPCP23:EDAB;SeSV;PAR;Arc_C\r\n",
    );
    v.push_str(
        "RTYSA03:LNK\r\nRIDSA08:Lien_FS\r\n\
         SCPCP30:EDAB;SeSD;REL;ID_S_RCO_FAC\r\n\
         FTPCP24:EDAB;SeSV;PFE;Face_S\r\n\
         FTPCP23:EDAB;SeSV;PAR;Arc_S\r\n",
    );

    // Geometry links.
    for (link, fea, kind, primitive) in [
        ("Lien_GC", "Commune_1", "PFE", "Face_C"),
        ("Lien_GS", "Section_1", "PFE", "Face_S"),
        ("Lien_GP", "Parcelle_1", "PFE", "Face_P"),
        ("Lien_GN", "Numvoie_1", "PNO", "Node_1"),
    ] {
        v.push_str(&format!(
            "RTYSA03:LNK\r\nRIDSA07:{}\r\n\
             SCPCP26:EDAB;SeSD;REL;ID_S_OBJ\r\n\
             FTPCP24:EDAB;SeSV;FEA;{}\r\n\
             FTPCP24:EDAB;SeSV;{};{}\r\n",
            link, fea, kind, primitive
        ));
    }

    // Numvoie ↔ parcelle relation.
    v.push_str(
        "RTYSA03:LNK\r\nRIDSA07:Lien_R1\r\n\
         SCPCP36:EDAB;SeSD;REL;NUMVOIE_PARCELLE_id\r\n\
         FTPCP24:EDAB;SeSV;FEA;Numvoie_1\r\n\
         FTPCP25:EDAB;SeSV;FEA;Parcelle_1\r\n",
    );

    v
}

fn write_archive(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (member, content) in [
        ("E0000001.THF", THF.as_bytes().to_vec()),
        ("E0000001.SCD", SCD.as_bytes().to_vec()),
        ("E0000001.GEO", GEO.as_bytes().to_vec()),
        ("E0000001.QAL", QAL.as_bytes().to_vec()),
        ("E000000101.VEC", vec_file().into_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, member, content.as_slice()).unwrap();
    }
    builder
        .into_inner()
        .unwrap()
        .finish()
        .unwrap()
        .flush()
        .unwrap();
    path
}

fn decode(path: &Path, wanted: Option<HashSet<String>>) -> DecodedSheet {
    let bundle = read_sheet(path).unwrap();
    decode_sheet(&bundle, &wanted).unwrap()
}

fn context_for(sheet: &DecodedSheet, dep: &str, date: &str) -> ArchiveContext {
    ArchiveContext {
        dep: dep.to_string(),
        millesime: millesime_year(date).unwrap(),
        commune_id: sheet.first_idu("COMMUNE_ID").unwrap_or_default().to_string(),
        section_id: sheet.first_idu("SECTION_ID").unwrap_or_default().to_string(),
    }
}

#[test]
fn decodes_all_feature_kinds() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let sheet = decode(&path, None);
    assert_eq!(sheet.crs.epsg, 2154);
    assert_eq!(sheet.year, 2025);
    assert!(sheet.errors.is_empty(), "decode errors: {:?}", sheet.errors);

    assert_eq!(sheet.features["COMMUNE_ID"].len(), 1);
    assert_eq!(sheet.features["SECTION_ID"].len(), 1);
    assert_eq!(sheet.features["PARCELLE_ID"].len(), 1);
    assert_eq!(sheet.features["NUMVOIE_ID"].len(), 1);
    assert_eq!(sheet.relations.len(), 1);

    let parcelle = &sheet.features["PARCELLE_ID"][0];
    assert_eq!(parcelle.id, "0030000AB0012");
    assert_eq!(parcelle.attributes["SUPF"], "+1234.");
    // Quality dates merged from QAL.
    assert_eq!(parcelle.attributes["CREATEDATE"], "20240110");

    let Geometry::Polygon(polygon) = &parcelle.geometry else {
        panic!("expected a polygon, got {:?}", parcelle.geometry);
    };
    assert_eq!(polygon.exterior().0.len(), 5);
    assert!(polygon.exterior().is_ccw());
}

#[test]
fn kind_filter_keeps_only_configured_tables() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let config = Config::load("bati").unwrap();
    let sheet = decode(&path, Some(config.wanted_kinds()));

    let kinds: Vec<&str> = sheet.features.keys().map(|k| k.as_str()).collect();
    assert_eq!(kinds, vec!["COMMUNE_ID"]);
    assert!(sheet.skipped_kinds >= 3);
    assert!(sheet.relations.is_empty());
}

#[test]
fn department_from_filename_prefixes_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let dep = department::from_filename(&path).unwrap();
    assert_eq!(dep, "38");

    let sheet = decode(&path, None);
    let context = context_for(&sheet, &dep, "2025-04");
    assert_eq!(context.commune_id, "003");
    assert_eq!(context.section_id, "0030000AB");

    let config = Config::load("full").unwrap();
    let table = &config.tables["PARCELLE_id"];
    let reprojector = Reprojector::new(sheet.crs.epsg, 4326).unwrap();
    let row = transform::feature_row(
        table,
        &sheet.features["PARCELLE_ID"][0],
        &context,
        &reprojector,
        7,
    )
    .unwrap();

    // Field order follows the preset: idu, tex, supf, coar, commune,
    // section, dep, annee, creat_date, update_date, geomhash, geom.
    assert_eq!(row[0], SqlValue::Text("380030000AB0012".to_string()));
    assert_eq!(row[2], SqlValue::Float(1234.0));
    assert_eq!(row[4], SqlValue::Text("38003".to_string()));
    assert_eq!(row[5], SqlValue::Text("380030000AB".to_string()));
    assert_eq!(row[6], SqlValue::Text("38".to_string()));
    assert_eq!(row[7], SqlValue::Int(2025));
    assert_eq!(
        row[8],
        SqlValue::Date(chrono::NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
    );
    assert!(matches!(row[10], SqlValue::Bytes(ref b) if b.len() == 32));

    // The parcel corner at the Lambert 93 false origin lands on 3°E 46.5°N.
    let SqlValue::Geometry(ewkt) = &row[11] else {
        panic!("expected geometry");
    };
    assert!(ewkt.starts_with("SRID=4326;POLYGON"), "{}", ewkt);
    assert!(ewkt.contains("3 46.5"), "{}", ewkt);
}

#[test]
fn corsican_department_codes_are_preserved() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-2A0040000A01.tar.bz2");
    assert_eq!(department::from_filename(&path).unwrap(), "2A");
}

#[test]
fn relation_rows_carry_both_foreign_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let sheet = decode(&path, None);
    let context = context_for(&sheet, "38", "2025-04");
    let config = Config::load("full").unwrap();
    let table = &config.tables["NUMVOIE_PARCELLE"];

    let rows: Vec<_> = sheet
        .relations
        .iter()
        .filter_map(|pair| transform::relation_row(table, pair, &context).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], SqlValue::Text("4bis".to_string()));
    assert_eq!(rows[0][1], SqlValue::Text("380030000AB0012".to_string()));
    assert_eq!(rows[0][2], SqlValue::Int(2025));
}

#[test]
fn geomhash_is_stable_across_decodes() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let hash_of = |sheet: &DecodedSheet| {
        let reprojector = Reprojector::new(sheet.crs.epsg, 4326).unwrap();
        let geometry = reprojector
            .transform_geometry(&sheet.features["PARCELLE_ID"][0].geometry)
            .unwrap();
        transform::geometry_hash(&transform::round_coords(&geometry, 7))
    };

    let first = decode(&path, None);
    let second = decode(&path, None);
    assert_eq!(hash_of(&first), hash_of(&second));
}

#[test]
fn unchanged_archive_has_stable_checksum() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_archive(tmp.path(), "edigeo-380030000AB01.tar.bz2");

    let a = cadastre_ingest::ingest::file_checksum(&path).unwrap();
    let b = cadastre_ingest::ingest::file_checksum(&path).unwrap();
    assert_eq!(a, b);
}
