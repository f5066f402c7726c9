//! Schema-driven transform: decoded features → table rows.
//!
//! For every configured field the engine selects a source value (`json`
//! attribute or `const`), pushes it through the declared coercion chain,
//! and finalizes it against the column's SQL type. Geometry is reprojected
//! once per feature, rounded to the output precision (7 decimals for
//! geographic targets, 2 for metric ones) and encoded as EWKT; tables with
//! `hashGeom` additionally get a SHA-256 digest of the canonical geometry
//! form for cross-run deduplication.
//!
//! # Coercions
//!
//! | Name | Behavior |
//! |------|----------|
//! | `addMillesime` | replace with the integer millésime year |
//! | `addDep` | prefix with the department code |
//! | `toInt` | decimal integer; empty/unparsable → NULL |
//! | `toFloat` | first decimal number in the value; none → NULL |
//! | `toDate` | `YYYYMMDD`; year < 1000 or invalid → NULL |
//! | `toDateFR` | `DDMMYYYY`, `/` separators allowed; same NULL rules |
//!
//! Chains compose left-to-right. A NULL result only fails the row when the
//! field is declared `notNull`.
//!
//! # Geometry hash
//!
//! The canonical form is a compact JSON document: geometry type plus
//! coordinates scaled to integers at 1e-6 precision, polygon rings rotated
//! to start at their lexicographically smallest vertex. Two features with
//! the same shape therefore hash identically even when their rings were
//! chained from different starting arcs.

use chrono::NaiveDate;
use geo::{Coord, Geometry, LineString, MapCoords, Polygon};
use geozero::GeozeroGeometry;
use sha2::{Digest, Sha256};

use crate::config::{Coercion, FieldConfig, TableConfig, TableKind};
use crate::decoder::{Feature, RelationPair};
use crate::error::TransformError;
use crate::reproject::Reprojector;

/// Per-archive constants available to `const` selectors.
#[derive(Debug, Clone)]
pub struct ArchiveContext {
    /// Department code (`38`, `2A`, `974`, …).
    pub dep: String,
    /// Millésime year derived from the `YYYY-MM` run date.
    pub millesime: i16,
    /// IDU of the sheet's COMMUNE feature, empty when absent.
    pub commune_id: String,
    /// IDU of the sheet's SECTION feature, empty when absent.
    pub section_id: String,
}

/// A typed value ready to be bound into an INSERT.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    /// Raw geomhash bytes.
    Bytes(Vec<u8>),
    /// EWKT, inserted through `ST_GeomFromEWKT`.
    Geometry(String),
}

/// Derives the smallint millésime from a `YYYY-MM` date, validating the
/// format up front.
pub fn millesime_year(date: &str) -> anyhow::Result<i16> {
    let valid = date.len() == 7
        && date.as_bytes()[4] == b'-'
        && date[..4].chars().all(|c| c.is_ascii_digit())
        && date[5..].chars().all(|c| c.is_ascii_digit());
    if !valid {
        anyhow::bail!("invalid date '{}': expected YYYY-MM (e.g. 2025-04)", date);
    }
    let year: i16 = date[..4].parse()?;
    let month: u8 = date[5..].parse()?;
    if !(1900..=2100).contains(&year) {
        anyhow::bail!("year out of range: {}", year);
    }
    if !(1..=12).contains(&month) {
        anyhow::bail!("month must be 01-12, got {:02}", month);
    }
    Ok(year)
}

/// The column list of a table's INSERT, in the exact order
/// [`feature_row`] / [`relation_row`] emit values: configured fields,
/// then `geomhash` when hashed, then the geometry column.
pub fn insert_columns(table: &TableConfig) -> Vec<String> {
    let mut columns: Vec<String> = table.fields.iter().map(|f| f.db.clone()).collect();
    if table.hash_geom {
        columns.push("geomhash".to_string());
    }
    if let Some(geometry) = table.geometry_column() {
        columns.push(geometry.to_string());
    }
    columns
}

/// Builds the row of one feature for its `FeatureCollection` table:
/// configured fields, then `geomhash` when hashed, then the EWKT geometry.
pub fn feature_row(
    table: &TableConfig,
    feature: &Feature,
    context: &ArchiveContext,
    reprojector: &Reprojector,
    precision: u8,
) -> Result<Vec<SqlValue>, TransformError> {
    let mut values = Vec::with_capacity(table.fields.len() + 2);

    for field in &table.fields {
        values.push(field_value(field, Some(feature), context)?);
    }

    let geometry = reprojector.transform_geometry(&feature.geometry)?;
    let geometry = round_coords(&geometry, precision);

    if table.hash_geom {
        values.push(SqlValue::Bytes(geometry_hash(&geometry).to_vec()));
    }
    values.push(SqlValue::Geometry(to_ewkt(
        &geometry,
        reprojector.target_epsg(),
    )?));

    Ok(values)
}

/// The two object kinds a relation table joins, upper-cased.
pub fn relation_sources(table: &TableConfig) -> Vec<String> {
    let mut sources: Vec<String> = table
        .fields
        .iter()
        .filter_map(|f| f.table_source.as_ref())
        .map(|s| s.to_uppercase())
        .collect();
    sources.sort_unstable();
    sources.dedup();
    sources
}

/// Builds the row of one relation pair, or `None` when the pair's kinds do
/// not match this table's declared sources.
pub fn relation_row(
    table: &TableConfig,
    pair: &RelationPair,
    context: &ArchiveContext,
) -> Result<Option<Vec<SqlValue>>, TransformError> {
    debug_assert_eq!(table.kind, TableKind::Relation);

    let mut pair_kinds = vec![pair.left.kind.clone(), pair.right.kind.clone()];
    pair_kinds.sort_unstable();
    if relation_sources(table) != pair_kinds {
        return Ok(None);
    }

    let mut values = Vec::with_capacity(table.fields.len());
    for field in &table.fields {
        match &field.table_source {
            None => values.push(field_value(field, None, context)?),
            Some(source) => {
                let source = source.to_uppercase();
                let end = if pair.left.kind == source {
                    &pair.left
                } else {
                    &pair.right
                };
                let raw = field
                    .json
                    .as_ref()
                    .and_then(|name| end.attributes.get(name))
                    .map(String::as_str);
                values.push(coerce(field, raw, context)?);
            }
        }
    }

    Ok(Some(values))
}

fn field_value(
    field: &FieldConfig,
    feature: Option<&Feature>,
    context: &ArchiveContext,
) -> Result<SqlValue, TransformError> {
    let constant_storage;
    let raw: Option<&str> = if let Some(key) = &field.constant {
        constant_storage = constant_value(key, context);
        constant_storage.as_deref()
    } else if let (Some(name), Some(feature)) = (&field.json, feature) {
        feature.attributes.get(name).map(String::as_str)
    } else {
        None
    };

    coerce(field, raw, context)
}

fn constant_value(key: &str, context: &ArchiveContext) -> Option<String> {
    match key {
        "commune_id" => Some(context.commune_id.clone()),
        "section_id" => Some(context.section_id.clone()),
        "dep" => Some(context.dep.clone()),
        // The millésime constant carries no text of its own; the
        // addMillesime coercion supplies the year.
        "millesime" => Some(String::new()),
        _ => None,
    }
}

/// Applies the coercion chain, then finalizes against the column type.
fn coerce(
    field: &FieldConfig,
    raw: Option<&str>,
    context: &ArchiveContext,
) -> Result<SqlValue, TransformError> {
    let mut value = match raw {
        Some(v) if !v.is_empty() => SqlValue::Text(v.to_string()),
        _ => SqlValue::Null,
    };

    for coercion in field.coercions() {
        value = apply_coercion(coercion, value, context);
    }

    let value = finalize_for_type(value, &field.pgtype);

    if field.not_null && value == SqlValue::Null {
        return Err(TransformError::CoercionFailed {
            column: field.db.clone(),
            value: raw.unwrap_or_default().to_string(),
            function: "notNull",
        });
    }

    Ok(value)
}

fn apply_coercion(coercion: Coercion, value: SqlValue, context: &ArchiveContext) -> SqlValue {
    match coercion {
        Coercion::AddMillesime => SqlValue::Int(context.millesime as i64),
        Coercion::AddDep => match value {
            SqlValue::Text(v) if !v.is_empty() => {
                SqlValue::Text(format!("{}{}", context.dep, v))
            }
            other => other,
        },
        Coercion::ToInt => match text_of(&value) {
            Some(v) => parse_decimal(&v)
                .map(|n| SqlValue::Int(n.trunc() as i64))
                .unwrap_or(SqlValue::Null),
            None => pass_numeric(value),
        },
        Coercion::ToFloat => match text_of(&value) {
            Some(v) => first_number(&v).map(SqlValue::Float).unwrap_or(SqlValue::Null),
            None => pass_numeric(value),
        },
        Coercion::ToDate => match text_of(&value) {
            Some(v) => parse_date_ymd(&v).map(SqlValue::Date).unwrap_or(SqlValue::Null),
            None => SqlValue::Null,
        },
        Coercion::ToDateFr => match text_of(&value) {
            Some(v) => parse_date_fr(&v).map(SqlValue::Date).unwrap_or(SqlValue::Null),
            None => SqlValue::Null,
        },
    }
}

fn text_of(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(v) => Some(v.clone()),
        _ => None,
    }
}

/// Numeric coercions applied to an already-numeric value pass it through.
fn pass_numeric(value: SqlValue) -> SqlValue {
    match value {
        SqlValue::Int(_) | SqlValue::Float(_) => value,
        _ => SqlValue::Null,
    }
}

/// EDIGEO decimal: tolerates a leading `+` and a trailing orphan point.
fn parse_decimal(raw: &str) -> Option<f64> {
    let v = raw.trim().trim_start_matches('+');
    let v = v.strip_suffix('.').unwrap_or(v);
    if v.is_empty() {
        return None;
    }
    v.parse::<f64>().ok()
}

/// Extracts the first decimal number of a free-form value
/// (`"12,34 m²"` → 12).
fn first_number(raw: &str) -> Option<f64> {
    let bytes = raw.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let mut end = start;
    let mut seen_point = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_point => {
                seen_point = true;
                end += 1;
            }
            _ => break,
        }
    }
    let negative = start > 0 && bytes[start - 1] == b'-';
    let number: f64 = raw[start..end].trim_end_matches('.').parse().ok()?;
    Some(if negative { -number } else { number })
}

/// `YYYYMMDD`; years below 1000 are sentinel values and become NULL.
fn parse_date_ymd(raw: &str) -> Option<NaiveDate> {
    let v = raw.trim();
    if v.len() != 8 || !v.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = v[..4].parse().ok()?;
    if year < 1000 {
        return None;
    }
    NaiveDate::from_ymd_opt(year, v[4..6].parse().ok()?, v[6..8].parse().ok()?)
}

/// `DDMMYYYY` with optional `/` separators.
fn parse_date_fr(raw: &str) -> Option<NaiveDate> {
    let compact: String = raw.trim().chars().filter(|&c| c != '/').collect();
    if compact.len() != 8 || !compact.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = compact[4..8].parse().ok()?;
    if year < 1000 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        year,
        compact[2..4].parse().ok()?,
        compact[..2].parse().ok()?,
    )
}

/// Broad SQL type families, used to finalize coerced values and to bind
/// correctly-typed NULLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFamily {
    Text,
    Int,
    Float,
    Date,
}

/// Classifies a `pgtype` declaration (`varchar(20)`, `double precision`,
/// `smallint`, …) into its family.
pub fn pgtype_family(pgtype: &str) -> PgFamily {
    let head = pgtype
        .split(|c: char| c == '(' || c == ' ')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match head.as_str() {
        "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint" => PgFamily::Int,
        "double" | "float" | "float4" | "float8" | "real" | "numeric" => PgFamily::Float,
        "date" => PgFamily::Date,
        _ => PgFamily::Text,
    }
}

fn finalize_for_type(value: SqlValue, pgtype: &str) -> SqlValue {
    match (pgtype_family(pgtype), value) {
        (PgFamily::Int, SqlValue::Text(v)) => parse_decimal(&v)
            .map(|n| SqlValue::Int(n.trunc() as i64))
            .unwrap_or(SqlValue::Null),
        (PgFamily::Float, SqlValue::Text(v)) => {
            parse_decimal(&v).map(SqlValue::Float).unwrap_or(SqlValue::Null)
        }
        (PgFamily::Float, SqlValue::Int(v)) => SqlValue::Float(v as f64),
        (PgFamily::Date, SqlValue::Text(_)) => SqlValue::Null,
        (_, v) => v,
    }
}

/// Rounds every coordinate to `decimals` places.
pub fn round_coords(geometry: &Geometry, decimals: u8) -> Geometry {
    let factor = 10_f64.powi(decimals as i32);
    geometry.map_coords(|c| Coord {
        x: (c.x * factor).round() / factor,
        y: (c.y * factor).round() / factor,
    })
}

/// Default output precision: 7 decimals (~1 cm) for geographic targets,
/// 2 decimals (~1 cm) for metric ones.
pub fn default_precision(target_epsg: u32) -> u8 {
    if target_epsg == 4326 {
        7
    } else {
        2
    }
}

/// Encodes a geometry as `SRID=<epsg>;<WKT>`.
pub fn to_ewkt(geometry: &Geometry, srid: u32) -> Result<String, TransformError> {
    let mut wkt: Vec<u8> = Vec::with_capacity(256);
    let mut writer = geozero::wkt::WktWriter::new(&mut wkt);
    geometry
        .process_geom(&mut writer)
        .map_err(|e| TransformError::ReprojectionFailed {
            from: srid,
            to: srid,
            reason: format!("WKT encoding failed: {}", e),
        })?;
    Ok(format!("SRID={};{}", srid, String::from_utf8_lossy(&wkt)))
}

const HASH_SCALE: f64 = 1_000_000.0;

/// SHA-256 over the canonical geometry form.
pub fn geometry_hash(geometry: &Geometry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(geometry).as_bytes());
    hasher.finalize().into()
}

fn canonical_json(geometry: &Geometry) -> String {
    let mut out = String::with_capacity(256);
    write_canonical(geometry, &mut out);
    out
}

fn write_canonical(geometry: &Geometry, out: &mut String) {
    match geometry {
        Geometry::Point(p) => {
            out.push_str("{\"type\":\"Point\",\"coordinates\":");
            write_coord(p.0, out);
            out.push('}');
        }
        Geometry::MultiPoint(mp) => {
            out.push_str("{\"type\":\"MultiPoint\",\"coordinates\":[");
            for (i, p) in mp.0.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_coord(p.0, out);
            }
            out.push_str("]}");
        }
        Geometry::LineString(ls) => {
            out.push_str("{\"type\":\"LineString\",\"coordinates\":");
            write_line(&ls.0, out);
            out.push('}');
        }
        Geometry::MultiLineString(mls) => {
            out.push_str("{\"type\":\"MultiLineString\",\"coordinates\":[");
            for (i, ls) in mls.0.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_line(&ls.0, out);
            }
            out.push_str("]}");
        }
        Geometry::Polygon(p) => {
            out.push_str("{\"type\":\"Polygon\",\"coordinates\":");
            write_polygon(p, out);
            out.push('}');
        }
        Geometry::MultiPolygon(mp) => {
            out.push_str("{\"type\":\"MultiPolygon\",\"coordinates\":[");
            for (i, p) in mp.0.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_polygon(p, out);
            }
            out.push_str("]}");
        }
        other => {
            // Remaining variants (Rect, Triangle, collections) never leave
            // the assembler; fall back to their debug form.
            out.push_str(&format!("{:?}", other));
        }
    }
}

fn write_polygon(polygon: &Polygon, out: &mut String) {
    out.push('[');
    write_ring_normalized(polygon.exterior(), out);
    for interior in polygon.interiors() {
        out.push(',');
        write_ring_normalized(interior, out);
    }
    out.push(']');
}

/// Writes a ring rotated to start at its lexicographically smallest
/// vertex, dropping the closing duplicate, so the canonical form does not
/// depend on which arc the chaining happened to start from.
fn write_ring_normalized(ring: &LineString, out: &mut String) {
    let coords = &ring.0;
    let len = if coords.len() > 1 && coords.first() == coords.last() {
        coords.len() - 1
    } else {
        coords.len()
    };
    if len == 0 {
        out.push_str("[]");
        return;
    }

    let min_index = (0..len)
        .min_by(|&a, &b| {
            let (ca, cb) = (coords[a], coords[b]);
            ca.x.partial_cmp(&cb.x)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ca.y.partial_cmp(&cb.y).unwrap_or(std::cmp::Ordering::Equal))
        })
        .unwrap_or(0);

    out.push('[');
    for i in 0..len {
        if i > 0 {
            out.push(',');
        }
        write_coord(coords[(min_index + i) % len], out);
    }
    out.push(']');
}

fn write_line(coords: &[Coord], out: &mut String) {
    out.push('[');
    for (i, &c) in coords.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_coord(c, out);
    }
    out.push(']');
}

fn write_coord(c: Coord, out: &mut String) {
    let x = (c.x * HASH_SCALE).round() as i64;
    let y = (c.y * HASH_SCALE).round() as i64;
    out.push('[');
    out.push_str(&x.to_string());
    out.push(',');
    out.push_str(&y.to_string());
    out.push(']');
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    fn context() -> ArchiveContext {
        ArchiveContext {
            dep: "38".to_string(),
            millesime: 2025,
            commune_id: "380010000".to_string(),
            section_id: "38001000AB".to_string(),
        }
    }

    fn field(pgtype: &str, functions: &[&str]) -> FieldConfig {
        FieldConfig {
            db: "col".to_string(),
            json: Some("V".to_string()),
            constant: None,
            functions: functions.iter().map(|s| s.to_string()).collect(),
            pgtype: pgtype.to_string(),
            json_schema: None,
            table_source: None,
            not_null: false,
        }
    }

    fn run(pgtype: &str, functions: &[&str], raw: Option<&str>) -> SqlValue {
        coerce(&field(pgtype, functions), raw, &context()).unwrap()
    }

    #[test]
    fn test_to_int() {
        assert_eq!(run("integer", &["toInt"], Some("0042")), SqlValue::Int(42));
        assert_eq!(run("integer", &["toInt"], Some("")), SqlValue::Null);
        assert_eq!(run("integer", &["toInt"], Some("+1895.")), SqlValue::Int(1895));
        assert_eq!(run("integer", &["toInt"], Some("abc")), SqlValue::Null);
    }

    #[test]
    fn test_to_float_extracts_first_number() {
        assert_eq!(
            run("double precision", &["toFloat"], Some("12,34 m²")),
            SqlValue::Float(12.0)
        );
        assert_eq!(
            run("double precision", &["toFloat"], Some("surface: 45.5 ha")),
            SqlValue::Float(45.5)
        );
        assert_eq!(run("double precision", &["toFloat"], Some("none")), SqlValue::Null);
        assert_eq!(run("double precision", &["toFloat"], None), SqlValue::Null);
    }

    #[test]
    fn test_to_date() {
        assert_eq!(
            run("date", &["toDate"], Some("19990307")),
            SqlValue::Date(NaiveDate::from_ymd_opt(1999, 3, 7).unwrap())
        );
        // Year sentinel below 1000.
        assert_eq!(run("date", &["toDate"], Some("00010101")), SqlValue::Null);
        assert_eq!(run("date", &["toDate"], Some("19991342")), SqlValue::Null);
        assert_eq!(run("date", &["toDate"], Some("not-a-date")), SqlValue::Null);
    }

    #[test]
    fn test_to_date_fr() {
        let expected = SqlValue::Date(NaiveDate::from_ymd_opt(1999, 3, 7).unwrap());
        assert_eq!(run("date", &["toDateFR"], Some("07/03/1999")), expected);
        assert_eq!(run("date", &["toDateFR"], Some("07031999")), expected);
        assert_eq!(run("date", &["toDateFR"], Some("07/03/0999")), SqlValue::Null);
    }

    #[test]
    fn test_add_dep_prefixes() {
        assert_eq!(
            run("text", &["addDep"], Some("X")),
            SqlValue::Text("38X".to_string())
        );
        assert_eq!(run("text", &["addDep"], None), SqlValue::Null);
    }

    #[test]
    fn test_add_millesime_replaces_value() {
        assert_eq!(run("smallint", &["addMillesime"], Some("anything")), SqlValue::Int(2025));
        assert_eq!(run("smallint", &["addMillesime"], None), SqlValue::Int(2025));
    }

    #[test]
    fn test_chain_composes_left_to_right() {
        // addDep then toInt: "38" + "1" = "381" parsed as integer.
        assert_eq!(
            run("integer", &["addDep", "toInt"], Some("1")),
            SqlValue::Int(381)
        );
    }

    #[test]
    fn test_not_null_violation_fails() {
        let mut f = field("integer", &["toInt"]);
        f.not_null = true;
        let err = coerce(&f, Some("abc"), &context()).unwrap_err();
        assert!(matches!(err, TransformError::CoercionFailed { .. }));
    }

    #[test]
    fn test_finalize_parses_untouched_numeric_text() {
        assert_eq!(run("smallint", &[], Some("07")), SqlValue::Int(7));
        assert_eq!(run("double precision", &[], Some("1.5")), SqlValue::Float(1.5));
        assert_eq!(run("text", &[], Some("07")), SqlValue::Text("07".to_string()));
    }

    #[test]
    fn test_millesime_year() {
        assert_eq!(millesime_year("2025-04").unwrap(), 2025);
        assert!(millesime_year("2025").is_err());
        assert!(millesime_year("2025-13").is_err());
        assert!(millesime_year("25-04").is_err());
    }

    #[test]
    fn test_geometry_hash_stable_across_ring_starts() {
        let a: Geometry = polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)
        ]
        .into();
        let b: Geometry = polygon![
            (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0), (x: 1.0, y: 0.0)
        ]
        .into();
        assert_eq!(geometry_hash(&a), geometry_hash(&b));
    }

    #[test]
    fn test_geometry_hash_differs_for_different_shapes() {
        let a: Geometry = point!(x: 1.0, y: 2.0).into();
        let b: Geometry = point!(x: 1.0, y: 2.5).into();
        assert_ne!(geometry_hash(&a), geometry_hash(&b));
    }

    #[test]
    fn test_round_coords() {
        let g: Geometry = point!(x: 2.12345678901, y: 48.98765432109).into();
        let rounded = round_coords(&g, 7);
        let Geometry::Point(p) = rounded else { panic!() };
        assert!((p.x() - 2.1234568).abs() < 1e-12);
        assert!((p.y() - 48.9876543).abs() < 1e-12);
    }

    #[test]
    fn test_to_ewkt() {
        let g: Geometry = point!(x: 2.5, y: 48.5).into();
        let ewkt = to_ewkt(&g, 4326).unwrap();
        assert!(ewkt.starts_with("SRID=4326;POINT"), "{}", ewkt);
        assert!(ewkt.contains("2.5"));
    }

    #[test]
    fn test_insert_columns_order() {
        let config = crate::config::Config::load("bati").unwrap();
        let table = &config.tables["BATIMENT_id"];
        assert_eq!(
            insert_columns(table),
            vec!["tex", "dur", "commune", "annee", "geomhash", "geom"]
        );
    }

    #[test]
    fn test_feature_row_shapes() {
        let config = crate::config::Config::load("bati").unwrap();
        let table = &config.tables["BATIMENT_id"];
        let reprojector = Reprojector::new(2154, 2154).unwrap();
        let feature = Feature {
            kind: "BATIMENT_ID".to_string(),
            id: "b1".to_string(),
            attributes: std::collections::HashMap::from([
                ("TEX".to_string(), "hangar".to_string()),
                ("DUR".to_string(), "01".to_string()),
            ]),
            geometry: polygon![
                (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
            ]
            .into(),
        };

        let row = feature_row(table, &feature, &context(), &reprojector, 2).unwrap();
        assert_eq!(row.len(), 6);
        assert_eq!(row[0], SqlValue::Text("hangar".to_string()));
        assert_eq!(row[1], SqlValue::Int(1));
        assert_eq!(row[2], SqlValue::Text("38380010000".to_string()));
        assert_eq!(row[3], SqlValue::Int(2025));
        assert!(matches!(row[4], SqlValue::Bytes(ref b) if b.len() == 32));
        assert!(matches!(row[5], SqlValue::Geometry(ref e) if e.starts_with("SRID=2154;POLYGON")));
    }

    #[test]
    fn test_relation_row_matches_sources() {
        let config = crate::config::Config::load("full").unwrap();
        let table = &config.tables["NUMVOIE_PARCELLE"];
        let pair = RelationPair {
            name: "NUMVOIE_PARCELLE_ID".to_string(),
            left: crate::decoder::RelationEnd {
                kind: "PARCELLE_ID".to_string(),
                attributes: std::collections::HashMap::from([(
                    "IDU".to_string(),
                    "0001AB12".to_string(),
                )]),
            },
            right: crate::decoder::RelationEnd {
                kind: "NUMVOIE_ID".to_string(),
                attributes: std::collections::HashMap::from([(
                    "TEX".to_string(),
                    "12".to_string(),
                )]),
            },
        };

        let row = relation_row(table, &pair, &context()).unwrap().unwrap();
        assert_eq!(row[0], SqlValue::Text("12".to_string()));
        assert_eq!(row[1], SqlValue::Text("380001AB12".to_string()));
        assert_eq!(row[2], SqlValue::Int(2025));

        // A pair with unrelated kinds does not match.
        let other = RelationPair {
            name: "X".to_string(),
            left: crate::decoder::RelationEnd {
                kind: "SUBDFISC_ID".to_string(),
                attributes: Default::default(),
            },
            right: pair.right.clone(),
        };
        assert!(relation_row(table, &other, &context()).unwrap().is_none());
    }
}
