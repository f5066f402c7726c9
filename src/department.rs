//! Department resolution for a decoded sheet.
//!
//! Three policies, in priority order:
//!
//! 1. **Explicit** — the caller supplies a code (`--dep 38`), used verbatim.
//! 2. **FromFilename** — the archive basename follows the national
//!    distribution convention `edigeo-<dep>…`; Corsican `2A`/`2B` and
//!    three-digit overseas codes (`971`–`988`) are preserved as strings.
//! 3. **Spatial** — the bounding box of the sheet's `SECTION_id` feature is
//!    matched against a department boundary set (GeoJSON) indexed by an
//!    R-tree. The department with the largest overlap wins; equal overlaps
//!    resolve deterministically to the lower INSEE code; no overlap yields
//!    `00` with a warning.
//!
//! The boundary index is expensive to build and read-only afterwards, so it
//! is published once per process behind a `OnceLock`: the first caller
//! builds it, every later caller observes the finished structure.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use geo::{Area, BooleanOps, BoundingRect, Coord, Geometry, LineString, Polygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use tracing::warn;

/// How the orchestrator assigns a department code to each archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepartmentPolicy {
    /// A literal two- or three-character code, used for every archive.
    Explicit(String),
    /// Derive the code from the archive filename (`edigeo-<dep>…`).
    FromFilename,
    /// Look the sheet up in the department boundary index.
    Spatial,
}

impl DepartmentPolicy {
    /// Parses the CLI `--dep` value: `auto`, `fromFile`, or a literal code.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            v if v.eq_ignore_ascii_case("auto") => Ok(Self::Spatial),
            v if v.eq_ignore_ascii_case("fromfile") => Ok(Self::FromFilename),
            v if (2..=3).contains(&v.len())
                && v.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                Ok(Self::Explicit(v.to_uppercase()))
            }
            v => bail!("invalid department policy '{}': use auto, fromFile or a code", v),
        }
    }
}

/// Extracts the department code from an `edigeo-<dep>…` archive name.
pub fn from_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let rest = name
        .strip_prefix("edigeo-")
        .or_else(|| name.strip_prefix("EDIGEO-"))?;

    let mut chars = rest.chars();
    let first = chars.next()?;
    let second = chars.next()?;

    if !first.is_ascii_digit() {
        return None;
    }

    // Corsica: 2A / 2B.
    if first == '2' && (second == 'A' || second == 'B') {
        return Some(format!("{}{}", first, second));
    }
    if !second.is_ascii_digit() {
        return None;
    }

    let mut dep = format!("{}{}", first, second);

    // Overseas departments and collectivities carry three digits.
    if dep == "97" || dep == "98" {
        if let Some(third) = chars.next().filter(|c| c.is_ascii_digit()) {
            dep.push(third);
        }
    }

    Some(dep)
}

/// One department's boundary, indexed by its bounding box.
struct DepartmentShape {
    code: String,
    polygons: Vec<Polygon>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for DepartmentShape {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// The static department boundary set, R-tree indexed.
pub struct DepartmentIndex {
    tree: RTree<DepartmentShape>,
}

static GLOBAL_INDEX: OnceLock<DepartmentIndex> = OnceLock::new();

impl DepartmentIndex {
    /// Returns the process-wide index, building it from `path` on first
    /// use. Safe under concurrent first use: a losing builder's work is
    /// discarded and the winning index is observed by everyone.
    pub fn global(path: &Path) -> Result<&'static DepartmentIndex> {
        if let Some(index) = GLOBAL_INDEX.get() {
            return Ok(index);
        }
        let built = Self::load(path)?;
        Ok(GLOBAL_INDEX.get_or_init(|| built))
    }

    /// Loads a GeoJSON FeatureCollection of department boundaries. The
    /// INSEE code is read from the `code` property (`INSEE_DEP` accepted).
    pub fn load(path: &Path) -> Result<DepartmentIndex> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read department boundaries: {}", path.display()))?;
        let geojson: geojson::GeoJson = content
            .parse()
            .with_context(|| format!("invalid GeoJSON: {}", path.display()))?;

        let geojson::GeoJson::FeatureCollection(collection) = geojson else {
            bail!("department boundaries must be a FeatureCollection");
        };

        let mut shapes = Vec::with_capacity(collection.features.len());
        for feature in collection.features {
            let Some(code) = feature
                .property("code")
                .or_else(|| feature.property("INSEE_DEP"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_uppercase())
            else {
                continue;
            };
            let Some(geometry) = feature.geometry else {
                continue;
            };
            let shape: Geometry = geometry
                .value
                .try_into()
                .with_context(|| format!("department {}: unsupported geometry", code))?;
            let polygons = match shape {
                Geometry::Polygon(p) => vec![p],
                Geometry::MultiPolygon(mp) => mp.0,
                _ => continue,
            };
            let Some(envelope) = polygons_envelope(&polygons) else {
                continue;
            };
            shapes.push(DepartmentShape {
                code,
                polygons,
                envelope,
            });
        }

        if shapes.is_empty() {
            bail!("department boundary set is empty");
        }

        Ok(DepartmentIndex {
            tree: RTree::bulk_load(shapes),
        })
    }

    /// Resolves the department covering `bbox` (the SECTION bounding box,
    /// in the same CRS as the boundary set).
    ///
    /// Candidates come from the R-tree; when several intersect, the one
    /// with the largest overlap area wins, ties going to the lower INSEE
    /// code. Returns `00` when nothing intersects.
    pub fn resolve(&self, bbox: Rect) -> String {
        let query = AABB::from_corners(
            [bbox.min().x, bbox.min().y],
            [bbox.max().x, bbox.max().y],
        );
        let clip = rect_polygon(bbox);

        let mut candidates: Vec<&DepartmentShape> =
            self.tree.locate_in_envelope_intersecting(&query).collect();
        candidates.sort_by(|a, b| a.code.cmp(&b.code));

        let mut best: Option<(&str, f64)> = None;
        for shape in candidates {
            let overlap: f64 = shape
                .polygons
                .iter()
                .map(|polygon| polygon.intersection(&clip).unsigned_area())
                .sum();
            if overlap <= 0.0 {
                continue;
            }
            // Strict comparison: equal overlaps keep the earlier (lower)
            // code thanks to the sort above.
            if best.map_or(true, |(_, area)| overlap > area) {
                best = Some((shape.code.as_str(), overlap));
            }
        }

        match best {
            Some((code, _)) => code.to_string(),
            None => {
                warn!("section bbox intersects no department, using 00");
                "00".to_string()
            }
        }
    }

    #[cfg(test)]
    fn from_shapes(shapes: Vec<(String, Polygon)>) -> DepartmentIndex {
        let shapes = shapes
            .into_iter()
            .filter_map(|(code, polygon)| {
                let polygons = vec![polygon];
                polygons_envelope(&polygons).map(|envelope| DepartmentShape {
                    code,
                    polygons,
                    envelope,
                })
            })
            .collect();
        DepartmentIndex {
            tree: RTree::bulk_load(shapes),
        }
    }
}

fn polygons_envelope(polygons: &[Polygon]) -> Option<AABB<[f64; 2]>> {
    let mut rects = polygons.iter().filter_map(|p| p.bounding_rect());
    let first = rects.next()?;
    let merged = rects.fold(first, |acc, r| {
        Rect::new(
            Coord {
                x: acc.min().x.min(r.min().x),
                y: acc.min().y.min(r.min().y),
            },
            Coord {
                x: acc.max().x.max(r.max().x),
                y: acc.max().y.max(r.max().y),
            },
        )
    });
    Some(AABB::from_corners(
        [merged.min().x, merged.min().y],
        [merged.max().x, merged.max().y],
    ))
}

fn rect_polygon(rect: Rect) -> Polygon {
    let (min, max) = (rect.min(), rect.max());
    Polygon::new(
        LineString::from(vec![
            (min.x, min.y),
            (max.x, min.y),
            (max.x, max.y),
            (min.x, max.y),
            (min.x, min.y),
        ]),
        vec![],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon {
        Polygon::new(
            LineString::from(vec![
                (x0, y0),
                (x0 + size, y0),
                (x0 + size, y0 + size),
                (x0, y0 + size),
                (x0, y0),
            ]),
            vec![],
        )
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(DepartmentPolicy::parse("auto").unwrap(), DepartmentPolicy::Spatial);
        assert_eq!(
            DepartmentPolicy::parse("fromFile").unwrap(),
            DepartmentPolicy::FromFilename
        );
        assert_eq!(
            DepartmentPolicy::parse("2a").unwrap(),
            DepartmentPolicy::Explicit("2A".to_string())
        );
        assert!(DepartmentPolicy::parse("not-a-code").is_err());
    }

    #[test]
    fn test_from_filename() {
        assert_eq!(
            from_filename(Path::new("edigeo-380910000C01.tar.bz2")).as_deref(),
            Some("38")
        );
        assert_eq!(
            from_filename(Path::new("edigeo-2A0040000A01.tar.bz2")).as_deref(),
            Some("2A")
        );
        assert_eq!(
            from_filename(Path::new("edigeo-9740120000B02.tar.bz2")).as_deref(),
            Some("974")
        );
        assert_eq!(from_filename(Path::new("EDIGEO-01.tar.bz2")).as_deref(), Some("01"));
        assert_eq!(from_filename(Path::new("sheet-38.tar.bz2")), None);
    }

    #[test]
    fn test_resolve_largest_overlap_wins() {
        let index = DepartmentIndex::from_shapes(vec![
            ("38".to_string(), square(0.0, 0.0, 10.0)),
            ("73".to_string(), square(10.0, 0.0, 10.0)),
        ]);
        // Bbox mostly inside 38.
        let bbox = Rect::new(Coord { x: 8.0, y: 1.0 }, Coord { x: 11.0, y: 2.0 });
        assert_eq!(index.resolve(bbox), "38");
        // Bbox mostly inside 73.
        let bbox = Rect::new(Coord { x: 9.0, y: 1.0 }, Coord { x: 14.0, y: 2.0 });
        assert_eq!(index.resolve(bbox), "73");
    }

    #[test]
    fn test_resolve_tie_prefers_lower_code() {
        let index = DepartmentIndex::from_shapes(vec![
            ("73".to_string(), square(10.0, 0.0, 10.0)),
            ("38".to_string(), square(0.0, 0.0, 10.0)),
        ]);
        // Straddles the boundary with exactly equal overlap on both sides.
        let bbox = Rect::new(Coord { x: 9.0, y: 1.0 }, Coord { x: 11.0, y: 2.0 });
        assert_eq!(index.resolve(bbox), "38");
    }

    #[test]
    fn test_resolve_no_overlap_is_00() {
        let index =
            DepartmentIndex::from_shapes(vec![("38".to_string(), square(0.0, 0.0, 10.0))]);
        let bbox = Rect::new(Coord { x: 100.0, y: 100.0 }, Coord { x: 101.0, y: 101.0 });
        assert_eq!(index.resolve(bbox), "00");
    }

    #[test]
    fn test_load_from_geojson_file() {
        let geojson = r##"{
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": { "code": "38", "nom": "Isère" },
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[5.0,45.0],[6.0,45.0],[6.0,46.0],[5.0,46.0],[5.0,45.0]]]
                    }
                }
            ]
        }"##;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), geojson).unwrap();

        let index = DepartmentIndex::load(file.path()).unwrap();
        let bbox = Rect::new(Coord { x: 5.2, y: 45.2 }, Coord { x: 5.4, y: 45.4 });
        assert_eq!(index.resolve(bbox), "38");
    }
}
