//! Coordinate reprojection for the well-known French cadastral systems.
//!
//! Pure-Rust transforms, no native PROJ dependency. Supported sources:
//!
//! | EPSG | System |
//! |------|--------|
//! | 2154 | RGF93 / Lambert 93 (métropole) |
//! | 3942–3950 | RGF93 / CC42–CC50 conic-conformal zones |
//! | 27561–27564, 27572 | NTF (Paris) legacy Lambert zones |
//! | 2971 / 2973 | Guadeloupe / Martinique UTM 20N |
//! | 2972 | Guyane UTM 22N |
//! | 2975 | Réunion UTM 40S |
//! | 4326 | WGS84 (pass-through source) |
//!
//! Targets: WGS84 (4326) and Web Mercator (3857). Identical source and
//! target short-circuit to an identity transform.
//!
//! Legacy NTF zones go through a geocentric 3-parameter datum shift
//! (−168, −60, +320 m) before landing on WGS84; the sub-metre residual of
//! that shift is well below cadastral plotting accuracy. The modern RGF93
//! and overseas systems are treated as WGS84-equivalent.

use geo::{Coord, Geometry, MapCoords};

use crate::error::TransformError;

/// Geographic coordinates in radians on the WGS84 ellipsoid.
#[derive(Debug, Clone, Copy)]
struct Geographic {
    lon: f64,
    lat: f64,
}

/// Ellipsoid constants.
#[derive(Debug, Clone, Copy)]
struct Ellipsoid {
    a: f64,
    e2: f64,
}

const GRS80: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    e2: 0.006_694_380_022_903_416,
};

const CLARKE_1880_IGN: Ellipsoid = Ellipsoid {
    a: 6_378_249.2,
    e2: 0.006_803_487_646_389_837,
};

/// Geocentric translation NTF → WGS84, metres.
const NTF_TO_WGS84: (f64, f64, f64) = (-168.0, -60.0, 320.0);

/// Paris meridian, degrees east of Greenwich.
const PARIS_MERIDIAN_DEG: f64 = 2.337_229_167;

/// Lambert conformal conic parameters reduced to the inverse-form
/// constants `n`, `c`, `r0`.
#[derive(Debug, Clone, Copy)]
struct Lcc {
    ellipsoid: Ellipsoid,
    n: f64,
    c: f64,
    r0: f64,
    lon0: f64,
    x0: f64,
    y0: f64,
    /// Datum shift to apply after the inverse projection, if any.
    shift: Option<(f64, f64, f64)>,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Lcc(Lcc),
    Utm { zone: u32, south: bool },
    Geographic,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Wgs84,
    WebMercator,
}

/// A source → target coordinate transform, built once per archive.
#[derive(Debug, Clone, Copy)]
pub struct Reprojector {
    source_epsg: u32,
    target_epsg: u32,
    pipeline: Option<(Source, Target)>,
}

impl Reprojector {
    pub fn new(source_epsg: u32, target_epsg: u32) -> Result<Self, TransformError> {
        if source_epsg == target_epsg {
            return Ok(Self {
                source_epsg,
                target_epsg,
                pipeline: None,
            });
        }

        let source = source_for(source_epsg).ok_or_else(|| TransformError::ReprojectionFailed {
            from: source_epsg,
            to: target_epsg,
            reason: "unsupported source CRS".to_string(),
        })?;
        let target = match target_epsg {
            4326 => Target::Wgs84,
            3857 => Target::WebMercator,
            _ => {
                return Err(TransformError::ReprojectionFailed {
                    from: source_epsg,
                    to: target_epsg,
                    reason: "unsupported target CRS (use 4326 or 3857)".to_string(),
                })
            }
        };

        Ok(Self {
            source_epsg,
            target_epsg,
            pipeline: Some((source, target)),
        })
    }

    pub fn source_epsg(&self) -> u32 {
        self.source_epsg
    }

    pub fn target_epsg(&self) -> u32 {
        self.target_epsg
    }

    /// Transforms a single position.
    pub fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64), TransformError> {
        let Some((source, target)) = self.pipeline else {
            return Ok((x, y));
        };

        let geographic = match source {
            Source::Lcc(lcc) => lcc_inverse(&lcc, x, y),
            Source::Utm { zone, south } => utm_inverse(x, y, zone, south),
            Source::Geographic => Geographic {
                lon: x.to_radians(),
                lat: y.to_radians(),
            },
        };

        if !geographic.lon.is_finite() || !geographic.lat.is_finite() {
            return Err(TransformError::ReprojectionFailed {
                from: self.source_epsg,
                to: self.target_epsg,
                reason: format!("non-finite result for ({}, {})", x, y),
            });
        }

        Ok(match target {
            Target::Wgs84 => (geographic.lon.to_degrees(), geographic.lat.to_degrees()),
            Target::WebMercator => web_mercator_forward(geographic),
        })
    }

    /// Transforms every coordinate of a geometry.
    pub fn transform_geometry(&self, geometry: &Geometry) -> Result<Geometry, TransformError> {
        if self.pipeline.is_none() {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|coord| {
            let (x, y) = self.transform_point(coord.x, coord.y)?;
            Ok(Coord { x, y })
        })
    }
}

fn source_for(epsg: u32) -> Option<Source> {
    match epsg {
        4326 => Some(Source::Geographic),
        2154 => Some(Source::Lcc(lcc_secant(
            GRS80, 3.0, 46.5, 44.0, 49.0, 700_000.0, 6_600_000.0, None,
        ))),
        3942..=3950 => {
            let zone = (epsg - 3900) as f64;
            Some(Source::Lcc(lcc_secant(
                GRS80,
                3.0,
                zone,
                zone - 0.75,
                zone + 0.75,
                1_700_000.0,
                (zone - 41.0) * 1_000_000.0 + 200_000.0,
                None,
            )))
        }
        27561 => Some(Source::Lcc(lcc_tangent(
            CLARKE_1880_IGN, PARIS_MERIDIAN_DEG, 49.5, 0.999_877_341, 600_000.0, 200_000.0,
            Some(NTF_TO_WGS84),
        ))),
        27562 => Some(Source::Lcc(lcc_tangent(
            CLARKE_1880_IGN, PARIS_MERIDIAN_DEG, 46.8, 0.999_877_42, 600_000.0, 200_000.0,
            Some(NTF_TO_WGS84),
        ))),
        27563 => Some(Source::Lcc(lcc_tangent(
            CLARKE_1880_IGN, PARIS_MERIDIAN_DEG, 44.1, 0.999_877_499, 600_000.0, 200_000.0,
            Some(NTF_TO_WGS84),
        ))),
        27564 => Some(Source::Lcc(lcc_tangent(
            CLARKE_1880_IGN, PARIS_MERIDIAN_DEG, 42.165, 0.999_944_71, 234.358, 185_861.369,
            Some(NTF_TO_WGS84),
        ))),
        27572 => Some(Source::Lcc(lcc_tangent(
            CLARKE_1880_IGN, PARIS_MERIDIAN_DEG, 46.8, 0.999_877_42, 600_000.0, 2_200_000.0,
            Some(NTF_TO_WGS84),
        ))),
        2971 | 2973 => Some(Source::Utm { zone: 20, south: false }),
        2972 => Some(Source::Utm { zone: 22, south: false }),
        2975 => Some(Source::Utm { zone: 40, south: true }),
        _ => None,
    }
}

/// Isometric latitude.
fn iso_lat(lat: f64, e: f64) -> f64 {
    let s = lat.sin();
    let term = ((1.0 - e * s) / (1.0 + e * s)).powf(e / 2.0);
    ((std::f64::consts::FRAC_PI_4 + lat / 2.0).tan() * term).ln()
}

/// Latitude from isometric latitude, by fixed-point iteration.
fn lat_from_iso(iso: f64, e: f64) -> f64 {
    let mut lat = 2.0 * iso.exp().atan() - std::f64::consts::FRAC_PI_2;
    for _ in 0..12 {
        let s = lat.sin();
        let term = ((1.0 + e * s) / (1.0 - e * s)).powf(e / 2.0);
        let next = 2.0 * (iso.exp() * term).atan() - std::f64::consts::FRAC_PI_2;
        if (next - lat).abs() < 1e-12 {
            return next;
        }
        lat = next;
    }
    lat
}

fn lcc_m(lat: f64, ellipsoid: Ellipsoid) -> f64 {
    lat.cos() / (1.0 - ellipsoid.e2 * lat.sin().powi(2)).sqrt()
}

/// Two-standard-parallel Lambert conformal conic constants.
#[allow(clippy::too_many_arguments)]
fn lcc_secant(
    ellipsoid: Ellipsoid,
    lon0_deg: f64,
    lat0_deg: f64,
    lat1_deg: f64,
    lat2_deg: f64,
    x0: f64,
    y0: f64,
    shift: Option<(f64, f64, f64)>,
) -> Lcc {
    let e = ellipsoid.e2.sqrt();
    let (lat0, lat1, lat2) = (
        lat0_deg.to_radians(),
        lat1_deg.to_radians(),
        lat2_deg.to_radians(),
    );
    let (m1, m2) = (lcc_m(lat1, ellipsoid), lcc_m(lat2, ellipsoid));
    let (iso0, iso1, iso2) = (iso_lat(lat0, e), iso_lat(lat1, e), iso_lat(lat2, e));

    let n = (m1.ln() - m2.ln()) / (iso2 - iso1);
    let c = ellipsoid.a * m1 * (n * iso1).exp() / n;
    let r0 = c * (-n * iso0).exp();

    Lcc {
        ellipsoid,
        n,
        c,
        r0,
        lon0: lon0_deg.to_radians(),
        x0,
        y0,
        shift,
    }
}

/// One-standard-parallel (tangent, scaled) Lambert conformal conic
/// constants — the form the legacy NTF zones are defined in.
fn lcc_tangent(
    ellipsoid: Ellipsoid,
    lon0_deg: f64,
    lat0_deg: f64,
    k0: f64,
    x0: f64,
    y0: f64,
    shift: Option<(f64, f64, f64)>,
) -> Lcc {
    let e = ellipsoid.e2.sqrt();
    let lat0 = lat0_deg.to_radians();
    let n = lat0.sin();
    let m0 = lcc_m(lat0, ellipsoid);
    let iso0 = iso_lat(lat0, e);

    let c = ellipsoid.a * k0 * m0 * (n * iso0).exp() / n;
    let r0 = c * (-n * iso0).exp();

    Lcc {
        ellipsoid,
        n,
        c,
        r0,
        lon0: lon0_deg.to_radians(),
        x0,
        y0,
        shift,
    }
}

fn lcc_inverse(lcc: &Lcc, x: f64, y: f64) -> Geographic {
    let e = lcc.ellipsoid.e2.sqrt();
    let dx = x - lcc.x0;
    let dy = y - lcc.y0;

    let mut r = (dx * dx + (lcc.r0 - dy) * (lcc.r0 - dy)).sqrt();
    if lcc.n < 0.0 {
        r = -r;
    }
    let gamma = (dx / (lcc.r0 - dy)).atan();

    let iso = -(r / lcc.c).ln() / lcc.n;
    let lat = lat_from_iso(iso, e);
    let lon = lcc.lon0 + gamma / lcc.n;

    match lcc.shift {
        None => Geographic { lon, lat },
        Some(shift) => datum_shift(Geographic { lon, lat }, lcc.ellipsoid, shift),
    }
}

/// Shifts geographic coordinates from a legacy datum onto WGS84 through a
/// geocentric 3-parameter translation.
fn datum_shift(g: Geographic, from: Ellipsoid, (tx, ty, tz): (f64, f64, f64)) -> Geographic {
    // Geodetic → geocentric on the source ellipsoid (h = 0).
    let nu = from.a / (1.0 - from.e2 * g.lat.sin().powi(2)).sqrt();
    let x = nu * g.lat.cos() * g.lon.cos() + tx;
    let y = nu * g.lat.cos() * g.lon.sin() + ty;
    let z = nu * (1.0 - from.e2) * g.lat.sin() + tz;

    // Geocentric → geodetic on WGS84, iterating the latitude.
    let to = GRS80;
    let p = (x * x + y * y).sqrt();
    let lon = y.atan2(x);
    let mut lat = (z / (p * (1.0 - to.e2))).atan();
    for _ in 0..8 {
        let nu = to.a / (1.0 - to.e2 * lat.sin().powi(2)).sqrt();
        let next = ((z + to.e2 * nu * lat.sin()) / p).atan();
        if (next - lat).abs() < 1e-12 {
            lat = next;
            break;
        }
        lat = next;
    }

    Geographic { lon, lat }
}

/// Inverse transverse Mercator (UTM) on the WGS84 ellipsoid.
fn utm_inverse(x: f64, y: f64, zone: u32, south: bool) -> Geographic {
    let ellipsoid = GRS80;
    let a = ellipsoid.a;
    let e2 = ellipsoid.e2;
    let ep2 = e2 / (1.0 - e2);

    let k0 = 0.9996;
    let x = x - 500_000.0;
    let y = if south { y - 10_000_000.0 } else { y };
    let lon0 = ((zone as f64 - 1.0) * 6.0 - 180.0 + 3.0).to_radians();

    let m = y / k0;
    let mu = m / (a * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1.powi(2) / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();

    let n1 = a / (1.0 - e2 * sin1 * sin1).sqrt();
    let t1 = tan1 * tan1;
    let c1 = ep2 * cos1 * cos1;
    let r1 = a * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * k0);

    let lat = phi1
        - (n1 * tan1 / r1)
            * (d.powi(2) / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);

    let lon = lon0
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos1;

    Geographic { lon, lat }
}

/// Forward spherical Web Mercator.
fn web_mercator_forward(g: Geographic) -> (f64, f64) {
    let r = GRS80.a;
    let lat = g.lat.clamp(-85.06_f64.to_radians(), 85.06_f64.to_radians());
    let x = r * g.lon;
    let y = r * (std::f64::consts::FRAC_PI_4 + lat / 2.0).tan().ln();
    (x, y)
}
