//! Geometry assembly from the sheet graph.
//!
//! Features reference primitives; this module turns those references into
//! `geo` geometries:
//!
//! - nodes → `Point` / `MultiPoint`
//! - arcs → `LineString` / `MultiLineString`
//! - faces → `Polygon` / `MultiPolygon`
//!
//! # Polygon assembly
//!
//! A face is an unordered bag of directed arcs. Assembly resolves each arc
//! (reversing the flagged ones), then chains arcs end-to-end, joining
//! endpoints that coincide within [`ENDPOINT_TOLERANCE`]. A chain is a ring
//! once its last vertex meets its first. When a face produces several
//! rings, the one with the largest absolute area is the outer boundary and
//! the others are holes. Ring orientation is then normalized to the
//! right-hand rule: outer counter-clockwise, holes clockwise.
//!
//! Chaining is strict: a gap wider than the tolerance, or an arc that can
//! never be reached, fails the face with
//! [`DecodeError::GeometryIncomplete`]. There is no auto-closing and no
//! hull approximation — a feature whose boundary cannot be chained is
//! dropped and the error recorded against the sheet.
//!
//! Consecutive duplicate vertices are collapsed everywhere; that is the
//! only silent repair performed.

use geo::winding_order::Winding;
use geo::{
    Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon,
};

use crate::decoder::primitives::{Face, GeometryLink, PrimitiveRef, SheetGraph};
use crate::error::DecodeError;

/// Endpoint coincidence tolerance, in coordinate units.
pub const ENDPOINT_TOLERANCE: f64 = 1e-6;

fn close(a: Coord, b: Coord) -> bool {
    (a.x - b.x).abs() <= ENDPOINT_TOLERANCE && (a.y - b.y).abs() <= ENDPOINT_TOLERANCE
}

/// Assembles the geometry of one feature from its primitive references.
pub fn assemble_geometry(
    link: &GeometryLink,
    graph: &SheetGraph,
    feature: &str,
) -> Result<Geometry, DecodeError> {
    let mut nodes = Vec::new();
    let mut arcs = Vec::new();
    let mut faces = Vec::new();

    for reference in &link.primitives {
        match reference {
            PrimitiveRef::Node(id) => nodes.push(id),
            PrimitiveRef::Arc(id) => arcs.push(id),
            PrimitiveRef::Face(id) => faces.push(id),
        }
    }

    match (nodes.is_empty(), arcs.is_empty(), faces.is_empty()) {
        (false, true, true) => assemble_points(&nodes, graph, feature),
        (true, false, true) => assemble_lines(&arcs, graph, feature),
        (true, true, false) => assemble_polygons(&faces, graph, feature),
        (true, true, true) => Err(DecodeError::GeometryIncomplete {
            feature: feature.to_string(),
            reason: "no primitive references".to_string(),
        }),
        _ => Err(DecodeError::MixedPrimitives {
            feature: feature.to_string(),
        }),
    }
}

fn assemble_points(
    ids: &[&String],
    graph: &SheetGraph,
    feature: &str,
) -> Result<Geometry, DecodeError> {
    let mut points = Vec::with_capacity(ids.len());
    for id in ids {
        let node = graph.nodes.get(*id).ok_or_else(|| DecodeError::PrimitiveMissing {
            feature: feature.to_string(),
            kind: "node",
            primitive: (*id).clone(),
        })?;
        points.push(Point::new(node.position.0, node.position.1));
    }

    Ok(if points.len() == 1 {
        Geometry::Point(points[0])
    } else {
        Geometry::MultiPoint(MultiPoint::new(points))
    })
}

fn assemble_lines(
    ids: &[&String],
    graph: &SheetGraph,
    feature: &str,
) -> Result<Geometry, DecodeError> {
    let mut lines = Vec::with_capacity(ids.len());
    for id in ids {
        let arc = graph.arcs.get(*id).ok_or_else(|| DecodeError::PrimitiveMissing {
            feature: feature.to_string(),
            kind: "arc",
            primitive: (*id).clone(),
        })?;
        let coords = dedup_consecutive(arc.vertices.iter().map(|&(x, y)| Coord { x, y }));
        if coords.len() < 2 {
            return Err(DecodeError::GeometryIncomplete {
                feature: feature.to_string(),
                reason: format!("arc {} degenerates to a single vertex", id),
            });
        }
        lines.push(LineString::new(coords));
    }

    Ok(match lines.pop() {
        Some(line) if lines.is_empty() => Geometry::LineString(line),
        Some(line) => {
            lines.push(line);
            Geometry::MultiLineString(MultiLineString::new(lines))
        }
        None => Err(DecodeError::GeometryIncomplete {
            feature: feature.to_string(),
            reason: "no arc references".to_string(),
        })?,
    })
}

fn assemble_polygons(
    ids: &[&String],
    graph: &SheetGraph,
    feature: &str,
) -> Result<Geometry, DecodeError> {
    let mut polygons = Vec::with_capacity(ids.len());
    for id in ids {
        let face = graph.faces.get(*id).ok_or_else(|| DecodeError::PrimitiveMissing {
            feature: feature.to_string(),
            kind: "face",
            primitive: (*id).clone(),
        })?;
        polygons.push(face_to_polygon(face, graph, feature)?);
    }

    Ok(match polygons.pop() {
        Some(polygon) if polygons.is_empty() => Geometry::Polygon(polygon),
        Some(polygon) => {
            polygons.push(polygon);
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
        None => Err(DecodeError::GeometryIncomplete {
            feature: feature.to_string(),
            reason: "no face references".to_string(),
        })?,
    })
}

fn face_to_polygon(
    face: &Face,
    graph: &SheetGraph,
    feature: &str,
) -> Result<Polygon, DecodeError> {
    if face.arcs.is_empty() {
        return Err(DecodeError::GeometryIncomplete {
            feature: feature.to_string(),
            reason: format!("face {} has no arcs", face.id),
        });
    }

    let mut chains: Vec<Vec<Coord>> = Vec::with_capacity(face.arcs.len());
    for signed in &face.arcs {
        let arc = graph
            .arcs
            .get(&signed.arc)
            .ok_or_else(|| DecodeError::PrimitiveMissing {
                feature: feature.to_string(),
                kind: "arc",
                primitive: signed.arc.clone(),
            })?;
        let mut coords = dedup_consecutive(arc.vertices.iter().map(|&(x, y)| Coord { x, y }));
        if signed.reversed {
            coords.reverse();
        }
        if coords.len() >= 2 {
            chains.push(coords);
        }
    }

    let rings = chain_rings(chains).map_err(|reason| DecodeError::GeometryIncomplete {
        feature: feature.to_string(),
        reason: format!("face {}: {}", face.id, reason),
    })?;

    rings_to_polygon(rings).ok_or_else(|| DecodeError::GeometryIncomplete {
        feature: feature.to_string(),
        reason: format!("face {} yields no usable ring", face.id),
    })
}

/// Chains arc polylines into closed rings.
///
/// Greedy endpoint matching: a seed arc is extended at either end by any
/// arc whose endpoint coincides within tolerance, reversing the candidate
/// when needed. When no candidate fits, the current chain must already be
/// closed — otherwise the face is unrecoverable and the gap is reported.
fn chain_rings(mut remaining: Vec<Vec<Coord>>) -> Result<Vec<Vec<Coord>>, String> {
    let mut rings: Vec<Vec<Coord>> = Vec::new();

    // Arcs that already close on themselves are rings on their own.
    remaining.retain(|arc| {
        if arc.len() > 3 && close(arc[0], arc[arc.len() - 1]) {
            rings.push(arc.clone());
            false
        } else {
            true
        }
    });

    while let Some(mut chain) = remaining.pop() {
        loop {
            if chain.len() > 3 && close(chain[0], chain[chain.len() - 1]) {
                rings.push(chain);
                break;
            }

            let head = chain[0];
            let tail = chain[chain.len() - 1];
            let candidate = remaining.iter().position(|arc| {
                close(tail, arc[0])
                    || close(tail, arc[arc.len() - 1])
                    || close(head, arc[0])
                    || close(head, arc[arc.len() - 1])
            });

            let Some(index) = candidate else {
                if remaining.is_empty() && chain.len() > 1 {
                    let dx = chain[0].x - chain[chain.len() - 1].x;
                    let dy = chain[0].y - chain[chain.len() - 1].y;
                    return Err(format!(
                        "ring does not close (gap {:.3e})",
                        (dx * dx + dy * dy).sqrt()
                    ));
                }
                return Err("unreachable arc in face boundary".to_string());
            };

            let mut arc = remaining.swap_remove(index);
            if close(tail, arc[0]) {
                chain.pop();
                chain.extend(arc);
            } else if close(tail, arc[arc.len() - 1]) {
                chain.pop();
                chain.extend(arc.into_iter().rev());
            } else if close(head, arc[arc.len() - 1]) {
                arc.pop();
                arc.extend(chain);
                chain = arc;
            } else {
                let mut reversed: Vec<Coord> = arc.into_iter().rev().collect();
                reversed.pop();
                reversed.extend(chain);
                chain = reversed;
            }
        }
    }

    Ok(rings)
}

/// Orders rings into a polygon: largest absolute area is the outer
/// boundary, the rest are holes. Orientation is normalized to outer CCW,
/// holes CW, and rings are closed exactly (last vertex == first).
fn rings_to_polygon(mut rings: Vec<Vec<Coord>>) -> Option<Polygon> {
    rings.retain(|r| r.len() > 3);
    if rings.is_empty() {
        return None;
    }

    let outer_index = rings
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            ring_area(a)
                .abs()
                .partial_cmp(&ring_area(b).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)?;

    let outer = rings.swap_remove(outer_index);
    let mut exterior = LineString::new(close_exactly(outer));
    exterior.make_ccw_winding();

    let interiors: Vec<LineString> = rings
        .into_iter()
        .map(|ring| {
            let mut ls = LineString::new(close_exactly(ring));
            ls.make_cw_winding();
            ls
        })
        .collect();

    Some(Polygon::new(exterior, interiors))
}

/// Signed area of a ring (shoelace), positive for counter-clockwise.
fn ring_area(ring: &[Coord]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// Forces exact first == last closure after tolerance-based chaining.
fn close_exactly(mut ring: Vec<Coord>) -> Vec<Coord> {
    if let (Some(&first), Some(last)) = (ring.first(), ring.last().copied()) {
        if first != last {
            if close(first, last) {
                *ring.last_mut().unwrap() = first;
            } else {
                ring.push(first);
            }
        }
    }
    ring
}

/// Collapses consecutive vertices that coincide within tolerance.
fn dedup_consecutive(coords: impl Iterator<Item = Coord>) -> Vec<Coord> {
    let mut out: Vec<Coord> = Vec::new();
    for coord in coords {
        if out.last().map_or(true, |&last| !close(last, coord)) {
            out.push(coord);
        }
    }
    out
}
