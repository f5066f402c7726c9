//! Feature builder: joins semantic objects to their assembled geometries.
//!
//! One [`Feature`] is emitted per geometry link whose object kind is wanted
//! by the active table configuration; everything else is discarded before
//! any geometry work happens. Attribute names are normalized to upper-case
//! and quality dates (QAL) are merged in as `CREATEDATE` / `UPDATEDATE`.
//!
//! Relation edges (object↔object links) are resolved here too: a pair is
//! kept only when both of its ends survived — either as an emitted feature
//! or as an object whose kind no table stores — so relation rows can never
//! point at a feature row that was dropped for a bad geometry.

use std::collections::{HashMap, HashSet};

use geo::Geometry;

use crate::decoder::geometry::assemble_geometry;
use crate::decoder::primitives::{Quality, SheetGraph};
use crate::error::DecodeError;

/// A decoded cadastral entity, ready for the transform stage.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Upper-cased object kind (`PARCELLE_ID`, `BATIMENT_ID`, …).
    pub kind: String,
    /// Cadastral identifier: the IDU attribute when present, the internal
    /// object id otherwise.
    pub id: String,
    /// Attribute map, names upper-cased.
    pub attributes: HashMap<String, String>,
    pub geometry: Geometry,
}

/// One end of a many-to-many relation edge.
#[derive(Debug, Clone)]
pub struct RelationEnd {
    pub kind: String,
    pub attributes: HashMap<String, String>,
}

/// A decoded relation record (`NUMVOIE↔PARCELLE` and friends).
#[derive(Debug, Clone)]
pub struct RelationPair {
    /// Relation descriptor name, for diagnostics.
    pub name: String,
    pub left: RelationEnd,
    pub right: RelationEnd,
}

/// Which object kinds the caller wants. `None` keeps everything (used by
/// `inspect`); the ingest pipeline passes the kinds its config references.
pub type KindFilter = Option<HashSet<String>>;

/// Output of the builder: features grouped by kind, relation pairs, and the
/// per-feature decode errors that were recorded instead of aborting.
#[derive(Debug, Default)]
pub struct BuiltFeatures {
    pub features: HashMap<String, Vec<Feature>>,
    pub relations: Vec<RelationPair>,
    pub errors: Vec<DecodeError>,
    pub skipped_kinds: usize,
}

pub fn build_features(
    graph: &SheetGraph,
    quality: &HashMap<String, Quality>,
    wanted: &KindFilter,
) -> BuiltFeatures {
    let mut out = BuiltFeatures::default();
    let mut failed_objects: HashSet<&str> = HashSet::new();

    for link in &graph.geometry_links {
        let Some(object) = graph.objects.get(&link.object) else {
            out.errors.push(DecodeError::PrimitiveMissing {
                feature: link.object.clone(),
                kind: "object",
                primitive: link.object.clone(),
            });
            continue;
        };

        if let Some(filter) = wanted {
            if !filter.contains(&object.kind) {
                out.skipped_kinds += 1;
                continue;
            }
        }

        let label = feature_id(object.id.as_str(), &object.attributes);
        let geometry = match assemble_geometry(link, graph, &label) {
            Ok(g) => g,
            Err(e) => {
                out.errors.push(e);
                failed_objects.insert(object.id.as_str());
                continue;
            }
        };

        let mut attributes = normalize_attributes(&object.attributes);
        if let Some(q) = object.quality.as_ref().and_then(|id| quality.get(id)) {
            if let Some(created) = &q.created {
                attributes.insert("CREATEDATE".to_string(), created.clone());
            }
            if let Some(updated) = &q.updated {
                attributes.insert("UPDATEDATE".to_string(), updated.clone());
            }
        }

        out.features
            .entry(object.kind.clone())
            .or_default()
            .push(Feature {
                kind: object.kind.clone(),
                id: label,
                attributes,
                geometry,
            });
    }

    for edge in &graph.relation_links {
        let (Some(left), Some(right)) = (
            graph.objects.get(&edge.left),
            graph.objects.get(&edge.right),
        ) else {
            continue;
        };

        // A pair may reference an object that was never linked to a
        // geometry (some relation-only kinds); that is fine. What is not
        // fine is referencing an object whose feature row was dropped.
        if failed_objects.contains(left.id.as_str()) || failed_objects.contains(right.id.as_str())
        {
            continue;
        }

        if let Some(filter) = wanted {
            if !filter.contains(&left.kind) || !filter.contains(&right.kind) {
                out.skipped_kinds += 1;
                continue;
            }
        }

        out.relations.push(RelationPair {
            name: edge.name.clone(),
            left: RelationEnd {
                kind: left.kind.clone(),
                attributes: normalize_attributes(&left.attributes),
            },
            right: RelationEnd {
                kind: right.kind.clone(),
                attributes: normalize_attributes(&right.attributes),
            },
        });
    }

    out
}

fn feature_id(object_id: &str, attributes: &HashMap<String, String>) -> String {
    attributes
        .get("IDU")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| object_id.to_string())
}

fn normalize_attributes(attributes: &HashMap<String, String>) -> HashMap<String, String> {
    attributes
        .iter()
        .map(|(k, v)| (k.to_uppercase(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::primitives::{
        GeometryLink, Node, PrimitiveRef, RelationLink, SemanticObject,
    };

    fn object(id: &str, kind: &str, idu: Option<&str>) -> SemanticObject {
        let mut attributes = HashMap::new();
        if let Some(idu) = idu {
            attributes.insert("IDU".to_string(), idu.to_string());
        }
        SemanticObject {
            id: id.to_string(),
            kind: kind.to_string(),
            attributes,
            quality: None,
        }
    }

    fn point_graph() -> SheetGraph {
        let mut graph = SheetGraph::default();
        graph.nodes.insert(
            "Node_1".to_string(),
            Node {
                id: "Node_1".to_string(),
                position: (1.0, 2.0),
            },
        );
        graph
            .objects
            .insert("Objet_1".to_string(), object("Objet_1", "NUMVOIE_ID", Some("0123")));
        graph.geometry_links.push(GeometryLink {
            object: "Objet_1".to_string(),
            primitives: vec![PrimitiveRef::Node("Node_1".to_string())],
        });
        graph
    }

    #[test]
    fn test_feature_id_prefers_idu() {
        let graph = point_graph();
        let built = build_features(&graph, &HashMap::new(), &None);
        let features = &built.features["NUMVOIE_ID"];
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, "0123");
    }

    #[test]
    fn test_kind_filter_discards_early() {
        let graph = point_graph();
        let filter = Some(HashSet::from(["PARCELLE_ID".to_string()]));
        let built = build_features(&graph, &HashMap::new(), &filter);
        assert!(built.features.is_empty());
        assert_eq!(built.skipped_kinds, 1);
        assert!(built.errors.is_empty());
    }

    #[test]
    fn test_quality_dates_merged() {
        let mut graph = point_graph();
        if let Some(o) = graph.objects.get_mut("Objet_1") {
            o.quality = Some("Qualite_1".to_string());
        }
        let quality = HashMap::from([(
            "Qualite_1".to_string(),
            Quality {
                created: Some("20250115".to_string()),
                updated: None,
            },
        )]);
        let built = build_features(&graph, &quality, &None);
        let feature = &built.features["NUMVOIE_ID"][0];
        assert_eq!(feature.attributes["CREATEDATE"], "20250115");
    }

    #[test]
    fn test_relation_pairs_carry_both_ends() {
        let mut graph = point_graph();
        graph
            .objects
            .insert("Objet_2".to_string(), object("Objet_2", "PARCELLE_ID", Some("AB 12")));
        graph.relation_links.push(RelationLink {
            name: "NUMVOIE_PARCELLE_ID".to_string(),
            left: "Objet_1".to_string(),
            right: "Objet_2".to_string(),
        });

        let built = build_features(&graph, &HashMap::new(), &None);
        assert_eq!(built.relations.len(), 1);
        let pair = &built.relations[0];
        assert_eq!(pair.left.kind, "NUMVOIE_ID");
        assert_eq!(pair.right.kind, "PARCELLE_ID");
        assert_eq!(pair.right.attributes["IDU"], "AB 12");
    }

    #[test]
    fn test_relation_dropped_when_feature_failed() {
        let mut graph = point_graph();
        // Objet_2 references a missing node: its geometry fails.
        graph
            .objects
            .insert("Objet_2".to_string(), object("Objet_2", "PARCELLE_ID", None));
        graph.geometry_links.push(GeometryLink {
            object: "Objet_2".to_string(),
            primitives: vec![PrimitiveRef::Node("Node_missing".to_string())],
        });
        graph.relation_links.push(RelationLink {
            name: "NUMVOIE_PARCELLE_ID".to_string(),
            left: "Objet_1".to_string(),
            right: "Objet_2".to_string(),
        });

        let built = build_features(&graph, &HashMap::new(), &None);
        assert_eq!(built.errors.len(), 1);
        assert!(built.relations.is_empty());
    }
}
