//! Per-sheet primitive store and VEC file parsing.
//!
//! A sheet's VEC files describe a planar graph plus the semantic objects
//! sitting on top of it:
//!
//! | Block | Meaning | Stored as |
//! |-------|---------|-----------|
//! | `PNO` | node (point) | [`Node`] |
//! | `PAR` | arc (polyline) | [`Arc`] |
//! | `PFE` | face (closed boundary) | [`Face`] |
//! | `FEA` | semantic object with attributes | [`SemanticObject`] |
//! | `LNK` | typed link between blocks | geometry / composition / relation |
//!
//! Links are what tie the graph together: face↔arc links fill each face's
//! arc list, object↔primitive links declare which primitives produce an
//! object's geometry, and object↔object links become the many-to-many
//! relation records (`NUMVOIE↔PARCELLE` and friends).
//!
//! The store is an append-only arena keyed by identifier, filled in a
//! single pass over each VEC file and dropped wholesale once the archive is
//! done. Identifiers are unique within a sheet, so later VEC files never
//! overwrite earlier ones.

use std::collections::HashMap;

use crate::decoder::records::{blocks, parse_coordinate, parse_reference};
use crate::decoder::schema::SemanticSchema;

/// A point primitive.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub position: (f64, f64),
}

/// A polyline primitive. Endpoints are implied by the vertex list.
#[derive(Debug, Clone)]
pub struct Arc {
    pub id: String,
    pub vertices: Vec<(f64, f64)>,
}

/// A directed arc reference inside a face boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArcRef {
    pub arc: String,
    /// When set, the arc is traversed from end to start.
    pub reversed: bool,
}

/// A closed boundary built from arcs. Holes appear as additional closed
/// chains once the arcs are assembled.
#[derive(Debug, Clone, Default)]
pub struct Face {
    pub id: String,
    pub arcs: Vec<SignedArcRef>,
}

/// A semantic object (`FEA` block): kind, attributes, optional quality ref.
#[derive(Debug, Clone)]
pub struct SemanticObject {
    pub id: String,
    /// Upper-cased kind from the object's schema reference (`PARCELLE_ID`, …).
    pub kind: String,
    pub attributes: HashMap<String, String>,
    pub quality: Option<String>,
}

/// Which primitive a geometry link points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveRef {
    Node(String),
    Arc(String),
    Face(String),
}

/// Object → primitives: the source of one feature's geometry.
#[derive(Debug, Clone)]
pub struct GeometryLink {
    pub object: String,
    pub primitives: Vec<PrimitiveRef>,
}

/// Object ↔ object: one many-to-many relation edge.
#[derive(Debug, Clone)]
pub struct RelationLink {
    /// The relation descriptor name, upper-cased, for diagnostics.
    pub name: String,
    pub left: String,
    pub right: String,
}

/// Quality dates attached to objects via `QAP` references.
#[derive(Debug, Clone, Default)]
pub struct Quality {
    pub created: Option<String>,
    pub updated: Option<String>,
}

/// Everything parsed from a sheet's VEC files.
#[derive(Debug, Default)]
pub struct SheetGraph {
    pub nodes: HashMap<String, Node>,
    pub arcs: HashMap<String, Arc>,
    pub faces: HashMap<String, Face>,
    pub objects: HashMap<String, SemanticObject>,
    pub geometry_links: Vec<GeometryLink>,
    pub relation_links: Vec<RelationLink>,
}

impl SheetGraph {
    /// Parses one decoded VEC file into the store. Call once per VEC member.
    pub fn absorb(&mut self, input: &str, schema: &SemanticSchema) {
        for block in blocks(input) {
            if block.id.is_empty() {
                continue;
            }
            match block.kind {
                "PNO" => self.absorb_node(&block),
                "PAR" => self.absorb_arc(&block),
                "PFE" => {
                    self.faces.entry(block.id.to_string()).or_insert_with(|| Face {
                        id: block.id.to_string(),
                        arcs: Vec::new(),
                    });
                }
                "FEA" => self.absorb_object(&block, schema),
                "LNK" => self.absorb_link(&block),
                _ => {}
            }
        }
    }

    fn absorb_node(&mut self, block: &crate::decoder::records::Block<'_>) {
        let position = block
            .records
            .iter()
            .find(|r| r.tag == "COR")
            .and_then(|r| parse_coordinate(r.value));
        if let Some(position) = position {
            self.nodes.insert(
                block.id.to_string(),
                Node {
                    id: block.id.to_string(),
                    position,
                },
            );
        }
    }

    fn absorb_arc(&mut self, block: &crate::decoder::records::Block<'_>) {
        let vertices: Vec<(f64, f64)> = block
            .records
            .iter()
            .filter(|r| r.tag == "COR")
            .filter_map(|r| parse_coordinate(r.value))
            .collect();
        if !vertices.is_empty() {
            self.arcs.insert(
                block.id.to_string(),
                Arc {
                    id: block.id.to_string(),
                    vertices,
                },
            );
        }
    }

    fn absorb_object(
        &mut self,
        block: &crate::decoder::records::Block<'_>,
        schema: &SemanticSchema,
    ) {
        let mut object = SemanticObject {
            id: block.id.to_string(),
            kind: String::new(),
            attributes: HashMap::new(),
            quality: None,
        };

        // Attribute values follow their descriptor reference: ATP names the
        // attribute, the next ATV carries its value.
        let mut pending_attribute: Option<String> = None;

        for record in &block.records {
            match record.tag {
                "SCP" => {
                    let (_, rid) = parse_reference(record.value);
                    object.kind = rid.to_uppercase();
                }
                "ATP" => {
                    let (_, rid) = parse_reference(record.value);
                    pending_attribute = Some(schema.attribute_name(&rid));
                }
                "ATV" => {
                    if let Some(name) = pending_attribute.take() {
                        object.attributes.insert(name, record.value.trim().to_string());
                    }
                }
                "QAP" => {
                    let (_, rid) = parse_reference(record.value);
                    object.quality = Some(rid);
                }
                _ => {}
            }
        }

        if !object.kind.is_empty() {
            self.objects.insert(block.id.to_string(), object);
        }
    }

    fn absorb_link(&mut self, block: &crate::decoder::records::Block<'_>) {
        let mut descriptor = String::new();
        let mut objects: Vec<String> = Vec::new();
        let mut primitives: Vec<PrimitiveRef> = Vec::new();
        let mut face: Option<String> = None;
        let mut face_arcs: Vec<SignedArcRef> = Vec::new();

        for record in &block.records {
            match record.tag {
                "SCP" => {
                    let (_, rid) = parse_reference(record.value);
                    descriptor = rid.to_uppercase();
                }
                "FTP" => {
                    let (rty, rid) = parse_reference(record.value);
                    match rty.as_str() {
                        "FEA" => objects.push(rid),
                        "PNO" => primitives.push(PrimitiveRef::Node(rid)),
                        "PAR" => {
                            // A leading '-' on the identifier flags reversed
                            // traversal within a face boundary.
                            let (reversed, id) = match rid.strip_prefix('-') {
                                Some(rest) => (true, rest.to_string()),
                                None => (false, rid),
                            };
                            face_arcs.push(SignedArcRef {
                                arc: id.clone(),
                                reversed,
                            });
                            primitives.push(PrimitiveRef::Arc(id));
                        }
                        "PFE" => {
                            face = Some(rid.clone());
                            primitives.push(PrimitiveRef::Face(rid));
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Face composition: attach arcs to the face they bound.
        if let Some(face_id) = face.as_ref() {
            if !face_arcs.is_empty() {
                let entry = self.faces.entry(face_id.clone()).or_insert_with(|| Face {
                    id: face_id.clone(),
                    arcs: Vec::new(),
                });
                entry.arcs.extend(face_arcs);
                return;
            }
        }

        match (objects.len(), primitives.is_empty()) {
            // Object ↔ primitives: geometry source.
            (1, false) => self.geometry_links.push(GeometryLink {
                object: objects.remove(0),
                primitives,
            }),
            // Object ↔ object: a declared relation edge.
            (2, true) => {
                let right = objects.pop().unwrap_or_default();
                let left = objects.pop().unwrap_or_default();
                self.relation_links.push(RelationLink {
                    name: descriptor,
                    left,
                    right,
                });
            }
            _ => {}
        }
    }
}

/// Parses a QAL file into per-object quality dates.
///
/// QAL is optional: an absent or empty file simply yields no quality data.
pub fn parse_qal(input: &str) -> HashMap<String, Quality> {
    let mut out = HashMap::new();

    for block in blocks(input) {
        if block.kind != "QUP" || block.id.is_empty() {
            continue;
        }
        let mut quality = Quality::default();
        for record in &block.records {
            match record.tag {
                "ODA" => quality.created = Some(record.value.trim().to_string()),
                "UDA" => quality.updated = Some(record.value.trim().to_string()),
                _ => {}
            }
        }
        out.insert(block.id.to_string(), quality);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(input: &str) -> SheetGraph {
        let mut g = SheetGraph::default();
        g.absorb(input, &SemanticSchema::default());
        g
    }

    #[test]
    fn test_absorb_node_and_arc() {
        let g = graph(
            "RTYSA03:PNO\nRIDSA06:Node_1\nCORCC10:+10.0;+20.0;\n\
             RTYSA03:PAR\nRIDSA05:Arc_1\nCORCC10:+0.0;+0.0;\nCORCC10:+1.0;+0.0;\n",
        );
        assert_eq!(g.nodes["Node_1"].position, (10.0, 20.0));
        assert_eq!(g.arcs["Arc_1"].vertices.len(), 2);
    }

    #[test]
    fn test_absorb_object_attributes() {
        let g = graph(
            "RTYSA03:FEA\nRIDSA09:Objet_1\n\
             SCPCP28:EDAB;SeSD;OBJ;PARCELLE_id\n\
             ATPCP25:EDAB;SeSD;ATT;IDU_id\nATVS T09:0001 AB 12\n\
             ATPCP25:EDAB;SeSD;ATT;SUPF_id\nATVS T04:1234\n",
        );
        let obj = &g.objects["Objet_1"];
        assert_eq!(obj.kind, "PARCELLE_ID");
        assert_eq!(obj.attributes["IDU"], "0001 AB 12");
        assert_eq!(obj.attributes["SUPF"], "1234");
    }

    #[test]
    fn test_face_composition_link() {
        let g = graph(
            "RTYSA03:PFE\nRIDSA06:Face_1\n\
             RTYSA03:LNK\nRIDSA06:Lien_1\n\
             SCPCP30:EDAB;SeSD;REL;ID_S_RCO_FAC\n\
             FTPCP24:EDAB;SeSV;PFE;Face_1\n\
             FTPCP23:EDAB;SeSV;PAR;Arc_1\n\
             FTPCP24:EDAB;SeSV;PAR;-Arc_2\n",
        );
        let face = &g.faces["Face_1"];
        assert_eq!(face.arcs.len(), 2);
        assert_eq!(face.arcs[0], SignedArcRef { arc: "Arc_1".into(), reversed: false });
        assert_eq!(face.arcs[1], SignedArcRef { arc: "Arc_2".into(), reversed: true });
        // Face composition must not register as a feature geometry link.
        assert!(g.geometry_links.is_empty());
    }

    #[test]
    fn test_geometry_and_relation_links() {
        let g = graph(
            "RTYSA03:LNK\nRIDSA06:Lien_1\n\
             SCPCP30:EDAB;SeSD;REL;ID_S_OBJ_X\n\
             FTPCP24:EDAB;SeSV;FEA;Objet_1\n\
             FTPCP24:EDAB;SeSV;PFE;Face_1\n\
             RTYSA03:LNK\nRIDSA06:Lien_2\n\
             SCPCP36:EDAB;SeSD;REL;NUMVOIE_PARCELLE_id\n\
             FTPCP24:EDAB;SeSV;FEA;Objet_1\n\
             FTPCP24:EDAB;SeSV;FEA;Objet_2\n",
        );
        assert_eq!(g.geometry_links.len(), 1);
        assert_eq!(g.geometry_links[0].object, "Objet_1");
        assert_eq!(g.geometry_links[0].primitives, vec![PrimitiveRef::Face("Face_1".into())]);

        assert_eq!(g.relation_links.len(), 1);
        assert_eq!(g.relation_links[0].name, "NUMVOIE_PARCELLE_ID");
        assert_eq!(g.relation_links[0].left, "Objet_1");
        assert_eq!(g.relation_links[0].right, "Objet_2");
    }

    #[test]
    fn test_parse_qal_dates() {
        let qal = parse_qal(
            "RTYSA03:QUP\nRIDSA09:Qualite_1\nODASD08:20250115\nUDASD08:20250120\n",
        );
        let q = &qal["Qualite_1"];
        assert_eq!(q.created.as_deref(), Some("20250115"));
        assert_eq!(q.updated.as_deref(), Some("20250120"));
    }
}
