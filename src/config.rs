//! Table mapping configuration.
//!
//! The ingest is driven by a JSON object whose top-level keys are EDIGEO
//! object kinds (`PARCELLE_id`, `BATIMENT_id`, …) or relation names. Each
//! value declares the target table, its fields, and how raw attribute
//! values are coerced into columns:
//!
//! ```json
//! {
//!   "PARCELLE_id": {
//!     "type": "FeatureCollection",
//!     "table": "edi_parcelle",
//!     "geomField": { "name": "geom" },
//!     "insertGid": true,
//!     "hashGeom": true,
//!     "fields": [
//!       { "db": "idu", "json": "IDU", "functions": ["addDep"], "pgtype": "varchar(20)" },
//!       { "db": "commune", "const": "commune_id", "functions": ["addDep"], "pgtype": "varchar(10)" },
//!       { "db": "annee", "const": "millesime", "functions": ["addMillesime"], "pgtype": "smallint" }
//!     ],
//!     "pgCONSTRAINT": ["UNIQUE (idu, annee)"],
//!     "pgFkCONSTRAINT": []
//!   }
//! }
//! ```
//!
//! Three presets ship embedded in the binary (`full`, `light`, `bati`); an
//! explicit path loads a user-supplied file instead. All validation is
//! static and happens at startup: an unknown coercion name, a field with
//! neither selector, or a relation field without `tableSource` abort the
//! run before any archive is read.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Recognized coercion functions, applied left-to-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Replace the value with the integer millésime year.
    AddMillesime,
    /// Prefix the value with the two-character department code.
    AddDep,
    /// Parse a decimal integer; empty or unparsable becomes NULL.
    ToInt,
    /// Extract the first decimal number; none becomes NULL.
    ToFloat,
    /// Parse `YYYYMMDD`; years below 1000 and invalid dates become NULL.
    ToDate,
    /// Parse `DDMMYYYY`, `/` separators allowed; same NULL rules.
    ToDateFr,
}

impl Coercion {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "addMillesime" => Self::AddMillesime,
            "addDep" => Self::AddDep,
            "toInt" => Self::ToInt,
            "toFloat" => Self::ToFloat,
            "toDate" => Self::ToDate,
            "toDateFR" => Self::ToDateFr,
            other => bail!("unknown coercion function '{}'", other),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddMillesime => "addMillesime",
            Self::AddDep => "addDep",
            Self::ToInt => "toInt",
            Self::ToFloat => "toFloat",
            Self::ToDate => "toDate",
            Self::ToDateFr => "toDateFR",
        }
    }
}

/// `FeatureCollection` tables store one row per feature; `relation` tables
/// store one row per decoded object↔object pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TableKind {
    FeatureCollection,
    #[serde(rename = "relation")]
    Relation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeomField {
    pub name: String,
}

/// One column of a configured table.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    /// Target column name.
    pub db: String,
    /// Source attribute name (upper-cased EDIGEO attribute).
    #[serde(default)]
    pub json: Option<String>,
    /// Constant key: `commune_id`, `section_id`, `millesime` or `dep`.
    #[serde(default, rename = "const")]
    pub constant: Option<String>,
    /// Coercion chain, validated into [`Coercion`]s at load.
    #[serde(default)]
    pub functions: Vec<String>,
    /// Target SQL type, used verbatim in the DDL.
    pub pgtype: String,
    /// Declared source value shape; informative only.
    #[serde(default, rename = "jsonSchema")]
    pub json_schema: Option<String>,
    /// For relation tables: which side of the pair this field reads
    /// (an object kind such as `PARCELLE_id`).
    #[serde(default, rename = "tableSource")]
    pub table_source: Option<String>,
    /// When set, a NULL after coercion fails the row instead of inserting
    /// NULL.
    #[serde(default, rename = "notNull")]
    pub not_null: bool,
}

impl FieldConfig {
    /// Parsed coercion chain. Valid after [`Config::validate`].
    pub fn coercions(&self) -> Vec<Coercion> {
        self.functions
            .iter()
            .filter_map(|name| Coercion::parse(name).ok())
            .collect()
    }
}

/// Configuration of one target table.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub table: String,
    #[serde(default, rename = "geomField")]
    pub geom_field: Option<GeomField>,
    #[serde(default, rename = "insertGid")]
    pub insert_gid: bool,
    #[serde(default, rename = "hashGeom")]
    pub hash_geom: bool,
    pub fields: Vec<FieldConfig>,
    /// Extra table constraints, verbatim (`PRIMARY KEY (...)`, `UNIQUE (...)`).
    #[serde(default, rename = "pgCONSTRAINT")]
    pub constraints: Vec<String>,
    /// Deferred foreign-key DDL, run after all archives; `$schema$` is
    /// replaced with the target schema name.
    #[serde(default, rename = "pgFkCONSTRAINT")]
    pub fk_constraints: Vec<String>,
}

impl TableConfig {
    /// Geometry column name; `FeatureCollection` tables always have one.
    pub fn geometry_column(&self) -> Option<&str> {
        match self.kind {
            TableKind::FeatureCollection => Some(
                self.geom_field
                    .as_ref()
                    .map(|g| g.name.as_str())
                    .unwrap_or("geometry"),
            ),
            TableKind::Relation => None,
        }
    }
}

/// The whole mapping: object kind / relation name → table.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub tables: HashMap<String, TableConfig>,
}

impl Config {
    /// Loads a preset (`full`, `light`, `bati`) or a JSON file path.
    pub fn load(spec: &str) -> Result<Config> {
        let config: Config = match spec {
            "full" => serde_json::from_str(include_str!("presets/full.json"))
                .context("embedded preset 'full' is invalid")?,
            "light" => serde_json::from_str(include_str!("presets/light.json"))
                .context("embedded preset 'light' is invalid")?,
            "bati" => serde_json::from_str(include_str!("presets/bati.json"))
                .context("embedded preset 'bati' is invalid")?,
            path => {
                let content = std::fs::read_to_string(Path::new(path))
                    .with_context(|| format!("cannot read config file: {}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("invalid config JSON: {}", path))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Static validation; any failure aborts before archives are read.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("config declares no tables");
        }

        for (kind, table) in &self.tables {
            if table.table.is_empty() {
                bail!("{}: empty table name", kind);
            }
            if table.fields.is_empty() {
                bail!("{}: table {} declares no fields", kind, table.table);
            }
            for field in &table.fields {
                for function in &field.functions {
                    Coercion::parse(function)
                        .with_context(|| format!("{}: column {}", kind, field.db))?;
                }
                if field.json.is_none() && field.constant.is_none() {
                    bail!(
                        "{}: column {} needs a 'json' or 'const' selector",
                        kind,
                        field.db
                    );
                }
                if table.kind == TableKind::Relation
                    && field.constant.is_none()
                    && field.table_source.is_none()
                {
                    bail!(
                        "{}: relation column {} needs a 'tableSource'",
                        kind,
                        field.db
                    );
                }
            }
            if table.kind == TableKind::Relation && (table.hash_geom || table.geom_field.is_some())
            {
                bail!("{}: relation tables cannot carry geometry", kind);
            }
        }

        Ok(())
    }

    /// Upper-cased object kinds the decoder must keep: feature-table kinds
    /// plus every relation `tableSource`.
    pub fn wanted_kinds(&self) -> std::collections::HashSet<String> {
        let mut kinds = std::collections::HashSet::new();
        for (key, table) in &self.tables {
            match table.kind {
                TableKind::FeatureCollection => {
                    kinds.insert(key.to_uppercase());
                }
                TableKind::Relation => {
                    for field in &table.fields {
                        if let Some(source) = &field.table_source {
                            kinds.insert(source.to_uppercase());
                        }
                    }
                }
            }
        }
        kinds
    }

    /// Feature kind (upper-cased) → table config, for the transform stage.
    pub fn feature_tables(&self) -> HashMap<String, &TableConfig> {
        self.tables
            .iter()
            .filter(|(_, t)| t.kind == TableKind::FeatureCollection)
            .map(|(k, t)| (k.to_uppercase(), t))
            .collect()
    }

    /// Relation tables, in deterministic order.
    pub fn relation_tables(&self) -> Vec<(&String, &TableConfig)> {
        let mut tables: Vec<_> = self
            .tables
            .iter()
            .filter(|(_, t)| t.kind == TableKind::Relation)
            .collect();
        tables.sort_by(|a, b| a.0.cmp(b.0));
        tables
    }

    /// Every configured table, feature tables first (FK prerequisites),
    /// each group in deterministic order.
    pub fn ordered_tables(&self) -> Vec<(&String, &TableConfig)> {
        let mut features: Vec<_> = self
            .tables
            .iter()
            .filter(|(_, t)| t.kind == TableKind::FeatureCollection)
            .collect();
        features.sort_by(|a, b| a.0.cmp(b.0));
        features.extend(self.relation_tables());
        features
    }
}
