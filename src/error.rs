//! Error types for the EDIGEO decode and transform stages.
//!
//! Decode errors are per-archive: the orchestrator records them against the
//! archive and moves on, so every variant carries enough context to be
//! useful in a one-line log. Startup problems (bad table config, unreachable
//! database) go through `anyhow` at the application layer instead.

use thiserror::Error;

/// Errors raised while turning one archive into typed features.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Decompression or tar framing failed.
    #[error("archive i/o: {0}")]
    ArchiveIo(#[from] std::io::Error),

    /// A mandatory member (THF, SCD or GEO) is absent from the archive.
    #[error("missing archive member: {0}")]
    MissingMember(&'static str),

    /// The GEO file declares a coordinate reference we do not know.
    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    /// A feature references a node, arc or face that was never declared.
    #[error("feature {feature}: unresolvable {kind} primitive {primitive}")]
    PrimitiveMissing {
        feature: String,
        kind: &'static str,
        primitive: String,
    },

    /// Face chaining failed: a gap above tolerance or an unreachable arc.
    #[error("feature {feature}: incomplete geometry ({reason})")]
    GeometryIncomplete { feature: String, reason: String },

    /// A feature mixes faces, arcs and nodes in one geometry reference set.
    #[error("feature {feature}: mixed primitive kinds")]
    MixedPrimitives { feature: String },
}

/// Errors raised while mapping decoded features into table rows.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A non-nullable column received a value its coercion chain rejects.
    #[error("column {column}: cannot coerce {value:?} with {function}")]
    CoercionFailed {
        column: String,
        value: String,
        function: &'static str,
    },

    /// The source CRS is known but the requested transform is not available.
    #[error("reprojection {from} -> {to} failed: {reason}")]
    ReprojectionFailed { from: u32, to: u32, reason: String },
}
