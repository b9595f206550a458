use std::path::PathBuf;

/// Malformed rule or profile input.
///
/// Raised before any side effect is applied; a caller that receives one must
/// not continue with a partially understood policy.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Invalid ruleset version: expected {expected}, found {found}")]
    InvalidVersion { expected: u64, found: String },

    #[error("Unsupported rule fields in rule {index}: {}", .fields.join(", "))]
    UnsupportedFields { index: usize, fields: Vec<String> },

    #[error("Rule {index} must include a non-empty domain")]
    MissingDomain { index: usize },

    #[error("Rule {index} has invalid domain `{domain}`: expected a bare hostname")]
    InvalidDomain { index: usize, domain: String },

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("input is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<SchemaError>,
    },
}

impl SchemaError {
    /// Attach the originating file to an error raised while parsing its contents.
    pub fn in_file(self, path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping file attribution.
    pub fn root(&self) -> &SchemaError {
        match self {
            Self::File { source, .. } => source.root(),
            other => other,
        }
    }
}
