//! `vec0` table configuration
//!
//! Parsed from the module arguments of
//! `CREATE VIRTUAL TABLE t USING vec0(embedding float[768], chunk_size=256)`.
//! The same arguments are parsed again every time the table is connected,
//! so nothing here needs to be persisted.

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::vector::{ElementType, MAX_DIMENSIONS};
use crate::{Error, Result};

/// Slots per chunk when `chunk_size` is not given
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Largest accepted `chunk_size`
pub const MAX_CHUNK_SIZE: usize = 4096;
/// Largest number of vector columns on one table
pub const MAX_VECTOR_COLUMNS: usize = 16;
/// Largest `k` accepted by a KNN query
pub const MAX_K: i64 = 4096;

const RESERVED_NAMES: [&str; 4] = ["rowid", "distance", "k", "oid"];

/// A declared vector column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorColumn {
    /// Column name, as declared
    pub name: String,
    /// Element storage type
    pub element_type: ElementType,
    /// Number of elements
    pub dimensions: usize,
    /// Metric used by KNN queries against this column
    pub distance_metric: DistanceMetric,
}

impl VectorColumn {
    /// Bytes one vector of this column occupies in a chunk
    pub fn vector_size(&self) -> usize {
        self.element_type.byte_size(self.dimensions)
    }

    /// Parse `name type[N] [distance_metric=metric]`
    fn parse(arg: &str) -> Result<Self> {
        let invalid = |msg: String| Error::InvalidTableDefinition(msg);

        let (name, rest) = split_name(arg)?;
        validate_name(name)?;

        let open = rest
            .find('[')
            .ok_or_else(|| invalid(format!("column '{name}' is missing a [dimensions] suffix")))?;
        let close = rest
            .find(']')
            .filter(|&close| close > open)
            .ok_or_else(|| invalid(format!("column '{name}' has an unterminated '['")))?;

        let element_type: ElementType = rest[..open]
            .trim()
            .parse()
            .map_err(|_| invalid(format!("unknown vector type '{}'", rest[..open].trim())))?;

        let dimensions: usize = rest[open + 1..close]
            .trim()
            .parse()
            .map_err(|_| invalid(format!("column '{name}' has invalid dimensions")))?;
        if dimensions == 0 || dimensions > MAX_DIMENSIONS {
            return Err(invalid(format!(
                "column '{name}' dimensions must be between 1 and {MAX_DIMENSIONS}, got {dimensions}"
            )));
        }
        if element_type == ElementType::Bit && dimensions % 8 != 0 {
            return Err(invalid(format!(
                "bit column '{name}' dimensions must be divisible by 8, got {dimensions}"
            )));
        }

        let mut distance_metric = match element_type {
            ElementType::Bit => DistanceMetric::Hamming,
            _ => DistanceMetric::L2,
        };

        let options = rest[close + 1..].trim();
        if !options.is_empty() {
            let (key, value) = options
                .split_once('=')
                .ok_or_else(|| invalid(format!("unexpected '{options}' after column '{name}'")))?;
            if !key.trim().eq_ignore_ascii_case("distance_metric") {
                return Err(invalid(format!("unknown column option '{}'", key.trim())));
            }
            let metric: DistanceMetric = value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("unknown distance metric '{}'", value.trim())))?;
            if !metric.supports(element_type) {
                return Err(invalid(format!(
                    "distance metric '{metric}' cannot be used with {element_type} column '{name}'"
                )));
            }
            distance_metric = metric;
        }

        Ok(Self {
            name: name.to_string(),
            element_type,
            dimensions,
            distance_metric,
        })
    }
}

/// Configuration of one `vec0` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vec0Config {
    /// Vector columns, in declaration order
    pub columns: Vec<VectorColumn>,
    /// Slots per chunk
    pub chunk_size: usize,
}

impl Default for Vec0Config {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Vec0Config {
    /// Parse the module arguments (everything after the table name)
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut config = Vec0Config::default();

        for arg in args {
            let arg = arg.as_ref().trim();
            if arg.is_empty() {
                continue;
            }

            if let Some((key, value)) = arg.split_once('=') {
                if key.trim().eq_ignore_ascii_case("chunk_size") {
                    config.chunk_size = parse_chunk_size(value.trim())?;
                    continue;
                }
            }

            let column = VectorColumn::parse(arg)?;
            if config.column_index(&column.name).is_some() {
                return Err(Error::InvalidTableDefinition(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
            config.columns.push(column);
        }

        if config.columns.is_empty() {
            return Err(Error::InvalidTableDefinition(
                "at least one vector column is required".to_string(),
            ));
        }
        if config.columns.len() > MAX_VECTOR_COLUMNS {
            return Err(Error::InvalidTableDefinition(format!(
                "at most {MAX_VECTOR_COLUMNS} vector columns are supported"
            )));
        }

        Ok(config)
    }

    /// Position of the column called `name` (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Index of the hidden `distance` column
    pub fn distance_column(&self) -> usize {
        self.columns.len()
    }

    /// Index of the hidden `k` column
    pub fn k_column(&self) -> usize {
        self.columns.len() + 1
    }

    /// Declaration passed to `sqlite3_declare_vtab`
    pub fn schema(&self) -> String {
        let mut columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        columns.push("distance hidden".to_string());
        columns.push("k hidden".to_string());
        format!("CREATE TABLE x({})", columns.join(", "))
    }
}

fn split_name(arg: &str) -> Result<(&str, &str)> {
    let arg = arg.trim();
    if let Some(stripped) = arg.strip_prefix('"') {
        let end = stripped.find('"').ok_or_else(|| {
            Error::InvalidTableDefinition(format!("unterminated quoted name in '{arg}'"))
        })?;
        return Ok((&stripped[..end], &stripped[end + 1..]));
    }

    match arg.find(char::is_whitespace) {
        Some(end) => Ok((&arg[..end], &arg[end..])),
        None => Err(Error::InvalidTableDefinition(format!(
            "column '{arg}' is missing a vector type"
        ))),
    }
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(Error::InvalidTableDefinition(format!(
            "invalid column name '{name}'"
        )));
    }
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(Error::InvalidTableDefinition(format!(
            "column name '{name}' is reserved"
        )));
    }
    Ok(())
}

fn parse_chunk_size(value: &str) -> Result<usize> {
    let size: usize = value
        .parse()
        .map_err(|_| Error::InvalidTableDefinition(format!("invalid chunk_size '{value}'")))?;
    if size == 0 || size % 8 != 0 || size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidTableDefinition(format!(
            "chunk_size must be a positive multiple of 8 no greater than {MAX_CHUNK_SIZE}, got {size}"
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_column() {
        let config = Vec0Config::parse(&["embedding float[4]"]).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            config.columns,
            vec![VectorColumn {
                name: "embedding".to_string(),
                element_type: ElementType::Float32,
                dimensions: 4,
                distance_metric: DistanceMetric::L2,
            }]
        );
        assert_eq!(config.columns[0].vector_size(), 16);
    }

    #[test]
    fn test_parse_options() {
        let config = Vec0Config::parse(&[
            "a f32[8] distance_metric=cosine",
            " b int8 [16] ",
            "\"c\" bit[64]",
            "chunk_size = 64",
        ])
        .unwrap();

        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.columns.len(), 3);
        assert_eq!(config.columns[0].distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.columns[1].element_type, ElementType::Int8);
        assert_eq!(config.columns[1].dimensions, 16);
        assert_eq!(config.columns[2].distance_metric, DistanceMetric::Hamming);
        assert_eq!(config.columns[2].vector_size(), 8);
        assert_eq!(config.distance_column(), 3);
        assert_eq!(config.k_column(), 4);
    }

    #[test]
    fn test_schema() {
        let config = Vec0Config::parse(&["embedding float[4]"]).unwrap();
        assert_eq!(
            config.schema(),
            "CREATE TABLE x(\"embedding\", distance hidden, k hidden)"
        );
    }

    #[test]
    fn test_reject_invalid_definitions() {
        let cases: &[&[&str]] = &[
            &[],
            &["chunk_size=64"],
            &["embedding"],
            &["embedding float"],
            &["embedding float[0]"],
            &["embedding float[9000]"],
            &["embedding float16[4]"],
            &["embedding float[x]"],
            &["embedding bit[12]"],
            &["embedding bit[8] distance_metric=l2"],
            &["embedding float[4] distance_metric=manhattan"],
            &["embedding float[4] unknown=1"],
            &["distance float[4]"],
            &["1abc float[4]"],
            &["a float[4]", "A float[4]"],
            &["a float[4]", "chunk_size=12"],
            &["a float[4]", "chunk_size=8192"],
        ];

        for case in cases {
            assert!(
                Vec0Config::parse(*case).is_err(),
                "expected {case:?} to be rejected"
            );
        }
    }
}
