//! Vector values: parsing, encoding and element-wise operations
//!
//! Vectors reach the extension either as BLOBs holding raw little-endian
//! elements or as JSON arrays in TEXT values. This module turns both into a
//! typed [`Vector`], and turns a [`Vector`] back into the canonical BLOB.
//!
//! Three element types are supported:
//! - `float32`: 4 bytes per element
//! - `int8`: 1 byte per element
//! - `bit`: 1 bit per element, packed least-significant bit first
use std::fmt;
use std::str::FromStr;

use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest number of elements a vector may have
pub const MAX_DIMENSIONS: usize = 8192;

/// Storage type of a vector's elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Int8,
    Bit,
}

impl ElementType {
    /// Canonical lowercase name, as used in error messages
    pub fn name(self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Int8 => "int8",
            ElementType::Bit => "bit",
        }
    }

    /// Number of bytes needed to store `dimensions` elements
    pub fn byte_size(self, dimensions: usize) -> usize {
        match self {
            ElementType::Float32 => dimensions * std::mem::size_of::<f32>(),
            ElementType::Int8 => dimensions,
            ElementType::Bit => dimensions.div_ceil(8),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float" | "f32" | "float32" => Ok(ElementType::Float32),
            "int8" | "i8" => Ok(ElementType::Int8),
            "bit" => Ok(ElementType::Bit),
            other => Err(Error::InvalidArgument(format!(
                "unknown vector element type '{other}'"
            ))),
        }
    }
}

/// A vector with typed elements
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    Float32(Vec<f32>),
    Int8(Vec<i8>),
    /// Packed bits, 8 dimensions per byte
    Bit(Vec<u8>),
}

impl Vector {
    /// Element type of this vector
    pub fn element_type(&self) -> ElementType {
        match self {
            Vector::Float32(_) => ElementType::Float32,
            Vector::Int8(_) => ElementType::Int8,
            Vector::Bit(_) => ElementType::Bit,
        }
    }

    /// Number of elements (bits, for bit vectors)
    pub fn dimensions(&self) -> usize {
        match self {
            Vector::Float32(v) => v.len(),
            Vector::Int8(v) => v.len(),
            Vector::Bit(v) => v.len() * 8,
        }
    }

    /// Read a vector from a SQLite value.
    ///
    /// BLOBs are taken as raw elements of `element_type`; TEXT is parsed as
    /// a JSON array. Every other storage class is rejected.
    pub fn from_value(value: ValueRef<'_>, element_type: ElementType) -> Result<Self> {
        match value {
            ValueRef::Blob(bytes) => Self::from_blob(bytes, element_type),
            ValueRef::Text(text) => {
                let text = std::str::from_utf8(text)
                    .map_err(|e| Error::InvalidVector(format!("text is not UTF-8: {e}")))?;
                Self::from_json(text, element_type)
            }
            ValueRef::Null => Err(Error::InvalidVector("value is NULL".to_string())),
            ValueRef::Integer(_) | ValueRef::Real(_) => Err(Error::InvalidVector(
                "expected a BLOB or JSON array, got a number".to_string(),
            )),
        }
    }

    /// Decode raw little-endian element bytes
    pub fn from_blob(bytes: &[u8], element_type: ElementType) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidVector(
                "zero-length vectors are not supported".to_string(),
            ));
        }

        let vector = match element_type {
            ElementType::Float32 => {
                if bytes.len() % 4 != 0 {
                    return Err(Error::InvalidVector(format!(
                        "float32 vector BLOB length must be divisible by 4, got {} bytes",
                        bytes.len()
                    )));
                }
                Vector::Float32(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            ElementType::Int8 => Vector::Int8(bytes.iter().map(|&b| b as i8).collect()),
            ElementType::Bit => Vector::Bit(bytes.to_vec()),
        };

        vector.check_max_dimensions()?;
        Ok(vector)
    }

    /// Parse a JSON array of numbers
    pub fn from_json(text: &str, element_type: ElementType) -> Result<Self> {
        let values: Vec<f64> = serde_json::from_str(text)?;
        if values.is_empty() {
            return Err(Error::InvalidVector(
                "zero-length vectors are not supported".to_string(),
            ));
        }

        let vector = match element_type {
            ElementType::Float32 => Vector::Float32(values.iter().map(|&x| x as f32).collect()),
            ElementType::Int8 => {
                let mut out = Vec::with_capacity(values.len());
                for (i, &x) in values.iter().enumerate() {
                    if x.fract() != 0.0 || x < i8::MIN as f64 || x > i8::MAX as f64 {
                        return Err(Error::InvalidVector(format!(
                            "element {i} ({x}) is not an integer between -128 and 127"
                        )));
                    }
                    out.push(x as i8);
                }
                Vector::Int8(out)
            }
            ElementType::Bit => {
                return Err(Error::InvalidVector(
                    "bit vectors must be provided as BLOBs".to_string(),
                ))
            }
        };

        vector.check_max_dimensions()?;
        Ok(vector)
    }

    /// Encode as the canonical BLOB
    pub fn to_blob(&self) -> Vec<u8> {
        match self {
            Vector::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Vector::Int8(v) => v.iter().map(|&x| x as u8).collect(),
            Vector::Bit(v) => v.clone(),
        }
    }

    /// Encode as a compact JSON array
    pub fn to_json(&self) -> Result<String> {
        match self {
            Vector::Float32(v) => Ok(serde_json::to_string(v)?),
            Vector::Int8(v) => Ok(serde_json::to_string(v)?),
            Vector::Bit(_) => Err(Error::InvalidArgument(
                "bit vectors cannot be converted to JSON".to_string(),
            )),
        }
    }

    /// Borrow the elements of a float32 vector
    pub fn as_f32(&self) -> Result<&[f32]> {
        match self {
            Vector::Float32(v) => Ok(v),
            other => Err(Error::ElementTypeMismatch {
                expected: ElementType::Float32,
                actual: other.element_type(),
            }),
        }
    }

    /// Ensure this vector has `expected` dimensions
    pub fn check_dimensions(&self, expected: usize) -> Result<()> {
        if self.dimensions() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: self.dimensions(),
            });
        }
        Ok(())
    }

    fn check_max_dimensions(&self) -> Result<()> {
        if self.dimensions() > MAX_DIMENSIONS {
            return Err(Error::InvalidVector(format!(
                "vectors may have at most {MAX_DIMENSIONS} dimensions, got {}",
                self.dimensions()
            )));
        }
        Ok(())
    }

    fn check_same_shape(&self, other: &Vector) -> Result<()> {
        if self.element_type() != other.element_type() {
            return Err(Error::ElementTypeMismatch {
                expected: self.element_type(),
                actual: other.element_type(),
            });
        }
        other.check_dimensions(self.dimensions())
    }

    /// Element-wise sum
    pub fn add(&self, other: &Vector) -> Result<Vector> {
        self.check_same_shape(other)?;
        match (self, other) {
            (Vector::Float32(a), Vector::Float32(b)) => Ok(Vector::Float32(
                a.iter().zip(b.iter()).map(|(x, y)| x + y).collect(),
            )),
            (Vector::Int8(a), Vector::Int8(b)) => Ok(Vector::Int8(
                a.iter().zip(b.iter()).map(|(x, y)| x.wrapping_add(*y)).collect(),
            )),
            _ => Err(Error::InvalidArgument(
                "bit vectors cannot be added".to_string(),
            )),
        }
    }

    /// Element-wise difference
    pub fn sub(&self, other: &Vector) -> Result<Vector> {
        self.check_same_shape(other)?;
        match (self, other) {
            (Vector::Float32(a), Vector::Float32(b)) => Ok(Vector::Float32(
                a.iter().zip(b.iter()).map(|(x, y)| x - y).collect(),
            )),
            (Vector::Int8(a), Vector::Int8(b)) => Ok(Vector::Int8(
                a.iter().zip(b.iter()).map(|(x, y)| x.wrapping_sub(*y)).collect(),
            )),
            _ => Err(Error::InvalidArgument(
                "bit vectors cannot be subtracted".to_string(),
            )),
        }
    }

    /// Scale a float32 vector to unit L2 norm. A zero vector is returned
    /// unchanged.
    pub fn normalize(&self) -> Result<Vector> {
        let mut v = self.as_f32()?.to_vec();
        normalize(&mut v);
        Ok(Vector::Float32(v))
    }

    /// Elements `start..end`. Bit vectors can only be sliced on byte
    /// boundaries.
    pub fn slice(&self, start: usize, end: usize) -> Result<Vector> {
        if end > self.dimensions() {
            return Err(Error::InvalidArgument(format!(
                "slice end {end} is greater than the number of dimensions {}",
                self.dimensions()
            )));
        }
        if start >= end {
            return Err(Error::InvalidArgument(format!(
                "slice start {start} must be less than end {end}, vectors must have non-zero length"
            )));
        }

        match self {
            Vector::Float32(v) => Ok(Vector::Float32(v[start..end].to_vec())),
            Vector::Int8(v) => Ok(Vector::Int8(v[start..end].to_vec())),
            Vector::Bit(v) => {
                if start % 8 != 0 || end % 8 != 0 {
                    return Err(Error::InvalidArgument(
                        "bit vector slice bounds must be divisible by 8".to_string(),
                    ));
                }
                Ok(Vector::Bit(v[start / 8..end / 8].to_vec()))
            }
        }
    }

    /// Quantize a float32 vector from the `[-1, 1]` range onto int8
    pub fn quantize_i8_unit(&self) -> Result<Vector> {
        const MIN: f64 = -1.0;
        const MAX: f64 = 1.0;

        let v = self.as_f32()?;
        Ok(Vector::Int8(
            v.iter()
                .map(|&x| {
                    let scaled = (f64::from(x) - MIN) * 255.0 / (MAX - MIN) - 128.0;
                    scaled.clamp(-128.0, 127.0) as i8
                })
                .collect(),
        ))
    }

    /// Quantize a float32 vector to one bit per element: set when the
    /// element is positive
    pub fn quantize_binary(&self) -> Result<Vector> {
        let v = self.as_f32()?;
        if v.len() % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "binary quantization requires dimensions divisible by 8, got {}",
                v.len()
            )));
        }

        let mut out = vec![0u8; v.len() / 8];
        for (i, &x) in v.iter().enumerate() {
            if x > 0.0 {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(Vector::Bit(out))
    }
}

/// Normalize a vector to unit length
///
/// # Arguments
/// * `v` - Vector to normalize (modified in place)
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_blob(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[test]
    fn test_blob_and_json_agree() {
        let from_json = Vector::from_json("[0.25, -1, 3.5]", ElementType::Float32).unwrap();
        let from_blob =
            Vector::from_blob(&f32_blob(&[0.25, -1.0, 3.5]), ElementType::Float32).unwrap();
        assert_eq!(from_json, from_blob);
        assert_eq!(from_json.to_blob(), f32_blob(&[0.25, -1.0, 3.5]));
    }

    #[test]
    fn test_from_value() {
        let v = Vector::from_value(ValueRef::Text(b"[1, 2]"), ElementType::Float32).unwrap();
        assert_eq!(v, Vector::Float32(vec![1.0, 2.0]));

        assert!(Vector::from_value(ValueRef::Null, ElementType::Float32).is_err());
        assert!(Vector::from_value(ValueRef::Integer(1), ElementType::Float32).is_err());
    }

    #[test]
    fn test_reject_bad_blobs() {
        assert!(Vector::from_blob(&[], ElementType::Float32).is_err());
        assert!(Vector::from_blob(&[0, 0, 0], ElementType::Float32).is_err());
        assert!(Vector::from_blob(&[], ElementType::Int8).is_err());

        let too_big = vec![0u8; (MAX_DIMENSIONS + 1) * 4];
        assert!(Vector::from_blob(&too_big, ElementType::Float32).is_err());
    }

    #[test]
    fn test_reject_bad_json() {
        assert!(Vector::from_json("[]", ElementType::Float32).is_err());
        assert!(Vector::from_json("[1, 2", ElementType::Float32).is_err());
        assert!(Vector::from_json("{\"a\": 1}", ElementType::Float32).is_err());
        assert!(Vector::from_json("[\"x\"]", ElementType::Float32).is_err());
        assert!(Vector::from_json("[1, 0]", ElementType::Bit).is_err());
    }

    #[test]
    fn test_int8_json_range() {
        let v = Vector::from_json("[-128, 0, 127]", ElementType::Int8).unwrap();
        assert_eq!(v.to_blob(), vec![0x80, 0x00, 0x7f]);

        assert!(Vector::from_json("[128]", ElementType::Int8).is_err());
        assert!(Vector::from_json("[1.5]", ElementType::Int8).is_err());
    }

    #[test]
    fn test_bit_dimensions() {
        let v = Vector::from_blob(&[0xff, 0x01], ElementType::Bit).unwrap();
        assert_eq!(v.dimensions(), 16);
        assert_eq!(ElementType::Bit.byte_size(16), 2);
        assert_eq!(ElementType::Float32.byte_size(3), 12);
    }

    #[test]
    fn test_element_type_parse() {
        assert_eq!("float".parse::<ElementType>().unwrap(), ElementType::Float32);
        assert_eq!("F32".parse::<ElementType>().unwrap(), ElementType::Float32);
        assert_eq!("i8".parse::<ElementType>().unwrap(), ElementType::Int8);
        assert_eq!("bit".parse::<ElementType>().unwrap(), ElementType::Bit);
        assert!("float16".parse::<ElementType>().is_err());
    }

    #[test]
    fn test_to_json() {
        let v = Vector::Float32(vec![1.0, 0.5]);
        assert_eq!(v.to_json().unwrap(), "[1.0,0.5]");
        assert!(Vector::Bit(vec![1]).to_json().is_err());
    }

    #[test]
    fn test_add_sub() {
        let a = Vector::Float32(vec![1.0, 2.0]);
        let b = Vector::Float32(vec![0.5, 0.5]);
        assert_eq!(a.add(&b).unwrap(), Vector::Float32(vec![1.5, 2.5]));
        assert_eq!(a.sub(&b).unwrap(), Vector::Float32(vec![0.5, 1.5]));

        let c = Vector::Float32(vec![1.0]);
        assert!(matches!(
            a.add(&c),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(a.add(&Vector::Int8(vec![1, 2])).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let zero = Vector::Float32(vec![0.0, 0.0]).normalize().unwrap();
        assert_eq!(zero, Vector::Float32(vec![0.0, 0.0]));
    }

    #[test]
    fn test_slice() {
        let v = Vector::Float32(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(v.slice(1, 3).unwrap(), Vector::Float32(vec![2.0, 3.0]));
        assert!(v.slice(2, 2).is_err());
        assert!(v.slice(0, 5).is_err());

        let bits = Vector::Bit(vec![0x0f, 0xf0]);
        assert_eq!(bits.slice(8, 16).unwrap(), Vector::Bit(vec![0xf0]));
        assert!(bits.slice(4, 16).is_err());
    }

    #[test]
    fn test_quantize_i8_unit() {
        let v = Vector::Float32(vec![-1.0, 0.0, 1.0, 2.0]);
        assert_eq!(
            v.quantize_i8_unit().unwrap(),
            Vector::Int8(vec![-128, 0, 127, 127])
        );
    }

    #[test]
    fn test_quantize_binary() {
        let v = Vector::Float32(vec![1.0, -1.0, 0.0, 0.5, -0.5, 2.0, 0.0, 0.1]);
        // bits 0, 3, 5, 7
        assert_eq!(v.quantize_binary().unwrap(), Vector::Bit(vec![0b1010_1001]));

        let odd = Vector::Float32(vec![1.0, 2.0, 3.0]);
        assert!(odd.quantize_binary().is_err());
    }
}
