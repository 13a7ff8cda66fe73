//! Distance metrics with SIMD acceleration
//!
//! This module provides the distance functions behind `vec_distance_*` and
//! `vec0` KNN queries:
//! - L2 (Euclidean) distance
//! - Cosine distance
//! - Hamming distance for bit vectors
//!
//! Kernels go through `simsimd`, which picks AVX-512/AVX2/NEON at runtime;
//! whenever it declines an input the scalar implementation is used instead.
//!
//! [`DistanceMetric::distance`] is the public entry point. It checks element
//! types and dimensions before reaching the slice kernels, which panic on
//! length mismatch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use simsimd::{BinarySimilarity, SpatialSimilarity};

use crate::vector::{ElementType, Vector};
use crate::{Error, Result};

/// Distance metric types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 (Euclidean) distance: sqrt(sum((a[i] - b[i])^2))
    #[default]
    L2,
    /// Cosine distance: 1 - (a·b)/(‖a‖‖b‖)
    Cosine,
    /// Number of differing bits (bit vectors only)
    Hamming,
}

impl DistanceMetric {
    /// Lowercase name, as accepted in `distance_metric=` options
    pub fn name(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Hamming => "hamming",
        }
    }

    /// Whether this metric can compare vectors of `element_type`
    pub fn supports(self, element_type: ElementType) -> bool {
        match self {
            DistanceMetric::L2 | DistanceMetric::Cosine => element_type != ElementType::Bit,
            DistanceMetric::Hamming => element_type == ElementType::Bit,
        }
    }

    /// Distance between two vectors of the same type and dimensions
    pub fn distance(self, a: &Vector, b: &Vector) -> Result<f32> {
        if a.element_type() != b.element_type() {
            return Err(Error::ElementTypeMismatch {
                expected: a.element_type(),
                actual: b.element_type(),
            });
        }
        b.check_dimensions(a.dimensions())?;

        let distance = match (self, a, b) {
            (DistanceMetric::L2, Vector::Float32(a), Vector::Float32(b)) => l2_distance(a, b),
            (DistanceMetric::L2, Vector::Int8(a), Vector::Int8(b)) => l2_distance_i8(a, b),
            (DistanceMetric::Cosine, Vector::Float32(a), Vector::Float32(b)) => {
                cosine_distance(a, b)
            }
            (DistanceMetric::Cosine, Vector::Int8(a), Vector::Int8(b)) => cosine_distance_i8(a, b),
            (DistanceMetric::Hamming, Vector::Bit(a), Vector::Bit(b)) => hamming_distance(a, b),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{} distance is not defined for {} vectors",
                    self.name(),
                    a.element_type()
                )))
            }
        };
        Ok(distance)
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(DistanceMetric::L2),
            "cosine" => Ok(DistanceMetric::Cosine),
            "hamming" => Ok(DistanceMetric::Hamming),
            other => Err(Error::InvalidArgument(format!(
                "unknown distance metric '{other}'"
            ))),
        }
    }
}

/// Compute L2 (Euclidean) distance between two vectors
///
/// # Arguments
/// * `a` - First vector
/// * `b` - Second vector
///
/// # Returns
/// L2 distance (always >= 0)
///
/// # Panics
/// Panics if vectors have different dimensions
pub(crate) fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    if let Some(sq) = f32::sqeuclidean(a, b) {
        return (sq as f32).max(0.0).sqrt();
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// L2 distance between two int8 vectors
pub(crate) fn l2_distance_i8(a: &[i8], b: &[i8]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    if let Some(sq) = i8::sqeuclidean(a, b) {
        return (sq as f32).max(0.0).sqrt();
    }

    let sq: i64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = i64::from(x) - i64::from(y);
            d * d
        })
        .sum();
    (sq as f32).sqrt()
}

/// Compute cosine distance between two vectors
///
/// # Returns
/// `1 - cosine similarity`, in range [0, 2]. A zero vector is at distance 1
/// from everything.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let norm_a = dot_product(a, a);
    let norm_b = dot_product(b, b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - dot_product(a, b) / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance between two int8 vectors
pub(crate) fn cosine_distance_i8(a: &[i8], b: &[i8]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let (mut dot, mut norm_a, mut norm_b) = (0i64, 0i64, 0i64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (i64::from(x), i64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0 || norm_b == 0 {
        return 1.0;
    }

    (1.0 - dot as f64 / ((norm_a as f64).sqrt() * (norm_b as f64).sqrt())) as f32
}

/// Compute dot product between two vectors
pub(crate) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    // simsimd returns Option<f64>
    if let Some(result) = f32::dot(a, b) {
        return result as f32;
    }

    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Number of differing bits between two packed bit vectors
pub(crate) fn hamming_distance(a: &[u8], b: &[u8]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    if let Some(result) = u8::hamming(a, b) {
        return result as f32;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum::<u32>() as f32
}
