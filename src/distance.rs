//! Distance kind dispatch.
//!
//! Four kernels, all returning f32 with smaller-is-nearer semantics:
//! squared L2, negative inner product, cosine distance, and Hamming
//! distance over packed bit vectors.

use thiserror::Error;

use crate::simd;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DistanceError {
    #[error("vector dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("unknown distance kind '{0}'")]
    UnknownKind(String),

    #[error("{0:?} distance requires float vectors")]
    FloatOnly(Distance),

    #[error("Hamming distance requires bit vectors with dim % 64 == 0")]
    BitOnly,
}

/// Distance measure carried by an index descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    L2,
    Ip,
    Cosine,
    Hamming,
}

impl Distance {
    /// Parse an option-string value. `L2`/`EUCLIDEAN` are synonyms, as in
    /// the scalar `myvector_distance` function.
    pub fn parse(s: &str) -> Result<Self, DistanceError> {
        if s.eq_ignore_ascii_case("L2") || s.eq_ignore_ascii_case("EUCLIDEAN") {
            Ok(Distance::L2)
        } else if s.eq_ignore_ascii_case("IP") {
            Ok(Distance::Ip)
        } else if s.eq_ignore_ascii_case("Cosine") {
            Ok(Distance::Cosine)
        } else if s.eq_ignore_ascii_case("Hamming") {
            Ok(Distance::Hamming)
        } else {
            Err(DistanceError::UnknownKind(s.to_string()))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Distance::L2 => "L2",
            Distance::Ip => "IP",
            Distance::Cosine => "Cosine",
            Distance::Hamming => "Hamming",
        }
    }

    /// Compute the distance between two float vectors. Mismatched
    /// dimensions are an error, never a silent truncation.
    pub fn compute(self, a: &[f32], b: &[f32]) -> Result<f32, DistanceError> {
        if a.len() != b.len() {
            return Err(DistanceError::DimensionMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        match self {
            Distance::L2 => Ok(simd::l2_squared(a, b)),
            Distance::Ip => Ok(-simd::dot_product(a, b)),
            Distance::Cosine => Ok(cosine_distance(a, b)),
            Distance::Hamming => Err(DistanceError::BitOnly),
        }
    }

    /// Compute the Hamming distance between two packed bit vectors.
    pub fn compute_bits(self, a: &[u8], b: &[u8]) -> Result<f32, DistanceError> {
        if self != Distance::Hamming {
            return Err(DistanceError::FloatOnly(self));
        }
        if a.len() != b.len() {
            return Err(DistanceError::DimensionMismatch {
                left: a.len() * 8,
                right: b.len() * 8,
            });
        }
        if a.len() % 8 != 0 {
            return Err(DistanceError::BitOnly);
        }
        Ok(simd::hamming(a, b) as f32)
    }
}

/// `1 − (a·b)/(‖a‖·‖b‖)`; returns 1.0 when either norm is zero.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot = simd::dot_product(a, b);
    let norm_a = simd::dot_product(a, a).sqrt();
    let norm_b = simd::dot_product(b, b).sqrt();
    let t = norm_a * norm_b;
    if t == 0.0 {
        return 1.0;
    }
    1.0 - dot / t
}
