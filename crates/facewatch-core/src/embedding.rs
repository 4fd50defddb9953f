//! Vector math over face embeddings.

use thiserror::Error;

/// Two embeddings of different dimensionality were compared.
///
/// The classifier fixes the dimension, so this means the roster and the
/// loaded model disagree. Callers treat it as fatal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot compare embeddings of different sizes: {left} vs {right}")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// Euclidean distance between two embeddings of equal length.
pub fn distance(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum();

    Ok(sum.sqrt())
}

/// Euclidean norm.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Unit-length copy of `v`, or `None` when its norm is zero.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let n = norm(v);
    if n > 0.0 && n.is_finite() {
        Some(v.iter().map(|x| x / n).collect())
    } else {
        None
    }
}

/// Scale `v` to unit length in place. Leaves it untouched and returns
/// false when the norm is zero.
pub fn normalize_in_place(v: &mut [f32]) -> bool {
    let n = norm(v);
    if n > 0.0 && n.is_finite() {
        v.iter_mut().for_each(|x| *x /= n);
        true
    } else {
        false
    }
}
