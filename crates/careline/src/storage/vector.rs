//! Embedding blob codec and exact cosine ranking.

use rayon::prelude::*;
use std::cmp::Ordering;

use crate::error::{Error, Result};

pub fn encode_f32_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_f32_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::Integrity(format!(
            "invalid embedding byte length {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Cosine similarity, or `None` when the vectors cannot be compared.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// A candidate row for ranking; `key` breaks ties deterministically.
pub struct Candidate<T> {
    pub key: (String, usize),
    pub embedding: Vec<f32>,
    pub payload: T,
}

/// Score every candidate against `query`, keep those strictly above
/// `threshold`, and return the best `k` ordered by similarity desc then key.
pub fn rank<T: Send>(
    query: &[f32],
    candidates: Vec<Candidate<T>>,
    k: usize,
    threshold: f32,
) -> Vec<(f32, T)> {
    let mut scored: Vec<((String, usize), f32, T)> = candidates
        .into_par_iter()
        .filter_map(|c| {
            let score = cosine_similarity(query, &c.embedding)?;
            (score > threshold).then_some((c.key, score, c.payload))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored.into_iter().map(|(_, score, p)| (score, p)).collect()
}
