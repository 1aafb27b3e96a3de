//! Score fusion for hybrid retrieval.
//!
//! Reciprocal rank fusion (Cormack, Clarke & Buettcher 2009) is the default;
//! a weighted linear combination over min-max-normalized scores is available
//! behind the `fusion = "linear"` config flag.

use std::collections::HashMap;
use uuid::Uuid;

pub const DEFAULT_RRF_K: u32 = 60;

/// RRF over ranked id lists: `score(d) = Σ 1 / (k + rank(d))` with 1-based
/// ranks. Output is sorted by fused score descending, normalized to [0, 1]
/// by the observed maximum, ties broken by id for determinism.
pub fn reciprocal_rank_fusion(ranked_lists: &[Vec<Uuid>], k: u32) -> Vec<(Uuid, f32)> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();

    for list in ranked_lists {
        for (rank, &id) in list.iter().enumerate() {
            let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
            *scores.entry(id).or_insert(0.0) += rrf;
        }
    }

    let max = scores.values().cloned().fold(0.0f32, f32::max);
    let mut results: Vec<(Uuid, f32)> = scores
        .into_iter()
        .map(|(id, score)| (id, if max > 0.0 { score / max } else { 0.0 }))
        .collect();

    sort_scored(&mut results);
    results
}

/// Weighted linear fusion: `alpha * semantic + (1 - alpha) * keyword`, each
/// side min-max normalized first. Ids missing from one side contribute zero
/// from that side.
pub fn linear_fusion(
    semantic: &[(Uuid, f32)],
    keyword: &[(Uuid, f32)],
    alpha: f32,
) -> Vec<(Uuid, f32)> {
    let alpha = alpha.clamp(0.0, 1.0);
    let semantic_norm = min_max_normalize(semantic);
    let keyword_norm = min_max_normalize(keyword);

    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    for (id, score) in semantic_norm {
        *scores.entry(id).or_insert(0.0) += alpha * score;
    }
    for (id, score) in keyword_norm {
        *scores.entry(id).or_insert(0.0) += (1.0 - alpha) * score;
    }

    let mut results: Vec<(Uuid, f32)> = scores.into_iter().collect();
    sort_scored(&mut results);
    results
}

/// Min-max normalize to [0, 1]. A constant list maps to all ones.
pub fn min_max_normalize(scores: &[(Uuid, f32)]) -> Vec<(Uuid, f32)> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    scores
        .iter()
        .map(|&(id, score)| {
            let normalized = if range > f32::EPSILON {
                (score - min) / range
            } else {
                1.0
            };
            (id, normalized)
        })
        .collect()
}

fn sort_scored(results: &mut [(Uuid, f32)]) {
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn rrf_favors_items_ranked_well_in_both_lists() {
        // Semantic scores [0.9, 0.8, 0.7] -> ranks c0, c1, c2
        // Keyword scores  [0.5, 0.9, 0.6] -> ranks c1, c2, c0
        let c = ids(3);
        let semantic = vec![c[0], c[1], c[2]];
        let keyword = vec![c[1], c[2], c[0]];

        let fused = reciprocal_rank_fusion(&[semantic, keyword], DEFAULT_RRF_K);

        // c1: 1/61 + 1/62, c0: 1/61 + 1/63, c2: 1/62 + 1/63
        assert_eq!(fused[0].0, c[1]);
        assert_eq!(fused[1].0, c[0]);
        assert_eq!(fused[2].0, c[2]);
        // Normalized: best is exactly 1.0, all within [0, 1]
        assert!((fused[0].1 - 1.0).abs() < 1e-6);
        for (_, score) in &fused {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn rrf_single_list_preserves_order() {
        let c = ids(3);
        let fused = reciprocal_rank_fusion(&[c.clone()], DEFAULT_RRF_K);
        let order: Vec<Uuid> = fused.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, c);
    }

    #[test]
    fn rrf_of_empty_lists_is_empty() {
        assert!(reciprocal_rank_fusion(&[vec![], vec![]], DEFAULT_RRF_K).is_empty());
    }

    #[test]
    fn linear_fusion_weighs_sides_by_alpha() {
        let c = ids(2);
        let semantic = vec![(c[0], 0.9f32), (c[1], 0.1f32)];
        let keyword = vec![(c[0], 0.1f32), (c[1], 0.9f32)];

        // Semantic-dominant
        let fused = linear_fusion(&semantic, &keyword, 0.9);
        assert_eq!(fused[0].0, c[0]);
        // Keyword-dominant
        let fused = linear_fusion(&semantic, &keyword, 0.1);
        assert_eq!(fused[0].0, c[1]);
    }

    #[test]
    fn normalize_handles_constant_scores() {
        let c = ids(2);
        let normalized = min_max_normalize(&[(c[0], 0.5), (c[1], 0.5)]);
        assert!(normalized.iter().all(|(_, s)| (*s - 1.0).abs() < 1e-6));
    }
}
