//! In-process BM25 inverted index over chunk content.
//!
//! Built write-through at ingestion and rebuilt from the relational store at
//! startup. Keyed by collection; reads are concurrent, writes take the
//! collection entry.

use dashmap::DashMap;
use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::retrieval::synonym::STOP_WORDS;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Tokenize for indexing: lowercase unicode words, stop words dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w.as_str()))
        .collect()
}

#[derive(Default)]
struct CollectionIndex {
    /// term -> chunk -> term frequency
    postings: HashMap<String, HashMap<Uuid, u32>>,
    /// chunk -> document length in tokens
    lengths: HashMap<Uuid, u32>,
    total_length: u64,
}

impl CollectionIndex {
    fn avg_length(&self) -> f32 {
        if self.lengths.is_empty() {
            return 0.0;
        }
        self.total_length as f32 / self.lengths.len() as f32
    }

    fn add(&mut self, chunk_id: Uuid, tokens: &[String]) {
        self.remove(chunk_id);
        for token in tokens {
            *self
                .postings
                .entry(token.clone())
                .or_default()
                .entry(chunk_id)
                .or_insert(0) += 1;
        }
        self.lengths.insert(chunk_id, tokens.len() as u32);
        self.total_length += tokens.len() as u64;
    }

    fn remove(&mut self, chunk_id: Uuid) {
        if let Some(length) = self.lengths.remove(&chunk_id) {
            self.total_length = self.total_length.saturating_sub(length as u64);
        }
        self.postings.retain(|_, chunks| {
            chunks.remove(&chunk_id);
            !chunks.is_empty()
        });
    }

    /// BM25 over the query terms; scores are raw (unnormalized).
    fn search(&self, terms: &[String], limit: usize) -> Vec<(Uuid, f32)> {
        let n = self.lengths.len() as f32;
        if n == 0.0 {
            return Vec::new();
        }
        let avgdl = self.avg_length().max(1.0);

        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        for term in terms {
            let Some(chunks) = self.postings.get(term) else {
                continue;
            };
            let df = chunks.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (&chunk_id, &tf) in chunks {
                let dl = *self.lengths.get(&chunk_id).unwrap_or(&1) as f32;
                let tf = tf as f32;
                let score = idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * dl / avgdl));
                *scores.entry(chunk_id).or_insert(0.0) += score;
            }
        }

        let mut results: Vec<(Uuid, f32)> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(limit);
        results
    }
}

/// Process-wide keyword index, one BM25 index per collection.
#[derive(Default)]
pub struct KeywordIndex {
    collections: DashMap<Uuid, CollectionIndex>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_chunk(&self, collection_id: Uuid, chunk_id: Uuid, content: &str) {
        let tokens = tokenize(content);
        self.collections
            .entry(collection_id)
            .or_default()
            .add(chunk_id, &tokens);
    }

    pub fn remove_chunks(&self, collection_id: Uuid, chunk_ids: &[Uuid]) {
        if let Some(mut index) = self.collections.get_mut(&collection_id) {
            for &chunk_id in chunk_ids {
                index.remove(chunk_id);
            }
        }
    }

    pub fn remove_collection(&self, collection_id: Uuid) {
        self.collections.remove(&collection_id);
    }

    /// Search one collection, or every collection when none is given.
    /// Returned scores are raw BM25; callers normalize for fusion.
    pub fn search(
        &self,
        collection_id: Option<Uuid>,
        query: &str,
        limit: usize,
    ) -> Vec<(Uuid, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        match collection_id {
            Some(id) => self
                .collections
                .get(&id)
                .map(|index| index.search(&terms, limit))
                .unwrap_or_default(),
            None => {
                let mut merged: Vec<(Uuid, f32)> = Vec::new();
                for entry in self.collections.iter() {
                    merged.extend(entry.value().search(&terms, limit));
                }
                merged.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                merged.truncate(limit);
                merged
            }
        }
    }

    pub fn chunk_count(&self, collection_id: Uuid) -> usize {
        self.collections
            .get(&collection_id)
            .map(|index| index.lengths.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (KeywordIndex, Uuid, Uuid, Uuid) {
        let index = KeywordIndex::new();
        let collection = Uuid::new_v4();
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();
        index.index_chunk(collection, chunk_a, "postgres replication uses a write ahead log");
        index.index_chunk(collection, chunk_b, "kubernetes schedules pods onto worker nodes");
        (index, collection, chunk_a, chunk_b)
    }

    #[test]
    fn matching_terms_rank_the_right_chunk_first() {
        let (index, collection, chunk_a, _) = seeded();
        let results = index.search(Some(collection), "write ahead log", 10);
        assert_eq!(results[0].0, chunk_a);
        assert!(results[0].1 > 0.0);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let (index, collection, _, _) = seeded();
        assert!(index.search(Some(collection), "quantum chromodynamics", 10).is_empty());
        assert!(index.search(Some(Uuid::new_v4()), "postgres", 10).is_empty());
    }

    #[test]
    fn reindexing_a_chunk_replaces_its_postings() {
        let (index, collection, chunk_a, _) = seeded();
        index.index_chunk(collection, chunk_a, "entirely different topic now");
        let results = index.search(Some(collection), "postgres replication", 10);
        assert!(results.iter().all(|(id, _)| *id != chunk_a));
    }

    #[test]
    fn removal_shrinks_the_index() {
        let (index, collection, chunk_a, chunk_b) = seeded();
        index.remove_chunks(collection, &[chunk_a, chunk_b]);
        assert_eq!(index.chunk_count(collection), 0);
        assert!(index.search(Some(collection), "postgres", 10).is_empty());
    }

    #[test]
    fn stop_words_are_dropped() {
        let tokens = tokenize("the quick brown fox is on a log");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"is".to_string()));
        assert!(tokens.contains(&"quick".to_string()));
    }

    #[test]
    fn cross_collection_search_merges() {
        let (index, _, _, _) = seeded();
        let other = Uuid::new_v4();
        index.index_chunk(other, Uuid::new_v4(), "postgres tuning guide");
        let results = index.search(None, "postgres", 10);
        assert_eq!(results.len(), 2);
    }
}
