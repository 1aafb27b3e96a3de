//! Entity graph over the corpus, behind a port so an external knowledge
//! graph service can replace the in-process build.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

use super::keyword::tokenize;

/// A chunk connected to query entities, with a raw relevance score.
#[derive(Debug, Clone)]
pub struct GraphHit {
    pub chunk_id: Uuid,
    pub relevance: f32,
    pub matched_entities: Vec<String>,
}

/// Port over the knowledge graph.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphIndex: Send + Sync {
    /// Index a chunk's entities at ingestion time.
    async fn index_chunk(&self, collection_id: Uuid, chunk_id: Uuid, content: &str);

    async fn remove_chunks(&self, collection_id: Uuid, chunk_ids: Vec<Uuid>);

    async fn remove_collection(&self, collection_id: Uuid);

    /// Chunks connected to the given entities, scored by how many distinct
    /// entities they touch.
    async fn neighbors(
        &self,
        collection_id: Option<Uuid>,
        entities: Vec<String>,
        limit: usize,
    ) -> Vec<GraphHit>;
}

/// Extract candidate entities from a query: salient terms plus adjacent-term
/// bigrams.
pub fn extract_entities(query: &str) -> Vec<String> {
    let tokens = tokenize(query);
    let mut entities: Vec<String> = tokens.clone();
    for pair in tokens.windows(2) {
        entities.push(format!("{} {}", pair[0], pair[1]));
    }
    entities.dedup();
    entities
}

#[derive(Default)]
struct CollectionGraph {
    /// entity -> chunks mentioning it
    adjacency: HashMap<String, Vec<Uuid>>,
    /// reverse edges for removal
    chunk_entities: HashMap<Uuid, Vec<String>>,
}

/// In-process adjacency graph: nodes are entities, edges connect entities to
/// the chunks mentioning them.
#[derive(Default)]
pub struct InMemoryGraph {
    collections: DashMap<Uuid, CollectionGraph>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphIndex for InMemoryGraph {
    async fn index_chunk(&self, collection_id: Uuid, chunk_id: Uuid, content: &str) {
        let entities = extract_entities(content);
        let mut graph = self.collections.entry(collection_id).or_default();

        for entity in &entities {
            let chunks = graph.adjacency.entry(entity.clone()).or_default();
            if !chunks.contains(&chunk_id) {
                chunks.push(chunk_id);
            }
        }
        graph.chunk_entities.insert(chunk_id, entities);
    }

    async fn remove_chunks(&self, collection_id: Uuid, chunk_ids: Vec<Uuid>) {
        let Some(mut graph) = self.collections.get_mut(&collection_id) else {
            return;
        };
        for chunk_id in chunk_ids {
            let Some(entities) = graph.chunk_entities.remove(&chunk_id) else {
                continue;
            };
            for entity in entities {
                if let Some(chunks) = graph.adjacency.get_mut(&entity) {
                    chunks.retain(|&c| c != chunk_id);
                    if chunks.is_empty() {
                        graph.adjacency.remove(&entity);
                    }
                }
            }
        }
    }

    async fn remove_collection(&self, collection_id: Uuid) {
        self.collections.remove(&collection_id);
    }

    async fn neighbors(
        &self,
        collection_id: Option<Uuid>,
        entities: Vec<String>,
        limit: usize,
    ) -> Vec<GraphHit> {
        if entities.is_empty() {
            return Vec::new();
        }

        let mut hits: HashMap<Uuid, (f32, Vec<String>)> = HashMap::new();

        let collect = |graph: &CollectionGraph, hits: &mut HashMap<Uuid, (f32, Vec<String>)>| {
            for entity in &entities {
                // Bigram matches are worth more than single terms
                let weight = if entity.contains(' ') { 2.0 } else { 1.0 };
                let Some(chunks) = graph.adjacency.get(entity) else {
                    continue;
                };
                for &chunk_id in chunks {
                    let entry = hits.entry(chunk_id).or_insert_with(|| (0.0, Vec::new()));
                    entry.0 += weight;
                    entry.1.push(entity.clone());
                }
            }
        };

        match collection_id {
            Some(id) => {
                if let Some(graph) = self.collections.get(&id) {
                    collect(&graph, &mut hits);
                }
            }
            None => {
                for entry in self.collections.iter() {
                    collect(entry.value(), &mut hits);
                }
            }
        }

        let mut results: Vec<GraphHit> = hits
            .into_iter()
            .map(|(chunk_id, (relevance, matched_entities))| GraphHit {
                chunk_id,
                relevance,
                matched_entities,
            })
            .collect();
        results.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connected_chunks_are_found_and_ranked() {
        let graph = InMemoryGraph::new();
        let collection = Uuid::new_v4();
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();

        graph
            .index_chunk(collection, chunk_a, "raft consensus elects a leader")
            .await;
        graph
            .index_chunk(collection, chunk_b, "paxos consensus is notoriously subtle")
            .await;

        let hits = graph
            .neighbors(
                Some(collection),
                extract_entities("how does raft consensus work"),
                10,
            )
            .await;

        assert_eq!(hits[0].chunk_id, chunk_a);
        assert!(hits[0].relevance > hits.last().unwrap().relevance || hits.len() == 1);
        assert!(hits[0]
            .matched_entities
            .iter()
            .any(|e| e == "raft consensus"));
    }

    #[tokio::test]
    async fn removal_disconnects_chunks() {
        let graph = InMemoryGraph::new();
        let collection = Uuid::new_v4();
        let chunk = Uuid::new_v4();
        graph.index_chunk(collection, chunk, "vector clocks order events").await;

        graph.remove_chunks(collection, vec![chunk]).await;
        let hits = graph
            .neighbors(Some(collection), extract_entities("vector clocks"), 10)
            .await;
        assert!(hits.is_empty());
    }

    #[test]
    fn entities_include_bigrams() {
        let entities = extract_entities("write ahead log");
        assert!(entities.contains(&"write".to_string()));
        assert!(entities.contains(&"write ahead".to_string()));
        assert!(entities.contains(&"ahead log".to_string()));
    }
}
