//! Query reformulation: expand, clarify, or fan out into multiple phrasings.
//!
//! Reformulation is best-effort. When disabled, on timeout, or on any
//! provider error the original query is returned unchanged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::index::TtlCache;
use crate::llm::{ChatMessage, ChatModel, GenerationParams};

const REFORMULATION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MULTI_QUERIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReformulationMode {
    Expand,
    Clarify,
    Multi,
}

impl ReformulationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReformulationMode::Expand => "expand",
            ReformulationMode::Clarify => "clarify",
            ReformulationMode::Multi => "multi",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reformulated {
    One(String),
    Many(Vec<String>),
}

impl Reformulated {
    pub fn primary(&self) -> &str {
        match self {
            Reformulated::One(q) => q,
            Reformulated::Many(qs) => qs.first().map(String::as_str).unwrap_or(""),
        }
    }
}

pub struct QueryReformulator {
    chat_model: Arc<dyn ChatModel>,
    cache: Arc<TtlCache>,
    enabled: bool,
}

impl QueryReformulator {
    pub fn new(chat_model: Arc<dyn ChatModel>, cache: Arc<TtlCache>, enabled: bool) -> Self {
        Self {
            chat_model,
            cache,
            enabled,
        }
    }

    fn prompt_for(mode: ReformulationMode, query: &str) -> (String, f32) {
        match mode {
            ReformulationMode::Expand => (
                format!(
                    "Expand this search query by adding 2-3 relevant synonyms or \
                     related terms. Keep it concise and focused on the same topic. \
                     Only output the expanded query, nothing else.\n\n\
                     Original query: {}\n\nExpanded query:",
                    query
                ),
                0.3,
            ),
            ReformulationMode::Clarify => (
                format!(
                    "Fix any typos and expand acronyms in this search query. Keep the \
                     meaning the same but make it clearer. Only output the clarified \
                     query, nothing else.\n\n\
                     Original query: {}\n\nClarified query:",
                    query
                ),
                0.1,
            ),
            ReformulationMode::Multi => (
                format!(
                    "Generate 3 different ways to search for this information. Each \
                     query should be unique but related to the same topic. Output only \
                     the queries, one per line, without numbering.\n\n\
                     Original query: {}\n\nAlternative queries:",
                    query
                ),
                0.7,
            ),
        }
    }

    fn unchanged(query: &str, mode: ReformulationMode) -> Reformulated {
        match mode {
            ReformulationMode::Multi => Reformulated::Many(vec![query.to_string()]),
            _ => Reformulated::One(query.to_string()),
        }
    }

    fn parse_multi(query: &str, output: &str) -> Vec<String> {
        let mut queries = vec![query.to_string()];
        for line in output.lines() {
            let cleaned = line
                .trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || ".-) ".contains(c))
                .trim()
                .to_string();
            if !cleaned.is_empty() && !queries.contains(&cleaned) {
                queries.push(cleaned);
            }
        }
        queries.truncate(MAX_MULTI_QUERIES);
        queries
    }

    async fn call_llm(&self, prompt: String, temperature: f32) -> Option<String> {
        let params = GenerationParams {
            temperature: Some(temperature),
            max_tokens: Some(200),
            ..Default::default()
        };
        let future = self
            .chat_model
            .complete(vec![ChatMessage::user(prompt)], &params);

        match tokio::time::timeout(REFORMULATION_TIMEOUT, future).await {
            Ok(Ok(output)) => Some(output.trim().to_string()).filter(|o| !o.is_empty()),
            Ok(Err(e)) => {
                warn!("reformulation failed: {}", e);
                None
            }
            Err(_) => {
                warn!("reformulation timed out");
                None
            }
        }
    }

    pub async fn reformulate(&self, query: &str, mode: ReformulationMode) -> Reformulated {
        if !self.enabled {
            return Self::unchanged(query, mode);
        }

        // Cache first; multi-query lists are stored as JSON to avoid
        // delimiter ambiguity
        let cache_key = TtlCache::reformulation_key(query, mode.as_str());
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!("reformulation cache hit");
            return match mode {
                ReformulationMode::Multi => serde_json::from_str(&cached)
                    .map(Reformulated::Many)
                    .unwrap_or_else(|_| Self::unchanged(query, mode)),
                _ => Reformulated::One(cached),
            };
        }

        let (prompt, temperature) = Self::prompt_for(mode, query);
        let Some(output) = self.call_llm(prompt, temperature).await else {
            return Self::unchanged(query, mode);
        };

        match mode {
            ReformulationMode::Multi => {
                let queries = Self::parse_multi(query, &output);
                if let Ok(serialized) = serde_json::to_string(&queries) {
                    self.cache.set(cache_key, serialized);
                }
                Reformulated::Many(queries)
            }
            _ => {
                self.cache.set(cache_key, output.clone());
                Reformulated::One(output)
            }
        }
    }

    /// Context-aware variant: folds the last three turns in so follow-up
    /// queries stay on topic rather than drifting to novelty.
    pub async fn reformulate_with_context(
        &self,
        query: &str,
        history: &[(String, String)],
        mode: ReformulationMode,
    ) -> Reformulated {
        if history.is_empty() {
            return self.reformulate(query, mode).await;
        }
        if !self.enabled {
            return Self::unchanged(query, mode);
        }

        let context: String = history
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|(role, content)| {
                let truncated: String = content.chars().take(100).collect();
                format!("{}: {}", role, truncated)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Given this conversation context, reformulate the current query so it \
             is self-contained and stays on the conversation's topic. Only output \
             the reformulated query.\n\nContext:\n{}\n\nCurrent query: {}\n\n\
             Reformulated query:",
            context, query
        );

        match self.call_llm(prompt, 0.3).await {
            Some(output) => Reformulated::One(output),
            None => self.reformulate(query, mode).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::MockChatModel;
    use crate::utils::ApiError;
    use std::time::Duration;

    fn reformulator(model: MockChatModel, enabled: bool) -> QueryReformulator {
        QueryReformulator::new(
            Arc::new(model),
            Arc::new(TtlCache::new(Duration::from_secs(60), 100)),
            enabled,
        )
    }

    #[tokio::test]
    async fn disabled_returns_original() {
        let result = reformulator(MockChatModel::new(), false)
            .reformulate("ML models", ReformulationMode::Expand)
            .await;
        assert_eq!(result, Reformulated::One("ML models".to_string()));
    }

    #[tokio::test]
    async fn errors_fall_back_to_original() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .returning(|_, _| Err(ApiError::Upstream("down".to_string())));
        let result = reformulator(model, true)
            .reformulate("ML models", ReformulationMode::Multi)
            .await;
        assert_eq!(result, Reformulated::Many(vec!["ML models".to_string()]));
    }

    #[tokio::test]
    async fn multi_includes_original_and_caps_at_four() {
        let mut model = MockChatModel::new();
        model.expect_complete().returning(|_, _| {
            Ok("1. What is RAG?\n2. Explain retrieval augmented generation\n\
                3. RAG architecture\n4. extra one\n5. another"
                .to_string())
        });
        let result = reformulator(model, true)
            .reformulate("How does RAG work?", ReformulationMode::Multi)
            .await;
        let Reformulated::Many(queries) = result else {
            panic!("expected multi result");
        };
        assert_eq!(queries[0], "How does RAG work?");
        assert_eq!(queries.len(), MAX_MULTI_QUERIES);
        assert!(queries.contains(&"What is RAG?".to_string()));
    }

    #[tokio::test]
    async fn expansion_result_is_cached() {
        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(1)
            .returning(|_, _| Ok("ML models machine learning algorithms".to_string()));

        let reformulator = reformulator(model, true);
        let first = reformulator
            .reformulate("ML models", ReformulationMode::Expand)
            .await;
        // Second call must hit the cache (mock would panic on a second call)
        let second = reformulator
            .reformulate("ML models", ReformulationMode::Expand)
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn context_variant_uses_history() {
        let mut model = MockChatModel::new();
        model.expect_complete().returning(|messages, _| {
            assert!(messages[0].content.contains("conversation context"));
            Ok("the raft leader election timeout".to_string())
        });
        let history = vec![
            ("user".to_string(), "tell me about raft".to_string()),
            ("assistant".to_string(), "raft is a consensus protocol".to_string()),
        ];
        let result = reformulator(model, true)
            .reformulate_with_context("what about the timeout?", &history, ReformulationMode::Expand)
            .await;
        assert_eq!(
            result,
            Reformulated::One("the raft leader election timeout".to_string())
        );
    }
}
