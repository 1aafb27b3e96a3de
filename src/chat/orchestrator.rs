//! The chat orchestrator: session state, retrieval, prompt assembly, and
//! streamed generation with post-stream source/media/follow-up events.
//!
//! Persistence contract: the user message is stored when the turn starts; an
//! `error` terminus removes it again so the session is left as it was, and
//! the assistant message is stored only after the stream completed. A client
//! disconnect drops the whole generator, aborting the in-flight LLM and
//! retrieval futures with it, and the partial assistant turn is never
//! persisted.

use dashmap::DashMap;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::events::{FollowUpQuestion, MediaRef, SourceRef, StreamEvent, Usage};
use crate::chat::prompt::PromptAssembler;
use crate::config::ChatConfig;
use crate::database::{ChatMessageRow, ChatSessionRow, Repository};
use crate::llm::{ChatMessage, ChatModel, GenerationParams};
use crate::models::chat::{ChatRequest, ReasoningMode};
use crate::models::retrieval::{RetrievalMode, RetrievalRequest, RetrievalResult};
use crate::retrieval::{QueryReformulator, Reformulated, ReformulationMode, Reranker, RetrievalEngine};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::utils::token_estimator;

const SUB_QUERIES_PER_ITERATION: usize = 2;
const SESSION_TITLE_MAX_CHARS: usize = 80;

pub struct ChatOrchestrator {
    repository: Arc<Repository>,
    engine: Arc<RetrievalEngine>,
    reformulator: Arc<QueryReformulator>,
    reranker: Option<Arc<dyn Reranker>>,
    chat_model: Arc<dyn ChatModel>,
    limiters: Arc<Limiters>,
    config: ChatConfig,
    /// Serializes concurrent turns on the same session.
    session_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

struct TurnOutcome {
    answer: String,
    results: Vec<RetrievalResult>,
    usage: Usage,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        engine: Arc<RetrievalEngine>,
        reformulator: Arc<QueryReformulator>,
        reranker: Option<Arc<dyn Reranker>>,
        chat_model: Arc<dyn ChatModel>,
        limiters: Arc<Limiters>,
        config: ChatConfig,
    ) -> Self {
        Self {
            repository,
            engine,
            reformulator,
            reranker,
            chat_model,
            limiters,
            config,
            session_locks: DashMap::new(),
        }
    }

    fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The full turn as an event stream. The stream ends with exactly one
    /// `done` or one `error`.
    pub fn run(
        self: Arc<Self>,
        user_id: Uuid,
        request: ChatRequest,
    ) -> impl Stream<Item = StreamEvent> + Send {
        async_stream::stream! {
            // Validate before touching any state
            let message = match request.validate(self.config.max_message_chars) {
                Ok(message) => message,
                Err(e) => {
                    yield StreamEvent::Error { error: e.to_string() };
                    return;
                }
            };

            // Resolve or create the session
            let session = match self.resolve_session(user_id, &request, &message).await {
                Ok(session) => session,
                Err(e) => {
                    yield StreamEvent::Error { error: e.to_string() };
                    return;
                }
            };
            let session_id = session.session_id;

            // Serialize turns on this session: a second concurrent turn waits
            let lock = self.session_lock(session_id);
            let _turn_guard = lock.lock().await;

            // History before this turn, for context-aware reformulation and
            // prompt history
            let history = self
                .repository
                .list_messages(session_id)
                .await
                .unwrap_or_default();

            // Persist the user message up front; an error terminus rolls it back
            let user_message = match self
                .repository
                .append_message(session_id, "user", &message)
                .await
            {
                Ok(row) => row,
                Err(e) => {
                    yield StreamEvent::Error { error: e.to_string() };
                    return;
                }
            };

            // Everything from retrieval to generation, with progress events
            // flowing through a channel so deep-mode steps surface live
            let (progress_tx, progress_rx) = flume::unbounded::<StreamEvent>();
            let turn = self.clone();
            let turn_request = request.clone();
            let turn_message = message.clone();
            let turn_history = history.clone();
            let mut work = Box::pin(async move {
                turn.execute_turn(
                    user_id,
                    session_id,
                    &turn_request,
                    &turn_message,
                    &turn_history,
                    progress_tx,
                )
                .await
            });

            // Drain progress events while the turn runs. Biased so the
            // finished turn wins over a closed progress channel.
            let outcome = loop {
                let next = tokio::select! {
                    biased;
                    result = &mut work => {
                        break result;
                    }
                    event = progress_rx.recv_async() => event,
                };
                if let Ok(event) = next {
                    yield event;
                }
            };

            // Flush any progress events still queued behind the completion
            while let Ok(event) = progress_rx.try_recv() {
                yield event;
            }

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Leave the session exactly as it was before the turn
                    if let Err(cleanup) = self.repository.delete_message(user_message.message_id).await {
                        warn!("failed to roll back user message: {}", cleanup);
                    }
                    yield StreamEvent::Error { error: e.to_string() };
                    return;
                }
            };

            // Post-stream events
            yield StreamEvent::Sources {
                sources: Self::sources_from(&outcome.results),
            };
            yield StreamEvent::Media {
                media: Self::media_from(&outcome.results),
            };

            match self.follow_ups(&message, &outcome.answer).await {
                Ok(questions) if !questions.is_empty() => {
                    yield StreamEvent::FollowUp { follow_up_questions: questions };
                }
                Ok(_) => {}
                Err(e) => debug!("follow-up generation failed: {}", e),
            }

            yield StreamEvent::Usage { usage: outcome.usage.clone() };

            // Persist the assistant message only now that the stream completed
            if let Err(e) = self
                .repository
                .append_message(session_id, "assistant", &outcome.answer)
                .await
            {
                yield StreamEvent::Error { error: e.to_string() };
                return;
            }

            info!(session_id = %session_id, "chat turn complete");
            yield StreamEvent::Done {
                session_id,
                metadata: json!({
                    "reasoning_mode": match request.reasoning_mode {
                        ReasoningMode::Standard => "standard",
                        ReasoningMode::Deep => "deep",
                    },
                    "source_count": outcome.results.len(),
                }),
            };
        }
    }

    /// Collected, non-streaming variant for `stream = false` requests.
    pub async fn complete(
        self: Arc<Self>,
        user_id: Uuid,
        request: ChatRequest,
    ) -> Result<crate::models::chat::ChatCompletionResponse, ApiError> {
        let mut stream = Box::pin(self.run(user_id, request));
        let mut content = String::new();
        let mut sources = Vec::new();
        let mut usage = Usage::default();
        let mut session_id = None;
        let mut error = None;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta { content: delta } => content.push_str(&delta),
                StreamEvent::Sources { sources: s } => sources = s,
                StreamEvent::Usage { usage: u } => usage = u,
                StreamEvent::Done { session_id: id, .. } => session_id = Some(id),
                StreamEvent::Error { error: e } => error = Some(e),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Err(ApiError::Upstream(error));
        }
        let session_id =
            session_id.ok_or_else(|| ApiError::Internal("stream ended without done".to_string()))?;

        Ok(crate::models::chat::ChatCompletionResponse {
            session_id,
            content,
            sources,
            usage,
        })
    }

    async fn resolve_session(
        &self,
        user_id: Uuid,
        request: &ChatRequest,
        message: &str,
    ) -> Result<ChatSessionRow, ApiError> {
        if let Some(session_id) = request.session_id {
            return self
                .repository
                .get_session(user_id, session_id)
                .await?
                .ok_or_else(|| ApiError::NotFound("session not found".to_string()));
        }

        // First message becomes the title
        let title: String = message.chars().take(SESSION_TITLE_MAX_CHARS).collect();
        let session = self
            .repository
            .create_session(user_id, request.collection_id, Some(title.trim()))
            .await?;
        Ok(session)
    }

    /// Retrieval through generation. Emits `delta`, `reasoning_step` and
    /// `sub_query` events through the progress channel as they happen.
    async fn execute_turn(
        &self,
        user_id: Uuid,
        _session_id: Uuid,
        request: &ChatRequest,
        message: &str,
        history: &[ChatMessageRow],
        progress: flume::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, ApiError> {
        // 1. Reformulate (context-aware when prior turns exist)
        let query = self.reformulated_query(message, history).await;

        // 2. Retrieve, standard or deep
        let mut results = match request.reasoning_mode {
            ReasoningMode::Standard => self.retrieve(user_id, request, &query).await?,
            ReasoningMode::Deep => {
                self.deep_retrieve(user_id, request, &query, &progress).await?
            }
        };

        // 3. Rerank when enabled
        if request.retrieval.rerank {
            if let Some(reranker) = &self.reranker {
                match reranker.rerank(&query, results.clone()).await {
                    Ok(reranked) => results = reranked,
                    Err(e) => warn!("rerank failed, continuing unreranked: {}", e),
                }
            }
        }

        // 4. Graph context, already synthesized, for the prompt head
        let graph_context = if request.retrieval.enable_graph
            && request.retrieval.mode != RetrievalMode::Graph
        {
            self.graph_context(user_id, request, &query).await
        } else {
            None
        };

        // 5. Assemble the prompt and trim history to the token budget
        let system_prompt = PromptAssembler::build_system_prompt(
            &results,
            request.preset,
            graph_context.as_deref(),
            request.custom_system_prompt.as_deref(),
            request.custom_instruction.as_deref(),
            request.is_follow_up,
            None,
        );
        let messages = self.build_messages(&system_prompt, history, message);

        // 6. Stream tokens, capped per user
        let params = self.generation_params(request);
        let semaphore = self.limiters.llm_for_user(user_id);
        let (_permit, wait) =
            Limiters::acquire_timed(semaphore, self.limiters.acquire_timeout, "llm_stream")
                .await
                .map_err(|e| ApiError::Upstream(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_stream", "wait_queue");

        let mut token_stream = self.chat_model.stream(messages.clone(), &params).await?;
        let mut answer = String::new();
        while let Some(delta) = token_stream.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            answer.push_str(&delta);
            let _ = progress.send(StreamEvent::Delta { content: delta });
        }

        if answer.trim().is_empty() {
            return Err(ApiError::Upstream("model returned no content".to_string()));
        }

        // 7. Usage accounting (estimator-based)
        let prompt_tokens: usize = messages
            .iter()
            .map(|m| token_estimator::estimate_tokens(&m.content))
            .sum();
        let completion_tokens = token_estimator::estimate_tokens(&answer);
        let retrieval_tokens: usize = results
            .iter()
            .map(|r| token_estimator::estimate_tokens(&r.content))
            .sum();
        let usage = Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            retrieval_tokens,
        };

        Ok(TurnOutcome {
            answer,
            results,
            usage,
        })
    }

    async fn reformulated_query(&self, message: &str, history: &[ChatMessageRow]) -> String {
        let turns: Vec<(String, String)> = history
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();

        let reformulated = if turns.is_empty() {
            self.reformulator
                .reformulate(message, ReformulationMode::Expand)
                .await
        } else {
            self.reformulator
                .reformulate_with_context(message, &turns, ReformulationMode::Expand)
                .await
        };

        match reformulated {
            Reformulated::One(query) => query,
            Reformulated::Many(queries) => queries.into_iter().next().unwrap_or_else(|| message.to_string()),
        }
    }

    fn retrieval_request(&self, request: &ChatRequest, query: &str) -> RetrievalRequest {
        let mode = if request.retrieval.hierarchical {
            RetrievalMode::Hierarchical
        } else {
            request.retrieval.mode
        };
        RetrievalRequest {
            query: query.to_string(),
            mode,
            top_k: request.effective_top_k(self.config.max_top_k),
            collection_id: request.collection_id,
            metadata_filter: request.retrieval.metadata_filter.clone(),
        }
    }

    async fn retrieve(
        &self,
        user_id: Uuid,
        request: &ChatRequest,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        let retrieval_request = self.retrieval_request(request, query);
        let mut response = self.engine.retrieve(user_id, &retrieval_request).await?;
        if request.retrieval.expand_context {
            self.engine.expand_context(&mut response.results).await;
        }
        Ok(response.results)
    }

    /// Deep mode: iterate sub-query generation and retrieval, merging by
    /// chunk id with max-score combination, then generate once.
    async fn deep_retrieve(
        &self,
        user_id: Uuid,
        request: &ChatRequest,
        query: &str,
        progress: &flume::Sender<StreamEvent>,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        let iterations = self.config.deep_max_iterations.clamp(1, 3);

        let _ = progress.send(StreamEvent::ReasoningStep {
            step: 1,
            description: "initial retrieval".to_string(),
        });
        let mut merged: HashMap<Uuid, RetrievalResult> = HashMap::new();
        for result in self.retrieve(user_id, request, query).await? {
            merged.insert(result.chunk_id, result);
        }

        for iteration in 2..=iterations {
            let sub_queries = self.sub_queries(query, &merged).await;
            if sub_queries.is_empty() {
                break;
            }
            let _ = progress.send(StreamEvent::ReasoningStep {
                step: iteration,
                description: format!("exploring {} sub-queries", sub_queries.len()),
            });

            for sub_query in sub_queries {
                let _ = progress.send(StreamEvent::SubQuery {
                    query: sub_query.clone(),
                });
                match self.retrieve(user_id, request, &sub_query).await {
                    Ok(results) => {
                        for result in results {
                            merged
                                .entry(result.chunk_id)
                                .and_modify(|existing| {
                                    // Scores combine by max
                                    if result.score > existing.score {
                                        existing.score = result.score;
                                    }
                                })
                                .or_insert(result);
                        }
                    }
                    Err(e) => warn!("sub-query retrieval failed: {}", e),
                }
            }
        }

        let mut results: Vec<RetrievalResult> = merged.into_values().collect();
        crate::retrieval::engine::sort_results(&mut results);
        results.truncate(request.effective_top_k(self.config.max_top_k));
        Ok(results)
    }

    async fn sub_queries(
        &self,
        query: &str,
        merged: &HashMap<Uuid, RetrievalResult>,
    ) -> Vec<String> {
        let context: String = merged
            .values()
            .take(3)
            .map(|r| r.content.chars().take(200).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Question: {}\n\nInitial context:\n{}\n\nList up to {} additional search \
             queries that would fill gaps in the context, as a JSON array of strings. \
             Output [] if the context is already sufficient.",
            query, context, SUB_QUERIES_PER_ITERATION
        );

        let params = GenerationParams {
            temperature: Some(0.3),
            max_tokens: Some(150),
            ..Default::default()
        };
        let output = match self
            .chat_model
            .complete(vec![ChatMessage::user(prompt)], &params)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("sub-query generation failed: {}", e);
                return Vec::new();
            }
        };

        parse_json_array(&output)
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .filter(|q| !q.trim().is_empty())
            .take(SUB_QUERIES_PER_ITERATION)
            .collect()
    }

    /// Prior turns, newest kept first within the token budget, oldest
    /// dropped.
    fn build_messages(
        &self,
        system_prompt: &str,
        history: &[ChatMessageRow],
        message: &str,
    ) -> Vec<ChatMessage> {
        let budget = self.config.history_token_budget;
        let mut kept: Vec<&ChatMessageRow> = Vec::new();
        let mut used = 0usize;
        for row in history.iter().rev() {
            let tokens = token_estimator::estimate_tokens(&row.content);
            if used + tokens > budget {
                break;
            }
            used += tokens;
            kept.push(row);
        }
        kept.reverse();

        let mut messages = Vec::with_capacity(kept.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        for row in kept {
            messages.push(ChatMessage {
                role: row.role.clone(),
                content: row.content.clone(),
            });
        }
        messages.push(ChatMessage::user(message));
        messages
    }

    fn generation_params(&self, request: &ChatRequest) -> GenerationParams {
        GenerationParams {
            model: request.generation.model.clone().or_else(|| request.model.clone()),
            temperature: request.generation.temperature.or(request.temperature),
            max_tokens: request.generation.max_tokens.or(request.max_tokens),
            top_p: request.generation.top_p,
            frequency_penalty: request.generation.frequency_penalty,
            presence_penalty: request.generation.presence_penalty,
        }
    }

    async fn graph_context(
        &self,
        user_id: Uuid,
        request: &ChatRequest,
        query: &str,
    ) -> Option<String> {
        let graph_request = RetrievalRequest {
            query: query.to_string(),
            mode: RetrievalMode::Graph,
            top_k: 5,
            collection_id: request.collection_id,
            metadata_filter: request.retrieval.metadata_filter.clone(),
        };
        match self.engine.retrieve(user_id, &graph_request).await {
            Ok(response) if !response.results.is_empty() => {
                let synthesis = response
                    .results
                    .iter()
                    .map(|r| format!("- {}", r.content.chars().take(300).collect::<String>()))
                    .collect::<Vec<_>>()
                    .join("\n");
                Some(synthesis)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("graph context retrieval failed: {}", e);
                None
            }
        }
    }

    fn sources_from(results: &[RetrievalResult]) -> Vec<SourceRef> {
        results
            .iter()
            .map(|r| SourceRef {
                document_id: r.document.id,
                title: r.document.title.clone(),
                filename: r.document.filename.clone(),
                chunk_index: r.chunk_index,
                score: r.score,
            })
            .collect()
    }

    /// Structured references to images/tables/figures found in the
    /// retrieved chunks.
    fn media_from(results: &[RetrievalResult]) -> Vec<MediaRef> {
        let mut media = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for result in results {
            // Figures recorded on the document at ingestion
            if let Some(items) = result.document.metadata.get("media").and_then(|m| m.as_array()) {
                for item in items {
                    let media_type = item
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("figure")
                        .to_string();
                    let page_number = item.get("page_number").and_then(|p| p.as_u64());
                    if !seen.insert((result.document.id, media_type.clone(), page_number)) {
                        continue;
                    }
                    media.push(MediaRef {
                        media_type,
                        source_document_id: result.document.id,
                        description: item
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(String::from),
                        page_number,
                        url: None,
                        content_preview: None,
                    });
                }
            }

            // Table blocks annotated by the domain processors
            let has_table = result
                .metadata
                .as_array()
                .is_some_and(|annotations| {
                    annotations
                        .iter()
                        .any(|a| a.get("type").and_then(|t| t.as_str()) == Some("table_block"))
                });
            if has_table && seen.insert((result.document.id, "table".to_string(), None)) {
                media.push(MediaRef {
                    media_type: "table".to_string(),
                    source_document_id: result.document.id,
                    description: None,
                    page_number: None,
                    url: None,
                    content_preview: Some(result.content.chars().take(160).collect()),
                });
            }
        }
        media
    }

    /// Short LLM call for suggested follow-up questions; parsed leniently.
    async fn follow_ups(
        &self,
        message: &str,
        answer: &str,
    ) -> Result<Vec<FollowUpQuestion>, ApiError> {
        let count = self.config.follow_up_count;
        if count == 0 {
            return Ok(Vec::new());
        }

        let answer_head: String = answer.chars().take(1500).collect();
        let prompt = format!(
            "The user asked: {}\nThe assistant answered:\n{}\n\nSuggest {} short \
             follow-up questions the user might ask next. Respond with a JSON array \
             of objects with keys \"question\" and \"relevance\" (0 to 1).",
            message, answer_head, count
        );
        let params = GenerationParams {
            temperature: Some(0.7),
            max_tokens: Some(200),
            ..Default::default()
        };
        let output = self
            .chat_model
            .complete(vec![ChatMessage::user(prompt)], &params)
            .await?;

        let mut questions: Vec<FollowUpQuestion> = parse_json_array(&output)
            .into_iter()
            .filter_map(|v| {
                let question = v.get("question")?.as_str()?.to_string();
                let relevance = v
                    .get("relevance")
                    .and_then(|r| r.as_f64())
                    .unwrap_or(0.5) as f32;
                Some(FollowUpQuestion {
                    question,
                    relevance: relevance.clamp(0.0, 1.0),
                })
            })
            .collect();
        questions.truncate(count);
        Ok(questions)
    }
}

/// Extract the first JSON array from possibly noisy model output.
fn parse_json_array(output: &str) -> Vec<serde_json::Value> {
    let start = match output.find('[') {
        Some(start) => start,
        None => return Vec::new(),
    };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in output[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else {
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &output[start..=start + i];
                    return serde_json::from_str::<serde_json::Value>(candidate)
                        .ok()
                        .and_then(|v| v.as_array().cloned())
                        .unwrap_or_default();
                }
            }
            _ => {}
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_and_noisy_json_arrays() {
        assert_eq!(parse_json_array(r#"["a", "b"]"#).len(), 2);
        assert_eq!(
            parse_json_array("Here you go:\n[{\"question\": \"q\", \"relevance\": 0.8}]\nEnjoy!")
                .len(),
            1
        );
        assert!(parse_json_array("no array here").is_empty());
        assert!(parse_json_array("[broken").is_empty());
    }

    #[test]
    fn nested_arrays_resolve_to_the_outermost() {
        let parsed = parse_json_array(r#"[["x"], ["y"]]"#);
        assert_eq!(parsed.len(), 2);
    }
}
