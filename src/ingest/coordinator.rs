//! The ingestion coordinator: drives a document through
//! `pending -> processing -> completed | failed`, deduplicates on content
//! and source-locator hashes, and keeps every index in step.

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::content::chunker::{Chunker, ChunkerConfig};
use crate::content::parser::{ParsedFile, ParserFactory};
use crate::content::processor::ProcessorFactory;
use crate::content::{resolve_content_type, ExtractedImage};
use crate::database::{DocumentRow, DocumentStatus, NewChunk, Repository};
use crate::index::{BlobStore, GraphIndex, KeywordIndex};
use crate::ingest::summary::DocumentSummaryService;
use crate::llm::{Embedder, VisionPort};
use crate::models::document::DocumentStatusResponse;
use crate::utils::error::ApiError;

/// A submitted payload, before any processing.
pub struct IngestRequest {
    pub user_id: Uuid,
    pub collection_id: Uuid,
    pub filename: String,
    pub declared_content_type: Option<String>,
    pub data: Vec<u8>,
    pub title: Option<String>,
    pub metadata: Value,
    /// Set when the payload is a URL rather than file bytes.
    pub source_url: Option<String>,
}

struct ProcessingJob {
    document_id: Uuid,
    collection_id: Uuid,
    user_id: Uuid,
    filename: String,
    content_type: String,
    data: Vec<u8>,
    chunker_config: ChunkerConfig,
    expected_dimension: usize,
}

pub struct IngestionCoordinator {
    repository: Arc<Repository>,
    blob_store: Arc<BlobStore>,
    parser_factory: Arc<ParserFactory>,
    processor_factory: Arc<ProcessorFactory>,
    chunker: Arc<Chunker>,
    embedder: Arc<dyn Embedder>,
    vision: Arc<dyn VisionPort>,
    keyword_index: Arc<KeywordIndex>,
    graph_index: Arc<dyn GraphIndex>,
    summary_service: Arc<DocumentSummaryService>,
    config: IngestionConfig,
    jobs: flume::Sender<ProcessingJob>,
    job_receiver: flume::Receiver<ProcessingJob>,
    /// Writer locks serializing index writes per collection.
    collection_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl IngestionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<Repository>,
        blob_store: Arc<BlobStore>,
        parser_factory: Arc<ParserFactory>,
        processor_factory: Arc<ProcessorFactory>,
        chunker: Arc<Chunker>,
        embedder: Arc<dyn Embedder>,
        vision: Arc<dyn VisionPort>,
        keyword_index: Arc<KeywordIndex>,
        graph_index: Arc<dyn GraphIndex>,
        summary_service: Arc<DocumentSummaryService>,
        config: IngestionConfig,
        queue_capacity: usize,
    ) -> Self {
        let (jobs, job_receiver) = flume::bounded(queue_capacity.max(1));
        Self {
            repository,
            blob_store,
            parser_factory,
            processor_factory,
            chunker,
            embedder,
            vision,
            keyword_index,
            graph_index,
            summary_service,
            config,
            jobs,
            job_receiver,
            collection_locks: DashMap::new(),
        }
    }

    /// Spawn the worker pool draining the processing queue. Documents are
    /// processed strictly sequentially within a job, in parallel across
    /// jobs up to the worker cap.
    pub fn start_workers(self: &Arc<Self>, worker_count: usize) {
        for worker_id in 0..worker_count.max(1) {
            let coordinator = self.clone();
            let receiver = self.job_receiver.clone();
            tokio::spawn(async move {
                debug!("ingest worker {} started", worker_id);
                while let Ok(job) = receiver.recv_async().await {
                    let document_id = job.document_id;
                    if let Err(e) = coordinator.process(job).await {
                        error!("worker {}: document {} failed: {}", worker_id, document_id, e);
                    }
                }
                debug!("ingest worker {} stopped", worker_id);
            });
        }
    }

    fn collection_lock(&self, collection_id: Uuid) -> Arc<Mutex<()>> {
        self.collection_locks
            .entry(collection_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Submit a payload. Returns the pending document immediately; parsing,
    /// chunking, embedding and indexing happen on the worker pool. The call
    /// itself never fails due to downstream processing.
    pub async fn submit(&self, request: IngestRequest) -> Result<DocumentRow, ApiError> {
        // 1. Resolve and validate the content type
        let prefix: Vec<u8> = request.data.iter().take(512).copied().collect();
        let content_type = resolve_content_type(
            &request.filename,
            Some(&prefix),
            request.declared_content_type.as_deref(),
        );
        if !self.parser_factory.supports(&content_type) {
            return Err(ApiError::Validation(format!(
                "unsupported content type: {}",
                content_type
            )));
        }
        self.validate_magic(&request.data, &content_type)?;

        if request.data.is_empty() {
            return Err(ApiError::invalid_field("file", "must not be empty"));
        }

        // 2. Hashes for dedupe
        let content_hash = Self::sha256_hex(&request.data);
        let unique_identifier_hash = request
            .source_url
            .as_deref()
            .map(|url| Self::sha256_hex(url.as_bytes()));

        // 3. Content-level dedupe: identical payload returns the prior
        //    document untouched
        if let Some(existing) = self
            .repository
            .find_document_by_content_hash(request.user_id, &content_hash)
            .await?
        {
            return self.handle_existing(existing, &request).await;
        }

        // 4. Source-locator dedupe: the same URL updates in place rather
        //    than duplicating
        if let Some(uih) = &unique_identifier_hash {
            if let Some(existing) = self
                .repository
                .find_document_by_unique_identifier(request.user_id, uih)
                .await?
            {
                return self.reingest_url_document(existing, request, content_hash).await;
            }
        }

        let collection = self
            .repository
            .get_collection(request.user_id, request.collection_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("collection not found".to_string()))?;
        let collection_config = collection.parsed_config();

        // 5. Create the pending row
        let document = self
            .repository
            .insert_document(
                request.collection_id,
                request.user_id,
                request.title.as_deref(),
                Some(&request.filename),
                &content_type,
                request.data.len() as i64,
                &content_hash,
                unique_identifier_hash.as_deref(),
                request.metadata.clone(),
            )
            .await?;

        // A dedupe race may hand back someone else's completed row
        if document.status != DocumentStatus::Pending.as_str() {
            return Ok(document);
        }

        // 6. Blob first; every later write can be rolled back against it
        let stored_name = self
            .blob_store
            .put(
                request.user_id,
                document.document_id,
                &request.filename,
                &content_hash,
                &request.data,
            )
            .await?;
        debug!("blob stored as {}", stored_name);

        // 7. Queue for processing
        self.enqueue(&document, &collection_config, request.data)?;

        info!(
            "document {} submitted ({} bytes, {})",
            document.document_id, document.size_bytes, document.content_type
        );
        Ok(document)
    }

    /// Declared/extension type must be consistent with the sniffed content;
    /// executables never pass.
    fn validate_magic(&self, data: &[u8], content_type: &str) -> Result<(), ApiError> {
        let Some(kind) = infer::get(data) else {
            // Plain text and URLs have no magic signature
            return Ok(());
        };
        let sniffed = kind.mime_type();

        if matches!(
            sniffed,
            "application/x-executable" | "application/x-msdownload" | "application/vnd.microsoft.portable-executable"
        ) {
            return Err(ApiError::Validation(
                "executable files are not accepted".to_string(),
            ));
        }

        // Office formats sniff as zip; text formats sniff as nothing. Only
        // flag a hard mismatch between two confident detections.
        let compatible = sniffed == content_type
            || sniffed == "application/zip"
            || content_type.starts_with("text/")
            || content_type == "application/json"
            || content_type == "application/jsonl"
            || sniffed.split('/').next() == content_type.split('/').next();
        if !compatible {
            return Err(ApiError::Validation(format!(
                "declared type {} does not match detected content type {}",
                content_type, sniffed
            )));
        }
        Ok(())
    }

    async fn handle_existing(
        &self,
        existing: DocumentRow,
        request: &IngestRequest,
    ) -> Result<DocumentRow, ApiError> {
        match DocumentStatus::parse(&existing.status) {
            Some(DocumentStatus::Failed) => {
                // Explicit retry path: failed -> pending -> processing
                info!("retrying failed document {}", existing.document_id);
                let collection = self
                    .repository
                    .get_collection(request.user_id, existing.collection_id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound("collection not found".to_string()))?;
                self.enqueue(&existing, &collection.parsed_config(), request.data.clone())?;
                Ok(existing)
            }
            _ => {
                // Same-URL resubmission may still refresh metadata
                let has_metadata = request
                    .metadata
                    .as_object()
                    .is_some_and(|m| !m.is_empty());
                if request.source_url.is_some() && has_metadata {
                    if let Some(updated) = self
                        .repository
                        .update_document_meta(
                            request.user_id,
                            existing.document_id,
                            request.title.as_deref(),
                            Some(request.metadata.clone()),
                        )
                        .await?
                    {
                        return Ok(updated);
                    }
                }
                debug!(
                    "dedupe hit: returning existing document {}",
                    existing.document_id
                );
                Ok(existing)
            }
        }
    }

    /// Same URL, new content: drop the old derived data and reprocess under
    /// the same document id.
    async fn reingest_url_document(
        &self,
        existing: DocumentRow,
        request: IngestRequest,
        content_hash: String,
    ) -> Result<DocumentRow, ApiError> {
        info!("re-ingesting URL document {}", existing.document_id);

        let collection = self
            .repository
            .get_collection(request.user_id, existing.collection_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("collection not found".to_string()))?;

        let updated = self
            .repository
            .update_document_meta(
                request.user_id,
                existing.document_id,
                request.title.as_deref(),
                Some(request.metadata.clone()),
            )
            .await?
            .unwrap_or(existing);

        if let Err(e) = self
            .repository
            .update_document_content_hash(
                updated.document_id,
                &content_hash,
                request.data.len() as i64,
            )
            .await
        {
            // Another document of this user already has the new payload;
            // keep the old hash and reprocess anyway
            warn!("could not update content hash: {}", e);
        }

        self.rollback_derived_data(&updated).await;
        self.repository.clear_document_summary(updated.document_id).await?;
        self.enqueue(&updated, &collection.parsed_config(), request.data)?;
        Ok(updated)
    }

    fn enqueue(
        &self,
        document: &DocumentRow,
        collection_config: &crate::models::collection::CollectionConfig,
        data: Vec<u8>,
    ) -> Result<(), ApiError> {
        let job = ProcessingJob {
            document_id: document.document_id,
            collection_id: document.collection_id,
            user_id: document.user_id,
            filename: document.filename.clone().unwrap_or_default(),
            content_type: document.content_type.clone(),
            data,
            chunker_config: ChunkerConfig {
                target_tokens: collection_config
                    .chunk_size_tokens
                    .unwrap_or(self.config.chunk_size_tokens),
                overlap_tokens: collection_config
                    .chunk_overlap_tokens
                    .unwrap_or(self.config.chunk_overlap_tokens),
            },
            expected_dimension: collection_config
                .embedding_dimension
                .unwrap_or_else(|| self.embedder.dimension()),
        };
        self.jobs
            .try_send(job)
            .map_err(|_| ApiError::Internal("ingestion queue is full".to_string()))
    }

    /// One document, strictly sequential: parse -> classify -> chunk ->
    /// embed -> write indexes -> summary.
    async fn process(&self, job: ProcessingJob) -> anyhow::Result<()> {
        // At-most-one worker per document
        if !self
            .repository
            .claim_document_for_processing(job.document_id)
            .await?
        {
            debug!("document {} already claimed, skipping", job.document_id);
            return Ok(());
        }

        match self.run_pipeline(&job).await {
            Ok(processing_info) => {
                self.repository
                    .mark_document_completed(job.document_id, processing_info)
                    .await?;
                self.repository
                    .refresh_collection_document_count(job.collection_id)
                    .await?;
                info!("document {} completed", job.document_id);
                Ok(())
            }
            Err(e) => {
                warn!("document {} failed: {}", job.document_id, e);
                // Remove any partial writes before flipping the status
                if let Ok(Some(document)) = self
                    .repository
                    .get_document(job.user_id, job.document_id)
                    .await
                {
                    self.rollback_derived_data(&document).await;
                }
                self.repository
                    .mark_document_failed(
                        job.document_id,
                        json!({"stage": "failed", "error": e.to_string()}),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn run_pipeline(&self, job: &ProcessingJob) -> anyhow::Result<Value> {
        let mut info = Map::new();

        // Parse
        self.stage(job.document_id, "parsing").await;
        let parser = self
            .parser_factory
            .parser_for(&job.content_type)
            .ok_or_else(|| anyhow::anyhow!("no parser for {}", job.content_type))?;
        let temp_path = self.write_temp(job).await?;
        let parse_result = parser.parse(&temp_path).await;
        let _ = tokio::fs::remove_file(&temp_path).await;
        let mut parsed = parse_result?;

        info.insert("parser".to_string(), json!(parser.name()));
        for (key, value) in &parsed.metadata {
            info.insert(key.clone(), value.clone());
        }
        // Parser metadata (extraction method, sheets, duration, ...) is also
        // queryable on the document itself
        if !parsed.metadata.is_empty() {
            self.repository
                .merge_document_metadata(
                    job.document_id,
                    Value::Object(parsed.metadata.clone()),
                )
                .await?;
        }

        // Figure descriptions from extracted images are appended as their
        // own sections; service errors surface in metadata, not as failures
        let media = self.describe_images(&mut parsed).await;
        if !media.is_empty() {
            info.insert("media".to_string(), json!(media));
            // Surfaced on the document metadata so retrieval results carry it
            self.repository
                .merge_document_metadata(job.document_id, json!({"media": media}))
                .await?;
        }

        if parsed.content.trim().is_empty() {
            anyhow::bail!("no text content found in document");
        }

        // Classify
        self.stage(job.document_id, "classifying").await;
        let processed = if self.config.domain_processors_enabled {
            let (processor, confidence) = self
                .processor_factory
                .select(&parsed.content, &parsed.metadata);
            let mut processed = processor
                .process(&parsed.content, &parsed.metadata, Some(&job.filename))
                .await?;
            processed.confidence = confidence;
            processed
        } else {
            crate::content::ProcessedDocument::passthrough(&parsed.content, "general", 0.0)
        };
        info.insert("processor".to_string(), json!(processed.processor_name));
        info.insert("confidence".to_string(), json!(processed.confidence));
        if !processed.document_metadata.is_empty() {
            self.repository
                .merge_document_metadata(
                    job.document_id,
                    Value::Object(processed.document_metadata.clone()),
                )
                .await?;
        }

        // Chunk
        self.stage(job.document_id, "chunking").await;
        let boundaries = processed.hard_boundaries();
        let chunks = self
            .chunker
            .chunk(&processed.content, &job.chunker_config, &boundaries)?;
        if chunks.is_empty() {
            anyhow::bail!("document produced no chunks");
        }
        info.insert("chunk_count".to_string(), json!(chunks.len()));

        // Embed
        self.stage(job.document_id, "embedding").await;
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed_texts(texts)
            .await
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;
        for embedding in &embeddings {
            if embedding.len() != job.expected_dimension {
                anyhow::bail!(
                    "embedding dimension {} does not match collection config {}",
                    embedding.len(),
                    job.expected_dimension
                );
            }
        }

        let annotations_json = json!(processed.annotations);
        let new_chunks: Vec<NewChunk> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| NewChunk {
                chunk_index: chunk.chunk_index as i32,
                content: chunk.content.clone(),
                token_count: chunk.tokens as i32,
                embedding,
                metadata: json!({
                    "page_count": parsed.page_count,
                }),
                annotations: annotations_json.clone(),
            })
            .collect();

        // Writes are ordered: chunks+vectors -> keyword -> graph, under the
        // collection writer lock
        self.stage(job.document_id, "indexing").await;
        {
            let lock = self.collection_lock(job.collection_id);
            let _guard = lock.lock().await;

            self.repository
                .insert_chunks(job.document_id, job.collection_id, &new_chunks)
                .await?;

            let stored = self
                .repository
                .all_chunk_ids_for_document(job.document_id)
                .await?;
            for (chunk_id, content) in &stored {
                self.keyword_index
                    .index_chunk(job.collection_id, *chunk_id, content);
                self.graph_index
                    .index_chunk(job.collection_id, *chunk_id, content)
                    .await;
            }
        }

        // Summary last; failure leaves the document out of hierarchical
        // retrieval but otherwise complete
        self.stage(job.document_id, "summarizing").await;
        self.summary_service
            .generate(job.document_id, &processed.content)
            .await;

        info.insert("stage".to_string(), json!("completed"));
        Ok(Value::Object(info))
    }

    /// Vision descriptions for parser-extracted images. Appended to content
    /// as figure sections; failures land in the returned media list.
    async fn describe_images(&self, parsed: &mut ParsedFile) -> Vec<Value> {
        let images: Vec<ExtractedImage> = std::mem::take(&mut parsed.images);
        if images.is_empty() || !self.vision.available() {
            return Vec::new();
        }

        let mut media = Vec::new();
        for image in images {
            match self.vision.describe_image(&image.bytes, &image.format).await {
                Ok(described) => {
                    parsed.content.push_str(&format!(
                        "\n\nFigure (page {}): {}\n",
                        image.page, described.description
                    ));
                    if let Some(ocr) = &described.ocr_text {
                        parsed.content.push_str(ocr);
                        parsed.content.push('\n');
                    }
                    media.push(json!({
                        "type": "figure",
                        "page_number": image.page,
                        "filename": image.filename,
                        "description": described.description,
                    }));
                }
                Err(e) => {
                    media.push(json!({
                        "type": "figure",
                        "page_number": image.page,
                        "filename": image.filename,
                        "error": e.to_string(),
                    }));
                }
            }
        }
        media
    }

    async fn write_temp(&self, job: &ProcessingJob) -> anyhow::Result<std::path::PathBuf> {
        let dir = self
            .config
            .temp_dir
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&dir).await?;
        let extension = std::path::Path::new(&job.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let path = dir.join(format!("ingest_{}.{}", job.document_id, extension));
        tokio::fs::write(&path, &job.data).await?;
        Ok(path)
    }

    async fn stage(&self, document_id: Uuid, stage: &str) {
        if let Err(e) = self
            .repository
            .update_document_processing_stage(document_id, stage)
            .await
        {
            warn!("failed to record stage {} for {}: {}", stage, document_id, e);
        }
    }

    /// Remove chunks and index entries for a document (failure rollback and
    /// URL re-ingest both funnel through here).
    async fn rollback_derived_data(&self, document: &DocumentRow) {
        match self
            .repository
            .all_chunk_ids_for_document(document.document_id)
            .await
        {
            Ok(stored) => {
                let chunk_ids: Vec<Uuid> = stored.iter().map(|(id, _)| *id).collect();
                self.keyword_index
                    .remove_chunks(document.collection_id, &chunk_ids);
                self.graph_index
                    .remove_chunks(document.collection_id, chunk_ids)
                    .await;
            }
            Err(e) => warn!("failed to enumerate chunks for rollback: {}", e),
        }
        if let Err(e) = self
            .repository
            .delete_chunks_for_document(document.document_id)
            .await
        {
            warn!("failed to delete chunks for {}: {}", document.document_id, e);
        }
    }

    /// Full delete: row (cascading to chunks), blob, and index entries.
    pub async fn delete_document(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<bool, ApiError> {
        let Some(document) = self.repository.get_document(user_id, document_id).await? else {
            return Ok(false);
        };

        self.rollback_derived_data(&document).await;
        self.repository.delete_document(user_id, document_id).await?;
        self.blob_store.delete_document(user_id, document_id).await?;
        self.repository
            .refresh_collection_document_count(document.collection_id)
            .await?;
        info!("document {} deleted", document_id);
        Ok(true)
    }

    pub async fn get_status(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<DocumentStatusResponse, ApiError> {
        let status = self
            .repository
            .document_status(user_id, document_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("document not found".to_string()))?;

        let error_message = status
            .processing_info
            .get("error")
            .and_then(|e| e.as_str())
            .map(String::from);

        Ok(DocumentStatusResponse {
            status: status.status,
            chunk_count: status.chunk_count,
            total_tokens: status.total_tokens,
            error_message,
            created_at: status.created_at,
            processed_at: status.processed_at,
        })
    }

    /// Rebuild the in-process keyword and graph indexes from the relational
    /// store. Called once at startup.
    pub async fn rebuild_indexes(&self) -> anyhow::Result<usize> {
        let chunks = self.repository.all_completed_chunks().await?;
        let count = chunks.len();
        for chunk in chunks {
            self.keyword_index
                .index_chunk(chunk.collection_id, chunk.chunk_id, &chunk.content);
            self.graph_index
                .index_chunk(chunk.collection_id, chunk.chunk_id, &chunk.content)
                .await;
        }
        info!("rebuilt in-process indexes from {} chunks", count);
        Ok(count)
    }
}
