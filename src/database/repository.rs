use anyhow::Result;
use pgvector::Vector;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::models::{
    ChatMessageRow, ChatSessionRow, ChunkRow, CollectionRow, DocumentRow, DocumentStatusRow,
    DocumentSummaryHit, ScoredChunkRow, UserRow,
};
use super::DbPool;

/// A chunk ready for insertion, produced by the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub content: String,
    pub token_count: i32,
    pub embedding: Vec<f32>,
    pub metadata: Value,
    pub annotations: Value,
}

pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        self.pool.get_pool()
    }

    // ===== Users =====

    pub async fn create_user(
        &self,
        email: &str,
        credential_hash: &str,
        api_key_hash: &str,
        api_key_prefix: &str,
    ) -> Result<UserRow, sqlx::Error> {
        sqlx::query_as::<_, UserRow>(
            r#"INSERT INTO users (email, credential_hash, api_key_hash, api_key_prefix)
               VALUES ($1, $2, $3, $4)
               RETURNING user_id, email, credential_hash, api_key_hash, api_key_prefix, created_at"#,
        )
        .bind(email)
        .bind(credential_hash)
        .bind(api_key_hash)
        .bind(api_key_prefix)
        .fetch_one(self.pool())
        .await
    }

    pub async fn find_user_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(
            r#"SELECT user_id, email, credential_hash, api_key_hash, api_key_prefix, created_at
               FROM users WHERE api_key_hash = $1"#,
        )
        .bind(api_key_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(user)
    }

    // ===== Collections =====

    pub async fn create_collection(
        &self,
        user_id: Uuid,
        name: &str,
        description: Option<&str>,
        metadata: Value,
        config: Value,
    ) -> Result<CollectionRow> {
        let row = sqlx::query_as::<_, CollectionRow>(
            r#"INSERT INTO collections (user_id, name, description, metadata, config)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING collection_id, user_id, name, description, metadata, config,
                         document_count, created_at, updated_at"#,
        )
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(metadata)
        .bind(config)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_collection(
        &self,
        user_id: Uuid,
        collection_id: Uuid,
    ) -> Result<Option<CollectionRow>> {
        let row = sqlx::query_as::<_, CollectionRow>(
            r#"SELECT collection_id, user_id, name, description, metadata, config,
                      document_count, created_at, updated_at
               FROM collections WHERE collection_id = $1 AND user_id = $2"#,
        )
        .bind(collection_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_collections(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<CollectionRow>, i64)> {
        let rows = sqlx::query_as::<_, CollectionRow>(
            r#"SELECT collection_id, user_id, name, description, metadata, config,
                      document_count, created_at, updated_at
               FROM collections WHERE user_id = $1
               ORDER BY created_at DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM collections WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;

        Ok((rows, total))
    }

    pub async fn update_collection(
        &self,
        user_id: Uuid,
        collection_id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        metadata: Option<Value>,
        config: Option<Value>,
    ) -> Result<Option<CollectionRow>> {
        let row = sqlx::query_as::<_, CollectionRow>(
            r#"UPDATE collections SET
                   name        = COALESCE($3, name),
                   description = COALESCE($4, description),
                   metadata    = COALESCE($5, metadata),
                   config      = COALESCE($6, config),
                   updated_at  = now()
               WHERE collection_id = $1 AND user_id = $2
               RETURNING collection_id, user_id, name, description, metadata, config,
                         document_count, created_at, updated_at"#,
        )
        .bind(collection_id)
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(metadata)
        .bind(config)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn delete_collection(&self, user_id: Uuid, collection_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM collections WHERE collection_id = $1 AND user_id = $2",
        )
        .bind(collection_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Recompute `document_count` as the number of completed documents.
    pub async fn refresh_collection_document_count(&self, collection_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE collections SET
                   document_count = (SELECT COUNT(*) FROM documents
                                     WHERE collection_id = $1 AND status = 'completed'),
                   updated_at = now()
               WHERE collection_id = $1"#,
        )
        .bind(collection_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ===== Documents =====

    pub async fn find_document_by_content_hash(
        &self,
        user_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            &format!("{} WHERE user_id = $1 AND content_hash = $2", SELECT_DOCUMENT),
        )
        .bind(user_id)
        .bind(content_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn find_document_by_unique_identifier(
        &self,
        user_id: Uuid,
        unique_identifier_hash: &str,
    ) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "{} WHERE user_id = $1 AND unique_identifier_hash = $2",
            SELECT_DOCUMENT
        ))
        .bind(user_id)
        .bind(unique_identifier_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Insert a pending document. On a `(user_id, content_hash)` race the
    /// insert is a no-op and the existing row is returned instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_document(
        &self,
        collection_id: Uuid,
        user_id: Uuid,
        title: Option<&str>,
        filename: Option<&str>,
        content_type: &str,
        size_bytes: i64,
        content_hash: &str,
        unique_identifier_hash: Option<&str>,
        metadata: Value,
    ) -> Result<DocumentRow> {
        let inserted = sqlx::query_as::<_, DocumentRow>(
            r#"INSERT INTO documents
                   (collection_id, user_id, title, filename, content_type, size_bytes,
                    content_hash, unique_identifier_hash, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (user_id, content_hash) DO NOTHING
               RETURNING document_id, collection_id, user_id, title, filename, content_type,
                         size_bytes, content_hash, unique_identifier_hash, status, metadata,
                         processing_info, summary, created_at, updated_at, processed_at"#,
        )
        .bind(collection_id)
        .bind(user_id)
        .bind(title)
        .bind(filename)
        .bind(content_type)
        .bind(size_bytes)
        .bind(content_hash)
        .bind(unique_identifier_hash)
        .bind(metadata)
        .fetch_optional(self.pool())
        .await?;

        match inserted {
            Some(row) => Ok(row),
            None => {
                debug!("document insert hit dedupe race, returning existing row");
                self.find_document_by_content_hash(user_id, content_hash)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("document vanished after dedupe conflict"))
            }
        }
    }

    /// Single-writer claim: only one worker wins the `pending|failed ->
    /// processing` transition.
    pub async fn claim_document_for_processing(&self, document_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE documents SET status = 'processing', updated_at = now()
               WHERE document_id = $1 AND status IN ('pending', 'failed')"#,
        )
        .bind(document_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_document_completed(
        &self,
        document_id: Uuid,
        processing_info: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents SET status = 'completed', processing_info = $2,
                   processed_at = now(), updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .bind(processing_info)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_document_failed(
        &self,
        document_id: Uuid,
        processing_info: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents SET status = 'failed', processing_info = $2, updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .bind(processing_info)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_document_processing_stage(
        &self,
        document_id: Uuid,
        stage: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents SET
                   processing_info = processing_info || jsonb_build_object('stage', $2::text),
                   updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .bind(stage)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_document(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "{} WHERE document_id = $1 AND user_id = $2",
            SELECT_DOCUMENT
        ))
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_documents(
        &self,
        user_id: Uuid,
        collection_id: Option<Uuid>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<DocumentRow>, i64)> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"{} WHERE user_id = $1
                 AND ($2::uuid IS NULL OR collection_id = $2)
                 AND ($3::text IS NULL OR status = $3)
               ORDER BY created_at DESC
               LIMIT $4 OFFSET $5"#,
            SELECT_DOCUMENT
        ))
        .bind(user_id)
        .bind(collection_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM documents
               WHERE user_id = $1
                 AND ($2::uuid IS NULL OR collection_id = $2)
                 AND ($3::text IS NULL OR status = $3)"#,
        )
        .bind(user_id)
        .bind(collection_id)
        .bind(status)
        .fetch_one(self.pool())
        .await?;

        Ok((rows, total))
    }

    /// Point the document at new payload bytes (URL re-ingest). Fails on a
    /// `(user_id, content_hash)` collision, which callers may tolerate.
    pub async fn update_document_content_hash(
        &self,
        document_id: Uuid,
        content_hash: &str,
        size_bytes: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE documents SET content_hash = $2, size_bytes = $3,
                   status = 'pending', updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .bind(content_hash)
        .bind(size_bytes)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Shallow-merge keys into the document metadata column.
    pub async fn merge_document_metadata(
        &self,
        document_id: Uuid,
        patch: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents SET metadata = metadata || $2, updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .bind(patch)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Metadata-only update; content and status are untouched.
    pub async fn update_document_meta(
        &self,
        user_id: Uuid,
        document_id: Uuid,
        title: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"UPDATE documents SET
                   title      = COALESCE($3, title),
                   metadata   = COALESCE($4, metadata),
                   updated_at = now()
               WHERE document_id = $1 AND user_id = $2
               RETURNING document_id, collection_id, user_id, title, filename, content_type,
                         size_bytes, content_hash, unique_identifier_hash, status, metadata,
                         processing_info, summary, created_at, updated_at, processed_at"#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(title)
        .bind(metadata)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn delete_document(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"DELETE FROM documents WHERE document_id = $1 AND user_id = $2
               RETURNING document_id, collection_id, user_id, title, filename, content_type,
                         size_bytes, content_hash, unique_identifier_hash, status, metadata,
                         processing_info, summary, created_at, updated_at, processed_at"#,
        )
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn document_status(
        &self,
        user_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<DocumentStatusRow>> {
        let row = sqlx::query_as::<_, DocumentStatusRow>(
            r#"SELECT d.status, d.processing_info, d.created_at, d.processed_at,
                      COUNT(c.chunk_id) AS chunk_count,
                      COALESCE(SUM(c.token_count), 0)::bigint AS total_tokens
               FROM documents d
               LEFT JOIN chunks c ON c.document_id = d.document_id
               WHERE d.document_id = $1 AND d.user_id = $2
               GROUP BY d.document_id"#,
        )
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Compare-and-set: the summary is written only while absent, so
    /// concurrent reprocessors cannot clobber each other.
    pub async fn set_document_summary_if_absent(
        &self,
        document_id: Uuid,
        summary: &str,
        summary_embedding: Vector,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE documents SET summary = $2, summary_embedding = $3, updated_at = now()
               WHERE document_id = $1 AND summary IS NULL"#,
        )
        .bind(document_id)
        .bind(summary)
        .bind(summary_embedding)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_document_summary(&self, document_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents SET summary = NULL, summary_embedding = NULL, updated_at = now()
               WHERE document_id = $1"#,
        )
        .bind(document_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ===== Chunks =====

    /// Insert all chunks for a document in one transaction.
    pub async fn insert_chunks(
        &self,
        document_id: Uuid,
        collection_id: Uuid,
        chunks: &[NewChunk],
    ) -> Result<()> {
        let mut transaction = self.pool().begin().await?;

        for chunk in chunks {
            sqlx::query(
                r#"INSERT INTO chunks
                       (document_id, collection_id, chunk_index, content, token_count,
                        embedding, metadata, annotations)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(document_id)
            .bind(collection_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(Vector::from(chunk.embedding.clone()))
            .bind(&chunk.metadata)
            .bind(&chunk.annotations)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        debug!("Inserted {} chunks for document {}", chunks.len(), document_id);
        Ok(())
    }

    pub async fn delete_chunks_for_document(&self, document_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Cosine search over completed chunks, scoped to a user and optionally a
    /// collection, document set, and metadata filter. Filters apply before
    /// scoring.
    pub async fn vector_search_chunks(
        &self,
        user_id: Uuid,
        query_embedding: Vector,
        collection_id: Option<Uuid>,
        document_ids: Option<&[Uuid]>,
        metadata_filter: Option<&Value>,
        limit: i64,
    ) -> Result<Vec<ScoredChunkRow>> {
        let rows = sqlx::query_as::<_, ScoredChunkRow>(
            r#"SELECT c.chunk_id, c.document_id, c.collection_id, c.chunk_index, c.content,
                      c.token_count, c.metadata, c.annotations,
                      (1 - (c.embedding <=> $2))::float8 AS score,
                      d.title AS document_title, d.filename AS document_filename,
                      d.metadata AS document_metadata
               FROM chunks c
               JOIN documents d ON d.document_id = c.document_id
               WHERE d.user_id = $1
                 AND d.status = 'completed'
                 AND c.embedding IS NOT NULL
                 AND ($3::uuid IS NULL OR c.collection_id = $3)
                 AND ($4::uuid[] IS NULL OR c.document_id = ANY($4))
                 AND ($5::jsonb IS NULL OR c.metadata @> $5 OR d.metadata @> $5)
               ORDER BY c.embedding <=> $2
               LIMIT $6"#,
        )
        .bind(user_id)
        .bind(query_embedding)
        .bind(collection_id)
        .bind(document_ids)
        .bind(metadata_filter)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// First stage of hierarchical retrieval: cosine search over document
    /// summary embeddings.
    pub async fn search_document_summaries(
        &self,
        user_id: Uuid,
        query_embedding: Vector,
        collection_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<DocumentSummaryHit>> {
        let rows = sqlx::query_as::<_, DocumentSummaryHit>(
            r#"SELECT document_id, (1 - (summary_embedding <=> $2))::float8 AS score
               FROM documents
               WHERE user_id = $1
                 AND status = 'completed'
                 AND summary_embedding IS NOT NULL
                 AND ($3::uuid IS NULL OR collection_id = $3)
               ORDER BY summary_embedding <=> $2
               LIMIT $4"#,
        )
        .bind(user_id)
        .bind(query_embedding)
        .bind(collection_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Hydrate chunks by id (keyword / graph candidates). Scores come back 0;
    /// the caller attaches its own.
    pub async fn get_chunks_by_ids(
        &self,
        user_id: Uuid,
        chunk_ids: &[Uuid],
    ) -> Result<Vec<ScoredChunkRow>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ScoredChunkRow>(
            r#"SELECT c.chunk_id, c.document_id, c.collection_id, c.chunk_index, c.content,
                      c.token_count, c.metadata, c.annotations,
                      0::float8 AS score,
                      d.title AS document_title, d.filename AS document_filename,
                      d.metadata AS document_metadata
               FROM chunks c
               JOIN documents d ON d.document_id = c.document_id
               WHERE d.user_id = $1 AND d.status = 'completed' AND c.chunk_id = ANY($2)"#,
        )
        .bind(user_id)
        .bind(chunk_ids)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// The ±1 neighbors of a chunk, for context expansion.
    pub async fn get_neighbor_chunks(
        &self,
        document_id: Uuid,
        chunk_index: i32,
    ) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT chunk_id, document_id, collection_id, chunk_index, content, token_count,
                      metadata, annotations
               FROM chunks
               WHERE document_id = $1 AND chunk_index BETWEEN $2 - 1 AND $2 + 1
               ORDER BY chunk_index"#,
        )
        .bind(document_id)
        .bind(chunk_index)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Chunk ids and contents for one document, for index maintenance.
    pub async fn all_chunk_ids_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT chunk_id, content FROM chunks WHERE document_id = $1 ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Every completed chunk, for rebuilding the in-process indexes at boot.
    pub async fn all_completed_chunks(&self) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT c.chunk_id, c.document_id, c.collection_id, c.chunk_index, c.content,
                      c.token_count, c.metadata, c.annotations
               FROM chunks c
               JOIN documents d ON d.document_id = c.document_id
               WHERE d.status = 'completed'"#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ===== Chat sessions & messages =====

    pub async fn create_session(
        &self,
        user_id: Uuid,
        collection_id: Option<Uuid>,
        title: Option<&str>,
    ) -> Result<ChatSessionRow> {
        let row = sqlx::query_as::<_, ChatSessionRow>(
            r#"INSERT INTO chat_sessions (user_id, collection_id, title)
               VALUES ($1, $2, $3)
               RETURNING session_id, user_id, collection_id, title, created_at,
                         last_message_at, message_count"#,
        )
        .bind(user_id)
        .bind(collection_id)
        .bind(title)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ChatSessionRow>> {
        let row = sqlx::query_as::<_, ChatSessionRow>(
            r#"SELECT session_id, user_id, collection_id, title, created_at,
                      last_message_at, message_count
               FROM chat_sessions WHERE session_id = $1 AND user_id = $2"#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_sessions(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatSessionRow>> {
        let rows = sqlx::query_as::<_, ChatSessionRow>(
            r#"SELECT session_id, user_id, collection_id, title, created_at,
                      last_message_at, message_count
               FROM chat_sessions WHERE user_id = $1
               ORDER BY COALESCE(last_message_at, created_at) DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM chat_sessions WHERE session_id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append a message and bump the session counters atomically.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<ChatMessageRow> {
        let mut transaction = self.pool().begin().await?;

        let row = sqlx::query_as::<_, ChatMessageRow>(
            r#"INSERT INTO chat_messages (session_id, role, content)
               VALUES ($1, $2, $3)
               RETURNING message_id, session_id, role, content, created_at"#,
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .fetch_one(&mut *transaction)
        .await?;

        sqlx::query(
            r#"UPDATE chat_sessions
               SET message_count = message_count + 1, last_message_at = now()
               WHERE session_id = $1"#,
        )
        .bind(session_id)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(row)
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<()> {
        let mut transaction = self.pool().begin().await?;
        let session_id: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM chat_messages WHERE message_id = $1 RETURNING session_id",
        )
        .bind(message_id)
        .fetch_optional(&mut *transaction)
        .await?;
        if let Some(session_id) = session_id {
            sqlx::query(
                r#"UPDATE chat_sessions SET message_count = GREATEST(message_count - 1, 0)
                   WHERE session_id = $1"#,
            )
            .bind(session_id)
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    pub async fn list_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessageRow>> {
        let rows = sqlx::query_as::<_, ChatMessageRow>(
            r#"SELECT message_id, session_id, role, content, created_at
               FROM chat_messages WHERE session_id = $1
               ORDER BY created_at"#,
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn set_session_title_if_absent(
        &self,
        session_id: Uuid,
        title: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chat_sessions SET title = $2 WHERE session_id = $1 AND title IS NULL",
        )
        .bind(session_id)
        .bind(title)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

const SELECT_DOCUMENT: &str = r#"SELECT document_id, collection_id, user_id, title, filename,
    content_type, size_bytes, content_hash, unique_identifier_hash, status, metadata,
    processing_info, summary, created_at, updated_at, processed_at
    FROM documents"#;
