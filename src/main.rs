use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use rag_server::auth::require_api_key;
use rag_server::chat::ChatOrchestrator;
use rag_server::config::Settings;
use rag_server::content::{Chunker, ParserFactory, ProcessorFactory};
use rag_server::database::{DbPool, Repository};
use rag_server::handlers;
use rag_server::index::{BlobStore, GraphIndex, InMemoryGraph, KeywordIndex, TtlCache};
use rag_server::ingest::{DocumentSummaryService, IngestionCoordinator};
use rag_server::llm::{ChatModel, HttpEmbedder, HttpSpeech, HttpVision, OpenAiChatModel};
use rag_server::retrieval::{HttpReranker, QueryReformulator, Reranker, RetrievalEngine, SynonymService};
use rag_server::state::AppState;
use rag_server::utils::limiters::Limiters;
use rag_server::utils::rate_limit::ApiRateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rag_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting RAG server...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    db_pool.migrate().await?;
    info!("Database ready");

    let repository = Arc::new(Repository::new(db_pool.clone()));
    let limiters = Arc::new(Limiters::new(&settings.limits));

    // Capability ports
    let chat_model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(settings.llm.clone()));
    let embedder = Arc::new(HttpEmbedder::new(
        settings.embedding.clone(),
        chat_model.clone(),
        limiters.clone(),
        settings.limits.embedding_batch_size,
    ));
    let vision = Arc::new(HttpVision::new(settings.vision.clone(), limiters.clone()));
    let speech = Arc::new(HttpSpeech::new(settings.speech.clone()));

    // Content pipeline
    let parser_factory = Arc::new(ParserFactory::new(
        vision.clone(),
        speech.clone(),
        &settings.ingestion,
    ));
    let processor_factory = Arc::new(ProcessorFactory::new(
        chat_model.clone(),
        settings.ingestion.llm_domain_extraction_enabled,
    ));
    let chunker = Arc::new(Chunker::new()?);

    // Stores
    let keyword_index = Arc::new(KeywordIndex::new());
    let graph_index: Arc<dyn GraphIndex> = Arc::new(InMemoryGraph::new());
    let cache = Arc::new(TtlCache::new(
        Duration::from_secs(settings.retrieval.cache_ttl_seconds),
        settings.retrieval.cache_capacity,
    ));
    let synonyms = Arc::new(SynonymService::new(
        settings
            .retrieval
            .synonym_dict_path
            .as_deref()
            .map(std::path::Path::new),
        None,
        settings.retrieval.synonym_max,
    ));
    let blob_store = Arc::new(BlobStore::new(
        settings.storage.document_path.clone(),
        &settings.storage.url_signing_secret,
    ));

    // Ingestion
    let summary_service = Arc::new(DocumentSummaryService::new(
        repository.clone(),
        embedder.clone(),
    ));
    let coordinator = Arc::new(IngestionCoordinator::new(
        repository.clone(),
        blob_store.clone(),
        parser_factory,
        processor_factory,
        chunker,
        embedder.clone(),
        vision.clone(),
        keyword_index.clone(),
        graph_index.clone(),
        summary_service,
        settings.ingestion.clone(),
        settings.limits.ingest_workers * 4,
    ));
    coordinator.start_workers(settings.limits.ingest_workers);
    coordinator.rebuild_indexes().await?;
    info!("Ingestion workers started");

    // Retrieval
    let reformulator = Arc::new(QueryReformulator::new(
        chat_model.clone(),
        cache.clone(),
        settings.retrieval.reformulation_enabled,
    ));
    let engine = Arc::new(RetrievalEngine::new(
        repository.clone(),
        embedder.clone(),
        keyword_index.clone(),
        graph_index.clone(),
        cache.clone(),
        synonyms.clone(),
        settings.retrieval.clone(),
    ));
    let reranker: Option<Arc<dyn Reranker>> = match (
        settings.retrieval.rerank_enabled,
        settings.retrieval.rerank_base_url.clone(),
    ) {
        (true, Some(base_url)) => Some(Arc::new(HttpReranker::new(
            base_url,
            settings.retrieval.rerank_model.clone(),
        ))),
        _ => None,
    };

    // Chat
    let orchestrator = Arc::new(ChatOrchestrator::new(
        repository.clone(),
        engine.clone(),
        reformulator.clone(),
        reranker,
        chat_model.clone(),
        limiters.clone(),
        settings.chat.clone(),
    ));

    let rate_limiter = Arc::new(ApiRateLimiter::new(&settings.rate_limit)?);

    let state = Arc::new(AppState {
        settings: settings.clone(),
        db_pool,
        repository,
        blob_store,
        keyword_index,
        graph_index,
        cache,
        synonyms,
        chat_model,
        engine,
        reformulator,
        coordinator,
        orchestrator,
        rate_limiter,
        limiters,
    });

    let app = build_router(state.clone(), settings.server.max_upload_bytes);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    // Public: health and presigned downloads (the signature is the credential)
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            "/documents/{id}/download",
            get(handlers::documents::download_document),
        );

    let auth_routes = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::rate_limit_auth,
        ));

    let collection_routes = Router::new()
        .route(
            "/collections",
            post(handlers::collections::create_collection)
                .get(handlers::collections::list_collections),
        )
        .route(
            "/collections/{id}",
            get(handlers::collections::get_collection)
                .patch(handlers::collections::update_collection)
                .delete(handlers::collections::delete_collection),
        );

    let upload_routes = Router::new()
        .route("/documents", post(handlers::documents::upload_document))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::rate_limit_upload,
        ));

    let document_routes = Router::new()
        .route("/documents", get(handlers::documents::list_documents))
        .route(
            "/documents/{id}",
            get(handlers::documents::get_document)
                .patch(handlers::documents::update_document)
                .delete(handlers::documents::delete_document),
        )
        .route(
            "/documents/{id}/status",
            get(handlers::documents::document_status),
        )
        .route("/documents/{id}/url", get(handlers::documents::document_url));

    let retrieval_routes = Router::new()
        .route("/retrievals", post(handlers::retrievals::retrieve))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::rate_limit_retrieval,
        ));

    let chat_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/chat/sessions", get(handlers::chat::list_sessions))
        .route(
            "/chat/sessions/{id}/messages",
            get(handlers::chat::session_messages),
        )
        .route(
            "/chat/sessions/{id}",
            delete(handlers::chat::delete_session),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::rate_limit_chat,
        ));

    // Authentication wraps every protected group; it runs before the
    // per-class rate limits so the limiter keys on the API key
    let protected_routes = Router::new()
        .merge(collection_routes)
        .merge(upload_routes)
        .merge(document_routes)
        .merge(retrieval_routes)
        .merge(chat_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}
