//! HTTP adaptor for the careline assistant.

mod api_error;
mod routes;
mod state;

use anyhow::Context;
use axum::{extract::DefaultBodyLimit, Router};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use careline::embeddings::{EmbeddingModel, OpenAIEmbedder};
use careline::llm::{ApiProvider, LLMManager, SimpleExternalProvider};
use careline::{
    AppConfig, AuthoritySync, ChatEngine, ContactService, DrugService, KnowledgeManager,
    MemoryService, Store, UploadPipeline,
};

use crate::state::AppState;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().map_err(anyhow::Error::msg)?;
    init_tracing(config.log_path.as_deref())?;

    tracing::info!(
        database = %config.database_url,
        model_chat = %config.llm.model_chat,
        model_analysis = %config.llm.model_analysis,
        embedding_model = %config.embedding.model,
        redis = config.redis_url.is_some(),
        places_lookup = config.google_api_key.is_some(),
        ultimate_workflow = config.use_ultimate_workflow,
        "Starting careline server"
    );
    if config.redis_url.is_some() {
        tracing::info!("REDIS_URL is set but caches stay in process");
    }

    let state = build_state(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    tracing::info!("Listening on http://{}", config.server.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(log_path: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            BoxMakeWriter::new(std::io::stdout.and(Mutex::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(log_path.is_none())
        .with_writer(writer)
        .init();
    Ok(())
}

fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store = match config.sqlite_path() {
        Some(path) => Store::open(&path)
            .with_context(|| format!("cannot open database {}", path.display()))?,
        None => {
            tracing::warn!("Using an in-memory database; data is lost on restart");
            Store::open_in_memory()?
        }
    };

    let provider = SimpleExternalProvider::new(
        ApiProvider::OpenAI,
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
        config.llm.model_chat.clone(),
    )?;
    let llm = LLMManager::new(Arc::new(provider));
    let embedder: Arc<dyn EmbeddingModel> =
        Arc::new(OpenAIEmbedder::new(&config.llm, &config.embedding)?);

    let memory = Arc::new(MemoryService::new(store.clone(), &config.memory));
    let knowledge = KnowledgeManager::new(store.clone(), embedder.clone(), config);
    let contacts = ContactService::new(store.clone(), AuthoritySync::new(knowledge.clone()));
    let drugs = DrugService::new(knowledge.clone());
    let uploads = UploadPipeline::new(
        store.clone(),
        knowledge.clone(),
        contacts.clone(),
        llm.clone(),
        config,
    );
    let chat = ChatEngine::new(store.clone(), memory.clone(), llm, embedder, config);

    Ok(AppState {
        store,
        chat: Arc::new(chat),
        memory,
        knowledge,
        contacts,
        drugs,
        uploads,
    })
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::chat::routes())
        .merge(routes::batch::routes())
        .merge(routes::contacts::routes())
        .merge(routes::knowledge::routes())
        .merge(routes::drug::routes())
        .merge(routes::conversations::routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
