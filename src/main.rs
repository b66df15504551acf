use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;

use sales_agent::ai::token_tracker::TokenTracker;
use sales_agent::ai::{build_embedder, ProviderRegistry};
use sales_agent::bootstrap::run_startup;
use sales_agent::catalog::CatalogLoader;
use sales_agent::chat::ChatService;
use sales_agent::db::Database;
use sales_agent::keyword_store::KeywordStore;
use sales_agent::qdrant_store::QdrantStore;
use sales_agent::readiness::{PostgresProbe, WaitPolicy};
use sales_agent::retrieval::HybridRetriever;
use sales_agent::server::AppState;
use sales_agent::telemetry::init_tracing;
use sales_agent::{run_server, AppConfig};

const GENERATION_PERMITS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    let _guard = init_tracing(&config.logging)?;

    let db = Database::connect_lazy(&config.database)?;
    let probe = PostgresProbe::new(config.database.url.clone());

    let tracker = Arc::new(TokenTracker::open(config.ai.token_usage_path.clone())?);
    let providers = ProviderRegistry::from_config(&config.ai, tracker.clone())?;
    let embedder = build_embedder(&config.ai);
    if embedder.is_none() {
        tracing::warn!("no embedding deployment configured, semantic search disabled");
    }

    let keyword = KeywordStore::new(config.search.keyword_index_dir.clone());
    let products = QdrantStore::new(
        config.search.qdrant_base_url.clone(),
        config.search.products_collection.clone(),
    );
    let solutions = QdrantStore::new(
        config.search.qdrant_base_url.clone(),
        config.search.solutions_collection.clone(),
    );

    let retriever = HybridRetriever::new(
        &config.search,
        keyword.clone(),
        products.clone(),
        solutions.clone(),
        embedder.clone(),
    );
    let loader = CatalogLoader::new(
        config.catalog.clone(),
        db.clone(),
        keyword.clone(),
        products,
        solutions,
        embedder,
    );
    let chat = ChatService::new(
        Arc::new(db.clone()),
        providers,
        retriever.clone(),
        Arc::new(Semaphore::new(GENERATION_PERMITS)),
    );
    let state = AppState::new(db.clone(), chat, retriever, keyword, tracker);

    let skip_loading = config.catalog.skip_loading;
    let server_config = config.server.clone();

    run_startup(
        &probe,
        WaitPolicy::from(&config.readiness),
        &db,
        move || async move {
            if skip_loading {
                tracing::info!("catalog loading disabled");
            } else {
                match loader.load(false).await {
                    Ok(report) => tracing::info!(
                        products = report.products,
                        solutions = report.solutions,
                        skipped = report.skipped,
                        vector_indexed = report.vector_indexed,
                        "catalog ready"
                    ),
                    Err(err) => tracing::warn!(error = %format!("{err:#}"), "catalog loading failed, continuing without it"),
                }
            }
            run_server(server_config, state).await
        },
    )
    .await
}
