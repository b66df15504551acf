use anyhow::Result;
use clap::Parser;

use sales_agent::ai::build_embedder;
use sales_agent::catalog::CatalogLoader;
use sales_agent::db::Database;
use sales_agent::keyword_store::KeywordStore;
use sales_agent::qdrant_store::QdrantStore;
use sales_agent::readiness::{wait_until_ready, PostgresProbe, WaitPolicy};
use sales_agent::telemetry::init_tracing;
use sales_agent::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "load-catalog")]
#[command(about = "Migrate the database and (re)build the catalog indexes")]
struct Cli {
    /// Rebuild even if the catalog fingerprint is unchanged.
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let _guard = init_tracing(&config.logging)?;

    let probe = PostgresProbe::new(config.database.url.clone());
    wait_until_ready(&probe, WaitPolicy::from(&config.readiness)).await?;

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;

    let loader = CatalogLoader::new(
        config.catalog.clone(),
        db,
        KeywordStore::new(config.search.keyword_index_dir.clone()),
        QdrantStore::new(
            config.search.qdrant_base_url.clone(),
            config.search.products_collection.clone(),
        ),
        QdrantStore::new(
            config.search.qdrant_base_url.clone(),
            config.search.solutions_collection.clone(),
        ),
        build_embedder(&config.ai),
    );

    let report = loader.load(cli.force).await?;
    println!(
        "products={} solutions={} skipped={} vector_indexed={}",
        report.products, report.solutions, report.skipped, report.vector_indexed
    );
    Ok(())
}
