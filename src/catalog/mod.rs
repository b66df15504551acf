pub mod samples;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::ai::Embedder;
use crate::config::CatalogConfig;
use crate::db::Database;
use crate::keyword_store::KeywordStore;
use crate::models::{CatalogManifest, Product, Solution, TextOrList};
use crate::qdrant_store::{product_point, solution_point, QdrantPoint, QdrantStore};

const UPSERT_BATCH: usize = 64;
const SAMPLE_FINGERPRINT: &str = "builtin-samples";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Product,
    Solution,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogData {
    pub products: Vec<Product>,
    pub solutions: Vec<Solution>,
    pub fingerprint: String,
    pub files: usize,
}

/// Decides what a free-standing catalog object is by the keys it carries.
/// Product detection wins when both match.
pub fn classify(item: &Value) -> Option<ItemKind> {
    let obj = item.as_object()?;
    let has_any = |keys: &[&str]| keys.iter().any(|k| obj.contains_key(*k));

    if has_any(&["name", "product_name", "title"])
        && has_any(&["price", "category", "description", "specifications"])
    {
        Some(ItemKind::Product)
    } else if has_any(&["solution_name", "name", "title"])
        && has_any(&["industry", "use_case", "benefits", "requirements"])
    {
        Some(ItemKind::Solution)
    } else {
        None
    }
}

impl CatalogData {
    /// Adds the items of one parsed file. A file is a list of items, an
    /// object with `products` and/or `solutions` arrays, or a single item.
    /// At most `max_items` are taken from each array.
    pub fn add_document(&mut self, document: Value, max_items: usize) {
        match document {
            Value::Array(items) => {
                for item in items.into_iter().take(max_items) {
                    self.add_classified(item);
                }
            }
            Value::Object(mut map)
                if map.contains_key("products") || map.contains_key("solutions") =>
            {
                if let Some(Value::Array(products)) = map.remove("products") {
                    for item in products.into_iter().take(max_items) {
                        self.add_item(ItemKind::Product, item);
                    }
                }
                if let Some(Value::Array(solutions)) = map.remove("solutions") {
                    for item in solutions.into_iter().take(max_items) {
                        self.add_item(ItemKind::Solution, item);
                    }
                }
            }
            single @ Value::Object(_) => self.add_classified(single),
            _ => {}
        }
    }

    fn add_classified(&mut self, item: Value) {
        if let Some(kind) = classify(&item) {
            self.add_item(kind, item);
        }
    }

    fn add_item(&mut self, kind: ItemKind, item: Value) {
        match kind {
            ItemKind::Product => {
                if let Some(mut product) = decode::<Product>(&item, "product") {
                    if product.id.trim().is_empty() {
                        product.id = derived_id("product", &item);
                    }
                    self.products.push(product);
                }
            }
            ItemKind::Solution => {
                if let Some(mut solution) = decode::<Solution>(&item, "solution") {
                    if solution.id.trim().is_empty() {
                        solution.id = derived_id("solution", &item);
                    }
                    self.solutions.push(solution);
                }
            }
        }
    }
}

trait Named {
    fn name_mut(&mut self) -> &mut String;
}

impl Named for Product {
    fn name_mut(&mut self) -> &mut String {
        &mut self.name
    }
}

impl Named for Solution {
    fn name_mut(&mut self) -> &mut String {
        &mut self.name
    }
}

/// Items that fail to decode or have a blank name are dropped.
fn decode<T: DeserializeOwned + Named>(item: &Value, kind: &str) -> Option<T> {
    let mut decoded: T = match serde_json::from_value(item.clone()) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::debug!(kind, error = %err, "skipping undecodable catalog item");
            return None;
        }
    };
    let name = decoded.name_mut();
    *name = name.trim().to_string();
    (!name.is_empty()).then_some(decoded)
}

fn derived_id(kind: &str, item: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{kind}-{}", &digest[..12])
}

/// Reads every `*.json` directly under `dir` in file-name order. Returns
/// `None` when the directory does not exist. Unparseable files are logged
/// and skipped but still count toward the fingerprint.
pub fn read_catalog_dir(dir: &Path, max_items: usize) -> Result<Option<CatalogData>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut data = CatalogData::default();
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some("json")
        {
            continue;
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read catalog file {}", path.display()))?;
        hasher.update(entry.file_name().to_string_lossy().as_bytes());
        hasher.update(&bytes);
        data.files += 1;

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(document) => {
                let (before_p, before_s) = (data.products.len(), data.solutions.len());
                data.add_document(document, max_items);
                tracing::info!(
                    file = %path.display(),
                    products = data.products.len() - before_p,
                    solutions = data.solutions.len() - before_s,
                    "catalog file parsed"
                );
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "skipping malformed catalog file");
            }
        }
    }

    hasher.update(max_items.to_le_bytes());
    data.fingerprint = format!("{:x}", hasher.finalize());
    Ok(Some(data))
}

pub fn sample_catalog() -> CatalogData {
    let mut data = CatalogData {
        fingerprint: SAMPLE_FINGERPRINT.to_string(),
        ..CatalogData::default()
    };
    for product in samples::sample_products() {
        data.add_item(ItemKind::Product, product);
    }
    for solution in samples::sample_solutions() {
        data.add_item(ItemKind::Solution, solution);
    }
    data
}

/// Text embedded for a product: `Label: value` parts joined by ` | `.
pub fn product_search_text(product: &Product) -> String {
    let mut parts = vec![format!("Product: {}", product.name)];
    push_part(&mut parts, "Category", product.category.as_deref());
    push_part(&mut parts, "Subcategory", product.subcategory.as_deref());
    push_part(&mut parts, "Description", product.description.as_deref());
    for (key, value) in &product.specifications {
        match value {
            Value::String(s) => parts.push(format!("{key}: {s}")),
            other => parts.push(format!("{key}: {other}")),
        }
    }
    push_text_or_list(&mut parts, "Features", product.features.as_ref());
    push_text_or_list(&mut parts, "Use cases", product.use_cases.as_ref());
    if !product.tags.is_empty() {
        parts.push(format!("Tags: {}", product.tags.join(", ")));
    }
    if !product.target_industries.is_empty() {
        parts.push(format!("Industries: {}", product.target_industries.join(", ")));
    }
    parts.join(" | ")
}

pub fn solution_search_text(solution: &Solution) -> String {
    let mut parts = vec![format!("Solution: {}", solution.name)];
    push_part(&mut parts, "Description", solution.description.as_deref());
    push_part(&mut parts, "Use case", solution.use_case.as_deref());
    if !solution.industry.is_empty() {
        parts.push(format!("Industries: {}", solution.industry.join(", ")));
    }
    push_text_or_list(&mut parts, "Benefits", solution.benefits.as_ref());
    push_text_or_list(&mut parts, "Requirements", solution.requirements.as_ref());
    parts.join(" | ")
}

fn push_part(parts: &mut Vec<String>, label: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
        parts.push(format!("{label}: {value}"));
    }
}

fn push_text_or_list(parts: &mut Vec<String>, label: &str, value: Option<&TextOrList>) {
    push_part(parts, label, value.map(TextOrList::joined).as_deref());
}

/// True when the stored manifest no longer describes what would be built.
pub fn needs_rebuild(
    latest: Option<&CatalogManifest>,
    fingerprint: &str,
    force: bool,
    index_present: bool,
) -> bool {
    force || !index_present || latest.map_or(true, |m| m.fingerprint != fingerprint)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub products: usize,
    pub solutions: usize,
    pub skipped: bool,
    pub vector_indexed: bool,
}

/// Builds the keyword and vector indexes from the catalog sources.
#[derive(Clone)]
pub struct CatalogLoader {
    config: CatalogConfig,
    db: Database,
    keyword: KeywordStore,
    products: QdrantStore,
    solutions: QdrantStore,
    embedder: Option<Arc<dyn Embedder>>,
}

impl CatalogLoader {
    pub fn new(
        config: CatalogConfig,
        db: Database,
        keyword: KeywordStore,
        products: QdrantStore,
        solutions: QdrantStore,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            config,
            db,
            keyword,
            products,
            solutions,
            embedder,
        }
    }

    pub async fn load(&self, force: bool) -> Result<LoadReport> {
        let dir = self.config.data_dir.clone();
        let max_items = self.config.max_items_per_file;
        let data = tokio::task::spawn_blocking(move || read_catalog_dir(&dir, max_items))
            .await
            .context("catalog scan task panicked")??;

        let data = match data {
            Some(data) => data,
            None => {
                tracing::warn!(dir = %self.config.data_dir.display(), "catalog directory not found, using sample catalog");
                sample_catalog()
            }
        };

        let latest = self.db.latest_manifest().await?;
        if !needs_rebuild(
            latest.as_ref(),
            &data.fingerprint,
            force || self.config.force_reload,
            self.keyword.exists(),
        ) {
            tracing::info!(fingerprint = %data.fingerprint, "catalog unchanged, skipping index rebuild");
            return Ok(LoadReport {
                products: data.products.len(),
                solutions: data.solutions.len(),
                skipped: true,
                vector_indexed: true,
            });
        }

        let keyword = self.keyword.clone();
        let products = data.products.clone();
        tokio::task::spawn_blocking(move || keyword.rebuild(&products))
            .await
            .context("keyword index task panicked")??;

        let vector_indexed = match self.index_vectors(&data).await {
            Ok(indexed) => indexed,
            Err(err) => {
                tracing::warn!(error = %err, "vector indexing failed, semantic search will be empty");
                false
            }
        };

        if vector_indexed {
            self.db
                .record_manifest(&CatalogManifest {
                    fingerprint: data.fingerprint.clone(),
                    product_count: data.products.len() as i64,
                    solution_count: data.solutions.len() as i64,
                    created_at: Utc::now(),
                })
                .await?;
        }

        tracing::info!(
            files = data.files,
            products = data.products.len(),
            solutions = data.solutions.len(),
            vector_indexed,
            "catalog indexed"
        );

        Ok(LoadReport {
            products: data.products.len(),
            solutions: data.solutions.len(),
            skipped: false,
            vector_indexed,
        })
    }

    async fn index_vectors(&self, data: &CatalogData) -> Result<bool> {
        let Some(embedder) = self.embedder.as_deref() else {
            tracing::warn!("no embedding deployment configured, skipping vector index");
            return Ok(false);
        };

        let mut product_points = Vec::with_capacity(data.products.len());
        for product in &data.products {
            let vector = embedder
                .embed(&product_search_text(product))
                .await
                .with_context(|| format!("failed embedding product {}", product.id))?;
            product_points.push(product_point(product, vector)?);
        }

        let mut solution_points = Vec::with_capacity(data.solutions.len());
        for solution in &data.solutions {
            let vector = embedder
                .embed(&solution_search_text(solution))
                .await
                .with_context(|| format!("failed embedding solution {}", solution.id))?;
            solution_points.push(solution_point(solution, vector)?);
        }

        replace_collection(&self.products, &product_points).await?;
        replace_collection(&self.solutions, &solution_points).await?;
        Ok(true)
    }
}

async fn replace_collection(store: &QdrantStore, points: &[QdrantPoint]) -> Result<()> {
    let Some(first) = points.first() else {
        store.delete_collection().await?;
        tracing::debug!(collection = store.collection(), "collection dropped, nothing to index");
        return Ok(());
    };
    store.recreate_collection(first.vector.len()).await?;

    for batch in points.chunks(UPSERT_BATCH) {
        store.upsert_points(batch).await?;
    }
    tracing::debug!(collection = store.collection(), points = points.len(), "collection rebuilt");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classification_uses_field_presence() {
        assert_eq!(
            classify(&json!({"name": "NAS", "price": 10})),
            Some(ItemKind::Product)
        );
        assert_eq!(
            classify(&json!({"solution_name": "Office", "benefits": "fast"})),
            Some(ItemKind::Solution)
        );
        assert_eq!(
            classify(&json!({"title": "Both", "category": "x", "industry": "y"})),
            Some(ItemKind::Product)
        );
        assert_eq!(classify(&json!({"name": "bare"})), None);
        assert_eq!(classify(&json!("text")), None);
    }

    #[test]
    fn arrays_are_capped_per_file() {
        let items: Vec<Value> = (0..10)
            .map(|i| json!({"id": format!("p{i}"), "name": format!("Item {i}"), "price": i}))
            .collect();

        let mut data = CatalogData::default();
        data.add_document(Value::Array(items), 4);
        assert_eq!(data.products.len(), 4);
        assert_eq!(data.products[3].id, "p3");
    }

    #[test]
    fn wrapped_document_reads_both_arrays() {
        let mut data = CatalogData::default();
        data.add_document(
            json!({
                "products": [{"name": "NAS"}, {"name": "  "}, {"name": "Server"}],
                "solutions": [{"name": "Office kit"}]
            }),
            50,
        );
        let names: Vec<_> = data.products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["NAS", "Server"]);
        assert_eq!(data.solutions.len(), 1);
    }

    #[test]
    fn missing_ids_are_derived_deterministically() {
        let item = json!({"name": "Rack", "category": "server"});
        let mut a = CatalogData::default();
        let mut b = CatalogData::default();
        a.add_document(item.clone(), 50);
        b.add_document(item, 50);

        assert!(a.products[0].id.starts_with("product-"));
        assert_eq!(a.products[0].id, b.products[0].id);
    }

    #[test]
    fn reads_directory_and_fingerprints_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"[{"id": "nas", "name": "NAS", "price": 1}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let first = read_catalog_dir(dir.path(), 50).unwrap().unwrap();
        assert_eq!(first.files, 2);
        assert_eq!(first.products.len(), 1);

        let again = read_catalog_dir(dir.path(), 50).unwrap().unwrap();
        assert_eq!(first.fingerprint, again.fingerprint);

        std::fs::write(
            dir.path().join("a.json"),
            r#"[{"id": "nas", "name": "NAS v2", "price": 1}]"#,
        )
        .unwrap();
        let changed = read_catalog_dir(dir.path(), 50).unwrap().unwrap();
        assert_ne!(first.fingerprint, changed.fingerprint);
    }

    #[test]
    fn missing_directory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_catalog_dir(&dir.path().join("absent"), 50)
            .unwrap()
            .is_none());
    }

    #[test]
    fn samples_decode() {
        let data = sample_catalog();
        assert_eq!(data.products.len(), 3);
        assert_eq!(data.solutions.len(), 2);
        assert_eq!(data.solutions[1].industry.len(), 4);
    }

    #[test]
    fn search_text_joins_labelled_parts() {
        let product = &sample_catalog().products[1];
        let text = product_search_text(product);
        assert!(text.starts_with("Product: Business NAS 4TB | Category: storage | "));
        assert!(text.contains("raid: RAID 1"));
        assert!(text.contains("Tags: storage, nas, business, backup"));
    }

    #[test]
    fn rebuild_decision() {
        let manifest = CatalogManifest {
            fingerprint: "abc".into(),
            product_count: 1,
            solution_count: 0,
            created_at: Utc::now(),
        };
        assert!(!needs_rebuild(Some(&manifest), "abc", false, true));
        assert!(needs_rebuild(Some(&manifest), "abc", true, true));
        assert!(needs_rebuild(Some(&manifest), "abc", false, false));
        assert!(needs_rebuild(Some(&manifest), "def", false, true));
        assert!(needs_rebuild(None, "abc", false, true));
    }

    #[test]
    fn list_valued_fields_are_joined_into_search_text() {
        let solution: Solution = serde_json::from_value(json!({
            "id": "office",
            "name": "Office Kit",
            "benefits": ["fast setup", "secure sharing"],
        }))
        .unwrap();
        assert_eq!(
            solution_search_text(&solution),
            "Solution: Office Kit | Benefits: fast setup, secure sharing"
        );
    }

    #[tokio::test]
    async fn empty_batch_drops_the_stale_collection() {
        use std::sync::Mutex;

        use axum::extract::{Path, State};
        use axum::routing::delete;
        use axum::{Json, Router};

        let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
        let router = Router::new()
            .route(
                "/collections/:name",
                delete(
                    |State(deleted): State<Arc<Mutex<Vec<String>>>>, Path(name): Path<String>| async move {
                        deleted.lock().unwrap().push(name);
                        Json(json!({"result": true}))
                    },
                ),
            )
            .with_state(deleted.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = QdrantStore::new(format!("http://{addr}"), "solutions");
        replace_collection(&store, &[]).await.unwrap();

        assert_eq!(*deleted.lock().unwrap(), vec!["solutions"]);
    }
}
