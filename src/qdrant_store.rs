use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Product, Solution};

/// One Qdrant collection over the REST API.
#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// Payload condition matching when `key` equals any of `values`. For array
/// payloads a single matching element is enough.
#[derive(Debug, Clone, PartialEq)]
pub struct AnyMatch {
    pub key: &'static str,
    pub values: Vec<String>,
}

impl AnyMatch {
    fn to_filter(&self) -> Value {
        json!({
            "must": [
                { "key": self.key, "match": { "any": self.values } }
            ]
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: Option<Value>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            known_vector_size: Arc::new(RwLock::new(None)),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn recreate_collection(&self, vector_size: usize) -> Result<()> {
        if let Err(err) = self.delete_collection().await {
            tracing::debug!(collection = %self.collection, error = %err, "collection delete failed");
            *self.known_vector_size.write().await = None;
        }

        self.ensure_collection(vector_size).await
    }

    /// Drops the collection. One that does not exist counts as deleted.
    pub async fn delete_collection(&self) -> Result<()> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("failed to contact qdrant while deleting collection")?;
        if response.status() != StatusCode::NOT_FOUND {
            response
                .error_for_status()
                .context("qdrant failed to delete collection")?;
        }
        *self.known_vector_size.write().await = None;
        Ok(())
    }

    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        if *self.known_vector_size.read().await == Some(vector_size) {
            return Ok(());
        }

        let create_url = format!("{}/collections/{}", self.base_url, self.collection);
        let payload = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });

        self.client
            .put(create_url)
            .json(&payload)
            .send()
            .await
            .context("failed to contact qdrant while creating collection")?
            .error_for_status()
            .context("qdrant failed to create collection")?;

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }

    pub async fn upsert_points(&self, points: &[QdrantPoint]) -> Result<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.ensure_collection(first.vector.len()).await?;

        let upsert_url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection
        );

        self.client
            .put(upsert_url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("failed to contact qdrant during upsert")?
            .error_for_status()
            .context("qdrant upsert returned non-success status")?;

        Ok(())
    }

    /// Nearest neighbours decoded from the `document` payload. Points whose
    /// document does not decode into `T` are skipped.
    pub async fn search<T: DeserializeOwned>(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&AnyMatch>,
    ) -> Result<Vec<(T, f32)>> {
        if vector.is_empty() {
            return Ok(vec![]);
        }

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter.to_filter();
        }

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<SearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let document = point.payload?.get_mut("document")?.take();
                let item = serde_json::from_value(document).ok()?;
                Some((item, point.score))
            })
            .collect())
    }
}

/// Stable point id derived from the catalog id. Qdrant only accepts
/// integers or UUIDs.
pub fn point_id(kind: &str, id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{kind}:{id}").as_bytes()).to_string()
}

pub fn product_point(product: &Product, vector: Vec<f32>) -> Result<QdrantPoint> {
    Ok(QdrantPoint {
        id: point_id("product", &product.id),
        vector,
        payload: json!({
            "id": product.id,
            "category": product.category.as_deref().map(str::to_lowercase),
            "document": serde_json::to_value(product)?,
        }),
    })
}

pub fn solution_point(solution: &Solution, vector: Vec<f32>) -> Result<QdrantPoint> {
    let mut industries = Vec::new();
    for industry in &solution.industry {
        for term in industry_terms(industry) {
            if !industries.contains(&term) {
                industries.push(term);
            }
        }
    }
    Ok(QdrantPoint {
        id: point_id("solution", &solution.id),
        vector,
        payload: json!({
            "id": solution.id,
            "industry": industries,
            "document": serde_json::to_value(solution)?,
        }),
    })
}

pub fn category_filter(categories: &[String]) -> Option<AnyMatch> {
    (!categories.is_empty()).then(|| AnyMatch {
        key: "category",
        values: categories.iter().map(|c| c.to_lowercase()).collect(),
    })
}

pub fn industry_filter(industry: &str) -> Option<AnyMatch> {
    let values = industry_terms(industry);
    (!values.is_empty()).then_some(AnyMatch {
        key: "industry",
        values,
    })
}

const INDUSTRY_STOPWORDS: &[&str] = &["and", "the", "for", "industry", "sector"];

/// The lowercased industry followed by its individual words, so
/// "Healthcare technology" still matches solutions tagged "healthcare".
fn industry_terms(industry: &str) -> Vec<String> {
    let full = industry.trim().to_lowercase();
    if full.is_empty() {
        return vec![];
    }

    let mut terms = vec![full.clone()];
    for word in full.split(|c: char| !c.is_alphanumeric()) {
        if word.len() < 3 || INDUSTRY_STOPWORDS.contains(&word) {
            continue;
        }
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}
