use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ai::{AiMessage, AiProvider, Embedder, GenerateOptions};
use crate::config::SearchConfig;
use crate::keyword_store::KeywordStore;
use crate::models::{
    Product, Requirements, RetrievalOutcome, RetrievedProduct, RetrievedSolution, SearchCounts,
    SearchSource, Solution,
};
use crate::qdrant_store::{category_filter, industry_filter, QdrantStore};

const KEYWORD_RECALL_K: usize = 15;
const SEMANTIC_PRODUCT_K: usize = 15;
const SEMANTIC_SOLUTION_K: usize = 10;
const MERGED_TOP_K: usize = 20;
const HIGH_SEMANTIC: f32 = 0.8;
const FALLBACK_QUERY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    pub keyword: f32,
    pub semantic: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            semantic: 0.6,
        }
    }
}

/// Keyword index plus vector index over the catalog, blended per product.
#[derive(Clone)]
pub struct HybridRetriever {
    keyword: KeywordStore,
    products: QdrantStore,
    solutions: QdrantStore,
    embedder: Option<Arc<dyn Embedder>>,
    weights: HybridWeights,
    hybrid: bool,
}

impl HybridRetriever {
    pub fn new(
        config: &SearchConfig,
        keyword: KeywordStore,
        products: QdrantStore,
        solutions: QdrantStore,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            keyword,
            products,
            solutions,
            embedder,
            weights: HybridWeights {
                keyword: config.keyword_weight,
                semantic: config.semantic_weight,
            },
            hybrid: config.use_hybrid_retriever,
        }
    }

    /// Extracts requirements from the conversation with `provider`, then
    /// searches the catalog with them.
    pub async fn retrieve(
        &self,
        provider: &dyn AiProvider,
        conversation: &[AiMessage],
        customer_context: Option<&Value>,
    ) -> RetrievalOutcome {
        let requirements = extract_requirements(provider, conversation, customer_context).await;
        self.search(requirements).await
    }

    /// Direct catalog search without an extraction step.
    pub async fn search_catalog(
        &self,
        query: &str,
        categories: Vec<String>,
        industry: Option<String>,
    ) -> RetrievalOutcome {
        let requirements = Requirements {
            search_terms: vec![query.to_string()],
            product_categories: categories,
            industry: industry.unwrap_or_default(),
            semantic_query: query.to_string(),
            extraction_method: "direct".to_string(),
            ..Requirements::default()
        };
        let keyword_categories = requirements.product_categories.clone();
        self.search_filtered(requirements, keyword_categories).await
    }

    /// Keyword recall is unfiltered here; extracted categories only narrow
    /// the vector side.
    pub async fn search(&self, requirements: Requirements) -> RetrievalOutcome {
        self.search_filtered(requirements, vec![]).await
    }

    async fn search_filtered(
        &self,
        requirements: Requirements,
        keyword_categories: Vec<String>,
    ) -> RetrievalOutcome {
        let keyword_query = keyword_query(&requirements);
        let keyword = self.keyword.clone();
        let keyword_task = tokio::task::spawn_blocking(move || {
            keyword.search(&keyword_query, &keyword_categories, KEYWORD_RECALL_K)
        });

        let (semantic_products, solutions) = if self.hybrid {
            self.semantic_search(&requirements).await
        } else {
            (vec![], vec![])
        };

        let keyword_products = match keyword_task.await {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "keyword search failed");
                vec![]
            }
            Err(err) => {
                tracing::warn!(error = %err, "keyword search task panicked");
                vec![]
            }
        };

        let mut search_counts = SearchCounts {
            keyword_products: keyword_products.len(),
            semantic_products: semantic_products.len(),
            semantic_solutions: solutions.len(),
            merged_products: 0,
        };

        let products = merge_products(keyword_products, semantic_products, self.weights);
        search_counts.merged_products = products.len();

        let solutions: Vec<RetrievedSolution> = solutions
            .into_iter()
            .map(|(solution, similarity)| RetrievedSolution {
                solution,
                similarity,
            })
            .collect();

        let confidence = compute_confidence(&products, &solutions);
        tracing::info!(
            keyword = search_counts.keyword_products,
            semantic = search_counts.semantic_products,
            solutions = search_counts.semantic_solutions,
            merged = search_counts.merged_products,
            confidence,
            "catalog retrieval finished"
        );

        RetrievalOutcome {
            requirements,
            products,
            solutions,
            search_counts,
            confidence,
        }
    }

    /// Catalog entries for explicit ids, in request order. Unknown ids are
    /// skipped.
    pub async fn products_by_id(&self, ids: Vec<String>) -> Result<Vec<Product>> {
        let keyword = self.keyword.clone();
        tokio::task::spawn_blocking(move || keyword.find_by_ids(&ids))
            .await
            .context("product lookup task panicked")?
    }

    async fn semantic_search(
        &self,
        requirements: &Requirements,
    ) -> (Vec<(Product, f32)>, Vec<(Solution, f32)>) {
        let Some(embedder) = self.embedder.as_deref() else {
            return (vec![], vec![]);
        };
        if requirements.semantic_query.trim().is_empty() {
            return (vec![], vec![]);
        }

        let vector = match embedder.embed(&requirements.semantic_query).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(error = %err, "query embedding failed");
                return (vec![], vec![]);
            }
        };

        let product_filter = category_filter(&requirements.product_categories);
        let solution_filter = industry_filter(&requirements.industry);
        let (products, solutions) = tokio::join!(
            self.products
                .search::<Product>(&vector, SEMANTIC_PRODUCT_K, product_filter.as_ref()),
            self.solutions
                .search::<Solution>(&vector, SEMANTIC_SOLUTION_K, solution_filter.as_ref()),
        );

        let products = products.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "semantic product search failed");
            vec![]
        });
        let solutions = solutions.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "semantic solution search failed");
            vec![]
        });
        (products, solutions)
    }
}

/// Blends both result lists by product id. Keyword scores are divided by
/// the best keyword score of the batch so both sides share a 0..=1 range.
pub fn merge_products(
    keyword: Vec<(Product, f32)>,
    semantic: Vec<(Product, f32)>,
    weights: HybridWeights,
) -> Vec<RetrievedProduct> {
    let max_keyword = keyword
        .iter()
        .map(|(_, score)| *score)
        .fold(0.0f32, f32::max);

    let mut merged: Vec<RetrievedProduct> = Vec::with_capacity(keyword.len() + semantic.len());
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (product, raw) in keyword {
        if product.id.is_empty() || by_id.contains_key(&product.id) {
            continue;
        }
        let score = if max_keyword > 0.0 {
            raw / max_keyword
        } else {
            0.0
        };
        by_id.insert(product.id.clone(), merged.len());
        merged.push(RetrievedProduct {
            product,
            keyword_score: score,
            semantic_score: 0.0,
            hybrid_score: score,
            source: SearchSource::Keyword,
        });
    }

    for (product, similarity) in semantic {
        if product.id.is_empty() {
            continue;
        }
        match by_id.get(&product.id) {
            Some(&idx) => {
                let entry = &mut merged[idx];
                if entry.source == SearchSource::Keyword {
                    entry.source = SearchSource::Both;
                    entry.semantic_score = similarity;
                    entry.hybrid_score =
                        weights.keyword * entry.keyword_score + weights.semantic * similarity;
                }
            }
            None => {
                by_id.insert(product.id.clone(), merged.len());
                merged.push(RetrievedProduct {
                    product,
                    keyword_score: 0.0,
                    semantic_score: similarity,
                    hybrid_score: similarity,
                    source: SearchSource::Semantic,
                });
            }
        }
    }

    merged.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(Ordering::Equal)
    });
    merged.truncate(MERGED_TOP_K);
    merged
}

pub fn compute_confidence(products: &[RetrievedProduct], solutions: &[RetrievedSolution]) -> f32 {
    let mut score = 0.0f32;
    if !products.is_empty() {
        score += 0.4;
    }
    if !solutions.is_empty() {
        score += 0.2;
    }

    let both = products
        .iter()
        .filter(|p| p.source == SearchSource::Both)
        .count();
    score += 0.3 * (both as f32 / 5.0).min(1.0);

    let high_semantic = products
        .iter()
        .filter(|p| p.semantic_score > HIGH_SEMANTIC)
        .count();
    score += 0.2 * (high_semantic as f32 / 3.0).min(1.0);

    score.min(1.0)
}

fn keyword_query(requirements: &Requirements) -> String {
    let mut terms: Vec<&str> = requirements
        .search_terms
        .iter()
        .chain(&requirements.technical_requirements)
        .chain(&requirements.product_categories)
        .map(String::as_str)
        .filter(|t| !t.trim().is_empty())
        .collect();
    terms.dedup();

    if terms.is_empty() {
        requirements.semantic_query.clone()
    } else {
        terms.join(" ")
    }
}

/// Natural-language query for the vector index.
pub fn build_semantic_query(requirements: &Requirements) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !requirements.use_case.trim().is_empty() {
        parts.push(requirements.use_case.clone());
    }
    parts.extend(
        requirements
            .technical_requirements
            .iter()
            .chain(&requirements.business_requirements)
            .filter(|r| !r.trim().is_empty())
            .cloned(),
    );
    if !requirements.product_categories.is_empty() {
        parts.push(format!(
            "Products needed: {}",
            requirements.product_categories.join(", ")
        ));
    }
    if !requirements.industry.trim().is_empty() {
        parts.push(format!("Industry: {}", requirements.industry));
    }
    parts.join(" ")
}

fn conversation_text(conversation: &[AiMessage]) -> String {
    conversation
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn context_industry(customer_context: Option<&Value>) -> String {
    customer_context
        .and_then(|c| c.get("industry"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Asks the model for a JSON requirements object. Any failure, including
/// an unparseable reply, falls back to keyword patterns.
pub async fn extract_requirements(
    provider: &dyn AiProvider,
    conversation: &[AiMessage],
    customer_context: Option<&Value>,
) -> Requirements {
    let text = conversation_text(conversation);
    match llm_requirements(provider, &text, customer_context).await {
        Ok(requirements) => requirements,
        Err(err) => {
            tracing::warn!(error = %err, "requirement extraction failed, using keyword fallback");
            fallback_requirements(&text, customer_context)
        }
    }
}

async fn llm_requirements(
    provider: &dyn AiProvider,
    conversation: &str,
    customer_context: Option<&Value>,
) -> Result<Requirements> {
    let context = customer_context
        .map(Value::to_string)
        .unwrap_or_else(|| "None provided".to_string());
    let prompt = format!(
        "You are an expert B2B technology sales analyst. Extract the customer's requirements \
         from this conversation.\n\nCONVERSATION:\n{conversation}\n\nCUSTOMER CONTEXT: {context}\n\n\
         Reply with a single JSON object and nothing else, using these keys:\n\
         \"technical_requirements\": list of technical needs and specifications,\n\
         \"business_requirements\": list of business goals and operational needs,\n\
         \"product_categories\": list of product types needed (server, storage, workstation, ...),\n\
         \"search_terms\": list of keywords to search the catalog with,\n\
         \"use_case\": short description of the use case,\n\
         \"industry\": the customer's industry or an empty string."
    );

    let response = provider
        .generate(
            &[AiMessage::user(prompt)],
            &GenerateOptions {
                max_tokens: Some(600),
                temperature: Some(0.1),
                top_p: None,
            },
        )
        .await?;

    let mut requirements = parse_reply_json::<Requirements>(&response.content)?;
    if requirements.industry.trim().is_empty() {
        requirements.industry = context_industry(customer_context);
    }
    requirements.semantic_query = build_semantic_query(&requirements);
    requirements.extraction_method = "llm".to_string();
    Ok(requirements)
}

/// Accepts bare JSON or JSON wrapped in prose or code fences.
pub(crate) fn parse_reply_json<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let start = reply.find('{').context("reply contains no JSON object")?;
    let end = reply.rfind('}').context("reply contains no JSON object")?;
    if end < start {
        anyhow::bail!("reply contains no JSON object");
    }
    serde_json::from_str(&reply[start..=end]).context("reply JSON has an unexpected shape")
}

pub fn fallback_requirements(conversation: &str, customer_context: Option<&Value>) -> Requirements {
    let lower = conversation.to_lowercase();
    let mut technical = Vec::new();
    let mut business = Vec::new();
    let mut categories = Vec::new();

    if lower.contains("workstation") || lower.contains("gaming") {
        technical.push("High-performance workstation".to_string());
        categories.push("workstation".to_string());
    }
    if lower.contains("server") {
        technical.push("Server infrastructure".to_string());
        categories.push("server".to_string());
    }
    if lower.contains("storage") || lower.contains("nas") {
        technical.push("Storage solution".to_string());
        categories.push("storage".to_string());
    }
    if lower.contains("business") {
        business.push("Business use case".to_string());
    }
    if lower.contains("enterprise") {
        business.push("Enterprise requirements".to_string());
    }

    let search_terms = categories.iter().chain(&technical).cloned().collect();
    Requirements {
        technical_requirements: technical,
        business_requirements: business,
        product_categories: categories,
        search_terms,
        use_case: "General business requirements".to_string(),
        industry: context_industry(customer_context),
        semantic_query: conversation.chars().take(FALLBACK_QUERY_CHARS).collect(),
        extraction_method: "fallback".to_string(),
    }
}
