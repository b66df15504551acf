use std::path::PathBuf;

use anyhow::{Context, Result};
use tantivy::collector::TopDocs;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexWriter, TantivyDocument, Term};

use crate::models::{Product, TextOrList};

/// BM25 index over the product catalog. Each document stores the full
/// product JSON so hits never need a second lookup.
#[derive(Clone)]
pub struct KeywordStore {
    index_dir: PathBuf,
}

#[derive(Clone, Copy)]
struct ProductFields {
    id: Field,
    name: Field,
    description: Field,
    features: Field,
    use_cases: Field,
    tags: Field,
    category: Field,
    document: Field,
}

impl KeywordStore {
    pub fn new(index_dir: PathBuf) -> Self {
        Self { index_dir }
    }

    pub fn rebuild(&self, products: &[Product]) -> Result<()> {
        if self.index_dir.exists() {
            std::fs::remove_dir_all(&self.index_dir)?;
        }
        std::fs::create_dir_all(&self.index_dir)?;

        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(&self.index_dir, schema)?;
        let mut writer: IndexWriter = index.writer(50_000_000)?;

        for product in products {
            writer.add_document(doc!(
                fields.id => product.id.clone(),
                fields.name => product.name.clone(),
                fields.description => product.description.clone().unwrap_or_default(),
                fields.features => product.features.as_ref().map(TextOrList::joined).unwrap_or_default(),
                fields.use_cases => product.use_cases.as_ref().map(TextOrList::joined).unwrap_or_default(),
                fields.tags => product.tags.join(" "),
                fields.category => category_key(product.category.as_deref().unwrap_or_default()),
                fields.document => serde_json::to_string(product)?,
            ))?;
        }

        writer.commit()?;
        tracing::info!(products = products.len(), dir = %self.index_dir.display(), "keyword index rebuilt");
        Ok(())
    }

    /// Up to `limit` indexed products, in index order.
    pub fn list(&self, limit: usize) -> Result<Vec<Product>> {
        if !self.index_dir.exists() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let searcher = index.reader()?.searcher();

        let top_docs = searcher.search(&AllQuery, &TopDocs::with_limit(limit.max(1)))?;
        let mut out = Vec::with_capacity(top_docs.len());
        for (_, addr) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            if let Some(raw) = doc.get_first(fields.document).and_then(|v| v.as_str()) {
                out.push(serde_json::from_str(raw).context("corrupt product document in keyword index")?);
            }
        }
        Ok(out)
    }

    /// Products whose id is in `ids`, in the order given.
    pub fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Product>> {
        if !self.index_dir.exists() || ids.is_empty() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let searcher = index.reader()?.searcher();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let query = TermQuery::new(
                Term::from_field_text(fields.id, id),
                IndexRecordOption::Basic,
            );
            let Some((_, addr)) = searcher
                .search(&query, &TopDocs::with_limit(1))?
                .into_iter()
                .next()
            else {
                continue;
            };
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            if let Some(raw) = doc.get_first(fields.document).and_then(|v| v.as_str()) {
                out.push(serde_json::from_str(raw).context("corrupt product document in keyword index")?);
            }
        }
        Ok(out)
    }

    pub fn exists(&self) -> bool {
        self.index_dir.join("meta.json").exists()
    }

    /// Matches `query` against name (boost 3), description (boost 2),
    /// features, use cases and tags. A non-empty `categories` list keeps
    /// only products whose category equals one of them, ignoring case.
    pub fn search(
        &self,
        query: &str,
        categories: &[String],
        limit: usize,
    ) -> Result<Vec<(Product, f32)>> {
        if !self.index_dir.exists() || query.trim().is_empty() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let reader = index.reader()?;
        let searcher = reader.searcher();

        let mut parser = QueryParser::for_index(
            &index,
            vec![
                fields.name,
                fields.description,
                fields.features,
                fields.use_cases,
                fields.tags,
            ],
        );
        parser.set_field_boost(fields.name, 3.0);
        parser.set_field_boost(fields.description, 2.0);
        let (text_query, errors) = parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(?errors, "keyword query parsed leniently");
        }

        let query: Box<dyn Query> = if categories.is_empty() {
            text_query
        } else {
            let category_any: Vec<(Occur, Box<dyn Query>)> = categories
                .iter()
                .map(|c| {
                    let term = Term::from_field_text(fields.category, &category_key(c));
                    (
                        Occur::Should,
                        Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>,
                    )
                })
                .collect();
            Box::new(BooleanQuery::new(vec![
                (Occur::Must, text_query),
                (Occur::Must, Box::new(BooleanQuery::new(category_any))),
            ]))
        };

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            let Some(raw) = doc.get_first(fields.document).and_then(|v| v.as_str()) else {
                continue;
            };
            let product: Product =
                serde_json::from_str(raw).context("corrupt product document in keyword index")?;
            out.push((product, score));
        }

        Ok(out)
    }
}

fn category_key(category: &str) -> String {
    category.trim().to_lowercase()
}

fn build_schema() -> (Schema, ProductFields) {
    let mut builder = Schema::builder();

    let id = builder.add_text_field("id", STRING | STORED);
    let name = builder.add_text_field("name", TEXT);
    let description = builder.add_text_field("description", TEXT);
    let features = builder.add_text_field("features", TEXT);
    let use_cases = builder.add_text_field("use_cases", TEXT);
    let tags = builder.add_text_field("tags", TEXT);
    let category = builder.add_text_field("category", STRING);
    let document = builder.add_text_field("document", STORED);

    (
        builder.build(),
        ProductFields {
            id,
            name,
            description,
            features,
            use_cases,
            tags,
            category,
            document,
        },
    )
}

fn resolve_fields(schema: &Schema) -> Result<ProductFields> {
    let field = |name: &str| {
        schema
            .get_field(name)
            .map_err(|err| anyhow::anyhow!("keyword index schema: {err}"))
    };

    Ok(ProductFields {
        id: field("id")?,
        name: field("name")?,
        description: field("description")?,
        features: field("features")?,
        use_cases: field("use_cases")?,
        tags: field("tags")?,
        category: field("category")?,
        document: field("document")?,
    })
}
