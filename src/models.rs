use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    User,
    Assistant,
    System,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::User => "USER",
            MessageType::Assistant => "ASSISTANT",
            MessageType::System => "SYSTEM",
        }
    }

    /// Role name used when replaying history to a chat model.
    pub fn role(self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::System => "system",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "USER" => Ok(MessageType::User),
            "ASSISTANT" => Ok(MessageType::Assistant),
            "SYSTEM" => Ok(MessageType::System),
            other => Err(anyhow::anyhow!("unknown message type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl LeadStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            LeadStatus::New => "NEW",
            LeadStatus::Contacted => "CONTACTED",
            LeadStatus::Qualified => "QUALIFIED",
            LeadStatus::Proposal => "PROPOSAL",
            LeadStatus::Negotiation => "NEGOTIATION",
            LeadStatus::ClosedWon => "CLOSED_WON",
            LeadStatus::ClosedLost => "CLOSED_LOST",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "CONTACTED" => LeadStatus::Contacted,
            "QUALIFIED" => LeadStatus::Qualified,
            "PROPOSAL" => LeadStatus::Proposal,
            "NEGOTIATION" => LeadStatus::Negotiation,
            "CLOSED_WON" => LeadStatus::ClosedWon,
            "CLOSED_LOST" => LeadStatus::ClosedLost,
            _ => LeadStatus::New,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompanySize {
    Startup,
    Small,
    Medium,
    Large,
    Enterprise,
}

impl CompanySize {
    pub fn as_str(self) -> &'static str {
        match self {
            CompanySize::Startup => "startup",
            CompanySize::Small => "small",
            CompanySize::Medium => "medium",
            CompanySize::Large => "large",
            CompanySize::Enterprise => "enterprise",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "startup" => Some(CompanySize::Startup),
            "small" => Some(CompanySize::Small),
            "medium" => Some(CompanySize::Medium),
            "large" => Some(CompanySize::Large),
            "enterprise" => Some(CompanySize::Enterprise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<CompanySize>,
    pub annual_revenue: Option<String>,
    pub pain_points: Vec<String>,
    pub budget_range: Option<String>,
    pub decision_timeline: Option<String>,
    pub decision_makers: Vec<String>,
    pub status: LeadStatus,
    pub lead_score: Option<i32>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_contact: Option<DateTime<Utc>>,
    pub next_follow_up: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadCreate {
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<CompanySize>,
}

impl LeadCreate {
    pub fn validate(&self) -> Result<(), String> {
        if self.company_name.trim().is_empty() {
            return Err("company_name must not be empty".to_string());
        }
        if self.contact_name.trim().is_empty() {
            return Err("contact_name must not be empty".to_string());
        }
        if !looks_like_email(&self.email) {
            return Err(format!("invalid email address: {}", self.email));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadUpdate {
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<CompanySize>,
    pub annual_revenue: Option<String>,
    pub pain_points: Option<Vec<String>>,
    pub budget_range: Option<String>,
    pub decision_timeline: Option<String>,
    pub decision_makers: Option<Vec<String>>,
    pub status: Option<LeadStatus>,
    pub lead_score: Option<i32>,
    pub notes: Option<String>,
    pub next_follow_up: Option<DateTime<Utc>>,
}

impl LeadUpdate {
    /// Checks only the fields being changed. Names may not be blanked, the
    /// email must still look like one and a score stays within 0..=100.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(&self.company_name, Some(v) if v.trim().is_empty()) {
            return Err("company_name must not be empty".to_string());
        }
        if matches!(&self.contact_name, Some(v) if v.trim().is_empty()) {
            return Err("contact_name must not be empty".to_string());
        }
        if let Some(email) = &self.email {
            if !looks_like_email(email) {
                return Err(format!("invalid email address: {email}"));
            }
        }
        if let Some(score) = self.lead_score {
            if !(0..=100).contains(&score) {
                return Err("lead_score must be between 0 and 100".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadListQuery {
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_lead_limit")]
    pub limit: i64,
}

fn default_lead_limit() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub lead_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub stage: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub lead_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub stage: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub lead_id: Option<String>,
    #[serde(default = "default_stage")]
    pub conversation_stage: String,
    pub provider: Option<String>,
    pub customer_context: Option<Value>,
}

/// Free-form note added to a lead's conversation by a salesperson.
#[derive(Debug, Clone, Deserialize)]
pub struct NoteRequest {
    pub message: String,
    #[serde(default = "default_stage")]
    pub stage: String,
}

pub fn default_stage() -> String {
    "discovery".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub lead_id: Option<String>,
    pub conversation_stage: String,
    pub products: Vec<ProductSummary>,
    pub retrieval_confidence: f32,
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSearchRequest {
    pub query: String,
    pub lead_id: Option<String>,
    #[serde(default)]
    pub use_fuzzy: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_search_limit")]
    pub limit: i64,
}

fn default_similarity_threshold() -> f32 {
    0.3
}

fn default_search_limit() -> i64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSearchHit {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSearchResponse {
    pub query: String,
    pub mode: String,
    pub results: Vec<ChatSearchHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Product {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "product_name", alias = "title")]
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub specifications: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "text_or_list", skip_serializing_if = "Option::is_none")]
    pub features: Option<TextOrList>,
    #[serde(default, deserialize_with = "text_or_list", skip_serializing_if = "Option::is_none")]
    pub use_cases: Option<TextOrList>,
    #[serde(default, deserialize_with = "list_or_text")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "list_or_text")]
    pub target_industries: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Catalog prose that may arrive as one string or as a list of items. The
/// original shape is kept so stored documents serialize back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TextOrList {
    Text(String),
    List(Vec<Value>),
}

impl TextOrList {
    /// Single-line form for search text; list items are joined with `, `.
    pub fn joined(&self) -> String {
        match self {
            TextOrList::Text(text) => text.clone(),
            TextOrList::List(items) => items
                .iter()
                .filter_map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "solution_name", alias = "title")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub use_case: Option<String>,
    #[serde(default, deserialize_with = "list_or_text")]
    pub industry: Vec<String>,
    #[serde(default)]
    pub company_size: Option<String>,
    #[serde(default)]
    pub budget_range: Option<String>,
    #[serde(default)]
    pub components: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub implementation_time: Option<String>,
    #[serde(default, deserialize_with = "text_or_list", skip_serializing_if = "Option::is_none")]
    pub benefits: Option<TextOrList>,
    #[serde(default, deserialize_with = "text_or_list", skip_serializing_if = "Option::is_none")]
    pub requirements: Option<TextOrList>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub hybrid_score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Keyword,
    Semantic,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedProduct {
    pub product: Product,
    pub keyword_score: f32,
    pub semantic_score: f32,
    pub hybrid_score: f32,
    pub source: SearchSource,
}

impl RetrievedProduct {
    pub fn summary(&self) -> ProductSummary {
        ProductSummary {
            id: self.product.id.clone(),
            name: self.product.name.clone(),
            category: self.product.category.clone(),
            price: self.product.price,
            hybrid_score: self.hybrid_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSolution {
    pub solution: Solution,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub technical_requirements: Vec<String>,
    #[serde(default)]
    pub business_requirements: Vec<String>,
    #[serde(default)]
    pub product_categories: Vec<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub use_case: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub semantic_query: String,
    #[serde(default)]
    pub extraction_method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchCounts {
    pub keyword_products: usize,
    pub semantic_products: usize,
    pub semantic_solutions: usize,
    pub merged_products: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub requirements: Requirements,
    pub products: Vec<RetrievedProduct>,
    pub solutions: Vec<RetrievedSolution>,
    pub search_counts: SearchCounts,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSearchRequest {
    pub query: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub industry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogManifest {
    pub fingerprint: String,
    pub product_count: i64,
    pub solution_count: i64,
    pub created_at: DateTime<Utc>,
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.trim().split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_start_matches('$').replace(',', "").parse().ok(),
        _ => None,
    })
}

fn text_or_list<'de, D>(deserializer: D) -> Result<Option<TextOrList>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(TextOrList::Text(s)),
        Some(Value::Array(items)) if !items.is_empty() => Some(TextOrList::List(items)),
        _ => None,
    })
}

fn list_or_text<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => vec![],
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_accepts_only_known_values() {
        assert_eq!("USER".parse::<MessageType>().unwrap(), MessageType::User);
        assert_eq!(
            "ASSISTANT".parse::<MessageType>().unwrap(),
            MessageType::Assistant
        );
        assert_eq!("SYSTEM".parse::<MessageType>().unwrap(), MessageType::System);
        assert!("user".parse::<MessageType>().is_err());
        assert!("NOTE".parse::<MessageType>().is_err());
    }

    #[test]
    fn message_type_serializes_uppercase() {
        let json = serde_json::to_string(&MessageType::Assistant).unwrap();
        assert_eq!(json, "\"ASSISTANT\"");
        assert!(serde_json::from_str::<MessageType>("\"BOT\"").is_err());
    }

    #[test]
    fn lead_status_db_mapping_is_uppercase() {
        assert_eq!(LeadStatus::ClosedWon.as_db(), "CLOSED_WON");
        assert_eq!(LeadStatus::from_db("closed_lost"), LeadStatus::ClosedLost);
        assert_eq!(LeadStatus::from_db("garbage"), LeadStatus::New);
    }

    #[test]
    fn lead_create_rejects_bad_email() {
        let lead = LeadCreate {
            company_name: "Acme".to_string(),
            contact_name: "Sam".to_string(),
            email: "not-an-email".to_string(),
            phone: None,
            industry: None,
            company_size: None,
        };
        assert!(lead.validate().is_err());

        let ok = LeadCreate {
            email: "sam@acme.io".to_string(),
            ..lead
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn product_parsing_is_lenient() {
        let product: Product = serde_json::from_value(serde_json::json!({
            "id": "nas-1",
            "product_name": "Office NAS",
            "price": "$1,299.50",
            "features": ["RAID", "Backup"],
            "tags": "storage, nas",
            "warranty": "2 years"
        }))
        .unwrap();

        assert_eq!(product.name, "Office NAS");
        assert_eq!(product.price, Some(1299.5));
        assert_eq!(
            product.features.as_ref().map(TextOrList::joined).as_deref(),
            Some("RAID, Backup")
        );
        assert_eq!(product.tags, vec!["storage", "nas"]);
        assert_eq!(
            product.extra.get("warranty"),
            Some(&Value::String("2 years".to_string()))
        );
    }

    #[test]
    fn list_fields_keep_their_shape_when_written_back() {
        let raw = serde_json::json!({
            "id": "nas-1",
            "name": "Office NAS",
            "features": ["RAID", "Backup"],
            "use_cases": "File sharing"
        });
        let product: Product = serde_json::from_value(raw).unwrap();
        let written = serde_json::to_value(&product).unwrap();

        assert_eq!(written["features"], serde_json::json!(["RAID", "Backup"]));
        assert_eq!(written["use_cases"], "File sharing");
        assert!(written.get("benefits").is_none());

        let solution: Solution = serde_json::from_value(serde_json::json!({
            "id": "office",
            "name": "Office",
            "benefits": ["fast", "secure"],
            "requirements": ""
        }))
        .unwrap();
        assert_eq!(
            solution.benefits,
            Some(TextOrList::List(vec!["fast".into(), "secure".into()]))
        );
        assert!(solution.requirements.is_none());
    }

    #[test]
    fn lead_update_checks_only_supplied_fields() {
        assert!(LeadUpdate::default().validate().is_ok());

        let bad_email = LeadUpdate {
            email: Some("nope".to_string()),
            ..LeadUpdate::default()
        };
        assert!(bad_email.validate().unwrap_err().contains("invalid email"));

        let blank_name = LeadUpdate {
            company_name: Some("  ".to_string()),
            ..LeadUpdate::default()
        };
        assert!(blank_name.validate().is_err());

        let score = |v| LeadUpdate {
            lead_score: Some(v),
            ..LeadUpdate::default()
        };
        assert!(score(101).validate().is_err());
        assert!(score(-1).validate().is_err());
        assert!(score(100).validate().is_ok());
    }
}
