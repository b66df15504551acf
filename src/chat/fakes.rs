//! In-memory stand-ins shared by the chat and quote tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{ChatService, ConversationStore};
use crate::ai::{AiMessage, AiProvider, AiResponse, GenerateOptions, ProviderRegistry, Usage};
use crate::config::SearchConfig;
use crate::keyword_store::KeywordStore;
use crate::models::{ChatMessage, Lead, LeadStatus, NewChatMessage};
use crate::qdrant_store::QdrantStore;
use crate::retrieval::HybridRetriever;

pub const ECHO_REPLY: &str = "```\nHappy to help. What is your budget?\n```";

#[derive(Default)]
pub struct MemoryStore {
    pub leads: HashMap<String, Lead>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub touched: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn with_lead(lead: Lead) -> Self {
        let mut store = Self::default();
        store.leads.insert(lead.id.clone(), lead);
        store
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        Ok(self.leads.get(lead_id).cloned())
    }

    async fn latest_messages(&self, lead_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.lock().unwrap();
        let for_lead: Vec<_> = messages
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .cloned()
            .collect();
        let skip = for_lead.len().saturating_sub(limit as usize);
        Ok(for_lead.into_iter().skip(skip).collect())
    }

    async fn insert_message(&self, message: &NewChatMessage) -> Result<ChatMessage> {
        let stored = ChatMessage {
            id: Uuid::new_v4().to_string(),
            lead_id: message.lead_id.clone(),
            message_type: message.message_type,
            content: message.content.clone(),
            stage: message.stage.clone(),
            metadata: message.metadata.clone(),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn touch_lead_contact(&self, lead_id: &str, _at: DateTime<Utc>) -> Result<()> {
        self.touched.lock().unwrap().push(lead_id.to_string());
        Ok(())
    }
}

/// Records every prompt and answers with a fixed reply.
pub struct EchoProvider {
    pub seen: Mutex<Vec<Vec<AiMessage>>>,
    reply: String,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::replying(ECHO_REPLY)
    }

    pub fn replying(reply: &str) -> Self {
        Self {
            seen: Mutex::new(vec![]),
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl AiProvider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo-1"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[AiMessage],
        _options: &GenerateOptions,
    ) -> Result<AiResponse> {
        self.seen.lock().unwrap().push(messages.to_vec());
        Ok(AiResponse {
            content: self.reply.clone(),
            model: "echo-1".into(),
            provider: "echo".into(),
            usage: Some(Usage::new(10, 5)),
            finish_reason: Some("stop".into()),
        })
    }
}

pub fn lead() -> Lead {
    let now = Utc::now();
    Lead {
        id: "lead-1".into(),
        company_name: "Acme".into(),
        contact_name: "Sam".into(),
        email: "sam@acme.test".into(),
        phone: None,
        industry: Some("legal".into()),
        company_size: None,
        annual_revenue: None,
        pain_points: vec!["slow backups".into()],
        budget_range: None,
        decision_timeline: None,
        decision_makers: vec![],
        status: LeadStatus::New,
        lead_score: None,
        notes: None,
        created_at: now,
        updated_at: now,
        last_contact: None,
        next_follow_up: None,
    }
}

/// Chat service over the sample catalog with vector search switched off.
/// The returned directory holds the keyword index.
pub fn service(
    store: Arc<MemoryStore>,
    provider: Arc<EchoProvider>,
) -> (ChatService, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig {
        keyword_index_dir: dir.path().join("index"),
        qdrant_base_url: "http://127.0.0.1:9".into(),
        products_collection: "products".into(),
        solutions_collection: "solutions".into(),
        use_hybrid_retriever: false,
        keyword_weight: 0.4,
        semantic_weight: 0.6,
    };
    let keyword = KeywordStore::new(config.keyword_index_dir.clone());
    keyword
        .rebuild(&crate::catalog::sample_catalog().products)
        .unwrap();
    let retriever = HybridRetriever::new(
        &config,
        keyword,
        QdrantStore::new("http://127.0.0.1:9", "products"),
        QdrantStore::new("http://127.0.0.1:9", "solutions"),
        None,
    );
    let providers = ProviderRegistry::with_providers("echo", [provider as Arc<dyn AiProvider>]);
    let chat = ChatService::new(store, providers, retriever, Arc::new(Semaphore::new(1)));
    (chat, dir)
}
