use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::ai::{AiMessage, AiProvider, GenerateOptions, ProviderRegistry};
use crate::db::Database;
use crate::models::{
    ChatMessage, ChatRequest, ChatResponse, Lead, MessageType, NewChatMessage, NoteRequest,
    RetrievalOutcome,
};
use crate::retrieval::HybridRetriever;

mod quote;

pub use quote::{Quote, QuoteCopy, QuoteLineItem, QuoteRequest};

const HISTORY_LIMIT: i64 = 10;
const PROMPT_PRODUCTS: usize = 5;
const PROMPT_SOLUTIONS: usize = 3;
pub const QUOTE_READY_STAGE: &str = "quote_ready";

const QUOTE_PHRASES: &[&str] = &[
    "give me the pdf",
    "generate quote",
    "pdf quote",
    "send quote",
    "create quote",
    "make quote",
    "quote me",
    "i want a quote",
    "can i get a quote",
    "price quote",
    "quotation",
    "how much",
    "what does it cost",
    "pricing",
    "price",
];

/// Lead and message persistence the chat flow needs.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>>;

    async fn latest_messages(&self, lead_id: &str, limit: i64) -> Result<Vec<ChatMessage>>;

    async fn insert_message(&self, message: &NewChatMessage) -> Result<ChatMessage>;

    async fn touch_lead_contact(&self, lead_id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl ConversationStore for Database {
    async fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        Database::get_lead(self, lead_id).await
    }

    async fn latest_messages(&self, lead_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        Database::latest_messages(self, lead_id, limit).await
    }

    async fn insert_message(&self, message: &NewChatMessage) -> Result<ChatMessage> {
        Database::insert_message(self, message).await
    }

    async fn touch_lead_contact(&self, lead_id: &str, at: DateTime<Utc>) -> Result<()> {
        Database::touch_lead_contact(self, lead_id, at).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("unknown AI provider: {0}")]
    UnknownProvider(String),
    #[error("lead not found: {0}")]
    LeadNotFound(String),
    #[error("no priced products to quote")]
    NothingToQuote,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationInsights {
    pub follow_up_needed: bool,
    pub buying_signals: Vec<String>,
    pub objections_raised: Vec<String>,
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    providers: ProviderRegistry,
    retriever: HybridRetriever,
    generation_limit: Arc<Semaphore>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        providers: ProviderRegistry,
        retriever: HybridRetriever,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            store,
            providers,
            retriever,
            generation_limit,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// One sales turn. With a lead id both sides of the exchange are stored
    /// and the lead's last contact is bumped; without one nothing is stored.
    pub async fn respond(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let provider = self
            .providers
            .get(request.provider.as_deref())
            .ok_or_else(|| {
                ChatError::UnknownProvider(
                    request
                        .provider
                        .clone()
                        .unwrap_or_else(|| self.providers.default_name().to_string()),
                )
            })?;

        let lead = match request.lead_id.as_deref() {
            Some(lead_id) => Some(
                self.store
                    .get_lead(lead_id)
                    .await?
                    .ok_or_else(|| ChatError::LeadNotFound(lead_id.to_string()))?,
            ),
            None => None,
        };

        let history = match &lead {
            Some(lead) => self.store.latest_messages(&lead.id, HISTORY_LIMIT).await?,
            None => vec![],
        };

        let stage = detect_stage(
            history
                .iter()
                .filter(|m| m.message_type == MessageType::User)
                .map(|m| m.content.as_str())
                .chain(std::iter::once(message.as_str())),
            &request.conversation_stage,
        );

        if let Some(lead) = &lead {
            self.store
                .insert_message(&NewChatMessage {
                    lead_id: lead.id.clone(),
                    message_type: MessageType::User,
                    content: message.clone(),
                    stage: Some(stage.clone()),
                    metadata: Some(json!({ "provider": provider.name() })),
                })
                .await?;
        }

        let mut conversation: Vec<AiMessage> = history
            .iter()
            .map(|m| AiMessage::new(m.message_type.role(), m.content.clone()))
            .collect();
        conversation.push(AiMessage::user(message.clone()));

        let customer_context = request
            .customer_context
            .clone()
            .or_else(|| lead.as_ref().map(lead_context_value));
        let outcome = self
            .retriever
            .retrieve(provider.as_ref(), &conversation, customer_context.as_ref())
            .await;

        let prompt = build_prompt(lead.as_ref(), &stage, &outcome, conversation);

        let response = {
            let _permit = self
                .generation_limit
                .acquire()
                .await
                .map_err(|err| ChatError::Internal(err.into()))?;
            generate(provider.as_ref(), &prompt).await?
        };

        let content = sanitize_model_output(&response.content);
        let insights = extract_insights(&content);
        let suggested_actions = suggested_actions(&stage, &outcome, &insights);
        let products: Vec<_> = outcome.products.iter().map(|p| p.summary()).collect();
        let now = Utc::now();

        let id = match &lead {
            Some(lead) => {
                let stored = self
                    .store
                    .insert_message(&NewChatMessage {
                        lead_id: lead.id.clone(),
                        message_type: MessageType::Assistant,
                        content: content.clone(),
                        stage: Some(stage.clone()),
                        metadata: Some(json!({
                            "provider": response.provider,
                            "model": response.model,
                            "usage": response.usage,
                            "finish_reason": response.finish_reason,
                            "product_ids": products.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
                            "retrieval_confidence": outcome.confidence,
                            "extraction_method": outcome.requirements.extraction_method,
                            "search_counts": outcome.search_counts,
                            "insights": insights,
                        })),
                    })
                    .await?;
                self.store.touch_lead_contact(&lead.id, now).await?;
                stored.id
            }
            None => Uuid::new_v4().to_string(),
        };

        tracing::info!(
            lead_id = request.lead_id.as_deref().unwrap_or("-"),
            provider = %response.provider,
            stage = %stage,
            products = products.len(),
            "chat turn completed"
        );

        Ok(ChatResponse {
            id,
            content,
            timestamp: now,
            provider: response.provider,
            model: response.model,
            lead_id: request.lead_id,
            conversation_stage: stage,
            products,
            retrieval_confidence: outcome.confidence,
            suggested_actions,
        })
    }
}

impl ChatService {
    /// Adds a free-form note to the lead's timeline as a SYSTEM message and
    /// bumps the lead's last contact.
    pub async fn add_note(&self, lead_id: &str, note: NoteRequest) -> Result<ChatMessage, ChatError> {
        let content = note.message.trim().to_string();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| ChatError::LeadNotFound(lead_id.to_string()))?;

        let stored = self
            .store
            .insert_message(&NewChatMessage {
                lead_id: lead.id.clone(),
                message_type: MessageType::System,
                content,
                stage: Some(note.stage),
                metadata: Some(json!({ "type": "note" })),
            })
            .await?;
        self.store.touch_lead_contact(&lead.id, Utc::now()).await?;

        tracing::info!(lead_id = %lead.id, "note added to conversation");
        Ok(stored)
    }
}

async fn generate(provider: &dyn AiProvider, prompt: &[AiMessage]) -> Result<crate::ai::AiResponse> {
    provider
        .generate(
            prompt,
            &GenerateOptions {
                max_tokens: Some(1000),
                temperature: Some(0.7),
                top_p: None,
            },
        )
        .await
}

/// A quote request anywhere in the customer's messages moves the
/// conversation to `quote_ready`. Otherwise the requested stage stands.
pub fn detect_stage<'a>(user_messages: impl IntoIterator<Item = &'a str>, requested: &str) -> String {
    let quote_requested = user_messages.into_iter().any(|text| {
        let lower = text.to_lowercase();
        QUOTE_PHRASES.iter().any(|phrase| lower.contains(phrase))
    });

    if quote_requested {
        QUOTE_READY_STAGE.to_string()
    } else if requested.trim().is_empty() {
        crate::models::default_stage()
    } else {
        requested.trim().to_string()
    }
}

fn lead_context_value(lead: &Lead) -> Value {
    json!({
        "company_name": lead.company_name,
        "industry": lead.industry,
        "company_size": lead.company_size,
        "budget_range": lead.budget_range,
        "pain_points": lead.pain_points,
    })
}

fn system_prompt(stage: &str) -> String {
    format!(
        "You are an expert B2B sales agent with deep knowledge of technology solutions. \
         Qualify prospects by understanding their needs, pain points and decision process. \
         Recommend products from the catalog context when they fit, quote prices only from \
         that context, and always suggest a clear next step. Be consultative, not pushy.\n\n\
         Current conversation stage: {stage}"
    )
}

fn lead_prompt(lead: &Lead) -> String {
    let mut parts = vec![
        "LEAD INFORMATION:".to_string(),
        format!("Company: {}", lead.company_name),
        format!("Contact: {} ({})", lead.contact_name, lead.email),
    ];
    if let Some(industry) = &lead.industry {
        parts.push(format!("Industry: {industry}"));
    }
    if let Some(size) = lead.company_size {
        parts.push(format!("Company Size: {}", size.as_str()));
    }
    if !lead.pain_points.is_empty() {
        parts.push(format!("Known Pain Points: {}", lead.pain_points.join(", ")));
    }
    if let Some(budget) = &lead.budget_range {
        parts.push(format!("Budget Range: {budget}"));
    }
    if let Some(timeline) = &lead.decision_timeline {
        parts.push(format!("Decision Timeline: {timeline}"));
    }
    if !lead.decision_makers.is_empty() {
        parts.push(format!("Decision Makers: {}", lead.decision_makers.join(", ")));
    }
    if let Some(notes) = &lead.notes {
        parts.push(format!("Additional Notes: {notes}"));
    }
    parts.join("\n")
}

fn stage_guidance(stage: &str) -> &'static str {
    match stage {
        "discovery" => {
            "DISCOVERY: ask about current challenges, existing solutions, budget, timeline \
             and who else is involved in the decision."
        }
        "presentation" => {
            "PRESENTATION: tie specific products to the stated pain points, give ROI and \
             implementation timeline, and propose a next step."
        }
        "objection_handling" => {
            "OBJECTION HANDLING: acknowledge the concern, answer it with evidence, and confirm \
             it is resolved before moving on."
        }
        "closing" => {
            "CLOSING: summarise the fit and value, address final concerns and ask for \
             commitment."
        }
        QUOTE_READY_STAGE => {
            "QUOTE READY: the customer asked for pricing. Give itemised prices for the \
             recommended products from the catalog context, with quantities and a total."
        }
        _ => "Focus on understanding the prospect's needs and presenting relevant solutions.",
    }
}

fn catalog_prompt(outcome: &RetrievalOutcome) -> Option<String> {
    if outcome.products.is_empty() && outcome.solutions.is_empty() {
        return None;
    }

    let mut lines = vec!["CATALOG CONTEXT:".to_string()];
    for item in outcome.products.iter().take(PROMPT_PRODUCTS) {
        let p = &item.product;
        let price = p
            .price
            .map(|price| format!("{price:.2} {}", p.currency.as_deref().unwrap_or("USD")))
            .unwrap_or_else(|| "price on request".to_string());
        lines.push(format!(
            "- [{}] {} ({}) {}: {}",
            p.id,
            p.name,
            p.category.as_deref().unwrap_or("uncategorised"),
            price,
            p.description.as_deref().unwrap_or_default()
        ));
    }
    for item in outcome.solutions.iter().take(PROMPT_SOLUTIONS) {
        let s = &item.solution;
        lines.push(format!(
            "- Solution [{}] {}: {}",
            s.id,
            s.name,
            s.description.as_deref().unwrap_or_default()
        ));
    }
    Some(lines.join("\n"))
}

/// System context (role, lead, stage, catalog) followed by the conversation.
pub fn build_prompt(
    lead: Option<&Lead>,
    stage: &str,
    outcome: &RetrievalOutcome,
    conversation: Vec<AiMessage>,
) -> Vec<AiMessage> {
    let mut messages = vec![AiMessage::system(system_prompt(stage))];
    if let Some(lead) = lead {
        messages.push(AiMessage::system(lead_prompt(lead)));
    }
    messages.push(AiMessage::system(stage_guidance(stage)));
    if let Some(catalog) = catalog_prompt(outcome) {
        messages.push(AiMessage::system(catalog));
    }
    messages.extend(conversation);
    messages
}

pub fn extract_insights(content: &str) -> ConversationInsights {
    let lower = content.to_lowercase();
    let found = |terms: &[&str]| -> Vec<String> {
        terms
            .iter()
            .filter(|t| lower.contains(*t))
            .map(|t| t.to_string())
            .collect()
    };

    ConversationInsights {
        follow_up_needed: ["let's schedule", "i'll send", "follow up", "next step"]
            .iter()
            .any(|p| lower.contains(p)),
        buying_signals: found(&["budget", "timeline", "when can we", "how soon", "decision", "approval"]),
        objections_raised: found(&["too expensive", "not sure", "need to think", "concern", "worried about"]),
    }
}

pub fn suggested_actions(
    stage: &str,
    outcome: &RetrievalOutcome,
    insights: &ConversationInsights,
) -> Vec<String> {
    let mut actions: Vec<&str> = match stage {
        QUOTE_READY_STAGE => vec!["Generate quote", "Confirm quantities and delivery timeline"],
        "discovery" => vec!["Ask about budget and timeline", "Identify decision makers"],
        "presentation" => vec!["Share detailed product specifications", "Schedule a demo"],
        "objection_handling" => vec!["Share a relevant case study"],
        "closing" => vec!["Propose next steps", "Send contract"],
        _ => vec!["Continue discovery"],
    };

    if stage != QUOTE_READY_STAGE && !outcome.products.is_empty() {
        actions.push("Review recommended products");
    }
    if !insights.objections_raised.is_empty() {
        actions.push("Address customer concerns");
    }
    if insights.follow_up_needed {
        actions.push("Schedule follow-up");
    }

    actions.into_iter().map(str::to_string).collect()
}

/// Strips a surrounding Markdown code fence some models wrap replies in.
fn sanitize_model_output(answer: &str) -> String {
    let text = answer.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }

    let fenced = Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```$")
        .ok()
        .and_then(|re| re.captures(text).and_then(|caps| caps.get(1)))
        .map(|body| body.as_str().trim().to_string());
    fenced.unwrap_or_else(|| text.replace("```", "").trim().to_string())
}

#[cfg(test)]
mod fakes;

#[cfg(test)]
mod tests {
    use super::fakes::{lead, service, EchoProvider, MemoryStore};
    use super::*;
    use crate::models::{NoteRequest, SearchCounts};

    fn request(message: &str, lead_id: Option<&str>) -> ChatRequest {
        ChatRequest {
            message: message.into(),
            lead_id: lead_id.map(str::to_string),
            conversation_stage: "discovery".into(),
            provider: None,
            customer_context: None,
        }
    }

    fn empty_outcome() -> RetrievalOutcome {
        RetrievalOutcome {
            requirements: Default::default(),
            products: vec![],
            solutions: vec![],
            search_counts: SearchCounts::default(),
            confidence: 0.0,
        }
    }

    #[test]
    fn quote_phrases_switch_stage() {
        assert_eq!(detect_stage(["How much for 5 units?"], "discovery"), "quote_ready");
        assert_eq!(detect_stage(["Tell me about NAS"], "presentation"), "presentation");
        assert_eq!(detect_stage(["hello"], " "), "discovery");
        assert_eq!(
            detect_stage(["can I get a QUOTATION", "thanks"], "closing"),
            "quote_ready"
        );
    }

    #[test]
    fn insights_pick_up_signals_and_objections() {
        let insights =
            extract_insights("Before the decision, what budget? I'm not sure. Let's schedule a call.");
        assert!(insights.follow_up_needed);
        assert_eq!(insights.buying_signals, vec!["budget", "decision"]);
        assert_eq!(insights.objections_raised, vec!["not sure"]);
    }

    #[test]
    fn actions_follow_stage() {
        let none = ConversationInsights::default();
        assert_eq!(
            suggested_actions("quote_ready", &empty_outcome(), &none),
            vec!["Generate quote", "Confirm quantities and delivery timeline"]
        );
        assert_eq!(
            suggested_actions("unknown", &empty_outcome(), &none),
            vec!["Continue discovery"]
        );
    }

    #[test]
    fn prompt_layers_context_before_conversation() {
        let lead = lead();
        let prompt = build_prompt(
            Some(&lead),
            "discovery",
            &empty_outcome(),
            vec![AiMessage::user("hi")],
        );
        assert_eq!(prompt.len(), 4);
        assert!(prompt[0].content.contains("Current conversation stage: discovery"));
        assert!(prompt[1].content.contains("Known Pain Points: slow backups"));
        assert!(prompt[2].content.starts_with("DISCOVERY"));
        assert_eq!(prompt[3], AiMessage::user("hi"));
    }

    #[test]
    fn code_fences_are_removed() {
        assert_eq!(sanitize_model_output("```markdown\nHi\n```"), "Hi");
        assert_eq!(sanitize_model_output("  plain  "), "plain");
    }

    #[tokio::test]
    async fn lead_turn_persists_both_messages() {
        let store = Arc::new(MemoryStore::with_lead(lead()));
        let provider = Arc::new(EchoProvider::new());
        let (chat, _dir) = service(store.clone(), provider.clone());

        let response = chat
            .respond(request("We need NAS storage, what's the price?", Some("lead-1")))
            .await
            .unwrap();

        assert_eq!(response.conversation_stage, "quote_ready");
        assert_eq!(response.content, "Happy to help. What is your budget?");
        assert!(response.products.iter().any(|p| p.id == "business-nas-4tb"));

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::User);
        assert_eq!(messages[1].message_type, MessageType::Assistant);
        assert_eq!(messages[1].id, response.id);
        let metadata = messages[1].metadata.as_ref().unwrap();
        assert_eq!(metadata["model"], "echo-1");
        assert_eq!(metadata["usage"]["total_tokens"], 15);
        assert_eq!(*store.touched.lock().unwrap(), vec!["lead-1".to_string()]);
    }

    #[tokio::test]
    async fn history_is_replayed_on_the_next_turn() {
        let store = Arc::new(MemoryStore::with_lead(lead()));
        let provider = Arc::new(EchoProvider::new());
        let (chat, _dir) = service(store.clone(), provider.clone());

        chat.respond(request("first question", Some("lead-1"))).await.unwrap();
        chat.respond(request("second question", Some("lead-1"))).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        let last = seen.last().unwrap();
        let replayed: Vec<_> = last
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(
            replayed,
            vec![
                "first question",
                "Happy to help. What is your budget?",
                "second question"
            ]
        );
    }

    #[tokio::test]
    async fn anonymous_turn_stores_nothing() {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(EchoProvider::new());
        let (chat, _dir) = service(store.clone(), provider);

        let response = chat.respond(request("hello", None)).await.unwrap();
        assert!(response.lead_id.is_none());
        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_lead_provider_and_empty_message() {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(EchoProvider::new());
        let (chat, _dir) = service(store, provider);

        assert!(matches!(
            chat.respond(request("hi", Some("ghost"))).await,
            Err(ChatError::LeadNotFound(_))
        ));
        assert!(matches!(
            chat.respond(request("   ", None)).await,
            Err(ChatError::EmptyMessage)
        ));

        let mut other = request("hi", None);
        other.provider = Some("azure_openai".into());
        assert!(matches!(
            chat.respond(other).await,
            Err(ChatError::UnknownProvider(_))
        ));
    }

    #[test]
    fn errors_render_for_api_clients() {
        assert_eq!(ChatError::EmptyMessage.to_string(), "message must not be empty");
        assert_eq!(
            ChatError::UnknownProvider("x".into()).to_string(),
            "unknown AI provider: x"
        );
        let internal = ChatError::from(anyhow::anyhow!("pool timed out"));
        assert!(matches!(internal, ChatError::Internal(_)));
        assert_eq!(internal.to_string(), "pool timed out");
    }

    #[tokio::test]
    async fn notes_are_stored_as_system_messages() {
        let store = Arc::new(MemoryStore::with_lead(lead()));
        let (chat, _dir) = service(store.clone(), Arc::new(EchoProvider::new()));

        let note = chat
            .add_note(
                "lead-1",
                NoteRequest {
                    message: " Called, wants a demo next week ".into(),
                    stage: "presentation".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(note.message_type, MessageType::System);
        assert_eq!(note.content, "Called, wants a demo next week");
        assert_eq!(note.stage.as_deref(), Some("presentation"));
        assert_eq!(note.metadata, Some(json!({"type": "note"})));
        assert_eq!(*store.touched.lock().unwrap(), vec!["lead-1".to_string()]);

        let missing = chat
            .add_note(
                "ghost",
                NoteRequest {
                    message: "hello".into(),
                    stage: "discovery".into(),
                },
            )
            .await;
        assert!(matches!(missing, Err(ChatError::LeadNotFound(_))));
    }
}
