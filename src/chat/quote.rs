use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{lead_context_value, ChatError, ChatService, HISTORY_LIMIT, QUOTE_READY_STAGE};
use crate::ai::{AiMessage, AiProvider, GenerateOptions, Usage};
use crate::models::{Lead, MessageType, NewChatMessage, Product, Requirements};
use crate::retrieval::parse_reply_json;

const DEFAULT_TAX_RATE: f64 = 0.08;
const DEFAULT_CURRENCY: &str = "USD";
const QUOTE_VALID_DAYS: i64 = 30;
const QUOTE_MAX_ITEMS: usize = 5;

const DEFAULT_TITLE: &str = "Professional Technology Solution";
const DEFAULT_TAGLINE: &str = "Your Technology Partner";
const DEFAULT_TERMS: &[&str] = &[
    "Payment terms: Net 30 days from invoice date",
    "Delivery: 5-10 business days after order confirmation",
    "Warranty: Standard manufacturer warranty applies",
    "Installation support included for first 30 days",
    "Prices valid for 30 days from quote date",
];
const DEFAULT_IMPLEMENTATION_NOTES: &[&str] = &[
    "Professional installation and configuration included",
    "Complete testing and validation before handover",
    "User training and documentation provided",
    "30-day post-implementation support included",
];
const DEFAULT_NEXT_STEPS: &[&str] = &[
    "Review quote details and specifications",
    "Contact us with any questions or modifications",
    "Submit purchase order to begin processing",
    "Schedule implementation planning meeting",
];

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteRequest {
    pub lead_id: String,
    #[serde(default)]
    pub provider: Option<String>,
    /// Quote exactly these catalog ids instead of what the conversation
    /// retrieves.
    #[serde(default)]
    pub product_ids: Vec<String>,
    /// Per product id; anything missing is quoted once.
    #[serde(default)]
    pub quantities: BTreeMap<String, u32>,
    #[serde(default)]
    pub tax_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteLineItem {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub quantity: u32,
    pub unit_price: f64,
    pub total_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub quote_number: String,
    pub lead_id: String,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub quote_title: String,
    pub company_tagline: String,
    pub customer_info: Value,
    pub business_context: Value,
    pub line_items: Vec<QuoteLineItem>,
    pub subtotal: f64,
    pub tax_rate: f64,
    pub tax_amount: f64,
    pub total: f64,
    pub currency: String,
    pub terms_and_conditions: Vec<String>,
    pub implementation_notes: Vec<String>,
    pub next_steps: Vec<String>,
    pub provider: String,
    pub model: String,
}

/// Wording the model writes around the numbers. Blank parts are filled from
/// the standard terms.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QuoteCopy {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub terms_and_conditions: Vec<String>,
    #[serde(default)]
    pub implementation_notes: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl QuoteCopy {
    fn with_defaults(mut self) -> Self {
        let fill = |items: &mut Vec<String>, defaults: &[&str]| {
            items.retain(|item| !item.trim().is_empty());
            if items.is_empty() {
                *items = defaults.iter().map(|s| s.to_string()).collect();
            }
        };

        if self.title.trim().is_empty() {
            self.title = DEFAULT_TITLE.to_string();
        }
        if self.tagline.trim().is_empty() {
            self.tagline = DEFAULT_TAGLINE.to_string();
        }
        fill(&mut self.terms_and_conditions, DEFAULT_TERMS);
        fill(&mut self.implementation_notes, DEFAULT_IMPLEMENTATION_NOTES);
        fill(&mut self.next_steps, DEFAULT_NEXT_STEPS);
        self
    }
}

impl ChatService {
    /// Prices the products the lead's conversation points at, has the model
    /// word the quote, and records it on the lead's timeline.
    pub async fn generate_quote(&self, request: QuoteRequest) -> Result<Quote, ChatError> {
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

        let lead = self
            .store
            .get_lead(&request.lead_id)
            .await?
            .ok_or_else(|| ChatError::LeadNotFound(request.lead_id.clone()))?;

        let (products, requirements) = if request.product_ids.is_empty() {
            let history = self.store.latest_messages(&lead.id, HISTORY_LIMIT).await?;
            let conversation: Vec<AiMessage> = history
                .iter()
                .map(|m| AiMessage::new(m.message_type.role(), m.content.clone()))
                .collect();
            let outcome = self
                .retriever
                .retrieve(provider.as_ref(), &conversation, Some(&lead_context_value(&lead)))
                .await;
            let products = outcome
                .products
                .into_iter()
                .map(|item| item.product)
                .filter(|p| p.price.is_some())
                .take(QUOTE_MAX_ITEMS)
                .collect();
            (products, outcome.requirements)
        } else {
            let products = self
                .retriever
                .products_by_id(request.product_ids.clone())
                .await?;
            (products, Requirements::default())
        };

        let line_items = line_items(&products, &request.quantities);
        if line_items.is_empty() {
            return Err(ChatError::NothingToQuote);
        }

        let tax_rate = request.tax_rate.unwrap_or(DEFAULT_TAX_RATE).max(0.0);
        let (subtotal, tax_amount, total) = totals(&line_items, tax_rate);
        let currency = products
            .iter()
            .find_map(|p| p.currency.clone())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let (copy, usage, model) = {
            let _permit = self
                .generation_limit
                .acquire()
                .await
                .map_err(|err| ChatError::Internal(err.into()))?;
            write_copy(provider.as_ref(), &lead, &line_items, total, &currency).await
        };

        let now = Utc::now();
        let quote_id = Uuid::new_v4();
        let quote = Quote {
            quote_number: quote_number(&quote_id),
            quote_id: quote_id.to_string(),
            lead_id: lead.id.clone(),
            created_at: now,
            valid_until: now + Duration::days(QUOTE_VALID_DAYS),
            quote_title: copy.title,
            company_tagline: copy.tagline,
            customer_info: customer_info(&lead),
            business_context: json!({
                "pain_points": lead.pain_points,
                "budget_range": lead.budget_range,
                "decision_timeline": lead.decision_timeline,
                "use_case": requirements.use_case,
                "technical_requirements": requirements.technical_requirements,
            }),
            line_items,
            subtotal,
            tax_rate,
            tax_amount,
            total,
            currency,
            terms_and_conditions: copy.terms_and_conditions,
            implementation_notes: copy.implementation_notes,
            next_steps: copy.next_steps,
            provider: provider.name().to_string(),
            model,
        };

        self.store
            .insert_message(&NewChatMessage {
                lead_id: lead.id.clone(),
                message_type: MessageType::Assistant,
                content: format!(
                    "Quote {} prepared: {} item(s), total {:.2} {}",
                    quote.quote_number,
                    quote.line_items.len(),
                    quote.total,
                    quote.currency
                ),
                stage: Some(QUOTE_READY_STAGE.to_string()),
                metadata: Some(json!({
                    "type": "quote",
                    "provider": quote.provider,
                    "model": quote.model,
                    "usage": usage,
                    "quote": quote,
                })),
            })
            .await?;
        self.store.touch_lead_contact(&lead.id, now).await?;

        tracing::info!(
            lead_id = %lead.id,
            quote_number = %quote.quote_number,
            items = quote.line_items.len(),
            total = quote.total,
            "quote generated"
        );
        Ok(quote)
    }
}

fn quote_number(id: &Uuid) -> String {
    let hex = id.simple().to_string();
    format!("Q-{}", hex[..8].to_uppercase())
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// One line per priced product; unpriced products cannot be quoted.
pub fn line_items(products: &[Product], quantities: &BTreeMap<String, u32>) -> Vec<QuoteLineItem> {
    products
        .iter()
        .filter_map(|product| {
            let unit_price = product.price?;
            let quantity = quantities.get(&product.id).copied().unwrap_or(1).max(1);
            Some(QuoteLineItem {
                product_id: product.id.clone(),
                name: product.name.clone(),
                description: product.description.clone().unwrap_or_default(),
                category: product.category.clone(),
                quantity,
                unit_price,
                total_price: round_cents(unit_price * f64::from(quantity)),
            })
        })
        .collect()
}

/// Subtotal, tax and grand total, each rounded to cents.
pub fn totals(items: &[QuoteLineItem], tax_rate: f64) -> (f64, f64, f64) {
    let subtotal = round_cents(items.iter().map(|i| i.total_price).sum());
    let tax_amount = round_cents(subtotal * tax_rate);
    (subtotal, tax_amount, round_cents(subtotal + tax_amount))
}

fn customer_info(lead: &Lead) -> Value {
    json!({
        "company_name": lead.company_name,
        "contact_name": lead.contact_name,
        "email": lead.email,
        "phone": lead.phone,
        "industry": lead.industry,
        "company_size": lead.company_size,
    })
}

/// Any provider failure or unusable reply falls back to the standard copy.
async fn write_copy(
    provider: &dyn AiProvider,
    lead: &Lead,
    items: &[QuoteLineItem],
    total: f64,
    currency: &str,
) -> (QuoteCopy, Option<Usage>, String) {
    let products = items
        .iter()
        .map(|i| format!("- {} x{} ({})", i.name, i.quantity, i.category.as_deref().unwrap_or("general")))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Write the wording for a B2B technology quote.\n\n\
         CUSTOMER: {} ({})\nPAIN POINTS: {}\nPRODUCTS:\n{products}\nTOTAL: {total:.2} {currency}\n\n\
         Reply with a single JSON object and nothing else, using these keys:\n\
         \"title\": a short professional quote title,\n\
         \"tagline\": a one-line company tagline,\n\
         \"terms_and_conditions\": list of 4-6 terms,\n\
         \"implementation_notes\": list of 3-5 implementation notes,\n\
         \"next_steps\": list of 3-4 next steps for the customer.",
        lead.company_name,
        lead.industry.as_deref().unwrap_or("unknown industry"),
        if lead.pain_points.is_empty() {
            "none recorded".to_string()
        } else {
            lead.pain_points.join(", ")
        },
    );

    let response = provider
        .generate(
            &[AiMessage::user(prompt)],
            &GenerateOptions {
                max_tokens: Some(800),
                temperature: Some(0.3),
                top_p: None,
            },
        )
        .await;

    match response {
        Ok(response) => {
            let copy = parse_reply_json::<QuoteCopy>(&response.content).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "quote wording unusable, using standard terms");
                QuoteCopy::default()
            });
            (copy.with_defaults(), response.usage, response.model)
        }
        Err(err) => {
            tracing::warn!(error = %err, "quote wording failed, using standard terms");
            (
                QuoteCopy::default().with_defaults(),
                None,
                provider.model().to_string(),
            )
        }
    }
}
