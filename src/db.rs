use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    CatalogManifest, ChatMessage, ChatSearchHit, CompanySize, Lead, LeadCreate, LeadStatus,
    LeadUpdate, MessageType, NewChatMessage,
};

const LEAD_COLUMNS: &str = "id, company_name, contact_name, email, phone, industry, company_size, \
     annual_revenue, pain_points, budget_range, decision_timeline, decision_makers, status, \
     lead_score, notes, created_at, updated_at, last_contact, next_follow_up";

const MESSAGE_COLUMNS: &str = "id, lead_id, message_type, content, stage, metadata, created_at";

#[derive(Debug)]
pub enum CreateLead {
    Created(Lead),
    DuplicateEmail,
}

#[derive(Debug)]
pub enum UpdateLead {
    Updated(Lead),
    NotFound,
    DuplicateEmail,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config)
            .connect(&config.url)
            .await
            .context("failed to open postgres pool")?;

        Ok(Self { pool })
    }

    /// Builds the pool without opening a connection. Used at startup so the
    /// readiness probe is the first thing that talks to the server.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config)
            .connect_lazy(&config.url)
            .context("invalid database url")?;

        Ok(Self { pool })
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
    }

    /// Applies the embedded migrations. Already-applied versions are skipped.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("schema migration failed")?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_lead(&self, request: &LeadCreate) -> Result<CreateLead> {
        if self.find_lead_by_email(&request.email).await?.is_some() {
            return Ok(CreateLead::DuplicateEmail);
        }

        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO leads (id, company_name, contact_name, email, phone, industry, company_size, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {LEAD_COLUMNS}
            "#
        ))
        .bind(&id)
        .bind(&request.company_name)
        .bind(&request.contact_name)
        .bind(&request.email)
        .bind(&request.phone)
        .bind(&request.industry)
        .bind(request.company_size.map(CompanySize::as_str))
        .bind(LeadStatus::New.as_db())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(CreateLead::Created(row_to_lead(&row)?)),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Ok(CreateLead::DuplicateEmail)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_lead).transpose()
    }

    pub async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>> {
        let row = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_lead).transpose()
    }

    pub async fn lead_exists(&self, lead_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM leads WHERE id = $1) AS present")
            .bind(lead_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>("present"))
    }

    pub async fn list_leads(
        &self,
        status: Option<LeadStatus>,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Lead>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LEAD_COLUMNS}
            FROM leads
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at ASC, id ASC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(status.map(LeadStatus::as_db))
        .bind(skip.max(0))
        .bind(limit.clamp(1, 1_000))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_lead).collect()
    }

    /// Applies the supplied fields in one statement, so concurrent writers
    /// of other columns (such as `last_contact`) are never overwritten.
    pub async fn update_lead(&self, lead_id: &str, update: &LeadUpdate) -> Result<UpdateLead> {
        if let Some(email) = &update.email {
            if let Some(existing) = self.find_lead_by_email(email).await? {
                if existing.id != lead_id {
                    return Ok(UpdateLead::DuplicateEmail);
                }
            }
        }

        let result = sqlx::query(&format!(
            r#"
            UPDATE leads SET
                company_name = COALESCE($2, company_name),
                contact_name = COALESCE($3, contact_name),
                email = COALESCE($4, email),
                phone = COALESCE($5, phone),
                industry = COALESCE($6, industry),
                company_size = COALESCE($7, company_size),
                annual_revenue = COALESCE($8, annual_revenue),
                pain_points = COALESCE($9, pain_points),
                budget_range = COALESCE($10, budget_range),
                decision_timeline = COALESCE($11, decision_timeline),
                decision_makers = COALESCE($12, decision_makers),
                status = COALESCE($13, status),
                lead_score = COALESCE($14, lead_score),
                notes = COALESCE($15, notes),
                next_follow_up = COALESCE($16, next_follow_up),
                updated_at = now()
            WHERE id = $1
            RETURNING {LEAD_COLUMNS}
            "#
        ))
        .bind(lead_id)
        .bind(&update.company_name)
        .bind(&update.contact_name)
        .bind(update.email.as_deref().map(str::trim))
        .bind(&update.phone)
        .bind(&update.industry)
        .bind(update.company_size.map(CompanySize::as_str))
        .bind(&update.annual_revenue)
        .bind(update.pain_points.as_ref().map(Json))
        .bind(&update.budget_range)
        .bind(&update.decision_timeline)
        .bind(update.decision_makers.as_ref().map(Json))
        .bind(update.status.map(LeadStatus::as_db))
        .bind(update.lead_score)
        .bind(&update.notes)
        .bind(update.next_follow_up)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Ok(UpdateLead::Updated(row_to_lead(&row)?)),
            Ok(None) => Ok(UpdateLead::NotFound),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Ok(UpdateLead::DuplicateEmail)
            }
            Err(err) => Err(err).with_context(|| format!("failed to update lead {lead_id}")),
        }
    }

    /// Deletes the lead; its chat messages go with it through the FK cascade.
    pub async fn delete_lead(&self, lead_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(lead_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_lead_contact(&self, lead_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE leads SET last_contact = $2, updated_at = $2 WHERE id = $1")
            .bind(lead_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_lead_score(&self, lead_id: &str, score: i32) -> Result<()> {
        sqlx::query("UPDATE leads SET lead_score = $2 WHERE id = $1")
            .bind(lead_id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_message(&self, message: &NewChatMessage) -> Result<ChatMessage> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO chat_messages (id, lead_id, message_type, content, stage, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.lead_id)
        .bind(message.message_type.as_str())
        .bind(&message.content)
        .bind(&message.stage)
        .bind(message.metadata.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to store message for lead {}", message.lead_id))?;

        row_to_message(&row)
    }

    pub async fn messages_for_lead(&self, lead_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE lead_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    pub async fn latest_messages(&self, lead_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM chat_messages
            WHERE lead_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(lead_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    pub async fn count_messages(&self, lead_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM chat_messages WHERE lead_id = $1")
            .bind(lead_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total"))
    }

    /// Full-text search over message content, ranked by `ts_rank`.
    pub async fn search_messages_exact(
        &self,
        query: &str,
        lead_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatSearchHit>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS},
                   ts_rank(to_tsvector('english', content), plainto_tsquery('english', $1)) AS score
            FROM chat_messages
            WHERE to_tsvector('english', content) @@ plainto_tsquery('english', $1)
              AND ($2::text IS NULL OR lead_id = $2)
            ORDER BY score DESC, created_at DESC
            LIMIT $3
            "#
        ))
        .bind(query)
        .bind(lead_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_search_hit).collect()
    }

    /// Trigram search tolerant of typos and partial words.
    pub async fn search_messages_fuzzy(
        &self,
        query: &str,
        lead_id: Option<&str>,
        threshold: f32,
        limit: i64,
    ) -> Result<Vec<ChatSearchHit>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS},
                   word_similarity($1, content) AS score
            FROM chat_messages
            WHERE word_similarity($1, content) >= $2
              AND ($3::text IS NULL OR lead_id = $3)
            ORDER BY score DESC, created_at DESC
            LIMIT $4
            "#
        ))
        .bind(query)
        .bind(threshold.clamp(0.0, 1.0))
        .bind(lead_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_search_hit).collect()
    }

    pub async fn record_manifest(&self, manifest: &CatalogManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catalog_manifests (fingerprint, product_count, solution_count, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&manifest.fingerprint)
        .bind(manifest.product_count)
        .bind(manifest.solution_count)
        .bind(manifest.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_manifest(&self) -> Result<Option<CatalogManifest>> {
        let row = sqlx::query(
            r#"
            SELECT fingerprint, product_count, solution_count, created_at
            FROM catalog_manifests
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CatalogManifest {
            fingerprint: r.get("fingerprint"),
            product_count: r.get("product_count"),
            solution_count: r.get("solution_count"),
            created_at: r.get("created_at"),
        }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_lead(row: &PgRow) -> Result<Lead> {
    let pain_points: Json<Vec<String>> = row.try_get("pain_points")?;
    let decision_makers: Json<Vec<String>> = row.try_get("decision_makers")?;
    let company_size: Option<String> = row.try_get("company_size")?;
    let status: String = row.try_get("status")?;

    Ok(Lead {
        id: row.try_get("id")?,
        company_name: row.try_get("company_name")?,
        contact_name: row.try_get("contact_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        industry: row.try_get("industry")?,
        company_size: company_size.as_deref().and_then(CompanySize::from_db),
        annual_revenue: row.try_get("annual_revenue")?,
        pain_points: pain_points.0,
        budget_range: row.try_get("budget_range")?,
        decision_timeline: row.try_get("decision_timeline")?,
        decision_makers: decision_makers.0,
        status: LeadStatus::from_db(&status),
        lead_score: row.try_get("lead_score")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_contact: row.try_get("last_contact")?,
        next_follow_up: row.try_get("next_follow_up")?,
    })
}

fn row_to_message(row: &PgRow) -> Result<ChatMessage> {
    let message_type: String = row.try_get("message_type")?;
    let metadata: Option<Json<serde_json::Value>> = row.try_get("metadata")?;

    Ok(ChatMessage {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        message_type: MessageType::from_str(&message_type)?,
        content: row.try_get("content")?,
        stage: row.try_get("stage")?,
        metadata: metadata.map(|json| json.0),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_search_hit(row: &PgRow) -> Result<ChatSearchHit> {
    Ok(ChatSearchHit {
        message: row_to_message(row)?,
        score: row.try_get::<f32, _>("score")?,
    })
}
