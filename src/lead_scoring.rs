use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{CompanySize, Lead};

const MAX_SCORE: i32 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreFactors {
    pub company_size: Option<CompanySize>,
    pub budget_range: Option<String>,
    pub decision_timeline: Option<String>,
    pub pain_points_count: usize,
    pub days_since_contact: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LeadScore {
    pub lead_score: i32,
    pub factors: ScoreFactors,
}

/// Rule-based qualification score in `0..=100`.
pub fn score_lead(lead: &Lead, now: DateTime<Utc>) -> LeadScore {
    let days_since_contact = lead.last_contact.map(|at| (now - at).num_days());

    let mut score = lead.company_size.map(size_points).unwrap_or(0);
    score += lead.budget_range.as_deref().map(budget_points).unwrap_or(0);
    score += lead
        .decision_timeline
        .as_deref()
        .map(timeline_points)
        .unwrap_or(0);
    score += 5 * lead.pain_points.len() as i32;
    score += match days_since_contact {
        Some(days) if days <= 7 => 20,
        Some(days) if days <= 30 => 10,
        _ => 0,
    };

    LeadScore {
        lead_score: score.min(MAX_SCORE),
        factors: ScoreFactors {
            company_size: lead.company_size,
            budget_range: lead.budget_range.clone(),
            decision_timeline: lead.decision_timeline.clone(),
            pain_points_count: lead.pain_points.len(),
            days_since_contact,
        },
    }
}

fn size_points(size: CompanySize) -> i32 {
    match size {
        CompanySize::Startup => 20,
        CompanySize::Small => 40,
        CompanySize::Medium => 60,
        CompanySize::Large => 80,
        CompanySize::Enterprise => 100,
    }
}

fn budget_points(budget: &str) -> i32 {
    let budget = budget.to_lowercase();
    if budget.contains("100k+") {
        50
    } else if budget.contains("50k+") {
        30
    } else if budget.contains("10k+") {
        20
    } else {
        0
    }
}

fn timeline_points(timeline: &str) -> i32 {
    let timeline = timeline.to_lowercase();
    if timeline.contains("immediate") || timeline.contains("asap") {
        30
    } else if timeline.contains("month") {
        20
    } else if timeline.contains("quarter") {
        10
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::LeadStatus;

    fn lead() -> Lead {
        let now = Utc::now();
        Lead {
            id: "lead-1".into(),
            company_name: "Acme".into(),
            contact_name: "Sam".into(),
            email: "sam@acme.test".into(),
            phone: None,
            industry: None,
            company_size: None,
            annual_revenue: None,
            pain_points: Vec::new(),
            budget_range: None,
            decision_timeline: None,
            decision_makers: Vec::new(),
            status: LeadStatus::New,
            lead_score: None,
            notes: None,
            created_at: now,
            updated_at: now,
            last_contact: None,
            next_follow_up: None,
        }
    }

    #[test]
    fn empty_lead_scores_zero() {
        let scored = score_lead(&lead(), Utc::now());
        assert_eq!(scored.lead_score, 0);
        assert_eq!(scored.factors.days_since_contact, None);
    }

    #[test]
    fn adds_up_each_factor() {
        let now = Utc::now();
        let mut lead = lead();
        lead.company_size = Some(CompanySize::Small);
        lead.budget_range = Some("$10K+".into());
        lead.decision_timeline = Some("Next quarter".into());
        lead.pain_points = vec!["slow backups".into()];
        lead.last_contact = Some(now - Duration::days(12));

        let scored = score_lead(&lead, now);
        assert_eq!(scored.lead_score, 40 + 20 + 10 + 5 + 10);
        assert_eq!(scored.factors.pain_points_count, 1);
        assert_eq!(scored.factors.days_since_contact, Some(12));
    }

    #[test]
    fn strongest_budget_and_timeline_match_wins() {
        let mut lead = lead();
        lead.budget_range = Some("100k+".into());
        lead.decision_timeline = Some("ASAP, within a month".into());
        assert_eq!(score_lead(&lead, Utc::now()).lead_score, 50 + 30);
    }

    #[test]
    fn stale_contact_adds_nothing() {
        let now = Utc::now();
        let mut lead = lead();
        lead.last_contact = Some(now - Duration::days(45));
        assert_eq!(score_lead(&lead, now).lead_score, 0);

        lead.last_contact = Some(now - Duration::days(3));
        assert_eq!(score_lead(&lead, now).lead_score, 20);
    }

    #[test]
    fn capped_at_one_hundred() {
        let mut lead = lead();
        lead.company_size = Some(CompanySize::Enterprise);
        lead.budget_range = Some("100k+".into());
        lead.pain_points = vec!["a".into(), "b".into()];
        assert_eq!(score_lead(&lead, Utc::now()).lead_score, 100);
    }
}
