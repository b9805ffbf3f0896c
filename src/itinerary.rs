//! Itinerary and budget pipeline collaborator.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::context::ConversationContext;

#[derive(Debug, Error)]
pub enum ItineraryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("planner returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Fallbacks for what the conversation does not collect.
#[derive(Debug, Clone, PartialEq)]
pub struct ItineraryDefaults {
    pub budget: Option<f64>,
    pub member_count: u32,
    pub pace: String,
}

impl Default for ItineraryDefaults {
    fn default() -> Self {
        Self {
            budget: None,
            member_count: 1,
            pace: "moderate".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSpec {
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub interests: Vec<String>,
    pub total_budget: Option<f64>,
    pub member_count: u32,
    pub pace: String,
}

impl TripSpec {
    /// `None` until destination, dates and activities are all known.
    pub fn from_context(context: &ConversationContext, defaults: &ItineraryDefaults) -> Option<Self> {
        if !context.is_complete() {
            return None;
        }
        let range = context.travel_dates?;
        Some(Self {
            destination: context.destination.clone()?,
            start_date: range.start,
            end_date: range.end,
            interests: context.activities.clone(),
            total_budget: context.preferences.budget.or(defaults.budget),
            member_count: defaults.member_count.max(1),
            pace: context
                .preferences
                .travel_style
                .clone()
                .unwrap_or_else(|| defaults.pace.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedActivity {
    pub name: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlan {
    pub day: u32,
    pub date: NaiveDate,
    #[serde(default)]
    pub activities: Vec<PlannedActivity>,
    #[serde(default)]
    pub day_cost: Option<f64>,
}

impl DayPlan {
    pub fn cost(&self) -> f64 {
        self.day_cost
            .unwrap_or_else(|| self.activities.iter().map(|a| a.cost).sum())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryPlan {
    pub destination: String,
    pub days: Vec<DayPlan>,
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl ItineraryPlan {
    pub fn total(&self) -> f64 {
        self.total_cost
            .unwrap_or_else(|| self.days.iter().map(DayPlan::cost).sum())
    }
}

#[async_trait]
pub trait ItineraryPlanner: Send + Sync {
    async fn plan(&self, trip: &TripSpec) -> Result<ItineraryPlan, ItineraryError>;
}

/// Posts the trip as JSON and reads the plan back.
pub struct HttpItineraryPlanner {
    http: reqwest::Client,
    url: String,
}

impl HttpItineraryPlanner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ItineraryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ItineraryPlanner for HttpItineraryPlanner {
    async fn plan(&self, trip: &TripSpec) -> Result<ItineraryPlan, ItineraryError> {
        let response = self.http.post(&self.url).json(trip).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ItineraryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DateRange;
    use chrono::Utc;

    fn complete() -> ConversationContext {
        let mut ctx = ConversationContext::new(Utc::now());
        ctx.destination = Some("Goa".into());
        ctx.travel_dates = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 4, 10).unwrap(),
            NaiveDate::from_ymd_opt(2026, 4, 12).unwrap(),
        );
        ctx.activities = vec!["Beach".into(), "Food Tours".into()];
        ctx
    }

    #[test]
    fn trip_needs_every_slot() {
        let mut ctx = complete();
        ctx.activities.clear();
        assert!(TripSpec::from_context(&ctx, &ItineraryDefaults::default()).is_none());
    }

    #[test]
    fn preferences_beat_defaults() {
        let defaults = ItineraryDefaults {
            budget: Some(1500.0),
            member_count: 2,
            pace: "relaxed".into(),
        };
        let spec = TripSpec::from_context(&complete(), &defaults).unwrap();
        assert_eq!(spec.total_budget, Some(1500.0));
        assert_eq!(spec.pace, "relaxed");
        assert_eq!(spec.member_count, 2);

        let mut ctx = complete();
        ctx.preferences.budget = Some(900.0);
        ctx.preferences.travel_style = Some("packed".into());
        let spec = TripSpec::from_context(&ctx, &defaults).unwrap();
        assert_eq!(spec.total_budget, Some(900.0));
        assert_eq!(spec.pace, "packed");
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let spec = TripSpec::from_context(&complete(), &ItineraryDefaults::default()).unwrap();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["startDate"], "2026-04-10");
        assert_eq!(value["memberCount"], 1);
        assert_eq!(value["interests"][1], "Food Tours");
    }

    #[test]
    fn costs_fall_back_to_activity_sums() {
        let plan: ItineraryPlan = serde_json::from_str(
            r#"{"destination": "Goa", "days": [
                {"day": 1, "date": "2026-04-10", "activities": [{"name": "Baga Beach", "cost": 0}, {"name": "Spice farm", "cost": 25.5}]},
                {"day": 2, "date": "2026-04-11", "activities": [], "dayCost": 40}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.days[0].cost(), 25.5);
        assert_eq!(plan.total(), 65.5);
    }
}
