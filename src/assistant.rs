//! One chat turn, end to end.

use anyhow::Context as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::analyze::{self, TripAnalysis};
use crate::compose::{ComposeInput, ComposedResponse, ItineraryOutcome, ResponseComposer, WeatherOutcome};
use crate::context::{
    ContextPatch, ContextStore, ConversationContext, HistoryEntry, Role, DEFAULT_HISTORY_LIMIT,
};
use crate::intent::{IntentClassifier, IntentEnvelope};
use crate::itinerary::{HttpItineraryPlanner, ItineraryDefaults, ItineraryPlanner, TripSpec};
use crate::llm::{ChatCompletionsClient, LlmClient};
use crate::settings::Settings;
use crate::stage::{Stage, StageController, TurnPlan};
use crate::weather::{OpenWeatherClient, WeatherError, WeatherProvider};

static ITINERARY_REQUEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:itinerary|plan\s+my|day[\s-]by[\s-]day|schedule)\b").unwrap());

const FAILURE_TEXT: &str = "Sorry, something went wrong on my side. Could you say that again?";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("could not encode response data: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    pub stage: Stage,
    pub response: ComposedResponse,
    pub context: ConversationContext,
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    pub fn failure(context: ConversationContext, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            stage: Stage::Error,
            response: ComposedResponse {
                text: FAILURE_TEXT.to_string(),
                data: json!({}),
                suggestions: Vec::new(),
                actions: Vec::new(),
            },
            context,
            timestamp,
        }
    }
}

pub struct TripAssistant {
    store: Arc<ContextStore>,
    classifier: IntentClassifier,
    stages: StageController,
    composer: ResponseComposer,
    weather: Option<Arc<dyn WeatherProvider>>,
    planner: Option<Arc<dyn ItineraryPlanner>>,
    itinerary_defaults: ItineraryDefaults,
    units: String,
    forecast_days: usize,
    weather_timeout: Duration,
    history_limit: usize,
}

impl TripAssistant {
    /// Rule-based only, with no collaborators wired in.
    pub fn new(store: Arc<ContextStore>) -> Self {
        let timeout = Duration::from_secs(10);
        Self {
            store,
            classifier: IntentClassifier::new(None, timeout),
            stages: StageController::new(),
            composer: ResponseComposer::new(None, timeout),
            weather: None,
            planner: None,
            itinerary_defaults: ItineraryDefaults::default(),
            units: "metric".to_string(),
            forecast_days: 5,
            weather_timeout: Duration::from_secs(8),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        self.classifier = IntentClassifier::new(Some(llm.clone()), timeout);
        self.composer = ResponseComposer::new(Some(llm), timeout).with_units(&self.units);
        self
    }

    pub fn with_weather(mut self, provider: Arc<dyn WeatherProvider>, timeout: Duration) -> Self {
        self.weather = Some(provider);
        self.weather_timeout = timeout;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn ItineraryPlanner>, defaults: ItineraryDefaults) -> Self {
        self.planner = Some(planner);
        self.itinerary_defaults = defaults;
        self
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self.composer = self.composer.with_units(units);
        self
    }

    pub fn with_forecast_days(mut self, days: usize) -> Self {
        self.forecast_days = days;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Wires the configured collaborators. A blank key leaves one out.
    pub fn from_settings(settings: &Settings, store: Arc<ContextStore>) -> anyhow::Result<Self> {
        let mut assistant = Self::new(store)
            .with_units(&settings.weather.units)
            .with_forecast_days(settings.weather.forecast_days)
            .with_history_limit(settings.context.history_limit);

        let llm = &settings.llm;
        if llm.is_usable() {
            let timeout = Duration::from_secs(llm.timeout_secs);
            let client = ChatCompletionsClient::new(&llm.base_url, llm.api_key.clone(), llm.model.clone(), timeout)
                .context("building language model client")?;
            assistant = assistant.with_llm(Arc::new(client), timeout);
            log::info!("Language model enabled ({})", llm.model);
        } else {
            log::warn!("No language model configured, using rule-based replies only");
        }

        let weather = &settings.weather;
        if weather.api_key.trim().is_empty() {
            log::warn!("No weather API key configured, weather lookups will report an error");
        } else {
            let timeout = Duration::from_secs(weather.timeout_secs);
            let client = OpenWeatherClient::new(&weather.base_url, weather.api_key.clone(), weather.units.clone(), timeout)
                .context("building weather client")?;
            assistant = assistant.with_weather(Arc::new(client), timeout);
        }

        let itinerary = &settings.itinerary;
        if let Some(url) = &itinerary.url {
            let planner = HttpItineraryPlanner::new(url.clone(), Duration::from_secs(itinerary.timeout_secs))
                .context("building itinerary client")?;
            let defaults = ItineraryDefaults {
                budget: itinerary.default_budget,
                member_count: itinerary.default_member_count,
                pace: itinerary.default_pace.clone(),
            };
            assistant = assistant.with_planner(Arc::new(planner), defaults);
            log::info!("Itinerary planner at {}", url);
        }

        Ok(assistant)
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Never fails: errors become a `success: false` envelope.
    pub async fn handle_turn(&self, user_id: &str, message: &str) -> ResponseEnvelope {
        let turn = Uuid::new_v4();
        log::debug!("[{}] turn for '{}': {:?}", turn, user_id, message);
        match self.run_turn(turn, user_id, message).await {
            Ok(envelope) => envelope,
            Err(err) => {
                log::error!("[{}] turn failed for '{}': {}", turn, user_id, err);
                let now = self.store.clock().now();
                ResponseEnvelope::failure(self.store.get_context(user_id), now)
            }
        }
    }

    async fn run_turn(&self, turn: Uuid, user_id: &str, message: &str) -> Result<ResponseEnvelope, TurnError> {
        let context = self.store.get_context(user_id);
        let now = self.store.clock().now();
        let today = now.date_naive();

        let envelope = self.classifier.classify(message, &context, today).await;
        let mut slots = envelope.extracted_info.slots();
        let mut proposed = context.merged(&slots);
        let mut plan = self.stages.plan(message, &envelope, &proposed);
        log::debug!("[{}] {:?} -> {:?}", turn, envelope.intent, plan.pipeline());

        let weather = match plan.weather_location.as_deref() {
            Some(location) => Some(self.fetch_weather(location).await),
            None => None,
        };

        if let Some(WeatherOutcome::NotFound(place)) = &weather {
            let was_destination = proposed
                .destination
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(place));
            if was_destination {
                slots.destination = Some(None);
                proposed.destination = None;
                plan = TurnPlan {
                    stage: Stage::CollectDestination,
                    weather_location: plan.weather_location.take(),
                    answer_directly: false,
                };
            }
        }

        let analysis = self.analyze(&plan, &proposed, weather.as_ref());
        let itinerary = self.itinerary(&plan, &context, &proposed, message).await;

        let composed = self
            .composer
            .compose(&ComposeInput {
                envelope: &envelope,
                context: &proposed,
                plan: &plan,
                weather: weather.as_ref(),
                analysis: analysis.as_ref(),
                itinerary: itinerary.as_ref(),
            })
            .await?;

        let patch = self.turn_patch(slots, &envelope, &proposed, &plan, message, &composed, now);
        let stored = self.store.update_context(user_id, &patch);

        Ok(ResponseEnvelope {
            success: true,
            stage: plan.stage,
            response: composed,
            context: stored,
            timestamp: now,
        })
    }

    async fn fetch_weather(&self, location: &str) -> WeatherOutcome {
        let Some(provider) = &self.weather else {
            return WeatherOutcome::Failed("weather service is not configured".to_string());
        };
        let fetch = provider.report(location, self.forecast_days);
        match tokio::time::timeout(self.weather_timeout, fetch).await {
            Ok(Ok(report)) => WeatherOutcome::Fetched(report),
            Ok(Err(WeatherError::LocationNotFound(place))) => {
                log::info!("Weather lookup found no place called '{}'", place);
                WeatherOutcome::NotFound(location.to_string())
            }
            Ok(Err(err)) => {
                log::warn!("Weather lookup for '{}' failed: {}", location, err);
                WeatherOutcome::Failed(err.to_string())
            }
            Err(_) => {
                log::warn!("Weather lookup for '{}' timed out", location);
                WeatherOutcome::Failed(format!("weather service timed out after {:?}", self.weather_timeout))
            }
        }
    }

    fn analyze(
        &self,
        plan: &TurnPlan,
        proposed: &ConversationContext,
        weather: Option<&WeatherOutcome>,
    ) -> Option<TripAnalysis> {
        if plan.stage != Stage::FetchWeather || plan.answer_directly {
            return None;
        }
        match (proposed.travel_dates, weather) {
            (Some(range), Some(WeatherOutcome::Fetched(report))) => {
                Some(analyze::analyze(&range, &proposed.activities, report))
            }
            _ => None,
        }
    }

    /// Planned once when the trip first becomes complete, or on request.
    async fn itinerary(
        &self,
        plan: &TurnPlan,
        before: &ConversationContext,
        proposed: &ConversationContext,
        message: &str,
    ) -> Option<ItineraryOutcome> {
        let planner = self.planner.as_ref()?;
        if plan.stage != Stage::FetchWeather || plan.answer_directly {
            return None;
        }
        if before.is_complete() && !ITINERARY_REQUEST.is_match(message) {
            return None;
        }
        let trip = TripSpec::from_context(proposed, &self.itinerary_defaults)?;
        Some(match planner.plan(&trip).await {
            Ok(itinerary) => ItineraryOutcome::Planned(itinerary),
            Err(err) => {
                log::warn!("Itinerary planning for {} failed: {}", trip.destination, err);
                ItineraryOutcome::Failed(err.to_string())
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn turn_patch(
        &self,
        slots: ContextPatch,
        envelope: &IntentEnvelope,
        proposed: &ConversationContext,
        plan: &TurnPlan,
        message: &str,
        composed: &ComposedResponse,
        now: DateTime<Utc>,
    ) -> ContextPatch {
        let entries = vec![
            HistoryEntry {
                role: Role::User,
                message: message.to_string(),
                timestamp: now,
                stage: Some(plan.stage),
            },
            HistoryEntry {
                role: Role::Assistant,
                message: composed.text.clone(),
                // Keeps the two entries of one turn ordered.
                timestamp: now + ChronoDuration::milliseconds(1),
                stage: Some(plan.stage),
            },
        ];
        let mut patch = slots.clone();
        patch.extend(ContextPatch {
            conversation_history: Some(proposed.history_with(entries, self.history_limit)),
            extracted_info: Some(Some(Box::new(slots))),
            last_intent: Some(envelope.intent),
            last_response: Some(composed.text.clone()),
            ..ContextPatch::default()
        });
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::weather::{CurrentWeather, WeatherReport};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct Recording {
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WeatherProvider for Recording {
        async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError> {
            self.asked.lock().push(location.to_string());
            if location == "Atlantis" {
                return Err(WeatherError::LocationNotFound(location.into()));
            }
            Ok(CurrentWeather {
                location: location.into(),
                temperature: 29.0,
                feels_like: 31.0,
                condition_description: "clear sky".into(),
                humidity: 60,
                wind_speed: 3.0,
                rain_mm: 0.0,
            })
        }

        async fn forecast(
            &self,
            _location: &str,
            _days: usize,
        ) -> Result<Vec<crate::weather::DailyForecast>, WeatherError> {
            Ok(Vec::new())
        }

        async fn report(&self, location: &str, _days: usize) -> Result<WeatherReport, WeatherError> {
            let current = self.current(location).await?;
            Ok(WeatherReport {
                location: current.location.clone(),
                current,
                forecast: Vec::new(),
            })
        }
    }

    fn assistant() -> (TripAssistant, Arc<Recording>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()));
        let store = Arc::new(ContextStore::with_clock(clock));
        let weather = Arc::new(Recording {
            asked: Mutex::new(Vec::new()),
        });
        let assistant = TripAssistant::new(store).with_weather(weather.clone(), Duration::from_secs(1));
        (assistant, weather)
    }

    #[tokio::test]
    async fn collection_dialogue_walks_the_stages() {
        let (assistant, weather) = assistant();
        let hi = assistant.handle_turn("u1", "Hi").await;
        assert!(hi.success);
        assert_eq!(hi.stage, Stage::Greeting);

        let goa = assistant.handle_turn("u1", "Goa").await;
        assert_eq!(goa.stage, Stage::CollectDates);
        assert_eq!(goa.context.destination.as_deref(), Some("Goa"));

        let dates = assistant.handle_turn("u1", "April 10 - 20").await;
        assert_eq!(dates.stage, Stage::CollectActivities);
        assert_eq!(dates.context.travel_dates.unwrap().start.to_string(), "2026-04-10");

        let acts = assistant.handle_turn("u1", "beach activities").await;
        assert_eq!(acts.stage, Stage::FetchWeather);
        assert_eq!(acts.context.activities, vec!["Beach Activities".to_string()]);
        assert_eq!(weather.asked.lock().as_slice(), ["Goa".to_string(), "Goa".to_string()]);
        assert!(acts.response.data.get("analysis").is_some());

        assert_eq!(acts.context.conversation_history.len(), 8);
        assert_eq!(acts.context.last_intent, Some(crate::intent::Intent::ProvideInfo));
    }

    #[tokio::test]
    async fn unknown_place_clears_destination() {
        let (assistant, _) = assistant();
        let out = assistant.handle_turn("u2", "I want to go to Atlantis").await;
        assert!(out.success);
        assert_eq!(out.stage, Stage::CollectDestination);
        assert!(out.context.destination.is_none());
        assert!(out.response.text.contains("Atlantis"));
    }

    #[tokio::test]
    async fn weather_question_does_not_move_the_trip() {
        let (assistant, weather) = assistant();
        assistant.handle_turn("u3", "Tokyo").await;
        let out = assistant.handle_turn("u3", "weather in Paris").await;
        assert_eq!(weather.asked.lock().last().map(String::as_str), Some("Paris"));
        assert_eq!(out.context.destination.as_deref(), Some("Tokyo"));
        assert_eq!(out.stage, Stage::CollectDates);
        assert!(out.response.text.contains("Paris"));
    }

    #[tokio::test]
    async fn weather_elsewhere_on_a_complete_trip_is_answered_not_analyzed() {
        let (assistant, weather) = assistant();
        for msg in ["Goa", "April 10 - 20", "beach activities"] {
            assistant.handle_turn("u5", msg).await;
        }
        let out = assistant.handle_turn("u5", "weather in Paris").await;
        assert_eq!(weather.asked.lock().last().map(String::as_str), Some("Paris"));
        assert_eq!(out.stage, Stage::FetchWeather);
        assert_eq!(out.context.destination.as_deref(), Some("Goa"));
        assert!(out.response.text.starts_with("Right now in Paris"));
        assert!(out.response.data.get("analysis").is_none());
        assert_eq!(out.response.data["weather"]["location"], "Paris");
    }

    #[tokio::test]
    async fn unknown_place_in_weather_question_keeps_the_trip() {
        let (assistant, _) = assistant();
        assistant.handle_turn("u6", "Tokyo").await;
        let out = assistant.handle_turn("u6", "weather in Atlantis").await;
        assert_eq!(out.context.destination.as_deref(), Some("Tokyo"));
        assert_eq!(out.stage, Stage::CollectDates);
        assert!(out.response.text.contains("Atlantis"));
        assert!(!out.response.text.contains("destination"));
    }

    #[tokio::test]
    async fn missing_weather_service_is_a_soft_error() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()));
        let assistant = TripAssistant::new(Arc::new(ContextStore::with_clock(clock)));
        let out = assistant.handle_turn("u4", "weather in Bali").await;
        assert!(out.success);
        assert!(out.response.data["weather"]["error"].is_string());
        assert_eq!(out.context.destination.as_deref(), Some("Bali"));
    }

    #[test]
    fn failure_envelope_shape() {
        let env = ResponseEnvelope::failure(ConversationContext::new(Utc::now()), Utc::now());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["stage"], "error");
        assert_eq!(value["response"]["text"], FAILURE_TEXT);
    }
}
