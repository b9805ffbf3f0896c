use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{ContextPatch, ConversationContext, DateRange};
use crate::extract::{self, DateSlot};
use crate::llm::{self, LlmClient, LlmError};

// The output of the classifier, telling the turn pipeline what it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    ProvideInfo,
    AskWeather,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Greeting,
    CollectInfo,
    WeatherInfo,
    TripSummary,
    General,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentEnvelope {
    pub intent: Intent,
    #[serde(default)]
    pub extracted_info: ContextPatch,
    #[serde(default)]
    pub needs_weather: bool,
    #[serde(default)]
    pub needs_more_date_info: bool,
    pub response_type: ResponseType,
    /// Place a weather question names, overriding the stored destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_location: Option<String>,
}

impl IntentEnvelope {
    fn new(intent: Intent, response_type: ResponseType) -> Self {
        Self {
            intent,
            extracted_info: ContextPatch::default(),
            needs_weather: false,
            needs_more_date_info: false,
            response_type,
            weather_location: None,
        }
    }
}

pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Never fails: any service problem yields the rule-based envelope.
    pub async fn classify(
        &self,
        message: &str,
        context: &ConversationContext,
        today: NaiveDate,
    ) -> IntentEnvelope {
        let prompt = build_prompt(message, context, today);
        let outcome = llm::with_fallback(
            self.llm.as_deref(),
            self.timeout,
            "intent classifier",
            &prompt,
            |reply| parse_reply(reply, context),
            || classify_fallback(message, context, today),
        )
        .await;
        log::debug!(
            "classified {:?} via {:?}: {:?}",
            outcome.value.intent,
            outcome.source,
            outcome.value.extracted_info
        );
        outcome.value
    }
}

// --- Rule-based path ---

/// Deterministic classification, checked in a fixed order.
pub fn classify_fallback(
    message: &str,
    context: &ConversationContext,
    today: NaiveDate,
) -> IntentEnvelope {
    let weather_flavoured = extract::mentions_weather(message);

    // Rule 1: greetings win outright
    if extract::is_greeting(message) {
        return IntentEnvelope::new(Intent::Greeting, ResponseType::Greeting);
    }

    // Rule 2: no destination yet, look for one
    if !context.has_destination() {
        if let Some(destination) = extract::extract_destination(message) {
            let mut envelope = IntentEnvelope::new(Intent::ProvideInfo, ResponseType::CollectInfo);
            envelope.extracted_info.destination = Some(Some(destination));
            envelope.needs_weather = true;
            // Dates given in the same breath are kept too.
            apply_date_slot(
                &mut envelope,
                extract::extract_dates(message, context.partial_date_info.as_deref(), today),
            );
            return envelope;
        }
    }

    // Rule 3: destination and dates known, activities missing
    if context.has_destination()
        && context.has_dates()
        && !context.has_activities()
        && !weather_flavoured
    {
        let activities = extract::extract_activities(message);
        if !activities.is_empty() {
            let mut envelope = IntentEnvelope::new(Intent::ProvideInfo, ResponseType::TripSummary);
            envelope.extracted_info.activities = Some(activities);
            envelope.needs_weather = true;
            return envelope;
        }
    }

    // Rule 4: destination known, dates missing
    if context.has_destination() && !context.has_dates() {
        let slot = extract::extract_dates(message, context.partial_date_info.as_deref(), today);
        if slot.is_some() {
            let mut envelope = IntentEnvelope::new(Intent::ProvideInfo, ResponseType::CollectInfo);
            envelope.needs_weather = true;
            apply_date_slot(&mut envelope, slot);
            return envelope;
        }
    }

    // Rule 5: a direct weather question
    if weather_flavoured {
        let mut envelope = IntentEnvelope::new(Intent::AskWeather, ResponseType::WeatherInfo);
        envelope.needs_weather = true;
        envelope.weather_location = extract::extract_weather_location(message);
        if !context.has_destination() {
            envelope.extracted_info.destination = envelope.weather_location.clone().map(Some);
        }
        return envelope;
    }

    // Rule 6: anything else
    let mut envelope = IntentEnvelope::new(Intent::Other, ResponseType::General);
    envelope.needs_weather = context.has_destination();
    envelope
}

fn apply_date_slot(envelope: &mut IntentEnvelope, slot: Option<DateSlot>) {
    match slot {
        Some(DateSlot::Range(range)) => {
            envelope.extracted_info.travel_dates = Some(Some(range));
            envelope.extracted_info.partial_date_info = Some(None);
        }
        Some(DateSlot::Month(month)) => {
            envelope.extracted_info.partial_date_info = Some(Some(month));
            envelope.needs_more_date_info = true;
        }
        None => {}
    }
}

// --- Service path ---

fn build_prompt(message: &str, context: &ConversationContext, today: NaiveDate) -> String {
    let snapshot = json!({
        "destination": context.destination,
        "travelDates": context.travel_dates,
        "partialDateInfo": context.partial_date_info,
        "activities": context.activities,
    });
    let history = context
        .recent_history(3)
        .iter()
        .map(|entry| format!("{:?}: {}", entry.role, entry.message))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You classify messages for a trip-planning assistant. Today is {today}.\n\
         Known trip details: {snapshot}\n\
         Recent conversation:\n{history}\n\
         User message: \"{message}\"\n\n\
         Reply with ONLY a JSON object of this shape:\n\
         {{\"intent\": \"greeting\" | \"provide_info\" | \"ask_weather\" | \"other\",\n\
          \"extractedInfo\": {{\"destination\": string or null, \
         \"travelDates\": {{\"start\": \"YYYY-MM-DD\", \"end\": \"YYYY-MM-DD\"}} or null, \
         \"partialDateInfo\": month name or null, \"activities\": [string]}},\n\
          \"needsWeather\": bool, \"needsMoreDateInfo\": bool,\n\
          \"responseType\": \"greeting\" | \"collect_info\" | \"weather_info\" | \"trip_summary\" | \"general\",\n\
          \"weatherLocation\": string or null}}\n\
         Only fill fields the message itself states. Dates without a year are this year, \
         or next year if the month has already passed."
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelReply {
    intent: Intent,
    #[serde(default)]
    extracted_info: ModelSlots,
    #[serde(default)]
    needs_weather: bool,
    #[serde(default)]
    needs_more_date_info: bool,
    response_type: ResponseType,
    #[serde(default)]
    weather_location: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelSlots {
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    travel_dates: Option<ModelDates>,
    #[serde(default)]
    partial_date_info: Option<String>,
    #[serde(default)]
    activities: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ModelDates {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

/// Turns a model reply into an envelope, normalizing every slot the same way
/// the rule path does.
fn parse_reply(reply: &str, context: &ConversationContext) -> Result<IntentEnvelope, LlmError> {
    let payload = llm::json_payload(reply)
        .ok_or_else(|| LlmError::Malformed("no JSON object in reply".into()))?;
    let parsed: ModelReply =
        serde_json::from_str(payload).map_err(|e| LlmError::Malformed(e.to_string()))?;

    let slots = parsed.extracted_info;
    let mut patch = ContextPatch::default();
    if let Some(destination) = slots.destination.as_deref().and_then(extract::normalize_destination) {
        patch.destination = Some(Some(destination));
    }
    // One-sided ranges are dropped rather than stored.
    if let Some(ModelDates {
        start: Some(start),
        end: Some(end),
    }) = slots.travel_dates
    {
        if let Some(range) = DateRange::new(start, end) {
            patch.travel_dates = Some(Some(range));
            patch.partial_date_info = Some(None);
        }
    }
    if patch.travel_dates.is_none() {
        if let Some(month) = slots
            .partial_date_info
            .as_deref()
            .and_then(extract::month_index)
            .and_then(extract::month_name)
        {
            patch.partial_date_info = Some(Some(month));
        }
    }
    if let Some(raw) = slots.activities {
        let activities = extract::tidy_activities(raw.iter().map(String::as_str));
        if !activities.is_empty() {
            patch.activities = Some(activities);
        }
    }

    let mut weather_location = parsed
        .weather_location
        .as_deref()
        .and_then(extract::normalize_destination);

    // A weather question about another place must not move the trip.
    if parsed.intent == Intent::AskWeather && context.has_destination() {
        if let Some(Some(asked)) = patch.destination.take() {
            if context.destination.as_deref() != Some(asked.as_str()) && weather_location.is_none() {
                weather_location = Some(asked);
            }
        }
    }
    // With no trip yet, the place asked about becomes the destination.
    if parsed.intent == Intent::AskWeather && !context.has_destination() && patch.destination.is_none() {
        patch.destination = weather_location.clone().map(Some);
    }

    Ok(IntentEnvelope {
        intent: parsed.intent,
        extracted_info: patch,
        needs_weather: parsed.needs_weather,
        needs_more_date_info: parsed.needs_more_date_info,
        response_type: parsed.response_type,
        weather_location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    fn ctx() -> ConversationContext {
        ConversationContext::new(Utc::now())
    }

    fn with_destination(place: &str) -> ConversationContext {
        let mut c = ctx();
        c.destination = Some(place.to_string());
        c
    }

    fn with_dates(place: &str) -> ConversationContext {
        let mut c = with_destination(place);
        c.travel_dates = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 4, 10).unwrap(),
            NaiveDate::from_ymd_opt(2026, 4, 20).unwrap(),
        );
        c
    }

    struct Reply(&'static str);

    #[async_trait]
    impl LlmClient for Reply {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl LlmClient for Down {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    #[test]
    fn greeting_wins_regardless_of_context() {
        for message in ["Hi", "hello!", "Hey, how are you"] {
            let env = classify_fallback(message, &ctx(), today());
            assert_eq!(env.intent, Intent::Greeting);
            assert!(env.extracted_info.is_empty());
        }
    }

    #[test]
    fn bare_place_is_destination() {
        let env = classify_fallback("Goa", &ctx(), today());
        assert_eq!(env.intent, Intent::ProvideInfo);
        assert!(env.needs_weather);
        assert_eq!(env.extracted_info.destination, Some(Some("Goa".into())));
    }

    #[test]
    fn destination_with_month_stages_partial_date() {
        let env = classify_fallback("I want to visit Paris in April", &ctx(), today());
        assert_eq!(env.extracted_info.destination, Some(Some("Paris".into())));
        assert_eq!(env.extracted_info.partial_date_info, Some(Some("April".into())));
        assert!(env.needs_more_date_info);
    }

    #[test]
    fn date_range_when_destination_known() {
        let env = classify_fallback("April 10 - 20", &with_destination("Goa"), today());
        assert_eq!(env.intent, Intent::ProvideInfo);
        let range = env.extracted_info.travel_dates.unwrap().unwrap();
        assert_eq!(range.start.to_string(), "2026-04-10");
        assert_eq!(range.end.to_string(), "2026-04-20");
    }

    #[test]
    fn bare_month_then_day_range() {
        let env = classify_fallback("sometime in June", &with_destination("Goa"), today());
        assert_eq!(env.extracted_info.partial_date_info, Some(Some("June".into())));
        assert!(env.extracted_info.travel_dates.is_none());

        let mut staged = with_destination("Goa");
        staged.partial_date_info = Some("June".into());
        let env = classify_fallback("the 3rd to 9th", &staged, today());
        let range = env.extracted_info.travel_dates.unwrap().unwrap();
        assert_eq!(range.start.to_string(), "2026-06-03");
        assert_eq!(env.extracted_info.partial_date_info, Some(None));
    }

    #[test]
    fn activities_after_dates() {
        let env = classify_fallback("beach activities", &with_dates("Goa"), today());
        assert_eq!(env.intent, Intent::ProvideInfo);
        assert_eq!(env.extracted_info.activities, Some(vec!["Beach Activities".to_string()]));
    }

    #[test]
    fn questions_while_collecting_activities_store_nothing() {
        for msg in ["what can you do?", "hmm, not sure yet", "is it safe there?"] {
            let env = classify_fallback(msg, &with_dates("Goa"), today());
            assert_eq!(env.intent, Intent::Other, "{}", msg);
            assert!(env.extracted_info.activities.is_none(), "{}", msg);
        }
    }

    #[test]
    fn weather_question_overrides_location_without_moving_trip() {
        let env = classify_fallback("weather in Paris", &with_destination("Tokyo"), today());
        assert_eq!(env.intent, Intent::AskWeather);
        assert!(env.needs_weather);
        assert_eq!(env.weather_location.as_deref(), Some("Paris"));
        assert!(env.extracted_info.destination.is_none());
    }

    #[test]
    fn weather_question_fills_empty_destination() {
        let env = classify_fallback("weather in Bali", &ctx(), today());
        assert_eq!(env.intent, Intent::AskWeather);
        assert_eq!(env.extracted_info.destination, Some(Some("Bali".into())));
    }

    #[test]
    fn weather_question_is_not_an_activity() {
        let env = classify_fallback("what's the weather like?", &with_dates("Goa"), today());
        assert_eq!(env.intent, Intent::AskWeather);
        assert!(env.extracted_info.activities.is_none());
    }

    #[test]
    fn anything_else_is_other() {
        let env = classify_fallback("what can you do?", &ctx(), today());
        assert_eq!(env.intent, Intent::Other);
        assert!(!env.needs_weather);
        let env = classify_fallback("hmm, not sure yet", &with_destination("Goa"), today());
        assert_eq!(env.intent, Intent::Other);
        assert!(env.needs_weather);
    }

    #[test]
    fn model_reply_is_normalized() {
        let reply = r#"```json
        {"intent": "provide_info",
         "extractedInfo": {"destination": "i want to go to goa", "travelDates": {"start": "2026-04-10", "end": null},
                           "activities": ["beach", "beach", "x"]},
         "needsWeather": true, "responseType": "collect_info"}
        ```"#;
        let env = parse_reply(reply, &ctx()).unwrap();
        assert_eq!(env.extracted_info.destination, Some(Some("Goa".into())));
        assert!(env.extracted_info.travel_dates.is_none());
        assert_eq!(env.extracted_info.activities, Some(vec!["Beach".to_string()]));
    }

    #[test]
    fn model_reply_missing_fields_is_rejected() {
        assert!(parse_reply(r#"{"extractedInfo": {}}"#, &ctx()).is_err());
        assert!(parse_reply(r#"{"intent": "dance", "responseType": "general"}"#, &ctx()).is_err());
        assert!(parse_reply("I think they want Goa", &ctx()).is_err());
    }

    #[tokio::test]
    async fn primary_path_used_when_reply_parses() {
        let llm: Arc<dyn LlmClient> = Arc::new(Reply(
            r#"{"intent": "ask_weather", "extractedInfo": {"destination": "Paris"}, "needsWeather": true, "responseType": "weather_info"}"#,
        ));
        let classifier = IntentClassifier::new(Some(llm), Duration::from_secs(1));
        let env = classifier
            .classify("is it warm in paris", &with_destination("Tokyo"), today())
            .await;
        assert_eq!(env.intent, Intent::AskWeather);
        assert_eq!(env.weather_location.as_deref(), Some("Paris"));
        assert!(env.extracted_info.destination.is_none());
    }

    #[tokio::test]
    async fn primary_weather_place_fills_empty_destination() {
        let llm: Arc<dyn LlmClient> = Arc::new(Reply(
            r#"{"intent": "ask_weather", "extractedInfo": {}, "needsWeather": true, "responseType": "weather_info", "weatherLocation": "Bali"}"#,
        ));
        let classifier = IntentClassifier::new(Some(llm), Duration::from_secs(1));
        let env = classifier.classify("weather in Bali", &ctx(), today()).await;
        assert_eq!(env.weather_location.as_deref(), Some("Bali"));
        assert_eq!(env.extracted_info.destination, Some(Some("Bali".to_string())));

        let rules = classify_fallback("weather in Bali", &ctx(), today());
        assert_eq!(rules.extracted_info.destination, env.extracted_info.destination);
    }

    #[tokio::test]
    async fn unavailable_service_gives_same_shape() {
        let llm: Arc<dyn LlmClient> = Arc::new(Down);
        let classifier = IntentClassifier::new(Some(llm), Duration::from_secs(1));
        let env = classifier.classify("Goa", &ctx(), today()).await;
        assert_eq!(env, classify_fallback("Goa", &ctx(), today()));
    }
}
