//! Reply text, structured data, suggestions and actions for one turn.

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::analyze::TripAnalysis;
use crate::context::{ConversationContext, DateRange};
use crate::intent::{Intent, IntentEnvelope};
use crate::itinerary::ItineraryPlan;
use crate::llm::{self, LlmClient, LlmError};
use crate::stage::{Stage, TurnPlan};
use crate::weather::WeatherReport;

const CITY_SUGGESTIONS: [&str; 5] = ["Paris", "Tokyo", "Goa", "Bali", "New York"];
const DATE_SUGGESTIONS: [&str; 3] = ["April 10 - 20", "June 1 - 7", "December 20 - 27"];
const ACTIVITY_SUGGESTIONS: [&str; 4] = ["Beach, Food Tours", "Hiking", "Museums & Culture", "Nightlife"];
const COMPLETE_SUGGESTIONS: [&str; 3] = ["Plan my days", "Show the forecast", "Start a new trip"];

const GREETINGS: [&str; 3] = [
    "Hi there! I'm your trip planner. Which destination are you dreaming about?",
    "Hello! Let's plan something great. What destination do you have in mind?",
    "Hey! Tell me your destination and I'll help with dates, weather and things to do.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GenerateItinerary,
    ViewForecast,
    ResetTrip,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedResponse {
    pub text: String,
    pub data: Value,
    pub suggestions: Vec<String>,
    pub actions: Vec<Action>,
}

/// Result of the weather step, when one ran.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherOutcome {
    Fetched(WeatherReport),
    NotFound(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItineraryOutcome {
    Planned(ItineraryPlan),
    Failed(String),
}

pub struct ComposeInput<'a> {
    pub envelope: &'a IntentEnvelope,
    /// Context as it will be stored after this turn.
    pub context: &'a ConversationContext,
    pub plan: &'a TurnPlan,
    pub weather: Option<&'a WeatherOutcome>,
    pub analysis: Option<&'a TripAnalysis>,
    pub itinerary: Option<&'a ItineraryOutcome>,
}

pub struct ResponseComposer {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
    degree: &'static str,
}

impl ResponseComposer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, timeout: Duration) -> Self {
        Self {
            llm,
            timeout,
            degree: "°C",
        }
    }

    /// Temperature suffix for the configured unit system.
    pub fn with_units(mut self, units: &str) -> Self {
        self.degree = match units {
            "imperial" => "°F",
            "standard" => " K",
            _ => "°C",
        };
        self
    }

    pub async fn compose(&self, input: &ComposeInput<'_>) -> Result<ComposedResponse, serde_json::Error> {
        let template = select_template(input);
        let text = match template {
            // The retry prompt is fixed; prose could blur what went wrong.
            Template::LocationNotFound { .. } => self.render(&template, input),
            _ => {
                let prompt = self.prompt(input, &template);
                llm::with_fallback(
                    self.llm.as_deref(),
                    self.timeout,
                    "response composer",
                    &prompt,
                    parse_prose,
                    || self.render(&template, input),
                )
                .await
                .value
            }
        };

        Ok(ComposedResponse {
            suggestions: suggestions(&text, input.context),
            actions: actions(input.context, input.weather),
            data: data(input)?,
            text,
        })
    }

    fn render(&self, template: &Template<'_>, input: &ComposeInput<'_>) -> String {
        let deg = self.degree;
        match *template {
            Template::LocationNotFound { place, trip_kept: false, .. } => format!(
                "I couldn't find weather for \"{}\". Could you check the spelling or give me a nearby city as your destination?",
                place
            ),
            Template::LocationNotFound { place, trip_kept: true, next } => format!(
                "I couldn't find weather for \"{}\". Could you check the spelling or ask about a nearby city? {}",
                place,
                follow_up(next)
            ),
            Template::Greeting => GREETINGS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(GREETINGS[0])
                .to_string(),
            Template::WeatherAnswer { report, next } => {
                let mut text = format!(
                    "Right now in {} it's {:.0}{} (feels like {:.0}{}) with {}.",
                    report.location,
                    report.current.temperature,
                    deg,
                    report.current.feels_like,
                    deg,
                    report.current.condition_description
                );
                if let Some(outlook) = outlook(report, deg) {
                    text.push(' ');
                    text.push_str(&outlook);
                }
                text.push(' ');
                text.push_str(follow_up(next));
                text
            }
            Template::WeatherUnavailable { next } => format!(
                "I couldn't reach the weather service just now, so I can't check that yet. {}",
                follow_up(next)
            ),
            Template::DestinationSet { destination, month: Some(month) } => format!(
                "Great choice, {} it is! Which dates in {} are you planning to travel?",
                destination, month
            ),
            Template::DestinationSet { destination, month: None } => format!(
                "Great choice, {} it is! What dates are you planning to travel? For example \"April 10 - 20\".",
                destination
            ),
            Template::StagedMonth { destination, month } => format!(
                "{} in {} sounds lovely. Which dates in {} work for you? Something like \"{} 10 - 15\".",
                destination, month, month, month
            ),
            Template::AskDates { destination } => format!(
                "When are you planning to visit {}? Tell me your travel dates, like \"April 10 - 20\".",
                destination
            ),
            Template::AskActivities { destination, dates } => format!(
                "{} from {}, noted. What activities are you interested in? Beaches, food, hiking, museums?",
                destination,
                describe_range(&dates)
            ),
            Template::Summary {
                destination,
                dates,
                activities,
            } => {
                let mut text = format!(
                    "Here's your trip: {} from {} ({} days), focused on {}.",
                    destination,
                    describe_range(&dates),
                    dates.days(),
                    activities.join(", ")
                );
                match input.weather {
                    Some(WeatherOutcome::Fetched(report)) => {
                        if let Some(outlook) = outlook(report, deg) {
                            text.push(' ');
                            text.push_str(&outlook);
                        }
                    }
                    Some(WeatherOutcome::Failed(_)) => {
                        text.push_str(" I couldn't fetch the weather right now.")
                    }
                    _ => {}
                }
                if let Some(analysis) = input.analysis {
                    for note in &analysis.activity_notes {
                        text.push(' ');
                        text.push_str(note);
                        text.push('.');
                    }
                    if !analysis.packing.is_empty() {
                        text.push_str(&format!(" Pack: {}.", analysis.packing.join(", ").to_lowercase()));
                    }
                }
                match input.itinerary {
                    Some(ItineraryOutcome::Planned(plan)) => text.push_str(&format!(
                        " I've drafted a {}-day itinerary, estimated at {:.0}{}.",
                        plan.days.len(),
                        plan.total(),
                        plan.currency.as_deref().map(|c| format!(" {}", c)).unwrap_or_default()
                    )),
                    _ => text.push_str(" Would you like a day-by-day itinerary?"),
                }
                text
            }
            Template::AskDestination => {
                "I'd love to help you plan a trip! Which destination are you thinking of?".to_string()
            }
        }
    }

    fn prompt(&self, input: &ComposeInput<'_>, template: &Template<'_>) -> String {
        let ctx = input.context;
        let mut known = Vec::new();
        if let Some(destination) = &ctx.destination {
            known.push(format!("destination: {}", destination));
        }
        if let Some(range) = &ctx.travel_dates {
            known.push(format!("dates: {} to {}", range.start, range.end));
        } else if let Some(month) = &ctx.partial_date_info {
            known.push(format!("month: {} (exact days unknown)", month));
        }
        if ctx.has_activities() {
            known.push(format!("activities: {}", ctx.activities.join(", ")));
        }
        let weather = match input.weather {
            Some(WeatherOutcome::Fetched(report)) => format!(
                "Weather in {}: {:.0}{}, {}. {}",
                report.location,
                report.current.temperature,
                self.degree,
                report.current.condition_description,
                outlook(report, self.degree).unwrap_or_default()
            ),
            Some(WeatherOutcome::Failed(_)) => "Weather is unavailable right now.".to_string(),
            _ => "No weather data.".to_string(),
        };
        let goal = match template {
            Template::Greeting | Template::AskDestination => "ask which destination they want to visit",
            Template::WeatherAnswer { .. } | Template::WeatherUnavailable { .. } => {
                "answer their weather question, then ask for the next missing trip detail"
            }
            Template::DestinationSet { .. } | Template::StagedMonth { .. } | Template::AskDates { .. } => {
                "ask for their travel dates"
            }
            Template::AskActivities { .. } => "ask which activities they enjoy",
            Template::Summary { .. } => "summarize the trip and offer a day-by-day itinerary",
            Template::LocationNotFound { .. } => "ask them to re-enter the destination",
        };
        format!(
            "You are a friendly travel assistant. Known trip details: {}.\n{}\n\
             Your goal: {}.\n\
             Reply in at most 4 short sentences of plain text, no lists, no markdown.",
            if known.is_empty() { "none".to_string() } else { known.join("; ") },
            weather,
            goal
        )
    }
}

enum Template<'a> {
    /// `trip_kept` when the place was only asked about, not the destination.
    LocationNotFound { place: &'a str, trip_kept: bool, next: Stage },
    Greeting,
    WeatherAnswer { report: &'a WeatherReport, next: Stage },
    WeatherUnavailable { next: Stage },
    DestinationSet { destination: &'a str, month: Option<&'a str> },
    StagedMonth { destination: &'a str, month: &'a str },
    AskDates { destination: &'a str },
    AskActivities { destination: &'a str, dates: DateRange },
    Summary { destination: &'a str, dates: DateRange, activities: &'a [String] },
    AskDestination,
}

/// First matching case wins. Each case binds exactly the fields it renders.
fn select_template<'a>(input: &ComposeInput<'a>) -> Template<'a> {
    let ctx = input.context;
    let stage = input.plan.stage;

    if let Some(WeatherOutcome::NotFound(place)) = input.weather {
        let trip_kept = ctx
            .destination
            .as_deref()
            .is_some_and(|d| !d.eq_ignore_ascii_case(place));
        return Template::LocationNotFound { place, trip_kept, next: stage };
    }
    if input.envelope.intent == Intent::Greeting && stage == Stage::Greeting {
        return Template::Greeting;
    }
    if input.plan.answer_directly {
        match input.weather {
            Some(WeatherOutcome::Fetched(report)) => return Template::WeatherAnswer { report, next: stage },
            Some(WeatherOutcome::Failed(_)) => return Template::WeatherUnavailable { next: stage },
            _ => {}
        }
    }

    let destination = ctx.destination.as_deref();
    let just_set = matches!(input.envelope.extracted_info.destination, Some(Some(_)));
    match (destination, ctx.travel_dates, ctx.has_activities()) {
        (Some(destination), None, _) if just_set => Template::DestinationSet {
            destination,
            month: ctx.partial_date_info.as_deref(),
        },
        (Some(destination), None, _) => match ctx.partial_date_info.as_deref() {
            Some(month) => Template::StagedMonth { destination, month },
            None => Template::AskDates { destination },
        },
        (Some(destination), Some(dates), false) => Template::AskActivities { destination, dates },
        (Some(destination), Some(dates), true) => Template::Summary {
            destination,
            dates,
            activities: &ctx.activities,
        },
        (None, _, _) if input.envelope.intent == Intent::Greeting => Template::Greeting,
        (None, _, _) => Template::AskDestination,
    }
}

fn parse_prose(reply: &str) -> Result<String, LlmError> {
    let text = reply.trim().trim_matches('"').trim();
    if text.is_empty() {
        return Err(LlmError::Empty);
    }
    Ok(text.to_string())
}

fn follow_up(next: Stage) -> &'static str {
    match next {
        Stage::Greeting | Stage::CollectDestination => "Which destination are you considering for your trip?",
        Stage::CollectDates => "What dates are you planning to travel?",
        Stage::CollectActivities => "What activities would you like to do?",
        _ => "Anything else you'd like to know?",
    }
}

fn describe_range(range: &DateRange) -> String {
    format!("{} to {}", range.start.format("%B %-d"), range.end.format("%B %-d, %Y"))
}

/// One-line forecast outlook, when there is a forecast.
fn outlook(report: &WeatherReport, deg: &str) -> Option<String> {
    let first = report.forecast.first()?;
    let high = report.forecast.iter().map(|d| d.max_temp).fold(f64::NEG_INFINITY, f64::max);
    let low = report.forecast.iter().map(|d| d.min_temp).fold(f64::INFINITY, f64::min);
    let wet = report
        .forecast
        .iter()
        .filter(|d| d.precipitation_probability >= 50)
        .count();
    let mut line = format!(
        "The forecast ranges from {:.0}{} to {:.0}{}, starting with {}",
        low,
        deg,
        high,
        deg,
        first.conditions
    );
    if wet > 0 {
        line.push_str(&format!(", and rain is likely on {} of {} days", wet, report.forecast.len()));
    }
    line.push('.');
    Some(line)
}

/// Deterministic on both text paths: cues in the text, then the first gap.
fn suggestions(text: &str, context: &ConversationContext) -> Vec<String> {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    if context.is_complete() {
        return owned(&COMPLETE_SUGGESTIONS);
    }

    let dates = || match context.partial_date_info.as_deref() {
        Some(month) => [1, 10, 20]
            .iter()
            .map(|d| format!("{} {} - {}", month, d, d + 5))
            .collect(),
        None => owned(&DATE_SUGGESTIONS),
    };

    let lower = text.to_lowercase();
    if lower.contains("destination") {
        owned(&CITY_SUGGESTIONS)
    } else if lower.contains("dates") {
        dates()
    } else if lower.contains("activities") {
        owned(&ACTIVITY_SUGGESTIONS)
    } else if !context.has_destination() {
        owned(&CITY_SUGGESTIONS)
    } else if !context.has_dates() {
        dates()
    } else {
        owned(&ACTIVITY_SUGGESTIONS)
    }
}

fn actions(context: &ConversationContext, weather: Option<&WeatherOutcome>) -> Vec<Action> {
    let mut actions = Vec::new();
    if context.is_complete() {
        actions.push(Action {
            kind: ActionKind::GenerateItinerary,
            label: "Create day-by-day itinerary".to_string(),
        });
    }
    if let Some(WeatherOutcome::Fetched(report)) = weather {
        actions.push(Action {
            kind: ActionKind::ViewForecast,
            label: format!("View forecast for {}", report.location),
        });
    }
    if context.has_destination() {
        actions.push(Action {
            kind: ActionKind::ResetTrip,
            label: "Start over".to_string(),
        });
    }
    actions
}

fn data(input: &ComposeInput<'_>) -> Result<Value, serde_json::Error> {
    let mut data = Map::new();
    data.insert("intent".into(), serde_json::to_value(input.envelope.intent)?);
    data.insert(
        "extracted".into(),
        serde_json::to_value(input.envelope.extracted_info.slots())?,
    );
    if let Some(weather) = input.weather {
        let value = match weather {
            WeatherOutcome::Fetched(report) => serde_json::to_value(report)?,
            WeatherOutcome::NotFound(place) => json!({ "error": "location not found", "location": place }),
            WeatherOutcome::Failed(message) => json!({ "error": message }),
        };
        data.insert("weather".into(), value);
    }
    if let Some(analysis) = input.analysis {
        data.insert("analysis".into(), serde_json::to_value(analysis)?);
    }
    if let Some(itinerary) = input.itinerary {
        let value = match itinerary {
            ItineraryOutcome::Planned(plan) => {
                let mut value = serde_json::to_value(plan)?;
                value["totalCost"] = json!(plan.total());
                value
            }
            ItineraryOutcome::Failed(message) => json!({ "error": message }),
        };
        data.insert("itinerary".into(), value);
    }
    Ok(Value::Object(data))
}
