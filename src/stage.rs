use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::ConversationContext;
use crate::extract;
use crate::intent::{Intent, IntentEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    CollectDestination,
    CollectDates,
    CollectActivities,
    FetchWeather,
    Analyze,
    Respond,
    /// Only ever reported on a failed turn.
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::CollectDestination => "collect_destination",
            Stage::CollectDates => "collect_dates",
            Stage::CollectActivities => "collect_activities",
            Stage::FetchWeather => "fetch_weather",
            Stage::Analyze => "analyze",
            Stage::Respond => "respond",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one turn will do after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPlan {
    pub stage: Stage,
    /// Place to fetch weather for this turn, if any.
    pub weather_location: Option<String>,
    /// A weather question answered ahead of the collection order.
    pub answer_directly: bool,
}

impl TurnPlan {
    pub fn fetches_weather(&self) -> bool {
        self.weather_location.is_some()
    }

    /// Stages walked this turn, in order.
    pub fn pipeline(&self) -> &'static [Stage] {
        StageController::pipeline(self.stage)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageController;

impl StageController {
    pub fn new() -> Self {
        Self
    }

    /// Priority-ordered decision: greeting, then the first missing slot.
    pub fn determine_stage(&self, message: &str, context: &ConversationContext) -> Stage {
        if extract::is_greeting(message) && !context.has_destination() {
            Stage::Greeting
        } else if !context.has_destination() {
            Stage::CollectDestination
        } else if !context.has_dates() {
            Stage::CollectDates
        } else if !context.has_activities() {
            Stage::CollectActivities
        } else {
            Stage::FetchWeather
        }
    }

    /// Plans the turn against the context with this turn's slots merged in.
    ///
    /// A weather question jumps ahead of the collection order: the place it
    /// names wins, otherwise the known destination. The reported stage still
    /// follows the slots, so the next prompt asks for what is missing.
    pub fn plan(
        &self,
        message: &str,
        envelope: &IntentEnvelope,
        proposed: &ConversationContext,
    ) -> TurnPlan {
        let stage = self.determine_stage(message, proposed);
        let asked = envelope.intent == Intent::AskWeather;
        let location = envelope
            .weather_location
            .clone()
            .or_else(|| proposed.destination.clone());

        let plan = if stage == Stage::FetchWeather {
            // Another place's forecast answers the question but says nothing
            // about the trip, so it is never analyzed.
            let elsewhere = match (location.as_deref(), proposed.destination.as_deref()) {
                (Some(place), Some(destination)) => !place.eq_ignore_ascii_case(destination),
                _ => false,
            };
            TurnPlan {
                stage,
                weather_location: location,
                answer_directly: asked && elsewhere,
            }
        } else if asked && location.is_some() {
            TurnPlan {
                stage,
                weather_location: location,
                answer_directly: true,
            }
        } else if let (true, Some(Some(named))) =
            (envelope.needs_weather, &envelope.extracted_info.destination)
        {
            // A newly named place is looked up right away so a bad name is
            // caught before dates are collected for it.
            TurnPlan {
                stage,
                weather_location: Some(named.clone()),
                answer_directly: false,
            }
        } else {
            TurnPlan {
                stage,
                weather_location: None,
                answer_directly: false,
            }
        };
        log::debug!("stage {} (weather: {:?})", plan.stage, plan.weather_location);
        plan
    }

    pub fn pipeline(stage: Stage) -> &'static [Stage] {
        match stage {
            Stage::FetchWeather => &[Stage::FetchWeather, Stage::Analyze, Stage::Respond],
            Stage::Greeting => &[Stage::Greeting, Stage::Respond],
            Stage::CollectDestination => &[Stage::CollectDestination, Stage::Respond],
            Stage::CollectDates => &[Stage::CollectDates, Stage::Respond],
            Stage::CollectActivities => &[Stage::CollectActivities, Stage::Respond],
            Stage::Analyze => &[Stage::Analyze, Stage::Respond],
            Stage::Respond => &[Stage::Respond],
            Stage::Error => &[Stage::Error],
        }
    }
}
