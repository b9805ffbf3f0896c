//! Slot extraction: destination, date range, bare month and activities.
//!
//! Every extractor is pure and never panics. A miss is `None` (or an empty
//! list), never an error. Rules are tried in order and the first match wins.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::context::DateRange;

pub const MAX_ACTIVITIES: usize = 5;

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

const MONTH: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?";
const DAY: &str = r"(\d{1,2})(?:st|nd|rd|th)?";
const RANGE_SEP: &str = r"(?:\s*[-–—]\s*|\s+(?:to|till|until|through)\s+)";

/// Candidates that are never a place.
const DESTINATION_STOPWORDS: &[&str] = &["to", "there", "here", "somewhere", "anywhere", "it"];

/// Words that mark a message as a sentence about travelling rather than a place.
const INTENT_WORDS: &[&str] = &[
    "i", "i'm", "im", "we", "we're", "me", "my", "our", "want", "wanna", "go", "going", "travel",
    "travelling", "traveling", "visit", "trip", "plan", "planning", "would", "like", "let's",
    "lets", "can", "should", "need",
];

/// Words after which the rest of a sentence is likely the place.
const SENTENCE_MARKERS: &[&str] = &[
    "want", "wanna", "going", "go", "like", "visit", "visiting", "travel", "to", "planning",
    "thinking", "about", "see",
];

const QUESTION_WORDS: &[&str] = &[
    "what", "what's", "whats", "how", "when", "why", "where", "which", "who", "is", "are", "can",
    "do", "does", "will",
];

/// Replies that carry no slot value at all.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "yes", "yeah", "yep", "no", "nope", "ok", "okay", "sure", "thanks", "thank you", "cool",
    "great", "nothing", "none", "maybe", "hmm", "not sure", "idk",
];

/// Openings of a non-committal reply ("not sure yet", "no idea really").
const HEDGES: &[&str] = &["not sure", "no idea", "don't know", "dont know", "dunno", "idk", "i don't know", "i'm not sure"];

/// Sounds skipped before looking for a hedge.
const FILLERS: &[&str] = &["hmm", "hm", "um", "umm", "uh", "erm", "well", "honestly"];

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:hi|hello|hey|hiya|howdy|hola|namaste|greetings|yo|good\s+(?:morning|afternoon|evening))\b")
        .unwrap()
});

static WEATHER_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:weather|temperature|forecast|rain\w*|climate)\b").unwrap()
});

static ANY_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(&format!(r"(?i)\b{}\b", MONTH)).unwrap());

static FULL_MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\b")
        .unwrap()
});

static DAY_ONLY_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b{}{}{}\b", DAY, RANGE_SEP, DAY)).unwrap());

static LEADING_TRAVEL_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:i|we)(?:'m|'re|\s+am|\s+are)?\s+)?(?:(?:really\s+)?(?:want|wanna|would\s+like|'d\s+like|plan|planning|am\s+going|going|hope)\s+(?:to\s+)?)?(?:(?:go|going|travel|travelling|fly|flying|head|heading|trip)(?:\s+to)?|visit|visiting|to)\s+",
    )
    .unwrap()
});

static TRAILING_QUALIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\s+(?:in|on|for|during|next|this|from|around|by|with|tomorrow|today|tonight|now|right|soon|later|january|february|march|april|june|july|august|september|october|november|december|\d+)\b.*$",
    )
    .unwrap()
});

static ACTIVITY_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i),|\s+and\s+|&|\+|/").unwrap());

static ACTIVITY_FILLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:i|we)\s+(?:like|love|enjoy|want|prefer)\s+(?:to\s+)?|maybe\s+|also\s+|mostly\s+|some\s+)")
        .unwrap()
});

// --- Strategy plumbing ---

/// One rule in an extraction cascade.
pub trait Extractor<T>: Send + Sync {
    fn name(&self) -> &'static str;
    fn attempt(&self, message: &str) -> Option<T>;
}

/// Runs `rules` in order and returns the first hit.
pub fn first_match<T>(rules: &[Box<dyn Extractor<T>>], message: &str) -> Option<T> {
    rules.iter().find_map(|rule| {
        let hit = rule.attempt(message);
        if hit.is_some() {
            log::trace!("extractor '{}' matched", rule.name());
        }
        hit
    })
}

/// Regex rule whose first capture group is a destination candidate.
struct CaptureRule {
    name: &'static str,
    pattern: Regex,
}

impl CaptureRule {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).unwrap(),
        }
    }
}

impl Extractor<String> for CaptureRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn attempt(&self, message: &str) -> Option<String> {
        let caps = self.pattern.captures(message.trim())?;
        normalize_destination(caps.get(1)?.as_str())
    }
}

/// A short message with no travel-intent words is taken as the place itself.
struct WholeMessageRule;

impl Extractor<String> for WholeMessageRule {
    fn name(&self) -> &'static str {
        "whole_message"
    }

    fn attempt(&self, message: &str) -> Option<String> {
        let trimmed = message.trim();
        let words: Vec<String> = trimmed
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                    .to_lowercase()
            })
            .collect();
        if words.is_empty() || words.len() > 4 {
            return None;
        }
        if is_question(trimmed)
            || trimmed.chars().any(|c| c.is_ascii_digit())
            || is_greeting(trimmed)
            || mentions_weather(trimmed)
            || ANY_MONTH.is_match(trimmed)
            || is_acknowledgement(trimmed)
        {
            return None;
        }
        if words
            .iter()
            .any(|w| INTENT_WORDS.contains(&w.as_str()) || QUESTION_WORDS.contains(&w.as_str()))
        {
            return None;
        }
        normalize_destination(trimmed)
    }
}

static DESTINATION_RULES: Lazy<Vec<Box<dyn Extractor<String>>>> = Lazy::new(|| {
    vec![
        Box::new(CaptureRule::new(
            "travel_verb",
            r"(?i)\b(?:want\s+to|go\s+to|visit|travel\s+to)\s+(\w[\w\s'-]{0,29}?)\s*[.!]*$",
        )),
        Box::new(CaptureRule::new(
            "to_place",
            r"(?i)\bto\s+(\w[\w\s'-]{0,29}?)\s*[.!]*$",
        )),
        Box::new(WholeMessageRule),
    ]
});

static WEATHER_LOCATION_RULES: Lazy<Vec<Box<dyn Extractor<String>>>> = Lazy::new(|| {
    vec![
        Box::new(CaptureRule::new(
            "weather_in_place",
            r"(?i)\b(?:weather|forecast|temperature|climate|rain\w*)\b.*?\b(?:in|at|for|of)\s+(\w[\w\s'-]{0,29}?)\s*[.!?]*$",
        )),
        Box::new(CaptureRule::new(
            "place_weather",
            r"(?i)^(\w[\w'-]*(?:\s+\w[\w'-]*){0,2})\s+(?:weather|forecast)\s*[.!?]*$",
        )),
    ]
});

// --- Vocabulary checks ---

pub fn is_greeting(message: &str) -> bool {
    GREETING.is_match(message)
}

pub fn mentions_weather(message: &str) -> bool {
    WEATHER_WORDS.is_match(message)
}

fn is_acknowledgement(message: &str) -> bool {
    let lower = message
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    if ACKNOWLEDGEMENTS.contains(&lower.as_str()) {
        return true;
    }
    let rest = lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))
        .skip_while(|w| FILLERS.contains(w))
        .collect::<Vec<_>>()
        .join(" ");
    HEDGES
        .iter()
        .any(|h| rest == *h || rest.starts_with(&format!("{} ", h)))
}

/// Ends in a question mark or opens with a question word.
pub fn is_question(message: &str) -> bool {
    let trimmed = message.trim();
    if trimmed.ends_with('?') {
        return true;
    }
    trimmed
        .split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'').to_lowercase())
        .is_some_and(|w| QUESTION_WORDS.contains(&w.as_str()))
}

pub fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// --- Destination ---

/// Cleans a destination candidate into a title-cased place name.
///
/// Idempotent: feeding the output back in returns it unchanged.
pub fn normalize_destination(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| !c.is_alphanumeric());
    let mut current = trimmed.to_string();
    // Verb phrases can nest ("want to go to ..."), so strip until stable.
    loop {
        let stripped = LEADING_TRAVEL_VERB.replace(&current, "").into_owned();
        if stripped == current {
            break;
        }
        current = stripped;
    }
    let current = TRAILING_QUALIFIER.replace(&current, "").into_owned();

    let tokens: Vec<&str> = current.split_whitespace().collect();
    let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
    let looks_like_sentence = tokens.len() > 4
        || lowered
            .iter()
            .any(|t| matches!(t.as_str(), "want" | "wanna" | "going" | "would" | "planning"));

    let kept: Vec<&str> = if looks_like_sentence {
        let after_marker = lowered
            .iter()
            .rposition(|t| SENTENCE_MARKERS.contains(&t.as_str()))
            .map(|i| i + 1)
            .unwrap_or(0);
        let tail = &tokens[after_marker..];
        tail[tail.len().saturating_sub(3)..].to_vec()
    } else {
        tokens
    };

    let place = kept.join(" ");
    let place = place.trim_matches(|c: char| !c.is_alphanumeric());
    if place.is_empty() || DESTINATION_STOPWORDS.contains(&place.to_lowercase().as_str()) {
        return None;
    }
    Some(title_case(place))
}

pub fn extract_destination(message: &str) -> Option<String> {
    first_match(&DESTINATION_RULES, message)
}

/// Place named by a weather question ("weather in Paris", "Bali forecast").
pub fn extract_weather_location(message: &str) -> Option<String> {
    first_match(&WEATHER_LOCATION_RULES, message).filter(|place| {
        let lower = place.to_lowercase();
        !lower.split_whitespace().any(|w| {
            QUESTION_WORDS.contains(&w)
                || matches!(w, "the" | "it" | "current" | "check" | "today" | "tomorrow")
        }) && !mentions_weather(&lower)
    })
}

// --- Dates ---

/// 1-based month index for a full or abbreviated month name.
pub fn month_index(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS
        .iter()
        .position(|m| m.starts_with(prefix))
        .map(|i| i as u32 + 1)
}

pub fn month_name(index: u32) -> Option<String> {
    let name = MONTHS.get(index.checked_sub(1)? as usize)?;
    Some(title_case(name))
}

/// A month earlier than the current one means next year.
fn resolve_year(month: u32, today: NaiveDate) -> i32 {
    if month < today.month() {
        today.year() + 1
    } else {
        today.year()
    }
}

fn parse_day(caps: &Captures<'_>, group: usize) -> Option<u32> {
    caps.get(group)?.as_str().parse().ok()
}

fn parse_month(caps: &Captures<'_>, group: usize) -> Option<u32> {
    month_index(caps.get(group)?.as_str())
}

fn same_month_range(month: u32, first: u32, last: u32, today: NaiveDate) -> Option<DateRange> {
    let year = resolve_year(month, today);
    let start = NaiveDate::from_ymd_opt(year, month, first)?;
    let end = NaiveDate::from_ymd_opt(year, month, last)?;
    DateRange::new(start, end)
}

fn cross_month_range(
    (m1, d1): (u32, u32),
    (m2, d2): (u32, u32),
    today: NaiveDate,
) -> Option<DateRange> {
    let start = NaiveDate::from_ymd_opt(resolve_year(m1, today), m1, d1)?;
    let mut end = NaiveDate::from_ymd_opt(resolve_year(m2, today), m2, d2)?;
    if end < start {
        end = NaiveDate::from_ymd_opt(end.year() + 1, m2, d2)?;
    }
    DateRange::new(start, end)
}

struct RangeRule {
    name: &'static str,
    pattern: Regex,
    build: fn(&Captures<'_>, NaiveDate) -> Option<DateRange>,
}

static RANGE_RULES: Lazy<Vec<RangeRule>> = Lazy::new(|| {
    vec![
        RangeRule {
            name: "month_day_dash_day",
            pattern: Regex::new(&format!(r"(?i)\b{}\s+{}\s*[-–—]\s*{}\b", MONTH, DAY, DAY)).unwrap(),
            build: |caps, today| {
                same_month_range(parse_month(caps, 1)?, parse_day(caps, 2)?, parse_day(caps, 3)?, today)
            },
        },
        RangeRule {
            name: "month_day_to_day",
            pattern: Regex::new(&format!(
                r"(?i)\b{}\s+{}\s+(?:to|till|until|through)\s+{}\b",
                MONTH, DAY, DAY
            ))
            .unwrap(),
            build: |caps, today| {
                same_month_range(parse_month(caps, 1)?, parse_day(caps, 2)?, parse_day(caps, 3)?, today)
            },
        },
        RangeRule {
            name: "month_day_to_month_day",
            pattern: Regex::new(&format!(
                r"(?i)\b{}\s+{}{}{}\s+{}\b",
                MONTH, DAY, RANGE_SEP, MONTH, DAY
            ))
            .unwrap(),
            build: |caps, today| {
                cross_month_range(
                    (parse_month(caps, 1)?, parse_day(caps, 2)?),
                    (parse_month(caps, 3)?, parse_day(caps, 4)?),
                    today,
                )
            },
        },
        RangeRule {
            name: "day_dash_day_month",
            pattern: Regex::new(&format!(r"(?i)\b{}{}{}\s+(?:of\s+)?{}", DAY, RANGE_SEP, DAY, MONTH))
                .unwrap(),
            build: |caps, today| {
                same_month_range(parse_month(caps, 3)?, parse_day(caps, 1)?, parse_day(caps, 2)?, today)
            },
        },
    ]
});

/// Date range from the message, resolved against `today`.
pub fn extract_date_range(message: &str, today: NaiveDate) -> Option<DateRange> {
    RANGE_RULES.iter().find_map(|rule| {
        let caps = rule.pattern.captures(message)?;
        let range = (rule.build)(&caps, today);
        if range.is_some() {
            log::trace!("date rule '{}' matched", rule.name);
        }
        range
    })
}

/// Bare full month name, title-cased. "may" only counts when written "May".
pub fn extract_month(message: &str) -> Option<String> {
    FULL_MONTH
        .captures_iter(message)
        .filter_map(|caps| caps.get(1))
        .find(|m| !m.as_str().eq_ignore_ascii_case("may") || m.as_str() == "May")
        .map(|m| title_case(m.as_str()))
}

/// Day-only range ("10-20") placed in a month staged on an earlier turn.
pub fn extract_day_range_in_month(message: &str, month: &str, today: NaiveDate) -> Option<DateRange> {
    let month = month_index(month)?;
    let caps = DAY_ONLY_RANGE.captures(message)?;
    same_month_range(month, parse_day(&caps, 1)?, parse_day(&caps, 2)?, today)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateSlot {
    Range(DateRange),
    Month(String),
}

/// Full date cascade: explicit range, staged month + day range, bare month.
pub fn extract_dates(message: &str, staged_month: Option<&str>, today: NaiveDate) -> Option<DateSlot> {
    extract_date_range(message, today)
        .or_else(|| staged_month.and_then(|m| extract_day_range_in_month(message, m, today)))
        .map(DateSlot::Range)
        .or_else(|| extract_month(message).map(DateSlot::Month))
}

// --- Activities ---

/// Up to five title-cased, deduplicated activity labels.
pub fn extract_activities(message: &str) -> Vec<String> {
    if mentions_weather(message) || is_question(message) || is_acknowledgement(message) {
        return Vec::new();
    }
    tidy_activities(ACTIVITY_SPLIT.split(message))
}

/// Cleans raw activity labels from any source into the stored form.
pub fn tidy_activities<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut activities: Vec<String> = Vec::new();
    for token in raw {
        let cleaned = token.trim().trim_matches(|c: char| !c.is_alphanumeric());
        let cleaned = ACTIVITY_FILLER.replace(cleaned, "");
        let label = title_case(&cleaned);
        if label.chars().count() < 3 || is_acknowledgement(&label) {
            continue;
        }
        if !activities.iter().any(|a| a.eq_ignore_ascii_case(&label)) {
            activities.push(label);
        }
        if activities.len() == MAX_ACTIVITIES {
            break;
        }
    }
    activities
}
