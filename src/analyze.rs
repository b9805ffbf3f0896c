use serde::Serialize;

use crate::context::DateRange;
use crate::weather::WeatherReport;

const RAINY_THRESHOLD: u8 = 50;
const COLD_BELOW: f64 = 12.0;
const HOT_ABOVE: f64 = 25.0;

const OUTDOOR_KEYWORDS: &[&str] = &[
    "beach", "hiking", "hike", "trek", "surf", "snorkel", "sightseeing", "cycling", "biking",
    "camping", "safari", "diving", "kayak",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripAnalysis {
    pub trip_days: i64,
    pub average_high: Option<f64>,
    pub average_low: Option<f64>,
    pub rainy_days: usize,
    pub activity_notes: Vec<String>,
    pub packing: Vec<String>,
}

fn has_keyword(activity: &str, keywords: &[&str]) -> bool {
    let lower = activity.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| (sum / n as f64 * 10.0).round() / 10.0)
}

/// Weather-aware notes for a fully specified trip.
pub fn analyze(range: &DateRange, activities: &[String], report: &WeatherReport) -> TripAnalysis {
    let forecast = &report.forecast;
    let average_high = mean(forecast.iter().map(|d| d.max_temp));
    let average_low = mean(forecast.iter().map(|d| d.min_temp));
    let rainy_days = forecast
        .iter()
        .filter(|d| d.precipitation_probability >= RAINY_THRESHOLD)
        .count();

    let activity_notes = if rainy_days > 0 {
        activities
            .iter()
            .filter(|a| has_keyword(a, OUTDOOR_KEYWORDS))
            .map(|a| {
                format!(
                    "{}: rain is likely on {} of the forecast days, keep a backup plan",
                    a, rainy_days
                )
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut packing: Vec<String> = Vec::new();
    let mut pack = |item: &str| {
        if !packing.iter().any(|p| p == item) {
            packing.push(item.to_string());
        }
    };
    let high = average_high.unwrap_or(report.current.temperature);
    let low = average_low.unwrap_or(report.current.temperature);
    if low < COLD_BELOW {
        pack("Warm layers");
    }
    if high > HOT_ABOVE {
        pack("Light clothing");
        pack("Sunscreen");
    }
    if rainy_days > 0 || report.current.rain_mm > 0.0 {
        pack("Umbrella");
    }
    for activity in activities {
        if has_keyword(activity, &["beach", "snorkel", "surf", "diving", "swim"]) {
            pack("Swimwear");
            pack("Sunscreen");
        }
        if has_keyword(activity, &["hiking", "hike", "trek"]) {
            pack("Hiking boots");
        }
    }

    TripAnalysis {
        trip_days: range.days(),
        average_high,
        average_low,
        rainy_days,
        activity_notes,
        packing,
    }
}
