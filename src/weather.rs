//! Weather collaborator: the provider seam and an OpenWeatherMap client.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeatherError {
    #[error("location not found: {0}")]
    LocationNotFound(String),
    #[error("weather service unavailable: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for WeatherError {
    fn from(err: reqwest::Error) -> Self {
        WeatherError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWeather {
    pub location: String,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition_description: String,
    pub humidity: u8,
    pub wind_speed: f64,
    pub rain_mm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub date_string: String,
    pub min_temp: f64,
    pub max_temp: f64,
    pub conditions: String,
    /// Percent, 0-100.
    pub precipitation_probability: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub location: String,
    pub current: CurrentWeather,
    pub forecast: Vec<DailyForecast>,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError>;

    async fn forecast(&self, location: &str, days: usize) -> Result<Vec<DailyForecast>, WeatherError>;

    /// Current conditions and forecast, fetched concurrently.
    async fn report(&self, location: &str, days: usize) -> Result<WeatherReport, WeatherError> {
        let (current, forecast) =
            tokio::try_join!(self.current(location), self.forecast(location, days))?;
        Ok(WeatherReport {
            location: current.location.clone(),
            current,
            forecast,
        })
    }
}

// --- OpenWeatherMap ---

#[derive(Deserialize)]
struct CurrentResponse {
    name: String,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<ConditionBlock>,
    #[serde(default)]
    wind: Option<WindBlock>,
    #[serde(default)]
    rain: Option<RainBlock>,
}

#[derive(Deserialize)]
struct MainBlock {
    temp: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    #[serde(default)]
    temp_min: Option<f64>,
    #[serde(default)]
    temp_max: Option<f64>,
    #[serde(default)]
    humidity: Option<u8>,
}

#[derive(Deserialize)]
struct ConditionBlock {
    description: String,
}

#[derive(Deserialize)]
struct WindBlock {
    speed: f64,
}

#[derive(Deserialize)]
struct RainBlock {
    #[serde(rename = "1h", default)]
    one_hour: Option<f64>,
    #[serde(rename = "3h", default)]
    three_hours: Option<f64>,
}

#[derive(Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    list: Vec<ForecastEntry>,
}

#[derive(Deserialize)]
struct ForecastEntry {
    dt: i64,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<ConditionBlock>,
    #[serde(default)]
    pop: f64,
}

pub struct OpenWeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    units: String,
}

impl OpenWeatherClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        units: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WeatherError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            units: units.into(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        location: &str,
    ) -> Result<T, WeatherError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .query(&[
                ("q", location),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, location, &body));
        }
        Ok(response.json().await?)
    }
}

fn status_error(status: StatusCode, location: &str, body: &str) -> WeatherError {
    if status == StatusCode::NOT_FOUND {
        WeatherError::LocationNotFound(location.to_string())
    } else {
        WeatherError::Transient(format!("{}: {}", status, body.trim()))
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError> {
        let raw: CurrentResponse = self.get("weather", location).await?;
        Ok(current_from(raw))
    }

    async fn forecast(&self, location: &str, days: usize) -> Result<Vec<DailyForecast>, WeatherError> {
        let raw: ForecastResponse = self.get("forecast", location).await?;
        Ok(aggregate_daily(&raw.list, days))
    }
}

fn current_from(raw: CurrentResponse) -> CurrentWeather {
    let rain_mm = raw
        .rain
        .and_then(|r| r.one_hour.or(r.three_hours))
        .unwrap_or(0.0);
    CurrentWeather {
        location: raw.name,
        temperature: raw.main.temp,
        feels_like: raw.main.feels_like.unwrap_or(raw.main.temp),
        condition_description: raw
            .weather
            .into_iter()
            .next()
            .map(|c| c.description)
            .unwrap_or_else(|| "unknown".to_string()),
        humidity: raw.main.humidity.unwrap_or(0),
        wind_speed: raw.wind.map(|w| w.speed).unwrap_or(0.0),
        rain_mm,
    }
}

/// Folds 3-hour slots into per-day summaries, oldest first.
fn aggregate_daily(entries: &[ForecastEntry], days: usize) -> Vec<DailyForecast> {
    let mut by_day: BTreeMap<NaiveDate, Vec<&ForecastEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(at) = DateTime::from_timestamp(entry.dt, 0) {
            by_day.entry(at.date_naive()).or_default().push(entry);
        }
    }

    by_day
        .into_iter()
        .take(days)
        .map(|(date, slots)| {
            let min_temp = slots
                .iter()
                .map(|s| s.main.temp_min.unwrap_or(s.main.temp))
                .fold(f64::INFINITY, f64::min);
            let max_temp = slots
                .iter()
                .map(|s| s.main.temp_max.unwrap_or(s.main.temp))
                .fold(f64::NEG_INFINITY, f64::max);
            let pop = slots.iter().map(|s| s.pop).fold(0.0, f64::max);

            // Most frequent description; ties go to the earliest slot.
            let mut counts: Vec<(&str, usize)> = Vec::new();
            for slot in &slots {
                if let Some(c) = slot.weather.first() {
                    match counts.iter_mut().find(|(d, _)| *d == c.description) {
                        Some((_, n)) => *n += 1,
                        None => counts.push((c.description.as_str(), 1)),
                    }
                }
            }
            let conditions = counts
                .iter()
                .fold(None::<(&str, usize)>, |best, &(d, n)| match best {
                    Some((_, m)) if m >= n => best,
                    _ => Some((d, n)),
                })
                .map(|(d, _)| d.to_string())
                .unwrap_or_else(|| "unknown".to_string());

            DailyForecast {
                date,
                date_string: date.format("%a, %b %-d").to_string(),
                min_temp: round1(min_temp),
                max_temp: round1(max_temp),
                conditions,
                precipitation_probability: (pop.clamp(0.0, 1.0) * 100.0).round() as u8,
            }
        })
        .collect()
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const FORECAST: &str = r#"{"list": [
        {"dt": 1775800800, "main": {"temp": 28.0, "temp_min": 26.5, "temp_max": 29.1}, "weather": [{"description": "light rain"}], "pop": 0.62},
        {"dt": 1775811600, "main": {"temp": 30.0, "temp_min": 27.0, "temp_max": 31.4}, "weather": [{"description": "light rain"}], "pop": 0.4},
        {"dt": 1775822400, "main": {"temp": 27.0}, "weather": [{"description": "clear sky"}]},
        {"dt": 1775887200, "main": {"temp": 25.0, "temp_min": 24.0, "temp_max": 26.0}, "weather": [{"description": "clear sky"}], "pop": 0.05}
    ]}"#;

    #[test]
    fn three_hour_slots_fold_into_days() {
        let raw: ForecastResponse = serde_json::from_str(FORECAST).unwrap();
        let days = aggregate_daily(&raw.list, 5);
        assert_eq!(days.len(), 2);
        let first = &days[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2026, 4, 10).unwrap());
        assert_eq!(first.min_temp, 26.5);
        assert_eq!(first.max_temp, 31.4);
        assert_eq!(first.conditions, "light rain");
        assert_eq!(first.precipitation_probability, 62);
        assert_eq!(first.date_string, "Fri, Apr 10");
        assert_eq!(days[1].precipitation_probability, 5);
    }

    #[test]
    fn forecast_is_capped_to_requested_days() {
        let raw: ForecastResponse = serde_json::from_str(FORECAST).unwrap();
        assert_eq!(aggregate_daily(&raw.list, 1).len(), 1);
        assert!(aggregate_daily(&[], 5).is_empty());
    }

    #[test]
    fn current_conditions_parse_with_optional_blocks() {
        let raw: CurrentResponse = serde_json::from_str(
            r#"{"name": "Panaji", "main": {"temp": 31.2, "feels_like": 35.0, "humidity": 74},
                "weather": [{"description": "scattered clouds"}], "wind": {"speed": 4.1}}"#,
        )
        .unwrap();
        let current = current_from(raw);
        assert_eq!(current.location, "Panaji");
        assert_eq!(current.condition_description, "scattered clouds");
        assert_eq!(current.rain_mm, 0.0);
    }

    #[test]
    fn not_found_is_distinct_from_outage() {
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, "Atlantis", "city not found"),
            WeatherError::LocationNotFound("Atlantis".into())
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "Goa", ""),
            WeatherError::Transient(_)
        ));
    }

    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WeatherProvider for Scripted {
        async fn current(&self, location: &str) -> Result<CurrentWeather, WeatherError> {
            self.calls.lock().push(location.to_string());
            if location == "Atlantis" {
                return Err(WeatherError::LocationNotFound(location.into()));
            }
            Ok(CurrentWeather {
                location: location.into(),
                temperature: 20.0,
                feels_like: 19.0,
                condition_description: "clear sky".into(),
                humidity: 50,
                wind_speed: 2.0,
                rain_mm: 0.0,
            })
        }

        async fn forecast(&self, _location: &str, _days: usize) -> Result<Vec<DailyForecast>, WeatherError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn report_combines_both_calls() {
        let provider = Scripted {
            calls: Mutex::new(Vec::new()),
        };
        let report = provider.report("Paris", 5).await.unwrap();
        assert_eq!(report.location, "Paris");
        let err = provider.report("Atlantis", 5).await.unwrap_err();
        assert_eq!(err, WeatherError::LocationNotFound("Atlantis".into()));
        assert_eq!(provider.calls.lock().len(), 2);
    }
}
