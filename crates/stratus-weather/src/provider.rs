//! Weather data providers.
//!
//! The orchestrator only sees the [`WeatherProvider`] trait; the concrete
//! implementation talks to Open-Meteo (free, no API key required).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::types::{
    AirQuality, Coordinate, CurrentConditions, DayForecast, HourlyForecast, WeatherAlert,
    WeatherCondition, WeatherSnapshot,
};

const FORECAST_BASE: &str = "https://api.open-meteo.com";
const AIR_QUALITY_BASE: &str = "https://air-quality-api.open-meteo.com";
const FORECAST_DAYS: u8 = 7;

/// Upstream weather source. One logical fetch per method; the forced flag
/// asks the implementation to bypass any HTTP-level cache.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Fetch current conditions plus hourly and daily forecasts.
    async fn fetch_primary(
        &self,
        coordinate: Coordinate,
        forced: bool,
    ) -> Result<WeatherSnapshot, FetchError>;

    /// Fetch the current air-quality reading. Best-effort from the
    /// orchestrator's point of view.
    async fn fetch_air_quality(
        &self,
        coordinate: Coordinate,
        forced: bool,
    ) -> Result<AirQuality, FetchError>;

    /// Fetch active alerts for the region around `coordinate`. Best-effort.
    async fn fetch_alerts(
        &self,
        coordinate: Coordinate,
        forced: bool,
    ) -> Result<Vec<WeatherAlert>, FetchError>;
}

/// Open-Meteo implementation of [`WeatherProvider`].
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    client: Arc<Client>,
    forecast_base: String,
    air_quality_base: String,
}

impl OpenMeteoProvider {
    /// Build a provider with its own HTTP client, using the configured
    /// connect and transfer timeouts.
    ///
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.resource_timeout)
            .build()?;
        Ok(Self {
            client: Arc::new(client),
            forecast_base: FORECAST_BASE.to_string(),
            air_quality_base: AIR_QUALITY_BASE.to_string(),
        })
    }

    /// Same as [`OpenMeteoProvider::new`] with overridable endpoints, for tests.
    ///
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn with_base_urls(
        config: &FetchConfig,
        forecast_base: impl Into<String>,
        air_quality_base: impl Into<String>,
    ) -> Result<Self, FetchError> {
        let mut provider = Self::new(config)?;
        provider.forecast_base = forecast_base.into();
        provider.air_quality_base = air_quality_base.into();
        Ok(provider)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        forced: bool,
    ) -> Result<T, FetchError> {
        let mut request = self.client.get(url).query(query);
        if forced {
            // Pull-to-refresh must reach the origin, not an intermediary cache.
            request = request.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }
        let response = request.send().await.map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }
        response
            .json::<T>()
            .await
            .map_err(|error| FetchError::DecodeFailure(error.to_string()))
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    async fn fetch_primary(
        &self,
        coordinate: Coordinate,
        forced: bool,
    ) -> Result<WeatherSnapshot, FetchError> {
        let url = format!("{}/v1/forecast", self.forecast_base);
        let query = [
            ("latitude", coordinate.latitude.to_string()),
            ("longitude", coordinate.longitude.to_string()),
            (
                "current",
                "temperature_2m,relative_humidity_2m,apparent_temperature,weather_code,wind_speed_10m"
                    .to_string(),
            ),
            ("hourly", "temperature_2m,weather_code,precipitation_probability".to_string()),
            (
                "daily",
                "weather_code,temperature_2m_max,temperature_2m_min,precipitation_probability_max"
                    .to_string(),
            ),
            ("forecast_days", FORECAST_DAYS.to_string()),
            ("timezone", "UTC".to_string()),
        ];
        let body: ForecastResponse = self.get_json(&url, &query, forced).await?;
        let snapshot = snapshot_from_response(coordinate, body)?;
        tracing::debug!(
            "Fetched forecast for ({}): {} hourly, {} daily entries",
            coordinate,
            snapshot.hourly.len(),
            snapshot.daily.len()
        );
        Ok(snapshot)
    }

    async fn fetch_air_quality(
        &self,
        coordinate: Coordinate,
        forced: bool,
    ) -> Result<AirQuality, FetchError> {
        let url = format!("{}/v1/air-quality", self.air_quality_base);
        let query = [
            ("latitude", coordinate.latitude.to_string()),
            ("longitude", coordinate.longitude.to_string()),
            ("current", "european_aqi,pm10,pm2_5".to_string()),
        ];
        let body: AirQualityResponse = self.get_json(&url, &query, forced).await?;
        Ok(AirQuality {
            european_aqi: body.current.european_aqi.clamp(0.0, u16::MAX as f64).round() as u16,
            pm2_5: body.current.pm2_5,
            pm10: body.current.pm10,
            measured_at: parse_hourly_time(&body.current.time)?,
        })
    }

    async fn fetch_alerts(
        &self,
        coordinate: Coordinate,
        _forced: bool,
    ) -> Result<Vec<WeatherAlert>, FetchError> {
        // Open-Meteo publishes no alert feed. The trait seam carries alerts
        // for backends that do; this implementation reports none.
        tracing::debug!("No alert feed available for ({})", coordinate);
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentBlock,
    hourly: HourlyBlock,
    daily: DailyBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    apparent_temperature: f64,
    weather_code: i32,
    wind_speed_10m: f64,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<f64>,
    weather_code: Vec<i32>,
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    time: Vec<String>,
    weather_code: Vec<i32>,
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AirQualityResponse {
    current: AirQualityBlock,
}

#[derive(Debug, Deserialize)]
struct AirQualityBlock {
    time: String,
    european_aqi: f64,
    pm10: f64,
    pm2_5: f64,
}

/// Open-Meteo hourly timestamps come without an offset, e.g. "2026-08-27T14:00";
/// we request timezone=UTC so they are UTC by construction.
fn parse_hourly_time(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .map(|naive| naive.and_utc())
        .map_err(|_| FetchError::DecodeFailure(format!("bad hourly timestamp {:?}", raw)))
}

fn parse_daily_date(raw: &str) -> Result<NaiveDate, FetchError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| FetchError::DecodeFailure(format!("bad daily date {:?}", raw)))
}

fn chance_from(value: Option<f64>) -> u8 {
    value.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8
}

fn snapshot_from_response(
    coordinate: Coordinate,
    body: ForecastResponse,
) -> Result<WeatherSnapshot, FetchError> {
    let current = CurrentConditions {
        temperature: body.current.temperature_2m,
        feels_like: body.current.apparent_temperature,
        humidity: body.current.relative_humidity_2m.clamp(0.0, 100.0).round() as u8,
        wind_speed: body.current.wind_speed_10m,
        condition: WeatherCondition::from_wmo_code(body.current.weather_code),
    };

    let mut hourly = Vec::with_capacity(body.hourly.time.len());
    for (i, raw_time) in body.hourly.time.iter().enumerate() {
        let (Some(temperature), Some(code)) =
            (body.hourly.temperature_2m.get(i), body.hourly.weather_code.get(i))
        else {
            return Err(FetchError::DecodeFailure("ragged hourly arrays".into()));
        };
        hourly.push(HourlyForecast {
            time: parse_hourly_time(raw_time)?,
            temperature: *temperature,
            condition: WeatherCondition::from_wmo_code(*code),
            precipitation_chance: chance_from(
                body.hourly.precipitation_probability.get(i).copied().flatten(),
            ),
        });
    }

    let mut daily = Vec::with_capacity(body.daily.time.len());
    for (i, raw_date) in body.daily.time.iter().enumerate() {
        let (Some(high), Some(low), Some(code)) = (
            body.daily.temperature_2m_max.get(i),
            body.daily.temperature_2m_min.get(i),
            body.daily.weather_code.get(i),
        ) else {
            return Err(FetchError::DecodeFailure("ragged daily arrays".into()));
        };
        daily.push(DayForecast {
            date: parse_daily_date(raw_date)?,
            high: *high,
            low: *low,
            condition: WeatherCondition::from_wmo_code(*code),
            precipitation_chance: chance_from(
                body.daily.precipitation_probability_max.get(i).copied().flatten(),
            ),
        });
    }

    Ok(WeatherSnapshot {
        coordinate,
        fetched_at: Utc::now(),
        current,
        hourly,
        daily,
        air_quality: None,
        alerts: Vec::new(),
    })
}
