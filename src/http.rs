// HTTP client for the public transport journey planner

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::api::{ApiError, Journey, JourneyQuery, Mode, RoutingApi, RoutingResponse};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRoutingConfig {
    pub base_url: String,
    pub app_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for HttpRoutingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.tfl.gov.uk".to_string(),
            app_key: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JourneyResultsPayload {
    #[serde(default)]
    journeys: Vec<JourneyPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JourneyPayload {
    start_date_time: String,
    arrival_date_time: String,
    // Minutes
    duration: u64,
    #[serde(default)]
    legs: Vec<LegPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegPayload {
    mode: ModePayload,
    #[serde(default)]
    route_options: Vec<RouteOptionPayload>,
}

#[derive(Debug, Deserialize)]
struct ModePayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RouteOptionPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    #[serde(default)]
    exception_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// Timestamps arrive without an offset; they are taken as UTC
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| ApiError::DecodeError(format!("bad timestamp {raw:?}: {e}")))
}

impl JourneyPayload {
    fn into_journey(self) -> Result<Journey, ApiError> {
        let modes: Vec<Mode> = self.legs.iter().map(|leg| Mode::from_id(&leg.mode.id)).collect();
        // The journey is labelled by its main means of transport
        let mode = modes
            .iter()
            .copied()
            .find(|mode| *mode != Mode::Walking)
            .or_else(|| modes.first().copied())
            .unwrap_or(Mode::Other);
        let route = self
            .legs
            .iter()
            .map(|leg| match leg.route_options.first() {
                Some(option) if !option.name.is_empty() => option.name.clone(),
                _ => leg.mode.id.clone(),
            })
            .collect::<Vec<_>>()
            .join(" > ");

        Ok(Journey {
            duration: Duration::from_secs(self.duration * 60),
            departure: parse_timestamp(&self.start_date_time)?,
            arrival: parse_timestamp(&self.arrival_date_time)?,
            mode,
            route,
        })
    }
}

pub fn decode_journeys(body: &str) -> Result<Vec<Journey>, ApiError> {
    let payload: JourneyResultsPayload =
        serde_json::from_str(body).map_err(|e| ApiError::DecodeError(e.to_string()))?;
    payload
        .journeys
        .into_iter()
        .map(JourneyPayload::into_journey)
        .collect()
}

/// Maps a journey planner response onto the routing contract.
///
/// 300 is a disambiguation answer, a 404 carrying `EntityNotFoundException`
/// means no journey exists, 429 is a quota response whose `Retry-After`
/// (seconds) defaults to one second.
pub fn classify_response(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> Result<RoutingResponse, ApiError> {
    match status {
        300 => Ok(RoutingResponse::Disambiguation),
        200..=299 => decode_journeys(body).map(RoutingResponse::Journeys),
        404 => {
            let payload: Option<ErrorPayload> = serde_json::from_str(body).ok();
            let message = payload
                .as_ref()
                .and_then(|p| p.message.clone())
                .unwrap_or_else(|| "Not found".to_string());
            match payload.and_then(|p| p.exception_type) {
                Some(kind) if kind == "EntityNotFoundException" => Err(ApiError::NotFound(message)),
                _ => Err(ApiError::ApiResponseError {
                    status_code: status,
                    message,
                }),
            }
        }
        429 => {
            let retry_after = retry_after
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(ApiError::RateLimited { retry_after })
        }
        _ => Err(ApiError::ApiResponseError {
            status_code: status,
            message: body.chars().take(200).collect(),
        }),
    }
}

pub fn query_parameters(query: &JourneyQuery, app_key: Option<&str>) -> Vec<(&'static str, String)> {
    let mut parameters = vec![
        ("date", query.arrival.format("%Y%m%d").to_string()),
        ("time", query.arrival.format("%H%M").to_string()),
        ("timeIs", "arriving".to_string()),
        (
            "mode",
            query
                .modes
                .iter()
                .map(|mode| mode.id())
                .collect::<Vec<_>>()
                .join(","),
        ),
    ];
    if let Some(key) = app_key {
        parameters.push(("app_key", key.to_string()));
    }
    parameters
}

pub struct HttpRoutingClient {
    client: reqwest::Client,
    config: HttpRoutingConfig,
}

impl HttpRoutingClient {
    pub fn new(config: HttpRoutingConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ApiError::NetworkError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn journey_url(&self, query: &JourneyQuery) -> String {
        format!(
            "{}/Journey/JourneyResults/{}/to/{}",
            self.config.base_url.trim_end_matches('/'),
            query.origin,
            query.destination
        )
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout(self.config.timeout_ms)
        } else {
            ApiError::NetworkError(e.to_string())
        }
    }
}

#[async_trait]
impl RoutingApi for HttpRoutingClient {
    async fn journey_results(&self, query: &JourneyQuery) -> Result<RoutingResponse, ApiError> {
        let url = self.journey_url(query);
        debug!(%url, arrival = %query.arrival, "Requesting journeys");

        let response = self
            .client
            .get(&url)
            .query(&query_parameters(query, self.config.app_key.as_deref()))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let result = classify_response(status, retry_after.as_deref(), &body);
        if let Err(ApiError::ApiResponseError { status_code, message }) = &result {
            error!(%url, status_code, %message, "Journey planner error");
        }
        result
    }
}
