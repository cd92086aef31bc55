use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::{Coordinates, PhotoRef, SearchResult};
use crate::throttle::RateLimiter;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const PHOTO_TIMEOUT_SECS: u64 = 30;
const MAX_RESULT_COUNT: u8 = 1;
const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.location,\
places.rating,places.userRatingCount,places.regularOpeningHours.weekdayDescriptions,places.photos";
const NEW_API_PHOTO_PREFIX: &str = "places/";

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub bias_center: Coordinates,
    pub bias_radius_m: f64,
}

/// Provider failures, kept apart from `AppError` because each maps onto a
/// rejection reason rather than aborting the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        SearchError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError>;

    /// Secondary calling convention tried after the primary one comes back empty.
    async fn search_legacy(&self, _query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn fetch_photo(&self, photo: &PhotoRef) -> AppResult<Vec<u8>>;
}

pub struct HttpPlacesClient {
    http: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    legacy_api_base: String,
    language: String,
    photo_max_width_px: u32,
    photo_max_bytes: u64,
    rate_limiter: RateLimiter,
}

impl HttpPlacesClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.require_places_key()?.clone();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            api_key,
            api_base: config.places_api_base.trim_end_matches('/').to_string(),
            legacy_api_base: config.places_legacy_api_base.trim_end_matches('/').to_string(),
            language: config.places_language.clone(),
            photo_max_width_px: config.photo_max_width_px,
            photo_max_bytes: config.photo_max_bytes,
            rate_limiter: RateLimiter::new(config.places_rate_limit_qps.max(1)),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextSearchBody<'a> {
    text_query: &'a str,
    max_result_count: u8,
    language_code: &'a str,
    location_bias: LocationBias,
}

#[derive(Serialize)]
struct LocationBias {
    circle: BiasCircle,
}

#[derive(Serialize)]
struct BiasCircle {
    center: BiasCenter,
    radius: f64,
}

#[derive(Serialize)]
struct BiasCenter {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct TextSearchResponse {
    #[serde(default)]
    places: Vec<ResponsePlace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePlace {
    id: Option<String>,
    display_name: Option<ResponseText>,
    formatted_address: Option<String>,
    location: Option<ResponseLocation>,
    rating: Option<f64>,
    user_rating_count: Option<u32>,
    regular_opening_hours: Option<ResponseHours>,
    #[serde(default)]
    photos: Vec<ResponsePhoto>,
}

#[derive(Deserialize)]
struct ResponseText {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponseLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseHours {
    #[serde(default)]
    weekday_descriptions: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePhoto {
    name: Option<String>,
    #[serde(default)]
    width_px: u32,
    #[serde(default)]
    height_px: u32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct LegacyResponse {
    status: String,
    #[serde(default)]
    results: Vec<LegacyPlace>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct LegacyPlace {
    place_id: Option<String>,
    name: Option<String>,
    formatted_address: Option<String>,
    geometry: Option<LegacyGeometry>,
    rating: Option<f64>,
    user_ratings_total: Option<u32>,
    #[serde(default)]
    photos: Vec<LegacyPhoto>,
}

#[derive(Deserialize)]
struct LegacyGeometry {
    location: Option<LegacyLocation>,
}

#[derive(Deserialize)]
struct LegacyLocation {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct LegacyPhoto {
    photo_reference: Option<String>,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

impl ResponsePlace {
    fn into_result(self) -> Option<SearchResult> {
        let external_id = self.id.filter(|id| !id.trim().is_empty())?;
        let display_name = self
            .display_name
            .and_then(|text| text.text)
            .filter(|name| !name.trim().is_empty())?;
        let location = self.location.and_then(|loc| match (loc.latitude, loc.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        });
        Some(SearchResult {
            display_name,
            formatted_address: self.formatted_address,
            location,
            rating: self.rating,
            review_count: self.user_rating_count,
            external_id,
            opening_hours: self
                .regular_opening_hours
                .map(|hours| hours.weekday_descriptions)
                .unwrap_or_default(),
            photos: self
                .photos
                .into_iter()
                .filter_map(|photo| {
                    photo.name.map(|name| PhotoRef {
                        name,
                        width_px: photo.width_px,
                        height_px: photo.height_px,
                    })
                })
                .collect(),
        })
    }
}

impl LegacyPlace {
    fn into_result(self) -> Option<SearchResult> {
        let external_id = self.place_id.filter(|id| !id.trim().is_empty())?;
        let display_name = self.name.filter(|name| !name.trim().is_empty())?;
        Some(SearchResult {
            display_name,
            formatted_address: self.formatted_address,
            location: self
                .geometry
                .and_then(|geometry| geometry.location)
                .map(|loc| Coordinates::new(loc.lat, loc.lng)),
            rating: self.rating,
            review_count: self.user_ratings_total,
            external_id,
            opening_hours: Vec::new(),
            photos: self
                .photos
                .into_iter()
                .filter_map(|photo| {
                    photo.photo_reference.map(|name| PhotoRef {
                        name,
                        width_px: photo.width,
                        height_px: photo.height,
                    })
                })
                .collect(),
        })
    }
}

#[async_trait]
impl PlaceSearch for HttpPlacesClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let body = TextSearchBody {
            text_query: &query.text,
            max_result_count: MAX_RESULT_COUNT,
            language_code: &self.language,
            location_bias: LocationBias {
                circle: BiasCircle {
                    center: BiasCenter {
                        latitude: query.bias_center.lat,
                        longitude: query.bias_center.lng,
                    },
                    radius: query.bias_radius_m,
                },
            },
        };

        self.rate_limiter.wait().await;
        trace!(query = %query.text, "places text search");
        let response = self
            .http
            .post(format!("{}/places:searchText", self.api_base))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .ok()
                .and_then(|envelope| envelope.error)
                .and_then(|error| error.message)
                .unwrap_or(text);
            warn!(status = status.as_u16(), %message, "places text search rejected");
            return Err(SearchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TextSearchResponse = response.json().await?;
        Ok(parsed
            .places
            .into_iter()
            .filter_map(ResponsePlace::into_result)
            .collect())
    }

    async fn search_legacy(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let location = format!("{},{}", query.bias_center.lat, query.bias_center.lng);
        let radius = query.bias_radius_m.round().to_string();

        self.rate_limiter.wait().await;
        trace!(query = %query.text, "legacy places text search");
        let response = self
            .http
            .get(format!("{}/textsearch/json", self.legacy_api_base))
            .query(&[
                ("query", query.text.as_str()),
                ("location", location.as_str()),
                ("radius", radius.as_str()),
                ("language", self.language.as_str()),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: LegacyResponse = response.json().await?;
        match parsed.status.as_str() {
            "OK" => Ok(parsed
                .results
                .into_iter()
                .filter_map(LegacyPlace::into_result)
                .take(usize::from(MAX_RESULT_COUNT))
                .collect()),
            "ZERO_RESULTS" => Ok(Vec::new()),
            other => Err(SearchError::Status {
                status: status.as_u16(),
                message: match parsed.error_message {
                    Some(detail) => format!("{other}: {detail}"),
                    None => other.to_string(),
                },
            }),
        }
    }
}

#[async_trait]
impl PhotoSource for HttpPlacesClient {
    async fn fetch_photo(&self, photo: &PhotoRef) -> AppResult<Vec<u8>> {
        let max_width = self.photo_max_width_px.to_string();
        let request = if photo.name.starts_with(NEW_API_PHOTO_PREFIX) {
            self.http
                .get(format!("{}/{}/media", self.api_base, photo.name))
                .header("X-Goog-Api-Key", self.api_key.expose_secret())
                .query(&[("maxWidthPx", max_width.as_str())])
        } else {
            self.http.get(format!("{}/photo", self.legacy_api_base)).query(&[
                ("maxwidth", max_width.as_str()),
                ("photo_reference", photo.name.as_str()),
                ("key", self.api_key.expose_secret()),
            ])
        };

        self.rate_limiter.wait().await;
        let response = request
            .timeout(Duration::from_secs(PHOTO_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?;

        if let Some(length) = response.content_length() {
            if length > self.photo_max_bytes {
                return Err(AppError::Parse(format!(
                    "photo is {length} bytes, above the {} byte limit",
                    self.photo_max_bytes
                )));
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (bytes.len() + chunk.len()) as u64 > self.photo_max_bytes {
                return Err(AppError::Parse(format!(
                    "photo exceeded the {} byte limit while downloading",
                    self.photo_max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(photo = %photo.name, bytes = bytes.len(), "photo downloaded");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_results_without_id_or_name() {
        let payload = serde_json::json!({
            "places": [
                { "displayName": { "text": "no id" } },
                { "id": "p1", "displayName": { "text": "  " } },
                {
                    "id": "p2",
                    "displayName": { "text": "紅蘭亭 下通本店" },
                    "formattedAddress": "熊本県熊本市中央区下通",
                    "location": { "latitude": 32.80, "longitude": 130.71 },
                    "rating": 4.1,
                    "userRatingCount": 870,
                    "regularOpeningHours": {
                        "weekdayDescriptions": ["月曜日: 11時00分～21時00分"]
                    },
                    "photos": [{ "name": "places/p2/photos/a", "widthPx": 800, "heightPx": 600 }]
                }
            ]
        });
        let parsed: TextSearchResponse = serde_json::from_value(payload).unwrap();
        let results: Vec<_> = parsed
            .places
            .into_iter()
            .filter_map(ResponsePlace::into_result)
            .collect();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.external_id, "p2");
        assert_eq!(result.review_count, Some(870));
        assert_eq!(result.opening_hours.len(), 1);
        assert_eq!(result.location, Some(Coordinates::new(32.80, 130.71)));
        assert_eq!(result.photos[0].area(), 480_000);
    }

    #[test]
    fn legacy_results_keep_photo_references() {
        let payload = serde_json::json!({
            "status": "OK",
            "results": [{
                "place_id": "legacy-1",
                "name": "B-speak",
                "geometry": { "location": { "lat": 33.26, "lng": 131.36 } },
                "user_ratings_total": 12,
                "photos": [{ "photo_reference": "ref-1", "width": 1200, "height": 900 }]
            }]
        });
        let parsed: LegacyResponse = serde_json::from_value(payload).unwrap();
        let result = parsed
            .results
            .into_iter()
            .find_map(LegacyPlace::into_result)
            .unwrap();
        assert_eq!(result.display_name, "B-speak");
        assert_eq!(result.photos[0].name, "ref-1");
        assert!(result.formatted_address.is_none());
    }

    #[test]
    fn requires_a_places_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::test_config(dir.path());
        config.google_places_api_key = None;
        assert!(matches!(HttpPlacesClient::new(&config), Err(AppError::Config(_))));
    }
}
