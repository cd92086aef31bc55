use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Restaurant,
    Cafe,
    Attraction,
    Shopping,
    Lodging,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Restaurant,
        Category::Cafe,
        Category::Attraction,
        Category::Shopping,
        Category::Lodging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Restaurant => "restaurant",
            Category::Cafe => "cafe",
            Category::Attraction => "attraction",
            Category::Shopping => "shopping",
            Category::Lodging => "lodging",
        }
    }

    /// Phrase used when asking the generator for candidates.
    pub fn generation_hint(&self) -> &'static str {
        match self {
            Category::Restaurant => "restaurants and local eateries",
            Category::Cafe => "cafes, dessert shops and tea houses",
            Category::Attraction => "sightseeing spots, museums, shrines and parks",
            Category::Shopping => "shops, markets and shopping streets",
            Category::Lodging => "hotels, ryokan and guesthouses",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "restaurant" | "restaurants" | "food" => Ok(Category::Restaurant),
            "cafe" | "cafes" => Ok(Category::Cafe),
            "attraction" | "attractions" | "sightseeing" => Ok(Category::Attraction),
            "shopping" | "shop" | "shops" => Ok(Category::Shopping),
            "lodging" | "hotel" | "hotels" | "accommodation" => Ok(Category::Lodging),
            _ => Err(AppError::Parse(format!("invalid category: {value}"))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6_371.0;
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Unverified place mention proposed by the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub name_local: String,
    #[serde(default)]
    pub name_native: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub region: String,
}

impl Candidate {
    /// Name sent to the search provider: the native-script name when present.
    pub fn query_name(&self) -> &str {
        self.name_native
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.name_local)
    }

    /// Every non-blank name carried by the candidate, native first.
    pub fn names(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(2);
        if let Some(native) = self.name_native.as_deref() {
            if !native.trim().is_empty() {
                names.push(native);
            }
        }
        if !self.name_local.trim().is_empty() && !names.contains(&self.name_local.as_str()) {
            names.push(self.name_local.as_str());
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Verified,
    AutoVerified,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Verified => "verified",
            Confidence::AutoVerified => "auto_verified",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "verified" => Ok(Confidence::Verified),
            "auto_verified" => Ok(Confidence::AutoVerified),
            _ => Err(AppError::Parse(format!("invalid confidence: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRef {
    pub name: String,
    #[serde(default)]
    pub width_px: u32,
    #[serde(default)]
    pub height_px: u32,
}

impl PhotoRef {
    pub fn area(&self) -> u64 {
        u64::from(self.width_px) * u64::from(self.height_px)
    }
}

/// One search provider hit, validated at ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub display_name: String,
    pub formatted_address: Option<String>,
    pub location: Option<Coordinates>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub external_id: String,
    pub opening_hours: Vec<String>,
    pub photos: Vec<PhotoRef>,
}

impl SearchResult {
    pub fn best_photo(&self) -> Option<&PhotoRef> {
        self.photos.iter().max_by_key(|photo| photo.area())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPlace {
    pub region: String,
    pub name_local: String,
    pub name_native: Option<String>,
    pub category: Category,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub address: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub hours: Vec<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub external_place_id: String,
    pub confidence: Confidence,
    pub image_url: Option<String>,
    #[serde(skip)]
    pub photos: Vec<PhotoRef>,
}

impl VerifiedPlace {
    pub fn from_match(
        candidate: &Candidate,
        result: SearchResult,
        fallback: Coordinates,
        confidence: Confidence,
    ) -> Self {
        let location = result.location.filter(Coordinates::is_valid).unwrap_or(fallback);
        Self {
            region: candidate.region.clone(),
            name_local: candidate.name_local.trim().to_string(),
            name_native: candidate
                .name_native
                .as_ref()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .or_else(|| Some(result.display_name.clone())),
            category: candidate.category,
            description: candidate.description.clone(),
            tags: candidate.tags.clone(),
            address: result.formatted_address,
            lat: location.lat,
            lng: location.lng,
            hours: result.opening_hours,
            rating: result.rating,
            review_count: result.review_count,
            external_place_id: result.external_id,
            confidence,
            image_url: None,
            photos: result.photos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoResult,
    NameMismatch,
    RequestFailed,
    ApiError,
    UnknownRegion,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoResult => "no_result",
            RejectReason::NameMismatch => "name_mismatch",
            RejectReason::RequestFailed => "request_failed",
            RejectReason::ApiError => "api_error",
            RejectReason::UnknownRegion => "unknown_region",
        }
    }

    /// Only a name mismatch can be recovered by relaxed matching.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RejectReason::NameMismatch)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub observed_name: Option<String>,
    pub detail: Option<String>,
}

impl Rejection {
    pub fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            observed_name: None,
            detail: None,
        }
    }

    pub fn observed(mut self, name: impl Into<String>) -> Self {
        self.observed_name = Some(name.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Side-channel record of a candidate that failed verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedCandidate {
    pub name_local: String,
    #[serde(default)]
    pub name_native: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub reject_reason: RejectReason,
    #[serde(default)]
    pub observed_name: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RejectedCandidate {
    pub fn new(candidate: &Candidate, rejection: Rejection) -> Self {
        Self {
            name_local: candidate.name_local.clone(),
            name_native: candidate.name_native.clone(),
            category: Some(candidate.category),
            description: candidate.description.clone(),
            tags: candidate.tags.clone(),
            reject_reason: rejection.reason,
            observed_name: rejection.observed_name,
            detail: rejection.detail,
        }
    }

    pub fn to_candidate(&self, region: &str, fallback_category: Category) -> Candidate {
        Candidate {
            name_local: self.name_local.clone(),
            name_native: self.name_native.clone(),
            category: self.category.unwrap_or(fallback_category),
            description: self.description.clone(),
            tags: self.tags.clone(),
            region: region.to_string(),
        }
    }
}

/// Count of rejections keyed by reason, in stable order.
pub type ReasonTally = BTreeMap<RejectReason, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_category_aliases() {
        assert_eq!(Category::parse("Hotels").unwrap(), Category::Lodging);
        assert_eq!(Category::parse(" cafe ").unwrap(), Category::Cafe);
        assert!(Category::parse("nightlife").is_err());
    }

    #[test]
    fn haversine_distance_is_plausible() {
        let fukuoka = Coordinates::new(33.5902, 130.4017);
        let kumamoto = Coordinates::new(32.8031, 130.7079);
        let km = fukuoka.distance_km(&kumamoto);
        assert!((85.0..100.0).contains(&km), "unexpected distance {km}");
    }

    #[test]
    fn rejected_candidate_serializes_side_channel_shape() {
        let candidate = Candidate {
            name_local: "이치란".into(),
            name_native: Some("一蘭".into()),
            category: Category::Restaurant,
            description: None,
            tags: Vec::new(),
            region: "fukuoka".into(),
        };
        let rejected = RejectedCandidate::new(
            &candidate,
            Rejection::new(RejectReason::NameMismatch).observed("一蘭 天神西通り店"),
        );
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value["nameLocal"], "이치란");
        assert_eq!(value["nameNative"], "一蘭");
        assert_eq!(value["rejectReason"], "name_mismatch");
        assert_eq!(value["observedName"], "一蘭 天神西通り店");
    }

    #[test]
    fn candidate_names_skip_blank_native() {
        let candidate = Candidate {
            name_local: "B-speak".into(),
            name_native: Some("  ".into()),
            category: Category::Cafe,
            description: None,
            tags: Vec::new(),
            region: "yufuin".into(),
        };
        assert_eq!(candidate.query_name(), "B-speak");
        assert_eq!(candidate.names(), vec!["B-speak"]);
    }

    #[test]
    fn best_photo_prefers_largest_area() {
        let result = SearchResult {
            display_name: "x".into(),
            formatted_address: None,
            location: None,
            rating: None,
            review_count: None,
            external_id: "id".into(),
            opening_hours: Vec::new(),
            photos: vec![
                PhotoRef { name: "small".into(), width_px: 400, height_px: 300 },
                PhotoRef { name: "large".into(), width_px: 4032, height_px: 3024 },
                PhotoRef { name: "tall".into(), width_px: 1000, height_px: 4000 },
            ],
        };
        assert_eq!(result.best_photo().unwrap().name, "large");
    }
}
