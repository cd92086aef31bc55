//! Quota-bounded registration of place mentions picked up outside a batch run.
//!
//! Callers hand over a request and move on; `submit` spawns the work and the
//! returned handle may be dropped. Every write is an idempotent upsert, so a
//! registration cut short by process exit leaves nothing half-done.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::matcher::MatchMode;
use crate::model::{
    Candidate, Category, Confidence, Coordinates, RejectReason, Rejection, VerifiedPlace,
};
use crate::places::PhotoSource;
use crate::regions::{self, Region};
use crate::storage::{photo_object_path, AssetStorage};
use crate::store::{ConflictKey, PlaceFilter, PlaceStore, UpsertOutcome};
use crate::verifier::Verifier;

const PHOTO_CONTENT_TYPE: &str = "image/jpeg";
const DEFAULT_CATEGORY: Category = Category::Attraction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceMention {
    pub name: String,
    /// The same place written for another audience, tried after a mismatch.
    #[serde(default)]
    pub alt_name: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PlaceMention {
    fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => {
                Some(Coordinates::new(lat, lng)).filter(Coordinates::is_valid)
            }
            _ => None,
        }
    }

    fn candidate(&self, region: &Region, alt: Option<&str>) -> Candidate {
        Candidate {
            name_local: self.name.trim().to_string(),
            name_native: alt.map(|name| name.trim().to_string()),
            category: self.category.unwrap_or(DEFAULT_CATEGORY),
            description: self.description.clone(),
            tags: Vec::new(),
            region: region.key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub mentions: Vec<PlaceMention>,
    #[serde(default)]
    pub region_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MentionOutcome {
    Registered {
        region: String,
        external_id: String,
        photo_stored: bool,
    },
    Duplicate {
        external_id: String,
    },
    ProtectedVerified,
    Rejected {
        reason: RejectReason,
        observed_name: Option<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionResult {
    pub name: String,
    pub outcome: MentionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationReport {
    pub requested: usize,
    pub quota_remaining: usize,
    pub attempted: usize,
    pub dropped_by_quota: usize,
    pub results: Vec<MentionResult>,
}

impl RegistrationReport {
    pub fn registered(&self) -> usize {
        self.results
            .iter()
            .filter(|result| matches!(result.outcome, MentionOutcome::Registered { .. }))
            .count()
    }
}

pub struct AutoRegistrar {
    verifier: Arc<Verifier>,
    store: Arc<dyn PlaceStore>,
    photos: Option<(Arc<dyn PhotoSource>, Arc<dyn AssetStorage>)>,
    daily_quota: usize,
    region_match_max_km: f64,
    default_region: String,
    delay: Duration,
}

impl AutoRegistrar {
    pub fn new(config: &AppConfig, verifier: Arc<Verifier>, store: Arc<dyn PlaceStore>) -> Self {
        Self {
            verifier,
            store,
            photos: None,
            daily_quota: config.auto_register_daily_quota,
            region_match_max_km: config.region_match_max_km,
            default_region: config.default_region.clone(),
            delay: config.auto_register_delay(),
        }
    }

    pub fn with_photos(
        mut self,
        source: Arc<dyn PhotoSource>,
        storage: Arc<dyn AssetStorage>,
    ) -> Self {
        self.photos = Some((source, storage));
        self
    }

    /// Starts registration in the background. The handle may be dropped.
    pub fn submit(
        self: &Arc<Self>,
        request: RegistrationRequest,
    ) -> JoinHandle<AppResult<RegistrationReport>> {
        let registrar = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = registrar.register(request).await;
            if let Err(err) = &outcome {
                warn!(%err, "auto registration aborted");
            }
            outcome
        })
    }

    pub async fn register(&self, request: RegistrationRequest) -> AppResult<RegistrationReport> {
        let used_today = self
            .store
            .count_where(&PlaceFilter::auto_verified_since(start_of_utc_day(Utc::now())))?;
        let quota_remaining = self.daily_quota.saturating_sub(used_today);
        let requested = request.mentions.len();
        let attempted = requested.min(quota_remaining);

        let mut report = RegistrationReport {
            requested,
            quota_remaining,
            attempted,
            dropped_by_quota: requested - attempted,
            results: Vec::with_capacity(attempted),
        };
        if report.dropped_by_quota > 0 {
            info!(
                requested,
                used_today,
                quota = self.daily_quota,
                dropped = report.dropped_by_quota,
                "auto registration quota reached; truncating batch"
            );
        }

        let hint = request.region_hint.as_deref();
        for (index, mention) in request.mentions.into_iter().take(attempted).enumerate() {
            if index > 0 {
                sleep(self.delay).await;
            }
            let outcome = match self.register_one(&mention, hint).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(name = %mention.name, %err, "auto registration failed");
                    MentionOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            report.results.push(MentionResult {
                name: mention.name,
                outcome,
            });
        }

        info!(
            attempted = report.attempted,
            registered = report.registered(),
            "auto registration finished"
        );
        Ok(report)
    }

    async fn register_one(
        &self,
        mention: &PlaceMention,
        hint: Option<&str>,
    ) -> AppResult<MentionOutcome> {
        let region = self.resolve_region(mention, hint)?;
        let place = match self.verify(mention, region).await {
            Ok(place) => place,
            Err(rejection) => {
                debug!(name = %mention.name, reason = %rejection.reason, "mention not verified");
                return Ok(MentionOutcome::Rejected {
                    reason: rejection.reason,
                    observed_name: rejection.observed_name,
                });
            }
        };

        if self.store.find_by_external_id(&place.external_place_id)?.is_some() {
            return Ok(MentionOutcome::Duplicate {
                external_id: place.external_place_id,
            });
        }
        if let Some(existing) = self.store.find_by_key(&place.region, &place.name_local)? {
            if existing.place.confidence == Confidence::Verified {
                debug!(
                    region = %place.region,
                    name = %place.name_local,
                    "verified row left untouched"
                );
                return Ok(MentionOutcome::ProtectedVerified);
            }
        }

        match self.store.upsert(&place, ConflictKey::RegionName)? {
            UpsertOutcome::Inserted | UpsertOutcome::Updated => {}
            UpsertOutcome::Confirmed => return Ok(MentionOutcome::ProtectedVerified),
            UpsertOutcome::Skipped(_) => {
                return Ok(MentionOutcome::Duplicate {
                    external_id: place.external_place_id,
                })
            }
        }

        let photo_stored = self.attach_photo(&place).await;
        info!(
            region = %place.region,
            name = %place.name_local,
            place_id = %place.external_place_id,
            photo_stored,
            "place auto-registered"
        );
        Ok(MentionOutcome::Registered {
            region: place.region,
            external_id: place.external_place_id,
            photo_stored,
        })
    }

    async fn verify(
        &self,
        mention: &PlaceMention,
        region: &Region,
    ) -> Result<VerifiedPlace, Rejection> {
        let first = self
            .verifier
            .verify_as(
                &mention.candidate(region, None),
                region,
                MatchMode::Strict,
                Confidence::AutoVerified,
            )
            .await;
        let alt = mention
            .alt_name
            .as_deref()
            .filter(|alt| !alt.trim().is_empty() && alt.trim() != mention.name.trim());
        match (first, alt) {
            (Err(rejection), Some(alt)) if rejection.reason == RejectReason::NameMismatch => {
                debug!(name = %mention.name, alt, "retrying with alternate name");
                self.verifier
                    .verify_as(
                        &mention.candidate(region, Some(alt)),
                        region,
                        MatchMode::Strict,
                        Confidence::AutoVerified,
                    )
                    .await
            }
            (outcome, _) => outcome,
        }
    }

    fn resolve_region(
        &self,
        mention: &PlaceMention,
        hint: Option<&str>,
    ) -> AppResult<&'static Region> {
        if let Some(region) = mention
            .coordinates()
            .and_then(|point| regions::nearest(&point, self.region_match_max_km))
        {
            return Ok(region);
        }
        if let Some(region) = hint.and_then(regions::find) {
            return Ok(region);
        }
        regions::require(&self.default_region)
    }

    /// Best effort: any failure is logged and reported as `false`.
    async fn attach_photo(&self, place: &VerifiedPlace) -> bool {
        let Some((source, storage)) = &self.photos else {
            return false;
        };
        let Some(photo) = place.photos.iter().max_by_key(|photo| photo.area()) else {
            return false;
        };

        let bytes = match source.fetch_photo(photo).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(place_id = %place.external_place_id, %err, "photo download failed");
                return false;
            }
        };
        let path = photo_object_path(&place.region, &place.external_place_id);
        let url = match storage.upload(bytes, &path, PHOTO_CONTENT_TYPE).await {
            Ok(url) => url,
            Err(err) => {
                warn!(place_id = %place.external_place_id, %err, "photo upload failed");
                return false;
            }
        };
        match self.store.set_image_url(&place.region, &place.name_local, &url) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(place_id = %place.external_place_id, %err, "photo url backfill failed");
                false
            }
        }
    }
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::errors::AppError;
    use crate::model::PhotoRef;
    use crate::store::tests::{memory_store, sample_place};
    use crate::store::SqlitePlaceStore;
    use crate::verifier::tests::{hit, FakeSearch};

    struct FakePhotos {
        fail: bool,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PhotoSource for FakePhotos {
        async fn fetch_photo(&self, photo: &PhotoRef) -> AppResult<Vec<u8>> {
            self.fetched.lock().push(photo.name.clone());
            if self.fail {
                Err(AppError::Parse("photo exceeded the byte limit".into()))
            } else {
                Ok(vec![0xFF, 0xD8, 0xFF])
            }
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        uploads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetStorage for FakeStorage {
        async fn upload(
            &self,
            _bytes: Vec<u8>,
            path: &str,
            _content_type: &str,
        ) -> AppResult<String> {
            self.uploads.lock().push(path.to_string());
            Ok(format!("https://cdn.test/{path}"))
        }
    }

    struct Harness {
        registrar: AutoRegistrar,
        store: Arc<SqlitePlaceStore>,
        search: Arc<FakeSearch>,
        _dir: tempfile::TempDir,
    }

    fn harness(search: FakeSearch) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = Arc::new(memory_store());
        let search = Arc::new(search);
        let verifier = Arc::new(Verifier::new(search.clone(), config.search_bias_radius_m));
        Harness {
            registrar: AutoRegistrar::new(&config, verifier, store.clone()),
            store,
            search,
            _dir: dir,
        }
    }

    fn mention(name: &str) -> PlaceMention {
        PlaceMention {
            name: name.into(),
            alt_name: None,
            category: Some(Category::Restaurant),
            lat: None,
            lng: None,
            description: None,
        }
    }

    fn request(mentions: Vec<PlaceMention>) -> RegistrationRequest {
        RegistrationRequest {
            mentions,
            region_hint: None,
        }
    }

    fn seed_auto_verified(store: &SqlitePlaceStore, count: usize) {
        for index in 0..count {
            let place = sample_place(
                &format!("seed-{index}"),
                &format!("seed-ext-{index}"),
                Confidence::AutoVerified,
            );
            store.upsert(&place, ConflictKey::RegionName).unwrap();
        }
    }

    #[tokio::test]
    async fn truncates_batch_to_remaining_quota_before_any_call() {
        let mut search = FakeSearch::default();
        for index in 0..10 {
            search = search.answer(
                &format!("spot{index} 福岡"),
                &format!("spot{index}"),
                &format!("ext-{index}"),
            );
        }
        let h = harness(search);
        seed_auto_verified(&h.store, 48);

        let mentions = (0..10).map(|index| mention(&format!("spot{index}"))).collect();
        let report = h.registrar.register(request(mentions)).await.unwrap();

        assert_eq!(report.quota_remaining, 2);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.dropped_by_quota, 8);
        assert_eq!(report.registered(), 2);
        assert_eq!(h.search.query_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_quota_makes_no_calls() {
        let h = harness(FakeSearch::default().answer("spot 福岡", "spot", "ext"));
        seed_auto_verified(&h.store, 50);

        let report = h.registrar.register(request(vec![mention("spot")])).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(report.results.is_empty());
        assert_eq!(h.search.query_count(), 0);
    }

    #[tokio::test]
    async fn dedup_precedence_protects_existing_rows() {
        let h = harness(
            FakeSearch::default()
                .answer("一蘭 福岡", "一蘭 天神西通り店", "ext-ichiran")
                .answer("紅蘭亭 福岡", "紅蘭亭", "ext-koran-new")
                .answer("元祖長浜屋 福岡", "元祖長浜屋", "ext-nagahama"),
        );
        // same external id under another name
        h.store
            .upsert(
                &sample_place("이치란", "ext-ichiran", Confidence::Verified),
                ConflictKey::RegionName,
            )
            .unwrap();
        // human-verified row with the same name
        h.store
            .upsert(
                &sample_place("紅蘭亭", "ext-koran", Confidence::Verified),
                ConflictKey::RegionName,
            )
            .unwrap();
        // earlier automatic row with the same name
        h.store
            .upsert(
                &sample_place("元祖長浜屋", "ext-old", Confidence::AutoVerified),
                ConflictKey::RegionName,
            )
            .unwrap();

        let report = h
            .registrar
            .register(request(vec![mention("一蘭"), mention("紅蘭亭"), mention("元祖長浜屋")]))
            .await
            .unwrap();

        let outcomes: Vec<&MentionOutcome> = report
            .results
            .iter()
            .map(|result| &result.outcome)
            .collect();
        assert!(matches!(outcomes[0], MentionOutcome::Duplicate { .. }));
        assert_eq!(outcomes[1], &MentionOutcome::ProtectedVerified);
        assert!(matches!(outcomes[2], MentionOutcome::Registered { .. }));

        let koran = h.store.find_by_key("fukuoka", "紅蘭亭").unwrap().unwrap();
        assert_eq!(koran.place.external_place_id, "ext-koran");
        assert_eq!(koran.place.confidence, Confidence::Verified);
        let nagahama = h.store.find_by_key("fukuoka", "元祖長浜屋").unwrap().unwrap();
        assert_eq!(nagahama.place.external_place_id, "ext-nagahama");
        assert!(h.store.find_by_key("fukuoka", "一蘭").unwrap().is_none());
    }

    #[tokio::test]
    async fn retries_mismatch_with_alternate_name() {
        let h = harness(
            FakeSearch::default()
                .answer("이치란 福岡", "一蘭 天神西通り店", "ext-ichiran")
                .answer("一蘭 福岡", "一蘭 天神西通り店", "ext-ichiran"),
        );
        let mut ichiran = mention("이치란");
        ichiran.alt_name = Some("一蘭".into());

        let report = h.registrar.register(request(vec![ichiran])).await.unwrap();
        assert!(matches!(report.results[0].outcome, MentionOutcome::Registered { .. }));
        let stored = h.store.find_by_key("fukuoka", "이치란").unwrap().unwrap();
        assert_eq!(stored.place.confidence, Confidence::AutoVerified);
        assert_eq!(stored.place.name_native.as_deref(), Some("一蘭"));
    }

    #[tokio::test]
    async fn resolves_region_from_coordinates_then_hint_then_default() {
        let h = harness(
            FakeSearch::default()
                .answer("B-speak 由布院", "B-speak", "ext-bspeak")
                .answer("紅蘭亭 熊本", "紅蘭亭", "ext-koran")
                .answer("元祖長浜屋 福岡", "元祖長浜屋", "ext-nagahama"),
        );
        let mut bspeak = mention("B-speak");
        bspeak.lat = Some(33.2660);
        bspeak.lng = Some(131.3690);
        let mut far_away = mention("紅蘭亭");
        far_away.lat = Some(37.5665);
        far_away.lng = Some(126.9780);

        let report = h
            .registrar
            .register(RegistrationRequest {
                mentions: vec![bspeak, far_away],
                region_hint: Some("kumamoto".into()),
            })
            .await
            .unwrap();
        let regions: Vec<String> = report
            .results
            .iter()
            .filter_map(|result| match &result.outcome {
                MentionOutcome::Registered { region, .. } => Some(region.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(regions, vec!["yufuin", "kumamoto"]);

        let report = h.registrar.register(request(vec![mention("元祖長浜屋")])).await.unwrap();
        assert!(matches!(
            &report.results[0].outcome,
            MentionOutcome::Registered { region, .. } if region == "fukuoka"
        ));
    }

    #[tokio::test]
    async fn photo_enrichment_is_best_effort() {
        let mut with_photos = hit("元祖長浜屋", "ext-nagahama");
        with_photos.photos = vec![
            PhotoRef { name: "places/x/photos/small".into(), width_px: 100, height_px: 100 },
            PhotoRef { name: "places/x/photos/large".into(), width_px: 2000, height_px: 1500 },
        ];
        let mut second = hit("紅蘭亭", "ext-koran");
        second.photos = with_photos.photos.clone();
        let search = FakeSearch::default()
            .answer_result("元祖長浜屋 福岡", with_photos)
            .answer_result("紅蘭亭 福岡", second);

        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = Arc::new(memory_store());
        let verifier = Arc::new(Verifier::new(Arc::new(search), config.search_bias_radius_m));
        let storage = Arc::new(FakeStorage::default());
        let working = Arc::new(FakePhotos { fail: false, fetched: Mutex::new(Vec::new()) });
        let registrar = AutoRegistrar::new(&config, verifier.clone(), store.clone())
            .with_photos(working.clone(), storage.clone());

        let report = registrar.register(request(vec![mention("元祖長浜屋")])).await.unwrap();
        assert!(matches!(
            report.results[0].outcome,
            MentionOutcome::Registered { photo_stored: true, .. }
        ));
        assert_eq!(*working.fetched.lock(), vec!["places/x/photos/large"]);
        let stored = store.find_by_key("fukuoka", "元祖長浜屋").unwrap().unwrap();
        let expected = format!("https://cdn.test/{}", photo_object_path("fukuoka", "ext-nagahama"));
        assert_eq!(stored.place.image_url.as_deref(), Some(expected.as_str()));

        let broken = Arc::new(FakePhotos {
            fail: true,
            fetched: Mutex::new(Vec::new()),
        });
        let registrar = AutoRegistrar::new(&config, verifier, store.clone())
            .with_photos(broken, storage.clone());
        let report = registrar.register(request(vec![mention("紅蘭亭")])).await.unwrap();
        assert!(matches!(
            report.results[0].outcome,
            MentionOutcome::Registered { photo_stored: false, .. }
        ));
        assert!(store.find_by_key("fukuoka", "紅蘭亭").unwrap().unwrap().place.image_url.is_none());
        assert_eq!(storage.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn submitted_work_runs_without_the_caller_waiting() {
        let h = harness(FakeSearch::default().answer(
            "元祖長浜屋 福岡",
            "元祖長浜屋",
            "ext-nagahama",
        ));
        let registrar = Arc::new(h.registrar);

        let handle = registrar.submit(request(vec![mention("元祖長浜屋")]));
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.registered(), 1);
        assert!(h.store.find_by_external_id("ext-nagahama").unwrap().is_some());
    }

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T17:45:12+09:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(start_of_utc_day(now).to_rfc3339(), "2024-05-01T00:00:00+00:00");
    }
}
