use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, trace};

use crate::db::format_timestamp;
use crate::errors::{AppError, AppResult};
use crate::model::{Category, Confidence, VerifiedPlace};

const PLACE_COLUMNS: &str = "id, region, name_local, name_native, category, description, \
     tags, address, lat, lng, hours, rating, review_count, external_place_id, confidence, \
     image_url, created_at, last_confirmed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKey {
    /// `(region, name_local)`
    RegionName,
    ExternalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// A `verified` row already holds the key; only its confirmation time moved.
    Confirmed,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DuplicateExternalId,
    DuplicateNaturalKey,
}

#[derive(Debug, Clone, Default)]
pub struct PlaceFilter {
    pub confidence: Option<Confidence>,
    pub created_since: Option<DateTime<Utc>>,
    pub region: Option<String>,
    pub category: Option<Category>,
}

impl PlaceFilter {
    pub fn auto_verified_since(since: DateTime<Utc>) -> Self {
        Self {
            confidence: Some(Confidence::AutoVerified),
            created_since: Some(since),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredPlace {
    pub id: i64,
    pub place: VerifiedPlace,
    pub created_at: String,
    pub last_confirmed_at: Option<String>,
}

/// Record storage with natural-key and external-id uniqueness.
pub trait PlaceStore: Send + Sync {
    fn upsert(&self, place: &VerifiedPlace, conflict: ConflictKey) -> AppResult<UpsertOutcome>;
    fn find_by_key(&self, region: &str, name_local: &str) -> AppResult<Option<StoredPlace>>;
    fn find_by_external_id(&self, external_id: &str) -> AppResult<Option<StoredPlace>>;
    fn count_where(&self, filter: &PlaceFilter) -> AppResult<usize>;
    fn delete_region_category(&self, region: &str, category: Category) -> AppResult<usize>;
    fn set_image_url(&self, region: &str, name_local: &str, url: &str) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct SqlitePlaceStore {
    db: Arc<Mutex<Connection>>,
}

impl SqlitePlaceStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }
}

impl PlaceStore for SqlitePlaceStore {
    fn upsert(&self, place: &VerifiedPlace, conflict: ConflictKey) -> AppResult<UpsertOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let by_key = select_by_key(&tx, &place.region, &place.name_local)?;
        let by_external = select_by_external_id(&tx, &place.external_place_id)?;
        let (existing, other) = match conflict {
            ConflictKey::RegionName => (by_key, by_external),
            ConflictKey::ExternalId => (by_external, by_key),
        };

        if let Some(other) = &other {
            if existing.as_ref().map(|row| row.id) != Some(other.id) {
                let reason = match conflict {
                    ConflictKey::RegionName => SkipReason::DuplicateExternalId,
                    ConflictKey::ExternalId => SkipReason::DuplicateNaturalKey,
                };
                debug!(
                    region = %place.region,
                    name = %place.name_local,
                    existing_id = other.id,
                    ?reason,
                    "upsert skipped; key held by another row"
                );
                return Ok(UpsertOutcome::Skipped(reason));
            }
        }

        let now = format_timestamp(Utc::now());
        let outcome = match existing {
            Some(row) if row.place.confidence == Confidence::Verified => {
                tx.execute(
                    "UPDATE verified_places SET last_confirmed_at = ?1 WHERE id = ?2",
                    params![now, row.id],
                )?;
                UpsertOutcome::Confirmed
            }
            Some(row) => {
                tx.execute(
                    "UPDATE verified_places SET
                        region = ?1, name_local = ?2, name_native = ?3, category = ?4,
                        description = ?5, tags = ?6, address = ?7, lat = ?8, lng = ?9,
                        hours = ?10, rating = ?11, review_count = ?12, external_place_id = ?13,
                        confidence = ?14, image_url = COALESCE(?15, image_url),
                        updated_at = ?16, last_confirmed_at = ?16
                    WHERE id = ?17",
                    params![
                        place.region,
                        place.name_local,
                        place.name_native,
                        place.category.as_str(),
                        place.description,
                        encode_list(&place.tags)?,
                        place.address,
                        place.lat,
                        place.lng,
                        encode_list(&place.hours)?,
                        place.rating,
                        place.review_count,
                        place.external_place_id,
                        place.confidence.as_str(),
                        place.image_url,
                        now,
                        row.id,
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO verified_places (
                        region, name_local, name_native, category, description, tags, address,
                        lat, lng, hours, rating, review_count, external_place_id, confidence,
                        image_url, created_at, updated_at, last_confirmed_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?16, ?16
                    )",
                    params![
                        place.region,
                        place.name_local,
                        place.name_native,
                        place.category.as_str(),
                        place.description,
                        encode_list(&place.tags)?,
                        place.address,
                        place.lat,
                        place.lng,
                        encode_list(&place.hours)?,
                        place.rating,
                        place.review_count,
                        place.external_place_id,
                        place.confidence.as_str(),
                        place.image_url,
                        now,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };
        tx.commit()?;

        trace!(
            region = %place.region,
            name = %place.name_local,
            place_id = %place.external_place_id,
            ?outcome,
            "place upsert recorded"
        );
        Ok(outcome)
    }

    fn find_by_key(&self, region: &str, name_local: &str) -> AppResult<Option<StoredPlace>> {
        let conn = self.db.lock();
        select_by_key(&conn, region, name_local)
    }

    fn find_by_external_id(&self, external_id: &str) -> AppResult<Option<StoredPlace>> {
        let conn = self.db.lock();
        select_by_external_id(&conn, external_id)
    }

    fn count_where(&self, filter: &PlaceFilter) -> AppResult<usize> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(confidence) = filter.confidence {
            values.push(confidence.as_str().to_string());
            clauses.push(format!("confidence = ?{}", values.len()));
        }
        if let Some(since) = filter.created_since {
            values.push(format_timestamp(since));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(region) = &filter.region {
            values.push(region.clone());
            clauses.push(format!("region = ?{}", values.len()));
        }
        if let Some(category) = filter.category {
            values.push(category.as_str().to_string());
            clauses.push(format!("category = ?{}", values.len()));
        }
        let mut sql = "SELECT COUNT(*) FROM verified_places".to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let conn = self.db.lock();
        conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get::<_, i64>(0))
            .map(|value| value as usize)
            .map_err(AppError::from)
    }

    fn delete_region_category(&self, region: &str, category: Category) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM verified_places WHERE region = ?1 AND category = ?2",
            params![region, category.as_str()],
        )?;
        debug!(region, %category, removed, "cleared region category rows");
        Ok(removed)
    }

    fn set_image_url(&self, region: &str, name_local: &str, url: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE verified_places SET image_url = ?1, updated_at = DATETIME('now')
            WHERE region = ?2 AND name_local = ?3",
            params![url, region, name_local],
        )?;
        Ok(updated > 0)
    }
}

fn select_by_key(
    conn: &Connection,
    region: &str,
    name_local: &str,
) -> AppResult<Option<StoredPlace>> {
    let sql = format!(
        "SELECT {PLACE_COLUMNS} FROM verified_places WHERE region = ?1 AND name_local = ?2"
    );
    conn.query_row(&sql, params![region, name_local], parse_stored_place)
        .optional()
        .map_err(AppError::from)
}

fn select_by_external_id(conn: &Connection, external_id: &str) -> AppResult<Option<StoredPlace>> {
    let sql = format!("SELECT {PLACE_COLUMNS} FROM verified_places WHERE external_place_id = ?1");
    conn.query_row(&sql, [external_id], parse_stored_place)
        .optional()
        .map_err(AppError::from)
}

fn encode_list(values: &[String]) -> AppResult<Option<String>> {
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(values)?))
    }
}

fn decode_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
        .unwrap_or_default()
}

fn parse_stored_place(row: &Row<'_>) -> rusqlite::Result<StoredPlace> {
    let category: String = row.get(4)?;
    let confidence: String = row.get(14)?;
    let category = Category::parse(&category).map_err(|err| conversion_error(4, err))?;
    let confidence = Confidence::parse(&confidence).map_err(|err| conversion_error(14, err))?;
    let review_count: Option<i64> = row.get(12)?;
    Ok(StoredPlace {
        id: row.get(0)?,
        place: VerifiedPlace {
            region: row.get(1)?,
            name_local: row.get(2)?,
            name_native: row.get(3)?,
            category,
            description: row.get(5)?,
            tags: decode_list(row.get(6)?),
            address: row.get(7)?,
            lat: row.get(8)?,
            lng: row.get(9)?,
            hours: decode_list(row.get(10)?),
            rating: row.get(11)?,
            review_count: review_count.and_then(|count| u32::try_from(count).ok()),
            external_place_id: row.get(13)?,
            confidence,
            image_url: row.get(15)?,
            photos: Vec::new(),
        },
        created_at: row.get(16)?,
        last_confirmed_at: row.get(17)?,
    })
}

fn conversion_error(column: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db;

    pub(crate) fn memory_store() -> SqlitePlaceStore {
        let conn = db::in_memory().unwrap();
        SqlitePlaceStore::new(Arc::new(Mutex::new(conn)))
    }

    pub(crate) fn sample_place(
        name: &str,
        external_id: &str,
        confidence: Confidence,
    ) -> VerifiedPlace {
        VerifiedPlace {
            region: "fukuoka".into(),
            name_local: name.into(),
            name_native: Some(format!("{name} native")),
            category: Category::Restaurant,
            description: None,
            tags: vec!["ramen".into()],
            address: Some("Tenjin".into()),
            lat: 33.59,
            lng: 130.40,
            hours: vec!["Mon: 10-22".into()],
            rating: Some(4.2),
            review_count: Some(120),
            external_place_id: external_id.into(),
            confidence,
            image_url: None,
            photos: Vec::new(),
        }
    }

    #[test]
    fn upserting_same_key_twice_keeps_one_row() {
        let store = memory_store();
        let place = sample_place("이치란", "ext-1", Confidence::AutoVerified);

        assert_eq!(store.upsert(&place, ConflictKey::RegionName).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&place, ConflictKey::RegionName).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.count_where(&PlaceFilter::default()).unwrap(), 1);
    }

    #[test]
    fn verified_rows_are_confirmed_not_overwritten() {
        let store = memory_store();
        let original = sample_place("이치란", "ext-1", Confidence::Verified);
        store.upsert(&original, ConflictKey::RegionName).unwrap();

        let mut incoming = sample_place("이치란", "ext-1", Confidence::AutoVerified);
        incoming.rating = Some(1.0);
        incoming.address = Some("elsewhere".into());
        assert_eq!(
            store.upsert(&incoming, ConflictKey::RegionName).unwrap(),
            UpsertOutcome::Confirmed
        );

        let stored = store.find_by_key("fukuoka", "이치란").unwrap().unwrap();
        assert_eq!(stored.place.confidence, Confidence::Verified);
        assert_eq!(stored.place.rating, Some(4.2));
        assert_eq!(stored.place.address.as_deref(), Some("Tenjin"));
        assert!(stored.last_confirmed_at.is_some());
    }

    #[test]
    fn external_id_collision_is_skipped() {
        let store = memory_store();
        store
            .upsert(&sample_place("一蘭", "ext-1", Confidence::Verified), ConflictKey::RegionName)
            .unwrap();
        let outcome = store
            .upsert(&sample_place("이치란", "ext-1", Confidence::Verified), ConflictKey::RegionName)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped(SkipReason::DuplicateExternalId));
        assert!(store.find_by_key("fukuoka", "이치란").unwrap().is_none());

        let outcome = store
            .upsert(&sample_place("一蘭", "ext-2", Confidence::Verified), ConflictKey::ExternalId)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped(SkipReason::DuplicateNaturalKey));
    }

    #[test]
    fn counts_auto_verified_rows_created_today() {
        let store = memory_store();
        store
            .upsert(&sample_place("a", "ext-a", Confidence::AutoVerified), ConflictKey::RegionName)
            .unwrap();
        store
            .upsert(&sample_place("b", "ext-b", Confidence::AutoVerified), ConflictKey::RegionName)
            .unwrap();
        store
            .upsert(&sample_place("c", "ext-c", Confidence::Verified), ConflictKey::RegionName)
            .unwrap();
        {
            let conn = store.connection();
            let conn = conn.lock();
            let yesterday = format_timestamp(Utc::now() - Duration::days(1));
            conn.execute(
                "UPDATE verified_places SET created_at = ?1 WHERE name_local = 'b'",
                [yesterday],
            )
            .unwrap();
        }

        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let count = store
            .count_where(&PlaceFilter::auto_verified_since(start_of_day))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn deletes_region_category_and_backfills_image() {
        let store = memory_store();
        store
            .upsert(&sample_place("a", "ext-a", Confidence::Verified), ConflictKey::RegionName)
            .unwrap();
        assert!(store.set_image_url("fukuoka", "a", "https://cdn/a.jpg").unwrap());
        let stored = store.find_by_external_id("ext-a").unwrap().unwrap();
        assert_eq!(stored.place.image_url.as_deref(), Some("https://cdn/a.jpg"));
        assert_eq!(stored.place.tags, vec!["ramen"]);

        assert_eq!(store.delete_region_category("fukuoka", Category::Cafe).unwrap(), 0);
        assert_eq!(store.delete_region_category("fukuoka", Category::Restaurant).unwrap(), 1);
        assert!(!store.set_image_url("fukuoka", "a", "x").unwrap());
    }
}
