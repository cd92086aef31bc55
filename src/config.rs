use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::secrets::SecretVault;

pub const PLACES_KEY_ALIAS: &str = "google-places-api-key";
pub const GENERATOR_KEY_ALIAS: &str = "generator-api-key";
pub const STORAGE_TOKEN_ALIAS: &str = "storage-token";

const DEFAULT_PHOTO_MAX_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub rejects_dir: PathBuf,
    pub google_places_api_key: Option<SecretString>,
    pub places_api_base: String,
    pub places_legacy_api_base: String,
    pub places_language: String,
    pub places_rate_limit_qps: u32,
    pub search_bias_radius_m: f64,
    pub generator_api_key: Option<SecretString>,
    pub generator_api_base: String,
    pub generator_model: String,
    pub local_language: String,
    pub generation_chunk_size: usize,
    pub generation_max_chunks: usize,
    pub generation_delay_ms: u64,
    pub default_target_count: usize,
    pub rate_limit_default_wait_secs: u64,
    pub rate_limit_max_wait_secs: u64,
    pub rate_limit_max_retries: u32,
    pub auto_register_daily_quota: usize,
    pub auto_register_delay_ms: u64,
    pub region_match_max_km: f64,
    pub default_region: String,
    pub photo_max_width_px: u32,
    pub photo_max_bytes: u64,
    pub asset_dir: Option<PathBuf>,
    pub storage_upload_url: Option<String>,
    pub storage_public_url: Option<String>,
    pub storage_token: Option<SecretString>,
    pub priority_keywords: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub rejects_dir: String,
    pub places_api_base: String,
    pub places_legacy_api_base: String,
    pub places_language: String,
    pub places_rate_limit_qps: u32,
    pub search_bias_radius_m: f64,
    pub generator_api_base: String,
    pub generator_model: String,
    pub local_language: String,
    pub generation_chunk_size: usize,
    pub generation_max_chunks: usize,
    pub default_target_count: usize,
    pub rate_limit_max_retries: u32,
    pub auto_register_daily_quota: usize,
    pub default_region: String,
    pub has_google_places_key: bool,
    pub has_generator_key: bool,
    pub has_storage_token: bool,
    pub asset_storage: &'static str,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("places.db")),
            rejects_dir: env::var("REJECTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rejects")),
            google_places_api_key: parse_secret("GOOGLE_PLACES_API_KEY"),
            places_api_base: parse_string("PLACES_API_BASE", "https://places.googleapis.com/v1"),
            places_legacy_api_base: parse_string(
                "PLACES_LEGACY_API_BASE",
                "https://maps.googleapis.com/maps/api/place",
            ),
            places_language: parse_string("PLACES_LANGUAGE", "ja"),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", 5),
            search_bias_radius_m: parse_f64("SEARCH_BIAS_RADIUS_M", 50_000.0),
            generator_api_key: parse_secret("GENERATOR_API_KEY"),
            generator_api_base: parse_string("GENERATOR_API_BASE", "https://api.openai.com/v1"),
            generator_model: parse_string("GENERATOR_MODEL", "gpt-4o-mini"),
            local_language: parse_string("LOCAL_LANGUAGE", "ko"),
            generation_chunk_size: parse_usize("GENERATION_CHUNK_SIZE", 25).max(1),
            generation_max_chunks: parse_usize("GENERATION_MAX_CHUNKS", 6).max(1),
            generation_delay_ms: parse_u64("GENERATION_DELAY_MS", 1_000),
            default_target_count: parse_usize("DEFAULT_TARGET_COUNT", 30),
            rate_limit_default_wait_secs: parse_u64("RATE_LIMIT_DEFAULT_WAIT_SECS", 20),
            rate_limit_max_wait_secs: parse_u64("RATE_LIMIT_MAX_WAIT_SECS", 120),
            rate_limit_max_retries: parse_u32("RATE_LIMIT_MAX_RETRIES", 3),
            auto_register_daily_quota: parse_usize("AUTO_REGISTER_DAILY_QUOTA", 50),
            auto_register_delay_ms: parse_u64("AUTO_REGISTER_DELAY_MS", 300),
            region_match_max_km: parse_f64("REGION_MATCH_MAX_KM", 80.0),
            default_region: parse_string("DEFAULT_REGION", "fukuoka"),
            photo_max_width_px: parse_u32("PHOTO_MAX_WIDTH_PX", 1_600).clamp(1, 4_800),
            photo_max_bytes: parse_u64("PHOTO_MAX_BYTES", DEFAULT_PHOTO_MAX_BYTES),
            asset_dir: env::var("ASSET_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            storage_upload_url: parse_optional("STORAGE_UPLOAD_URL"),
            storage_public_url: parse_optional("STORAGE_PUBLIC_URL"),
            storage_token: parse_secret("STORAGE_TOKEN"),
            priority_keywords: env::var("PRIORITY_KEYWORDS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
        }
    }

    /// Fills credentials missing from the environment with keychain entries.
    pub fn with_vault(mut self, vault: &SecretVault) -> AppResult<Self> {
        if self.google_places_api_key.is_none() {
            self.google_places_api_key = vault.read_secret(PLACES_KEY_ALIAS)?;
        }
        if self.generator_api_key.is_none() {
            self.generator_api_key = vault.read_secret(GENERATOR_KEY_ALIAS)?;
        }
        if self.storage_token.is_none() {
            self.storage_token = vault.read_secret(STORAGE_TOKEN_ALIAS)?;
        }
        Ok(self)
    }

    pub fn require_places_key(&self) -> AppResult<&SecretString> {
        self.google_places_api_key
            .as_ref()
            .ok_or_else(|| AppError::Config("GOOGLE_PLACES_API_KEY is not configured".into()))
    }

    pub fn require_generator_key(&self) -> AppResult<&SecretString> {
        self.generator_api_key
            .as_ref()
            .ok_or_else(|| AppError::Config("GENERATOR_API_KEY is not configured".into()))
    }

    pub fn generation_delay(&self) -> Duration {
        Duration::from_millis(self.generation_delay_ms)
    }

    pub fn auto_register_delay(&self) -> Duration {
        Duration::from_millis(self.auto_register_delay_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        let asset_storage = if self.storage_upload_url.is_some() {
            "http"
        } else if self.asset_dir.is_some() {
            "local"
        } else {
            "disabled"
        };
        PublicAppConfig {
            database_path: self.database_path.to_string_lossy().to_string(),
            rejects_dir: self.rejects_dir.to_string_lossy().to_string(),
            places_api_base: self.places_api_base.clone(),
            places_legacy_api_base: self.places_legacy_api_base.clone(),
            places_language: self.places_language.clone(),
            places_rate_limit_qps: self.places_rate_limit_qps,
            search_bias_radius_m: self.search_bias_radius_m,
            generator_api_base: self.generator_api_base.clone(),
            generator_model: self.generator_model.clone(),
            local_language: self.local_language.clone(),
            generation_chunk_size: self.generation_chunk_size,
            generation_max_chunks: self.generation_max_chunks,
            default_target_count: self.default_target_count,
            rate_limit_max_retries: self.rate_limit_max_retries,
            auto_register_daily_quota: self.auto_register_daily_quota,
            default_region: self.default_region.clone(),
            has_google_places_key: self.google_places_api_key.is_some(),
            has_generator_key: self.generator_api_key.is_some(),
            has_storage_token: self.storage_token.is_some(),
            asset_storage,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    parse_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secret(key: &str) -> Option<SecretString> {
    parse_optional(key).map(|v| SecretString::new(v.into()))
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        database_path: dir.join("test.db"),
        rejects_dir: dir.join("rejects"),
        google_places_api_key: Some(SecretString::new("test-key".into())),
        places_api_base: "http://127.0.0.1:9/v1".into(),
        places_legacy_api_base: "http://127.0.0.1:9/legacy".into(),
        places_language: "ja".into(),
        places_rate_limit_qps: 20,
        search_bias_radius_m: 50_000.0,
        generator_api_key: None,
        generator_api_base: "http://127.0.0.1:9/gen".into(),
        generator_model: "test-model".into(),
        local_language: "ko".into(),
        generation_chunk_size: 25,
        generation_max_chunks: 6,
        generation_delay_ms: 0,
        default_target_count: 30,
        rate_limit_default_wait_secs: 0,
        rate_limit_max_wait_secs: 0,
        rate_limit_max_retries: 3,
        auto_register_daily_quota: 50,
        auto_register_delay_ms: 0,
        region_match_max_km: 80.0,
        default_region: "fukuoka".into(),
        photo_max_width_px: 1_600,
        photo_max_bytes: DEFAULT_PHOTO_MAX_BYTES,
        asset_dir: None,
        storage_upload_url: None,
        storage_public_url: None,
        storage_token: None,
        priority_keywords: Vec::new(),
    }
}
