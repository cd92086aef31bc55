use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::matcher::MatchMode;
use crate::model::{Category, RejectedCandidate};
use crate::normalize::fold_width;
use crate::regions;
use crate::rejects::RejectLog;
use crate::store::{ConflictKey, PlaceStore, UpsertOutcome};
use crate::verifier::Verifier;

/// Chains whose names are worth a second, looser look.
pub const DEFAULT_PRIORITY_KEYWORDS: &[&str] = &[
    "一蘭",
    "一風堂",
    "丸亀",
    "marugame",
    "ichiran",
    "ippudo",
    "スターバックス",
    "starbucks",
    "ドン・キホーテ",
    "don quijote",
    "無印良品",
    "muji",
    "ユニクロ",
    "uniqlo",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ReverifyOptions {
    pub priority_only: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReverifyReport {
    pub region: String,
    pub category: Option<Category>,
    pub total: usize,
    pub unrecoverable: usize,
    pub not_prioritized: usize,
    pub attempted: usize,
    pub recovered: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub still_rejected: usize,
    pub dry_run: bool,
}

pub struct Reverifier {
    verifier: Arc<Verifier>,
    store: Arc<dyn PlaceStore>,
    rejects: RejectLog,
    priority_keywords: Vec<String>,
}

impl Reverifier {
    pub fn new(config: &AppConfig, verifier: Arc<Verifier>, store: Arc<dyn PlaceStore>) -> Self {
        let mut priority_keywords: Vec<String> = DEFAULT_PRIORITY_KEYWORDS
            .iter()
            .map(|keyword| keyword.to_string())
            .collect();
        priority_keywords.extend(config.priority_keywords.iter().cloned());
        Self {
            verifier,
            store,
            rejects: RejectLog::new(&config.rejects_dir),
            priority_keywords: priority_keywords
                .iter()
                .map(|keyword| fold_width(keyword.trim()))
                .filter(|keyword| !keyword.is_empty())
                .collect(),
        }
    }

    pub async fn reverify(
        &self,
        region_key: &str,
        category: Category,
        options: ReverifyOptions,
    ) -> AppResult<ReverifyReport> {
        let region = regions::require(region_key)?;
        let entries = self.rejects.load(region.key, category)?;
        let mut report = ReverifyReport {
            region: region.key.to_string(),
            category: Some(category),
            total: entries.len(),
            dry_run: options.dry_run,
            ..ReverifyReport::default()
        };

        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.reject_reason.is_recoverable() {
                report.unrecoverable += 1;
                remaining.push(entry);
                continue;
            }
            if options.priority_only && !self.is_priority(&entry) {
                report.not_prioritized += 1;
                remaining.push(entry);
                continue;
            }

            report.attempted += 1;
            let candidate = entry.to_candidate(region.key, category);
            match self.verifier.verify(&candidate, region, MatchMode::Loose).await {
                Ok(place) => {
                    report.recovered += 1;
                    if self.store.find_by_key(&place.region, &place.name_local)?.is_some() {
                        report.already_present += 1;
                        continue;
                    }
                    if options.dry_run {
                        continue;
                    }
                    match self.store.upsert(&place, ConflictKey::RegionName)? {
                        UpsertOutcome::Inserted | UpsertOutcome::Updated => report.inserted += 1,
                        UpsertOutcome::Confirmed | UpsertOutcome::Skipped(_) => {
                            report.already_present += 1
                        }
                    }
                }
                Err(rejection) => {
                    debug!(name = %entry.name_local, reason = %rejection.reason, "still rejected");
                    report.still_rejected += 1;
                    let observed = rejection.observed_name.or_else(|| entry.observed_name.clone());
                    remaining.push(RejectedCandidate {
                        observed_name: observed,
                        ..entry
                    });
                }
            }
        }

        if !options.dry_run {
            self.rejects.save(region.key, category, &remaining)?;
        }
        info!(
            region = %region.key,
            %category,
            attempted = report.attempted,
            recovered = report.recovered,
            inserted = report.inserted,
            "reverification finished"
        );
        Ok(report)
    }

    fn is_priority(&self, entry: &RejectedCandidate) -> bool {
        let names = [Some(entry.name_local.as_str()), entry.name_native.as_deref()];
        names.into_iter().flatten().any(|name| {
            let folded = fold_width(name);
            self.priority_keywords
                .iter()
                .any(|keyword| folded.contains(keyword.as_str()))
        })
    }
}
