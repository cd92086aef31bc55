use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::generator::{CandidateGenerator, GenerateError};
use crate::matcher::MatchMode;
use crate::model::{Candidate, Category, RejectedCandidate};
use crate::normalize::normalize;
use crate::regions::{self, Region, RegionTier};
use crate::rejects::RejectLog;
use crate::report::{JobSummary, RunReport};
use crate::store::{ConflictKey, PlaceStore, UpsertOutcome};
use crate::throttle::BackoffPolicy;
use crate::verifier::Verifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Generating,
    Verifying,
    Reporting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub region: String,
    pub category: Category,
}

impl JobSpec {
    pub fn new(region: impl Into<String>, category: Category) -> Self {
        Self {
            region: region.into(),
            category,
        }
    }

    /// Every region of `tier`, for one category or all of them.
    pub fn for_tier(tier: RegionTier, category: Option<Category>) -> Vec<Self> {
        let categories: Vec<Category> = match category {
            Some(category) => vec![category],
            None => Category::ALL.to_vec(),
        };
        regions::tier(tier)
            .flat_map(|region| {
                categories
                    .iter()
                    .map(move |category| JobSpec::new(region.key, *category))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Verify and report without touching the place store.
    pub dry_run: bool,
    /// Delete the region/category rows before inserting.
    pub replace: bool,
    pub count: Option<usize>,
}

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

pub struct Pipeline {
    generator: Arc<dyn CandidateGenerator>,
    verifier: Arc<Verifier>,
    store: Arc<dyn PlaceStore>,
    rejects: RejectLog,
    backoff: BackoffPolicy,
    chunk_size: usize,
    max_chunks: usize,
    default_target: usize,
    generation_delay: Duration,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        generator: Arc<dyn CandidateGenerator>,
        verifier: Arc<Verifier>,
        store: Arc<dyn PlaceStore>,
    ) -> Self {
        Self {
            generator,
            verifier,
            store,
            rejects: RejectLog::new(&config.rejects_dir),
            backoff: BackoffPolicy::from_config(config),
            chunk_size: config.generation_chunk_size.max(1),
            max_chunks: config.generation_max_chunks.max(1),
            default_target: config.default_target_count,
            generation_delay: config.generation_delay(),
        }
    }

    /// Runs each job in turn. A failed job is recorded and the rest continue.
    pub async fn run(&self, jobs: &[JobSpec], options: RunOptions) -> RunReport {
        let mut report = RunReport::new(options.dry_run);
        for spec in jobs {
            report.push(self.run_job(spec, options).await);
        }
        info!(
            jobs = report.jobs.len(),
            failed = report.failed_jobs().len(),
            dry_run = options.dry_run,
            "run finished"
        );
        report
    }

    pub async fn run_job(&self, spec: &JobSpec, options: RunOptions) -> JobSummary {
        let mut summary = JobSummary::new(&spec.region, spec.category);
        match self.execute(spec, options, &mut summary).await {
            Ok(()) => {
                summary.state = JobState::Done;
                info!(
                    region = %spec.region,
                    category = %spec.category,
                    generated = summary.generated,
                    verified = summary.verified,
                    rejected = summary.rejected,
                    "job done"
                );
            }
            Err(err) => {
                warn!(
                    region = %spec.region,
                    category = %spec.category,
                    stage = ?summary.state,
                    %err,
                    "job failed"
                );
                summary.state = JobState::Failed;
                summary.error = Some(err.to_string());
            }
        }
        summary
    }

    async fn execute(
        &self,
        spec: &JobSpec,
        options: RunOptions,
        summary: &mut JobSummary,
    ) -> Result<(), JobError> {
        let region = regions::require(&spec.region)?;
        let target = options.count.unwrap_or(self.default_target);

        summary.state = JobState::Generating;
        let candidates = self.generate(region, spec.category, target).await?;
        summary.generated = candidates.len();

        if options.replace && !options.dry_run {
            let removed = self.store.delete_region_category(region.key, spec.category)?;
            info!(region = %region.key, category = %spec.category, removed, "replacing rows");
        }

        summary.state = JobState::Verifying;
        let mut rejected = Vec::new();
        let verified = self
            .verify_all(region, &candidates, options, summary, &mut rejected)
            .await;

        summary.state = JobState::Reporting;
        if !rejected.is_empty() {
            let path = self.rejects.save(region.key, spec.category, &rejected)?;
            summary.reject_file = Some(path);
        } else if verified.is_ok() {
            self.rejects.clear(region.key, spec.category)?;
        }
        verified
    }

    /// Collects rejects into `rejected` even when a store error cuts the loop short.
    async fn verify_all(
        &self,
        region: &Region,
        candidates: &[Candidate],
        options: RunOptions,
        summary: &mut JobSummary,
        rejected: &mut Vec<RejectedCandidate>,
    ) -> Result<(), JobError> {
        for candidate in candidates {
            match self.verifier.verify(candidate, region, MatchMode::Strict).await {
                Ok(place) => {
                    summary.verified += 1;
                    if self.store.find_by_key(&place.region, &place.name_local)?.is_some() {
                        summary.skipped_existing += 1;
                        continue;
                    }
                    if options.dry_run {
                        continue;
                    }
                    match self.store.upsert(&place, ConflictKey::RegionName)? {
                        UpsertOutcome::Inserted | UpsertOutcome::Updated => summary.inserted += 1,
                        UpsertOutcome::Confirmed | UpsertOutcome::Skipped(_) => {
                            summary.skipped_existing += 1
                        }
                    }
                }
                Err(rejection) => {
                    summary.rejected += 1;
                    *summary.reasons.entry(rejection.reason).or_default() += 1;
                    rejected.push(RejectedCandidate::new(candidate, rejection));
                }
            }
        }
        Ok(())
    }

    /// Sequential chunks until `target` distinct candidates or the chunk budget runs out.
    async fn generate(
        &self,
        region: &Region,
        category: Category,
        target: usize,
    ) -> Result<Vec<Candidate>, JobError> {
        let mut seen = HashSet::new();
        let mut produced: Vec<String> = Vec::new();
        let mut candidates = Vec::new();

        for chunk in 0..self.max_chunks {
            if candidates.len() >= target {
                break;
            }
            if chunk > 0 {
                sleep(self.generation_delay).await;
            }
            let want = (target - candidates.len()).min(self.chunk_size);
            let batch = self
                .generate_with_backoff(region, category, want, &produced)
                .await?;

            let mut fresh = 0;
            for candidate in batch {
                let keys = dedup_keys(&candidate);
                if keys.is_empty() || keys.iter().any(|key| seen.contains(key)) {
                    continue;
                }
                seen.extend(keys);
                produced.push(candidate.name_local.clone());
                candidates.push(candidate);
                fresh += 1;
            }
            debug!(
                region = %region.key,
                %category,
                chunk,
                fresh,
                total = candidates.len(),
                "chunk generated"
            );
            if fresh == 0 {
                break;
            }
        }
        candidates.truncate(target);
        Ok(candidates)
    }

    async fn generate_with_backoff(
        &self,
        region: &Region,
        category: Category,
        count: usize,
        avoid: &[String],
    ) -> Result<Vec<Candidate>, GenerateError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.generator.generate(region, category, count, avoid).await {
                Ok(batch) => return Ok(batch),
                Err(GenerateError::RateLimited { retry_after })
                    if self.backoff.allows_retry(attempt) =>
                {
                    let delay = self.backoff.delay(attempt, retry_after);
                    warn!(
                        region = %region.key,
                        attempt,
                        max_retries = self.backoff.max_retries(),
                        "generator rate limited; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn dedup_keys(candidate: &Candidate) -> Vec<String> {
    candidate
        .names()
        .into_iter()
        .map(normalize)
        .filter(|key| !key.is_empty())
        .collect()
}
