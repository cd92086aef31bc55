use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::model::{Category, ReasonTally};
use crate::pipeline::JobState;

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub region: String,
    pub category: Category,
    pub state: JobState,
    pub generated: usize,
    pub verified: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub reasons: ReasonTally,
    pub reject_file: Option<PathBuf>,
    pub error: Option<String>,
}

impl JobSummary {
    pub fn new(region: &str, category: Category) -> Self {
        Self {
            region: region.to_string(),
            category,
            state: JobState::Generating,
            generated: 0,
            verified: 0,
            rejected: 0,
            inserted: 0,
            skipped_existing: 0,
            reasons: ReasonTally::new(),
            reject_file: None,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.state == JobState::Failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub generated: usize,
    pub verified: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
}

impl Totals {
    fn add(&mut self, job: &JobSummary) {
        self.generated += job.generated;
        self.verified += job.verified;
        self.rejected += job.rejected;
        self.inserted += job.inserted;
        self.skipped_existing += job.skipped_existing;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub region: String,
    pub category: Category,
    pub error: String,
}

/// Outcome of one `run` invocation across all of its jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub dry_run: bool,
    pub totals: Totals,
    pub reasons: ReasonTally,
    pub regions: BTreeMap<String, Totals>,
    pub failed_jobs: Vec<FailedJob>,
    pub jobs: &'a [JobSummary],
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            jobs: Vec::new(),
        }
    }

    pub fn push(&mut self, job: JobSummary) {
        self.jobs.push(job);
    }

    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for job in &self.jobs {
            totals.add(job);
        }
        totals
    }

    pub fn reasons(&self) -> ReasonTally {
        let mut tally = ReasonTally::new();
        for (reason, count) in self.jobs.iter().flat_map(|job| job.reasons.iter()) {
            *tally.entry(*reason).or_default() += count;
        }
        tally
    }

    pub fn by_region(&self) -> BTreeMap<String, Totals> {
        let mut regions: BTreeMap<String, Totals> = BTreeMap::new();
        for job in &self.jobs {
            regions.entry(job.region.clone()).or_default().add(job);
        }
        regions
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.jobs
            .iter()
            .filter(|job| job.failed())
            .map(|job| FailedJob {
                region: job.region.clone(),
                category: job.category,
                error: job.error.clone().unwrap_or_default(),
            })
            .collect()
    }

    pub fn summary(&self) -> RunSummary<'_> {
        RunSummary {
            dry_run: self.dry_run,
            totals: self.totals(),
            reasons: self.reasons(),
            regions: self.by_region(),
            failed_jobs: self.failed_jobs(),
            jobs: &self.jobs,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let totals = self.totals();
        if self.dry_run {
            writeln!(f, "dry run: nothing was written to the place store")?;
        }
        writeln!(
            f,
            "generated {}, verified {}, rejected {}, inserted {}, already present {}",
            totals.generated,
            totals.verified,
            totals.rejected,
            totals.inserted,
            totals.skipped_existing
        )?;

        let reasons = self.reasons();
        if !reasons.is_empty() {
            writeln!(f, "rejections:")?;
            for (reason, count) in &reasons {
                writeln!(f, "  {reason:<16} {count}")?;
            }
        }

        writeln!(f, "regions:")?;
        for (region, tally) in self.by_region() {
            writeln!(
                f,
                "  {region:<12} generated {:>3}  verified {:>3}  rejected {:>3}",
                tally.generated, tally.verified, tally.rejected
            )?;
        }

        let failed = self.failed_jobs();
        if !failed.is_empty() {
            writeln!(f, "failed jobs:")?;
            for job in failed {
                writeln!(f, "  {}/{}: {}", job.region, job.category, job.error)?;
            }
        }
        Ok(())
    }
}
