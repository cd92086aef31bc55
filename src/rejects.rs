use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::model::{Category, RejectedCandidate};

const EXTENSION: &str = "json";

/// Side files of rejected candidates, one per region and category.
#[derive(Debug, Clone)]
pub struct RejectLog {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectFile {
    pub region: String,
    pub category: Category,
    pub path: PathBuf,
    pub entries: usize,
}

impl RejectLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, region: &str, category: Category) -> PathBuf {
        self.dir.join(format!("{region}_{category}.{EXTENSION}"))
    }

    /// Replaces the side file for `region`/`category` with `entries`.
    pub fn save(
        &self,
        region: &str,
        category: Category,
        entries: &[RejectedCandidate],
    ) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(region, category);
        let staging = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(entries)?;
        fs::write(&staging, payload)?;
        fs::rename(&staging, &path)?;
        info!(
            region,
            %category,
            entries = entries.len(),
            path = %path.display(),
            "reject file written"
        );
        Ok(path)
    }

    /// Removes the side file, if any. Returns whether one existed.
    pub fn clear(&self, region: &str, category: Category) -> AppResult<bool> {
        let path = self.path(region, category);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(region, %category, path = %path.display(), "stale reject file removed");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Entries for `region`/`category`; empty when no file exists yet.
    pub fn load(&self, region: &str, category: Category) -> AppResult<Vec<RejectedCandidate>> {
        let path = self.path(region, category);
        if !path.exists() {
            debug!(path = %path.display(), "no reject file");
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(AppError::from)
    }

    pub fn list(&self) -> AppResult<Vec<RejectFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some((region, category)) = parse_file_stem(&path) else {
                continue;
            };
            let entries = self.load(&region, category)?.len();
            files.push(RejectFile {
                region,
                category,
                path,
                entries,
            });
        }
        files.sort_by(|a, b| a.region.cmp(&b.region).then(a.category.cmp(&b.category)));
        Ok(files)
    }
}

fn parse_file_stem(path: &Path) -> Option<(String, Category)> {
    let stem = path.file_stem()?.to_str()?;
    let (region, category) = stem.rsplit_once('_')?;
    let category = Category::parse(category).ok()?;
    (!region.is_empty()).then(|| (region.to_string(), category))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RejectReason;

    fn rejected(name: &str, reason: RejectReason) -> RejectedCandidate {
        RejectedCandidate {
            name_local: name.into(),
            name_native: None,
            category: Some(Category::Restaurant),
            description: None,
            tags: Vec::new(),
            reject_reason: reason,
            observed_name: Some("observed".into()),
            detail: None,
        }
    }

    #[test]
    fn saves_and_loads_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RejectLog::new(dir.path().join("rejects"));
        assert!(log.load("fukuoka", Category::Restaurant).unwrap().is_empty());

        let entries = vec![
            rejected("이치란", RejectReason::NameMismatch),
            rejected("모츠나베 맛집", RejectReason::NoResult),
        ];
        let path = log.save("fukuoka", Category::Restaurant, &entries).unwrap();
        assert!(path.ends_with("fukuoka_restaurant.json"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"rejectReason\": \"name_mismatch\""));
        assert_eq!(log.load("fukuoka", Category::Restaurant).unwrap(), entries);
    }

    #[test]
    fn lists_known_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = RejectLog::new(dir.path());
        log.save("yufuin", Category::Cafe, &[rejected("B-speak", RejectReason::ApiError)])
            .unwrap();
        log.save("fukuoka", Category::Restaurant, &[]).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("stray.json"), "[]").unwrap();

        let files = log.list().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].region, "fukuoka");
        assert_eq!(files[0].entries, 0);
        assert_eq!(files[1].category, Category::Cafe);
        assert_eq!(files[1].entries, 1);
    }
}
