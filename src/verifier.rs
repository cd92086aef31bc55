//! Resolves one candidate against the search provider.
//!
//! Query order: full name plus the region's native label, then a shortened
//! name, then the provider's legacy surface. The first non-empty answer is
//! judged by the name matcher; nothing after that is tried.

use std::sync::Arc;

use tracing::{debug, info};

use crate::matcher::{is_match, MatchMode};
use crate::model::{Candidate, Confidence, RejectReason, Rejection, SearchResult, VerifiedPlace};
use crate::normalize::{char_len, looks_like_address};
use crate::places::{PlaceSearch, SearchError, SearchQuery};
use crate::regions::Region;

const SHORT_QUERY_TOKENS: usize = 2;
const SHORT_QUERY_CHARS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryStage {
    Primary,
    Short,
    Legacy,
}

pub struct Verifier {
    search: Arc<dyn PlaceSearch>,
    bias_radius_m: f64,
}

impl Verifier {
    pub fn new(search: Arc<dyn PlaceSearch>, bias_radius_m: f64) -> Self {
        Self {
            search,
            bias_radius_m,
        }
    }

    pub async fn verify(
        &self,
        candidate: &Candidate,
        region: &Region,
        mode: MatchMode,
    ) -> Result<VerifiedPlace, Rejection> {
        self.verify_as(candidate, region, mode, Confidence::Verified)
            .await
    }

    pub async fn verify_as(
        &self,
        candidate: &Candidate,
        region: &Region,
        mode: MatchMode,
        confidence: Confidence,
    ) -> Result<VerifiedPlace, Rejection> {
        let result = self.lookup(candidate, region).await?;

        if looks_like_address(&result.display_name)
            && !candidate.names().iter().any(|name| looks_like_address(name))
        {
            debug!(
                name = %candidate.name_local,
                observed = %result.display_name,
                "provider answered with an address"
            );
            return Err(Rejection::new(RejectReason::NoResult)
                .observed(result.display_name)
                .detail("display name is an address"));
        }

        let matched = candidate
            .names()
            .into_iter()
            .any(|name| is_match(name, &result.display_name, mode));
        if !matched {
            debug!(
                name = %candidate.name_local,
                observed = %result.display_name,
                ?mode,
                "name mismatch"
            );
            return Err(Rejection::new(RejectReason::NameMismatch).observed(result.display_name));
        }

        info!(
            region = %region.key,
            name = %candidate.name_local,
            place_id = %result.external_id,
            "candidate verified"
        );
        Ok(VerifiedPlace::from_match(
            candidate,
            result,
            region.center(),
            confidence,
        ))
    }

    async fn lookup(
        &self,
        candidate: &Candidate,
        region: &Region,
    ) -> Result<SearchResult, Rejection> {
        let name = candidate.query_name().trim();
        let primary = self.query(format!("{name} {}", region.native_label), region);

        if let Some(result) = self.attempt(QueryStage::Primary, &primary).await? {
            return Ok(result);
        }
        if let Some(short) = short_name(name) {
            let query = self.query(format!("{short} {}", region.native_label), region);
            if let Some(result) = self.attempt(QueryStage::Short, &query).await? {
                return Ok(result);
            }
        }
        if let Some(result) = self.attempt(QueryStage::Legacy, &primary).await? {
            return Ok(result);
        }
        Err(Rejection::new(RejectReason::NoResult))
    }

    async fn attempt(
        &self,
        stage: QueryStage,
        query: &SearchQuery,
    ) -> Result<Option<SearchResult>, Rejection> {
        let outcome = match stage {
            QueryStage::Primary | QueryStage::Short => self.search.search(query).await,
            QueryStage::Legacy => self.search.search_legacy(query).await,
        };
        match outcome {
            Ok(results) => {
                debug!(?stage, query = %query.text, hits = results.len(), "search answered");
                Ok(results.into_iter().next())
            }
            Err(err) => {
                debug!(?stage, query = %query.text, %err, "search failed");
                Err(rejection_for(err))
            }
        }
    }

    fn query(&self, text: String, region: &Region) -> SearchQuery {
        SearchQuery {
            text,
            bias_center: region.center(),
            bias_radius_m: self.bias_radius_m,
        }
    }
}

fn rejection_for(err: SearchError) -> Rejection {
    match err {
        SearchError::Transport(message) => {
            Rejection::new(RejectReason::RequestFailed).detail(message)
        }
        SearchError::Status { status, message } => {
            Rejection::new(RejectReason::ApiError).detail(format!("{status}: {message}"))
        }
    }
}

/// First two whitespace tokens, or the first few characters of an unspaced
/// name. `None` when that would not change the query.
fn short_name(name: &str) -> Option<String> {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    let short = if tokens.len() > SHORT_QUERY_TOKENS {
        tokens[..SHORT_QUERY_TOKENS].join(" ")
    } else if tokens.len() == 1 && char_len(name) > SHORT_QUERY_CHARS {
        name.chars().take(SHORT_QUERY_CHARS).collect()
    } else {
        return None;
    };
    (short != name).then_some(short)
}
