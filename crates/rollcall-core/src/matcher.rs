//! Nearest-neighbour face matching over a scope's enrolled students.

use crate::store::{StoreError, StudentDirectory};
use crate::types::{Embedding, EnrolledStudent, MatchResult, Scope};
use thiserror::Error;

/// Default maximum accepted Euclidean distance. Model-specific; tune per deployment.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("could not fetch students for {scope}: {source}")]
    ScopeFetchFailed {
        scope: Scope,
        #[source]
        source: StoreError,
    },
}

/// Strategy for comparing a probe embedding against a roster of enrolled students.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, roster: &[EnrolledStudent], threshold: f32)
        -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Visits every (student, embedding) pair in roster order. The first pair to
/// reach the minimum distance wins, so ties resolve to the earlier student.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        roster: &[EnrolledStudent],
        threshold: f32,
    ) -> MatchResult {
        let mut best: Option<(f32, usize)> = None;

        for (i, student) in roster.iter().enumerate() {
            for reference in &student.embeddings {
                let Some(distance) = probe.euclidean_distance(reference) else {
                    tracing::debug!(
                        student = %student.id,
                        expected = probe.len(),
                        actual = reference.len(),
                        "skipping embedding with mismatched length"
                    );
                    continue;
                };
                if !distance.is_finite() {
                    tracing::debug!(student = %student.id, "skipping embedding with non-finite distance");
                    continue;
                }
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, i));
                }
            }
        }

        match best {
            Some((distance, idx)) if distance < threshold => MatchResult {
                student: Some(roster[idx].identity()),
                distance: Some(distance),
            },
            Some((distance, _)) => MatchResult {
                student: None,
                distance: Some(distance),
            },
            None => MatchResult::no_candidates(),
        }
    }
}

/// Fetches a scope snapshot and runs the matcher over it.
pub struct MatchEngine<M = EuclideanMatcher> {
    matcher: M,
    threshold: f32,
}

impl MatchEngine<EuclideanMatcher> {
    pub fn new(threshold: f32) -> Self {
        Self::with_matcher(EuclideanMatcher, threshold)
    }
}

impl<M: Matcher> MatchEngine<M> {
    pub fn with_matcher(matcher: M, threshold: f32) -> Self {
        Self { matcher, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Match `query` against every student enrolled in `scope`.
    ///
    /// Store failures surface as [`MatchError::ScopeFetchFailed`] and are not retried.
    pub async fn find_match<D>(
        &self,
        directory: &D,
        query: &Embedding,
        scope: &Scope,
    ) -> Result<MatchResult, MatchError>
    where
        D: StudentDirectory + ?Sized,
    {
        let roster = directory
            .list_students(scope)
            .await
            .map_err(|source| MatchError::ScopeFetchFailed {
                scope: scope.clone(),
                source,
            })?;

        let result = self.matcher.compare(query, &roster, self.threshold);

        tracing::info!(
            scope = %scope,
            candidates = roster.len(),
            distance = result.distance_or_inf(),
            student = result.student.as_ref().map(|s| s.id.as_str()),
            "match complete"
        );

        Ok(result)
    }
}
