use crate::catalog::Cluster;
use crate::model::{JobRequest, Matchable};

/// Inputs handed to a selector: the job being resolved and the candidates
/// that survived criterion matching, in catalog order.
pub struct SelectionContext<'a, R> {
    pub job_id: &'a str,
    pub request: &'a JobRequest,
    /// Set when selecting commands: the cluster already chosen.
    pub cluster: Option<&'a Cluster>,
    pub candidates: &'a [&'a R],
}

/// What a selector decided. `resource == None` means "no opinion", and the
/// next selector in the chain gets a turn.
#[derive(Debug)]
pub struct Selection<'a, R> {
    pub resource: Option<&'a R>,
    pub rationale: String,
}

impl<'a, R> Selection<'a, R> {
    pub fn selected(resource: &'a R, rationale: impl Into<String>) -> Self {
        Self {
            resource: Some(resource),
            rationale: rationale.into(),
        }
    }

    pub fn none(rationale: impl Into<String>) -> Self {
        Self {
            resource: None,
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SelectorError(pub String);

/// Picks one resource out of a non-empty candidate set.
///
/// Implementations must be deterministic for resolution to stay idempotent.
pub trait ResourceSelector<R>: Send + Sync {
    fn name(&self) -> &str;

    fn select<'a>(
        &self,
        context: &SelectionContext<'a, R>,
    ) -> Result<Selection<'a, R>, SelectorError>;
}

pub type ClusterSelector = dyn ResourceSelector<Cluster>;
pub type CommandSelector = dyn ResourceSelector<crate::catalog::Command>;

/// Picks the candidate with the lexicographically smallest id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestIdSelector;

impl<R: Matchable> ResourceSelector<R> for LowestIdSelector {
    fn name(&self) -> &str {
        "lowest-id"
    }

    fn select<'a>(
        &self,
        context: &SelectionContext<'a, R>,
    ) -> Result<Selection<'a, R>, SelectorError> {
        Ok(match context.candidates.iter().min_by(|a, b| a.id().cmp(b.id())) {
            Some(resource) => Selection::selected(*resource, "lowest id among candidates"),
            None => Selection::none("no candidates"),
        })
    }
}

/// Picks the first candidate in the order the catalog lists them. For
/// commands that is the cluster's priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidateSelector;

impl<R> ResourceSelector<R> for FirstCandidateSelector {
    fn name(&self) -> &str {
        "first-candidate"
    }

    fn select<'a>(
        &self,
        context: &SelectionContext<'a, R>,
    ) -> Result<Selection<'a, R>, SelectorError> {
        Ok(match context.candidates.first() {
            Some(resource) => Selection::selected(*resource, "first candidate in priority order"),
            None => Selection::none("no candidates"),
        })
    }
}

/// Prefers candidates carrying a given tag; stays silent otherwise so a later
/// selector can decide.
#[derive(Debug, Clone)]
pub struct PreferTagSelector {
    pub tag: String,
}

impl<R: Matchable> ResourceSelector<R> for PreferTagSelector {
    fn name(&self) -> &str {
        "prefer-tag"
    }

    fn select<'a>(
        &self,
        context: &SelectionContext<'a, R>,
    ) -> Result<Selection<'a, R>, SelectorError> {
        Ok(
            match context
                .candidates
                .iter()
                .filter(|c| c.tags().contains(&self.tag))
                .min_by(|a, b| a.id().cmp(b.id()))
            {
                Some(resource) => {
                    Selection::selected(*resource, format!("candidate tagged '{}'", self.tag))
                }
                None => Selection::none(format!("no candidate tagged '{}'", self.tag)),
            },
        )
    }
}
