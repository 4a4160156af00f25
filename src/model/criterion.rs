use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;

/// Something a [`Criterion`] can be evaluated against.
pub trait Matchable {
    /// Status a resource must have when the criterion does not name one.
    const DEFAULT_STATUS: &'static str;

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn status_name(&self) -> &str;
    fn tags(&self) -> &BTreeSet<String>;
}

/// A filter over resources by id, name, status and tags.
///
/// Immutable once constructed. At least one field must be set; an empty
/// criterion would match the whole catalog and is almost always a mistake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "CriterionFields")]
pub struct Criterion {
    id: Option<String>,
    name: Option<String>,
    status: Option<String>,
    tags: BTreeSet<String>,
}

#[derive(Deserialize)]
struct CriterionFields {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

impl TryFrom<CriterionFields> for Criterion {
    type Error = ResolutionError;

    fn try_from(fields: CriterionFields) -> Result<Self, Self::Error> {
        Criterion::new(fields.id, fields.name, fields.status, fields.tags)
    }
}

impl Criterion {
    pub fn new(
        id: Option<String>,
        name: Option<String>,
        status: Option<String>,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<Self, ResolutionError> {
        let clean = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let criterion = Self {
            id: clean(id),
            name: clean(name),
            status: clean(status),
            tags: tags
                .into_iter()
                .filter(|t| !t.trim().is_empty())
                .collect(),
        };

        if criterion.id.is_none()
            && criterion.name.is_none()
            && criterion.status.is_none()
            && criterion.tags.is_empty()
        {
            return Err(ResolutionError::InvalidCriteria(
                "criterion must set at least one of id, name, status or tags".to_string(),
            ));
        }
        Ok(criterion)
    }

    pub fn with_tags<I, S>(tags: I) -> Result<Self, ResolutionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(None, None, None, tags.into_iter().map(Into::into))
    }

    pub fn with_id(id: impl Into<String>) -> Result<Self, ResolutionError> {
        Self::new(Some(id.into()), None, None, Vec::new())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// All declared fields must match; tags use AND semantics.
    pub fn matches<R: Matchable>(&self, resource: &R) -> bool {
        if let Some(id) = &self.id {
            if id != resource.id() {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != resource.name() {
                return false;
            }
        }
        let wanted_status = self.status.as_deref().unwrap_or(R::DEFAULT_STATUS);
        if !wanted_status.eq_ignore_ascii_case(resource.status_name()) {
            return false;
        }
        self.tags.is_subset(resource.tags())
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.id {
            parts.push(format!("id={}", id));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name={}", name));
        }
        if let Some(status) = &self.status {
            parts.push(format!("status={}", status));
        }
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            parts.push(format!("tags=[{}]", tags.join(",")));
        }
        write!(f, "{{{}}}", parts.join(" "))
    }
}

/// What the user wants to run on: cluster criteria in priority order, exactly
/// one command criterion, and optionally an explicit list of applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CriteriaFields")]
pub struct ExecutionResourceCriteria {
    cluster_criteria: Vec<Criterion>,
    command_criterion: Criterion,
    application_ids: Vec<String>,
}

#[derive(Deserialize)]
struct CriteriaFields {
    cluster_criteria: Vec<Criterion>,
    command_criterion: Criterion,
    #[serde(default)]
    application_ids: Vec<String>,
}

impl TryFrom<CriteriaFields> for ExecutionResourceCriteria {
    type Error = ResolutionError;

    fn try_from(fields: CriteriaFields) -> Result<Self, Self::Error> {
        ExecutionResourceCriteria::new(
            fields.cluster_criteria,
            fields.command_criterion,
            fields.application_ids,
        )
    }
}

impl ExecutionResourceCriteria {
    pub fn new(
        cluster_criteria: Vec<Criterion>,
        command_criterion: Criterion,
        application_ids: Vec<String>,
    ) -> Result<Self, ResolutionError> {
        if cluster_criteria.is_empty() {
            return Err(ResolutionError::InvalidCriteria(
                "at least one cluster criterion is required".to_string(),
            ));
        }
        Ok(Self {
            cluster_criteria,
            command_criterion,
            application_ids,
        })
    }

    pub fn cluster_criteria(&self) -> &[Criterion] {
        &self.cluster_criteria
    }

    pub fn command_criterion(&self) -> &Criterion {
        &self.command_criterion
    }

    pub fn application_ids(&self) -> &[String] {
        &self.application_ids
    }
}
