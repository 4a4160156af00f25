//! Turns a job request into a concrete cluster, command and application set.
//!
//! Resolution is a pure function of the request and a catalog snapshot:
//!
//! 1. Cluster criteria are tried in order; the first that matches at least
//!    one cluster wins, even if a later one would match more.
//! 2. A chain of [`ClusterSelector`]s picks one cluster from that set.
//! 3. The command criterion is matched against the chosen cluster's commands
//!    and a chain of [`CommandSelector`]s picks one.
//! 4. Applications come from the explicit id list, or from the command's
//!    defaults when the request names none.

pub mod selector;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::{Application, Cluster, Command, ResourceCatalog};
use crate::config::ServerConfig;
use crate::error::ResolutionError;
use crate::model::{Criterion, ExecutionResource, JobRequest, JobSpecification};

pub use selector::{
    ClusterSelector, CommandSelector, FirstCandidateSelector, LowestIdSelector,
    PreferTagSelector, ResourceSelector, Selection, SelectionContext, SelectorError,
};

/// The criterion that produced a match, paired with what it matched.
#[derive(Debug)]
pub struct ResolvedResources<'a, R> {
    criterion: &'a Criterion,
    resources: Vec<&'a R>,
}

impl<'a, R> ResolvedResources<'a, R> {
    fn new(criterion: &'a Criterion, resources: Vec<&'a R>) -> Self {
        Self {
            criterion,
            resources,
        }
    }

    pub fn criterion(&self) -> &'a Criterion {
        self.criterion
    }

    pub fn resources(&self) -> &[&'a R] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Server-side values that fill in what a request leaves out.
#[derive(Debug, Clone)]
pub struct ResolutionDefaults {
    pub job_directory: String,
    pub archive_location: Option<String>,
    pub memory_mb: u32,
}

impl From<&ServerConfig> for ResolutionDefaults {
    fn from(config: &ServerConfig) -> Self {
        Self {
            job_directory: config.default_job_directory.clone(),
            archive_location: config.default_archive_location.clone(),
            memory_mb: config.default_memory_mb,
        }
    }
}

pub struct ResolutionEngine {
    cluster_selectors: Vec<Arc<ClusterSelector>>,
    command_selectors: Vec<Arc<CommandSelector>>,
    defaults: ResolutionDefaults,
}

impl ResolutionEngine {
    /// Engine with the deterministic default selectors.
    pub fn new(defaults: ResolutionDefaults) -> Self {
        Self {
            cluster_selectors: vec![Arc::new(LowestIdSelector)],
            command_selectors: vec![Arc::new(FirstCandidateSelector)],
            defaults,
        }
    }

    pub fn with_cluster_selectors(mut self, selectors: Vec<Arc<ClusterSelector>>) -> Self {
        self.cluster_selectors = selectors;
        self
    }

    pub fn with_command_selectors(mut self, selectors: Vec<Arc<CommandSelector>>) -> Self {
        self.command_selectors = selectors;
        self
    }

    pub fn defaults(&self) -> &ResolutionDefaults {
        &self.defaults
    }

    pub fn resolve(
        &self,
        job_id: &str,
        request: &JobRequest,
        catalog: &ResourceCatalog,
    ) -> Result<JobSpecification, ResolutionError> {
        let clusters = resolve_clusters(request, catalog)?;
        let cluster = select(
            &self.cluster_selectors,
            &SelectionContext {
                job_id,
                request,
                cluster: None,
                candidates: clusters.resources(),
            },
            "cluster",
        )?;
        tracing::debug!(
            job_id,
            cluster_id = %cluster.id,
            criterion = %clusters.criterion(),
            candidates = clusters.resources().len(),
            "Selected cluster"
        );

        let commands = resolve_commands(request, catalog, cluster)?;
        let command = select(
            &self.command_selectors,
            &SelectionContext {
                job_id,
                request,
                cluster: Some(cluster),
                candidates: commands.resources(),
            },
            "command",
        )?;
        tracing::debug!(job_id, command_id = %command.id, "Selected command");

        let applications = resolve_applications(request, catalog, command)?;

        let specification = self.build_specification(
            job_id,
            request,
            clusters.criterion(),
            cluster,
            command,
            &applications,
        );
        tracing::info!(
            job_id,
            cluster_id = %cluster.id,
            command_id = %command.id,
            applications = applications.len(),
            "Job resolved"
        );
        Ok(specification)
    }

    fn build_specification(
        &self,
        job_id: &str,
        request: &JobRequest,
        cluster_criterion: &Criterion,
        cluster: &Cluster,
        command: &Command,
        applications: &[&Application],
    ) -> JobSpecification {
        let memory_mb = request
            .requested_memory_mb
            .or(command.memory_mb)
            .unwrap_or(self.defaults.memory_mb);

        let archive_location = if request.agent_config.archiving_disabled {
            None
        } else {
            self.defaults
                .archive_location
                .as_ref()
                .map(|root| format!("{}/{}", root.trim_end_matches('/'), job_id))
        };

        let job_directory_location = request
            .agent_config
            .requested_job_directory
            .clone()
            .unwrap_or_else(|| self.defaults.job_directory.clone());

        let environment_variables = environment_variables(
            job_id,
            request,
            cluster_criterion,
            cluster,
            command,
            memory_mb,
        );

        JobSpecification {
            job: ExecutionResource::new(job_id, request.environment.clone()),
            cluster: ExecutionResource::new(&cluster.id, cluster.environment.clone()),
            command: ExecutionResource::new(&command.id, command.environment.clone()),
            applications: applications
                .iter()
                .map(|a| ExecutionResource::new(&a.id, a.environment.clone()))
                .collect(),
            executable_args: command.executable.clone(),
            job_args: request.command_args.clone(),
            environment_variables,
            interactive: request.interactive,
            job_directory_location,
            archive_location,
            timeout_secs: request.agent_config.timeout_secs,
            memory_mb,
        }
    }
}

fn resolve_clusters<'a>(
    request: &'a JobRequest,
    catalog: &'a ResourceCatalog,
) -> Result<ResolvedResources<'a, Cluster>, ResolutionError> {
    for criterion in request.criteria.cluster_criteria() {
        let matched: Vec<&Cluster> = catalog
            .clusters()
            .filter(|cluster| criterion.matches(*cluster))
            .collect();
        if !matched.is_empty() {
            return Ok(ResolvedResources::new(criterion, matched));
        }
    }

    let tried: Vec<String> = request
        .criteria
        .cluster_criteria()
        .iter()
        .map(ToString::to_string)
        .collect();
    Err(ResolutionError::NoMatchingResources(format!(
        "no cluster matched any of the criteria {}",
        tried.join(", ")
    )))
}

fn resolve_commands<'a>(
    request: &'a JobRequest,
    catalog: &'a ResourceCatalog,
    cluster: &'a Cluster,
) -> Result<ResolvedResources<'a, Command>, ResolutionError> {
    let criterion = request.criteria.command_criterion();
    let matched: Vec<&Command> = catalog
        .commands_for_cluster(cluster)
        .into_iter()
        .filter(|command| criterion.matches(*command))
        .collect();
    if matched.is_empty() {
        return Err(ResolutionError::NoMatchingResources(format!(
            "no command on cluster {} matched {}",
            cluster.id, criterion
        )));
    }
    Ok(ResolvedResources::new(criterion, matched))
}

fn resolve_applications<'a>(
    request: &JobRequest,
    catalog: &'a ResourceCatalog,
    command: &Command,
) -> Result<Vec<&'a Application>, ResolutionError> {
    let ids = if request.criteria.application_ids().is_empty() {
        &command.applications[..]
    } else {
        request.criteria.application_ids()
    };
    ids.iter()
        .map(|id| {
            catalog
                .application(id)
                .ok_or_else(|| ResolutionError::UnknownApplication(id.clone()))
        })
        .collect()
}

/// Run selectors in order until one picks a resource.
fn select<'a, R>(
    selectors: &[Arc<dyn ResourceSelector<R>>],
    context: &SelectionContext<'a, R>,
    kind: &'static str,
) -> Result<&'a R, ResolutionError> {
    let mut last = None;
    for selector in selectors {
        match selector.select(context) {
            Ok(Selection {
                resource: Some(resource),
                ..
            }) => return Ok(resource),
            Ok(Selection {
                resource: None,
                rationale,
            }) => last = Some((selector.name().to_string(), rationale)),
            Err(e) => {
                tracing::error!(
                    job_id = context.job_id,
                    selector = selector.name(),
                    error = %e,
                    "Selector failed"
                );
                return Err(ResolutionError::SelectorFailed {
                    selector: selector.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    let (selector, rationale) =
        last.unwrap_or_else(|| ("none".to_string(), "no selectors configured".to_string()));
    Err(ResolutionError::NoSelection {
        selector,
        kind,
        rationale,
    })
}

fn joined_tags<'a>(tags: impl IntoIterator<Item = &'a String>) -> String {
    tags.into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn environment_variables(
    job_id: &str,
    request: &JobRequest,
    cluster_criterion: &Criterion,
    cluster: &Cluster,
    command: &Command,
    memory_mb: u32,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        vars.insert(format!("JOBCOORD_{}", key), value);
    };

    set("VERSION", env!("CARGO_PKG_VERSION").to_string());
    set("JOB_ID", job_id.to_string());
    set("JOB_NAME", request.metadata.name.clone());
    set("JOB_TAGS", joined_tags(&request.metadata.tags));
    set("JOB_MEMORY", memory_mb.to_string());
    set("USER", request.metadata.user.clone());
    set("CLUSTER_ID", cluster.id.clone());
    set("CLUSTER_NAME", cluster.name.clone());
    set("CLUSTER_TAGS", joined_tags(&cluster.tags));
    set("COMMAND_ID", command.id.clone());
    set("COMMAND_NAME", command.name.clone());
    set("COMMAND_TAGS", joined_tags(&command.tags));
    set(
        "REQUESTED_COMMAND_TAGS",
        joined_tags(request.criteria.command_criterion().tags()),
    );
    set(
        "REQUESTED_CLUSTER_TAGS",
        joined_tags(cluster_criterion.tags()),
    );
    for (index, criterion) in request.criteria.cluster_criteria().iter().enumerate() {
        set(
            &format!("REQUESTED_CLUSTER_TAGS_{}", index),
            joined_tags(criterion.tags()),
        );
    }
    vars
}
