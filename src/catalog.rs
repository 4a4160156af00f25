//! Execution resources a job can be resolved against.
//!
//! The catalog is an immutable snapshot: resolution reads it, never writes it,
//! so resolving twice against the same snapshot yields the same answer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{ExecutionEnvironment, Matchable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Up,
    OutOfService,
    Terminated,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Up => "UP",
            ClusterStatus::OutOfService => "OUT_OF_SERVICE",
            ClusterStatus::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Active,
    Deprecated,
    Inactive,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Active => "ACTIVE",
            CommandStatus::Deprecated => "DEPRECATED",
            CommandStatus::Inactive => "INACTIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Active,
    Deprecated,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub status: ClusterStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub environment: ExecutionEnvironment,
    /// Commands runnable on this cluster, in priority order.
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub executable: Vec<String>,
    #[serde(default)]
    pub environment: ExecutionEnvironment,
    /// Applications loaded when the request names none, in load order.
    #[serde(default)]
    pub applications: Vec<String>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub status: ApplicationStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub environment: ExecutionEnvironment,
}

impl Matchable for Cluster {
    const DEFAULT_STATUS: &'static str = "UP";

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn status_name(&self) -> &str {
        self.status.as_str()
    }
    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

impl Matchable for Command {
    const DEFAULT_STATUS: &'static str = "ACTIVE";

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn status_name(&self) -> &str {
        self.status.as_str()
    }
    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Cluster {cluster} references unknown command {command}")]
    UnknownCommand { cluster: String, command: String },
    #[error("Command {command} references unknown application {application}")]
    UnknownApplication {
        command: String,
        application: String,
    },
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    clusters: Vec<Cluster>,
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    applications: Vec<Application>,
}

/// In-memory snapshot of clusters, commands and applications.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    clusters: BTreeMap<String, Cluster>,
    commands: BTreeMap<String, Command>,
    applications: BTreeMap<String, Application>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.insert(cluster.id.clone(), cluster);
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.insert(command.id.clone(), command);
        self
    }

    pub fn with_application(mut self, application: Application) -> Self {
        self.applications
            .insert(application.id.clone(), application);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let catalog = file
            .clusters
            .into_iter()
            .fold(Self::new(), |c, cluster| c.with_cluster(cluster));
        let catalog = file
            .commands
            .into_iter()
            .fold(catalog, |c, command| c.with_command(command));
        let catalog = file
            .applications
            .into_iter()
            .fold(catalog, |c, app| c.with_application(app));
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Every association must point at a resource that exists.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for cluster in self.clusters.values() {
            for command in &cluster.commands {
                if !self.commands.contains_key(command) {
                    return Err(CatalogError::UnknownCommand {
                        cluster: cluster.id.clone(),
                        command: command.clone(),
                    });
                }
            }
        }
        for command in self.commands.values() {
            for application in &command.applications {
                if !self.applications.contains_key(application) {
                    return Err(CatalogError::UnknownApplication {
                        command: command.id.clone(),
                        application: application.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Clusters in id order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn cluster(&self, id: &str) -> Option<&Cluster> {
        self.clusters.get(id)
    }

    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.get(id)
    }

    pub fn application(&self, id: &str) -> Option<&Application> {
        self.applications.get(id)
    }

    /// Commands attached to a cluster, in the cluster's priority order.
    pub fn commands_for_cluster(&self, cluster: &Cluster) -> Vec<&Command> {
        cluster
            .commands
            .iter()
            .filter_map(|id| self.commands.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "clusters": [
            {"id": "c1", "name": "batch", "status": "UP", "tags": ["default"], "commands": ["sh"]}
        ],
        "commands": [
            {"id": "sh", "name": "shell", "status": "ACTIVE", "executable": ["/bin/sh", "-c"],
             "applications": ["tools"]}
        ],
        "applications": [
            {"id": "tools", "name": "tools", "status": "ACTIVE"}
        ]
    }"#;

    #[test]
    fn loads_from_json() {
        let catalog = ResourceCatalog::from_json(CATALOG).unwrap();
        let cluster = catalog.cluster("c1").unwrap();
        assert_eq!(cluster.status, ClusterStatus::Up);
        let commands = catalog.commands_for_cluster(cluster);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].executable, vec!["/bin/sh", "-c"]);
    }

    #[test]
    fn dangling_command_reference_is_rejected() {
        let json = r#"{"clusters": [{"id": "c1", "name": "c", "status": "UP", "commands": ["missing"]}]}"#;
        assert!(matches!(
            ResourceCatalog::from_json(json),
            Err(CatalogError::UnknownCommand { .. })
        ));
    }
}
