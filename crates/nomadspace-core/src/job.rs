//! Nomad job document model.
//!
//! Only the fields NomadSpace rewrites are typed; everything else is kept in
//! `extra` and written back untouched on submission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A Nomad job as exchanged with the HTTP API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_groups: Option<Vec<TaskGroup>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Job identifier, or an empty string when the document has none.
    pub fn id_or_default(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Iterate over every task in every group.
    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.task_groups
            .iter_mut()
            .flatten()
            .flat_map(|group| group.tasks.iter_mut().flatten())
    }
}

/// A task group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,

    /// Group-level services (Consul Connect era job files)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "TaskDriver::is_unset")]
    pub driver: TaskDriver,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Driver-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A service registered by a task or group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Task drivers known to NomadSpace.
///
/// Unknown drivers round-trip through `Other` unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskDriver {
    Docker,
    Rkt,
    Exec,
    RawExec,
    Java,
    Qemu,
    Other(String),
    #[default]
    Unset,
}

impl TaskDriver {
    /// Drivers whose configuration accepts `dns_servers` and
    /// `dns_search_domains`.
    pub fn is_container(&self) -> bool {
        match self {
            TaskDriver::Docker | TaskDriver::Rkt => true,
            TaskDriver::Exec
            | TaskDriver::RawExec
            | TaskDriver::Java
            | TaskDriver::Qemu
            | TaskDriver::Other(_)
            | TaskDriver::Unset => false,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, TaskDriver::Unset)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskDriver::Docker => "docker",
            TaskDriver::Rkt => "rkt",
            TaskDriver::Exec => "exec",
            TaskDriver::RawExec => "raw_exec",
            TaskDriver::Java => "java",
            TaskDriver::Qemu => "qemu",
            TaskDriver::Other(name) => name,
            TaskDriver::Unset => "",
        }
    }
}

impl From<String> for TaskDriver {
    fn from(name: String) -> Self {
        match name.as_str() {
            "docker" => TaskDriver::Docker,
            "rkt" => TaskDriver::Rkt,
            "exec" => TaskDriver::Exec,
            "raw_exec" => TaskDriver::RawExec,
            "java" => TaskDriver::Java,
            "qemu" => TaskDriver::Qemu,
            "" => TaskDriver::Unset,
            _ => TaskDriver::Other(name),
        }
    }
}

impl From<&str> for TaskDriver {
    fn from(name: &str) -> Self {
        TaskDriver::from(name.to_string())
    }
}

impl From<TaskDriver> for String {
    fn from(driver: TaskDriver) -> Self {
        driver.as_str().to_string()
    }
}

impl std::fmt::Display for TaskDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
