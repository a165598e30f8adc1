//! Scenario definitions and the compiled plan executors load.
//!
//! A scenario is TOML source describing virtual-user groups: how many
//! concurrent instances to run, the metrics they emit (grouped into graphs)
//! and the steps each instance performs. [`compiler::build`] validates the
//! source and writes a [`CompiledPlan`], which is the artifact handed to an
//! executor subprocess.

pub mod compiler;

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};

pub use compiler::{CompiledArtifact, Compiler};

/// Artifact format understood by this build of the executor.
pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Histogram,
    Gauge,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Histogram => write!(f, "histogram"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub title: String,
    pub kind: MetricKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    pub title: String,
    #[serde(default)]
    pub unit: String,
    #[serde(rename = "metric", default)]
    pub metrics: Vec<MetricSpec>,
}

fn default_notify_value() -> i64 {
    1
}

fn default_iterations() -> u64 {
    1
}

/// One action performed by a virtual user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Notify {
        metric: String,
        #[serde(default = "default_notify_value")]
        value: i64,
    },
    Sleep {
        millis: u64,
    },
    Http {
        url: String,
        #[serde(default)]
        method: Option<String>,
        /// Histogram receiving the request latency in milliseconds.
        #[serde(default)]
        latency: Option<String>,
        /// Counter incremented on transport errors and non-2xx responses.
        #[serde(default)]
        errors: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    pub concurrency: usize,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(rename = "graph", default)]
    pub graphs: Vec<Graph>,
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

impl GroupSpec {
    pub fn metrics(&self) -> impl Iterator<Item = &MetricSpec> {
        self.graphs.iter().flat_map(|g| g.metrics.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "group", default)]
    pub groups: Vec<GroupSpec>,
}

impl Scenario {
    /// Parse and validate scenario source.
    pub fn parse(source: &str) -> Result<Self> {
        let scenario: Scenario =
            toml::from_str(source).map_err(|e| PilotError::Scenario(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(PilotError::Scenario(
                "scenario declares no groups".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(PilotError::Scenario("group name cannot be empty".to_string()));
            }
            if !names.insert(group.name.as_str()) {
                return Err(PilotError::Scenario(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
            if group.concurrency == 0 {
                return Err(PilotError::Scenario(format!(
                    "group '{}' must run at least one virtual user",
                    group.name
                )));
            }
            if group.iterations == 0 {
                return Err(PilotError::Scenario(format!(
                    "group '{}' must run at least one iteration",
                    group.name
                )));
            }
            if let Some(metric) = group.metrics().find(|m| m.title.trim().is_empty()) {
                return Err(PilotError::Scenario(format!(
                    "group '{}' declares a {} with an empty title",
                    group.name, metric.kind
                )));
            }
            for step in &group.steps {
                validate_step(&group.name, step)?;
            }
        }
        Ok(())
    }

    pub fn total_concurrency(&self) -> usize {
        self.groups.iter().map(|g| g.concurrency).sum()
    }
}

fn validate_step(group: &str, step: &Step) -> Result<()> {
    if let Step::Http { url, method, .. } = step {
        if !url.starts_with("http://") {
            return Err(PilotError::Scenario(format!(
                "group '{}': only http:// targets are supported, got '{}'",
                group, url
            )));
        }
        if let Some(method) = method {
            reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                PilotError::Scenario(format!("group '{}': invalid HTTP method '{}'", group, method))
            })?;
        }
    }
    Ok(())
}

/// The runnable artifact produced by the build step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
    pub version: u32,
    pub name: String,
    pub compiled_at: DateTime<Utc>,
    pub groups: Vec<GroupSpec>,
}

impl CompiledPlan {
    pub fn from_scenario(scenario: Scenario) -> Self {
        Self {
            version: PLAN_VERSION,
            name: scenario.name.unwrap_or_else(|| "unnamed".to_string()),
            compiled_at: Utc::now(),
            groups: scenario.groups,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let plan: CompiledPlan = serde_json::from_slice(&bytes)
            .map_err(|e| PilotError::Scenario(format!("unreadable artifact: {}", e)))?;
        if plan.version != PLAN_VERSION {
            return Err(PilotError::Scenario(format!(
                "artifact version {} is not supported (expected {})",
                plan.version, PLAN_VERSION
            )));
        }
        Ok(plan)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PilotError::Internal(format!("encode artifact: {}", e)))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
