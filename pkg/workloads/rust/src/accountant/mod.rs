// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Attributes container handles to the checks and builds that own them.

pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use tracing::{debug, info};

use crate::errors::{DatabaseError, Error};
use crate::postgres::PostgresOpener;
use crate::worker::Container;

pub use store::PgStore;

/// What a container is doing, from the ATC's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
    Run,
    Other(String),
}

impl ContainerType {
    pub fn from_meta(value: &str) -> Self {
        match value {
            "check" => ContainerType::Check,
            "get" => ContainerType::Get,
            "put" => ContainerType::Put,
            "task" => ContainerType::Task,
            "run" => ContainerType::Run,
            other => ContainerType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerType::Check => "check",
            ContainerType::Get => "get",
            ContainerType::Put => "put",
            ContainerType::Task => "task",
            ContainerType::Run => "run",
            ContainerType::Other(other) => other,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity a container exists for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    Check {
        team: String,
        pipeline: String,
        resource: String,
    },
    Build {
        team: String,
        pipeline: String,
        job: String,
        build: String,
        step: String,
    },
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Check {
                team,
                pipeline,
                resource,
            } => write!(f, "{team}/{pipeline}/{resource}"),
            Workload::Build {
                team,
                pipeline,
                job,
                build,
                step,
            } => write!(f, "{team}/{pipeline}/{job}/{build}/{step}"),
        }
    }
}

/// One attributed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub container: Container,
    pub container_type: ContainerType,
    pub workloads: Vec<Workload>,
}

impl Sample {
    pub fn labels(&self) -> Vec<String> {
        self.workloads.iter().map(ToString::to_string).collect()
    }
}

/// A build-step row: the step's workload and the container type stored with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub handle: String,
    pub container_type: ContainerType,
    pub workload: Workload,
}

/// The two lookups the accountant needs, each scoped to a set of handles.
pub trait WorkloadStore {
    /// `(handle, workload)` for every resource check a handle belongs to.
    fn check_workloads(
        &self,
        handles: &[String],
    ) -> impl Future<Output = Result<Vec<(String, Workload)>, DatabaseError>> + Send;

    /// Build-step containers, excluding those typed as checks.
    fn build_workloads(
        &self,
        handles: &[String],
    ) -> impl Future<Output = Result<Vec<BuildRecord>, DatabaseError>> + Send;
}

pub trait Accountant {
    fn account(
        &self,
        containers: &[Container],
    ) -> impl Future<Output = Result<Vec<Sample>, Error>> + Send;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountantConfig {
    /// Only label a check container with resources of the team that owns
    /// it. Off by default: a shared check session belongs to every team
    /// whose resources use it, and global check containers carry no team.
    pub own_team_checks_only: bool,
}

/// Classify `containers` in input order. A handle with check matches becomes
/// a check sample; otherwise a build match becomes a build sample; handles
/// with neither are dropped.
pub async fn classify<S: WorkloadStore>(
    store: &S,
    containers: &[Container],
) -> Result<Vec<Sample>, DatabaseError> {
    if containers.is_empty() {
        return Ok(Vec::new());
    }
    let handles: Vec<String> = containers.iter().map(|c| c.handle.clone()).collect();

    let mut checks: HashMap<String, Vec<Workload>> = HashMap::new();
    for (handle, workload) in store.check_workloads(&handles).await? {
        checks.entry(handle).or_default().push(workload);
    }
    let builds: HashMap<String, BuildRecord> = store
        .build_workloads(&handles)
        .await?
        .into_iter()
        .map(|record| (record.handle.clone(), record))
        .collect();

    let samples: Vec<Sample> = containers
        .iter()
        .filter_map(|container| {
            if let Some(workloads) = checks.get(&container.handle) {
                return Some(Sample {
                    container: container.clone(),
                    container_type: ContainerType::Check,
                    workloads: workloads.clone(),
                });
            }
            builds.get(&container.handle).map(|record| Sample {
                container: container.clone(),
                container_type: record.container_type.clone(),
                workloads: vec![record.workload.clone()],
            })
        })
        .collect();

    debug!(
        containers = containers.len(),
        samples = samples.len(),
        "Classified containers"
    );
    Ok(samples)
}

/// Accountant backed by the ATC database. Each call opens its own
/// connection through the opener.
#[derive(Clone)]
pub struct DbAccountant {
    opener: PostgresOpener,
    config: AccountantConfig,
}

impl DbAccountant {
    pub fn new(opener: PostgresOpener, config: AccountantConfig) -> Self {
        Self { opener, config }
    }
}

impl Accountant for DbAccountant {
    async fn account(&self, containers: &[Container]) -> Result<Vec<Sample>, Error> {
        let client = self.opener.open().await?;
        let store = PgStore::new(&client, self.config);
        let samples = classify(&store, containers).await?;
        info!(samples = samples.len(), "Accounted containers");
        Ok(samples)
    }
}
