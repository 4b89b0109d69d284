// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The two joins against the ATC schema.

use tokio_postgres::{Client, Row};

use super::{AccountantConfig, BuildRecord, ContainerType, Workload, WorkloadStore};
use crate::errors::DatabaseError;

const CHECK_QUERY: &str = "\
SELECT c.handle, r.name, p.name, t.name
FROM containers c
JOIN resource_config_check_sessions rccs ON c.resource_config_check_session_id = rccs.id
JOIN resources r ON rccs.resource_config_id = r.resource_config_id
JOIN pipelines p ON r.pipeline_id = p.id
JOIN teams t ON p.team_id = t.id
WHERE c.handle = ANY($1)";

const OWN_TEAM_FILTER: &str = "
  AND c.team_id = t.id";

const BUILD_QUERY: &str = "\
SELECT c.handle, t.name, c.meta_type, c.meta_pipeline_name, c.meta_job_name,
       c.meta_build_name, c.meta_step_name
FROM containers c
JOIN teams t ON c.team_id = t.id
WHERE c.handle = ANY($1)
  AND c.meta_type <> 'check'";

/// The check join, optionally restricted to the container's own team.
pub fn check_query(config: AccountantConfig) -> String {
    if config.own_team_checks_only {
        format!("{CHECK_QUERY}{OWN_TEAM_FILTER}")
    } else {
        CHECK_QUERY.to_string()
    }
}

pub fn build_query() -> &'static str {
    BUILD_QUERY
}

/// [`WorkloadStore`] over a connected ATC database client.
pub struct PgStore<'a> {
    client: &'a Client,
    config: AccountantConfig,
}

impl<'a> PgStore<'a> {
    pub fn new(client: &'a Client, config: AccountantConfig) -> Self {
        Self { client, config }
    }
}

fn query_error(join: &'static str) -> impl Fn(tokio_postgres::Error) -> DatabaseError {
    move |e| DatabaseError::Query {
        join,
        source: Box::new(e),
    }
}

fn text(row: &Row, idx: usize, join: &'static str) -> Result<String, DatabaseError> {
    row.try_get::<_, Option<String>>(idx)
        .map(Option::unwrap_or_default)
        .map_err(query_error(join))
}

impl WorkloadStore for PgStore<'_> {
    async fn check_workloads(
        &self,
        handles: &[String],
    ) -> Result<Vec<(String, Workload)>, DatabaseError> {
        let rows = self
            .client
            .query(check_query(self.config).as_str(), &[&handles])
            .await
            .map_err(query_error("check"))?;

        rows.iter()
            .map(|row| -> Result<_, DatabaseError> {
                Ok((
                    text(row, 0, "check")?,
                    Workload::Check {
                        resource: text(row, 1, "check")?,
                        pipeline: text(row, 2, "check")?,
                        team: text(row, 3, "check")?,
                    },
                ))
            })
            .collect()
    }

    async fn build_workloads(&self, handles: &[String]) -> Result<Vec<BuildRecord>, DatabaseError> {
        let rows = self
            .client
            .query(build_query(), &[&handles])
            .await
            .map_err(query_error("build"))?;

        rows.iter()
            .map(|row| -> Result<_, DatabaseError> {
                Ok(BuildRecord {
                    handle: text(row, 0, "build")?,
                    container_type: ContainerType::from_meta(&text(row, 2, "build")?),
                    workload: Workload::Build {
                        team: text(row, 1, "build")?,
                        pipeline: text(row, 3, "build")?,
                        job: text(row, 4, "build")?,
                        build: text(row, 5, "build")?,
                        step: text(row, 6, "build")?,
                    },
                })
            })
            .collect()
    }
}
