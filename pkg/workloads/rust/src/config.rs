// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Command-line configuration and the factories that turn it into a worker
//! and an accountant.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser};
use tracing::info;

use crate::accountant::{AccountantConfig, DbAccountant};
use crate::errors::{ConfigError, Error};
use crate::garden::{DialStrategy, DirectDialer, KubePortForward, TunnelDialer};
use crate::k8s::KubeParameterSource;
use crate::postgres::{
    DEFAULT_SSLMODE, HostnamePolicy, PostgresOpener, ProfileSource, StaticPostgres, WebNodeOpener,
};
use crate::worker::GardenWorker;

/// Attribute the containers on a Concourse worker to checks and builds
#[derive(Parser, Debug, Clone)]
#[command(name = "workload-accounts")]
#[command(about = "Attribute Garden containers to the Concourse checks and builds that own them")]
#[command(version)]
pub struct Command {
    /// Namespace of the worker and web pods
    #[arg(long, env = "K8S_NAMESPACE")]
    pub k8s_namespace: Option<String>,

    /// Worker pod to reach Garden through a port-forward
    #[arg(long, env = "K8S_POD")]
    pub k8s_pod: Option<String>,

    /// Garden address when not port-forwarding
    #[arg(long, default_value = crate::garden::DEFAULT_GARDEN_ADDRESS)]
    pub garden_address: String,

    /// Garden port inside the worker pod
    #[arg(long, default_value_t = crate::garden::DEFAULT_GARDEN_PORT)]
    pub garden_port: u16,

    /// Web pod to infer the database connection from
    #[arg(long, env = "K8S_WEB_POD")]
    pub k8s_web_pod: Option<String>,

    #[command(flatten)]
    pub postgres: PostgresFlags,

    /// Only attribute check containers to resources of their own team
    #[arg(long, default_value = "false")]
    pub own_team_checks_only: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PostgresFlags {
    #[arg(long = "postgres-host", env = "CONCOURSE_POSTGRES_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long = "postgres-port", env = "CONCOURSE_POSTGRES_PORT", default_value_t = crate::postgres::DEFAULT_PORT)]
    pub port: u16,

    #[arg(long = "postgres-user", env = "CONCOURSE_POSTGRES_USER")]
    pub user: Option<String>,

    #[arg(long = "postgres-password", env = "CONCOURSE_POSTGRES_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long = "postgres-sslmode", env = "CONCOURSE_POSTGRES_SSLMODE", default_value = DEFAULT_SSLMODE)]
    pub sslmode: String,

    #[arg(long = "postgres-database", env = "CONCOURSE_POSTGRES_DATABASE", default_value = crate::postgres::DEFAULT_DATABASE)]
    pub database: String,

    /// PEM root certificate used to verify the server
    #[arg(long = "postgres-ca-cert", env = "CONCOURSE_POSTGRES_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate
    #[arg(long = "postgres-client-cert", env = "CONCOURSE_POSTGRES_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// PEM client key
    #[arg(long = "postgres-client-key", env = "CONCOURSE_POSTGRES_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,

    /// Seconds to wait for the TCP connection to the database
    #[arg(long = "postgres-connect-timeout")]
    pub connect_timeout: Option<u64>,

    /// Always verify that the server certificate matches the host
    #[arg(long = "postgres-strict-hostname", default_value = "false")]
    pub strict_hostname: bool,
}

impl PostgresFlags {
    fn hostname_policy(&self) -> HostnamePolicy {
        if self.strict_hostname {
            HostnamePolicy::Strict
        } else {
            HostnamePolicy::Relaxed
        }
    }

    fn static_profile(&self) -> StaticPostgres {
        StaticPostgres {
            host: self.host.clone(),
            port: Some(self.port),
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            sslmode: self.sslmode.clone(),
            database: Some(self.database.clone()),
            ca_cert: self.ca_cert.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
            hostname_policy: self.hostname_policy(),
        }
    }
}

fn check_readable(path: &Path) -> Result<(), ConfigError> {
    std::fs::File::open(path)
        .map(drop)
        .map_err(|source| ConfigError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })
}

fn missing(flag: &str, reason: &str) -> ConfigError {
    ConfigError::MissingFlag {
        flag: flag.to_string(),
        reason: reason.to_string(),
    }
}

impl Command {
    /// Check flag combinations and file paths before any network I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k8s_namespace.is_none() {
            if self.k8s_pod.is_some() {
                return Err(missing("--k8s-namespace", "--k8s-pod is set"));
            }
            if self.k8s_web_pod.is_some() {
                return Err(missing("--k8s-namespace", "--k8s-web-pod is set"));
            }
        }

        if self.k8s_web_pod.is_none() {
            let reason = "the database is not inferred from a web pod";
            if self.postgres.user.as_deref().is_none_or(str::is_empty) {
                return Err(missing("--postgres-user", reason));
            }
            if self.postgres.password.as_deref().is_none_or(str::is_empty) {
                return Err(missing("--postgres-password", reason));
            }
            for path in [
                &self.postgres.ca_cert,
                &self.postgres.client_cert,
                &self.postgres.client_key,
            ]
            .into_iter()
            .flatten()
            {
                check_readable(path)?;
            }
        }
        Ok(())
    }

    fn needs_kube(&self) -> bool {
        self.k8s_pod.is_some() || self.k8s_web_pod.is_some()
    }

    fn namespace(&self) -> Result<&str, ConfigError> {
        self.k8s_namespace
            .as_deref()
            .ok_or_else(|| missing("--k8s-namespace", "a pod is referenced"))
    }

    pub fn dial_strategy(&self, client: Option<&kube::Client>) -> Result<DialStrategy, ConfigError> {
        match (&self.k8s_pod, client) {
            (Some(pod), Some(client)) => Ok(DialStrategy::Tunneled(TunnelDialer::new(
                KubePortForward::new(client.clone(), self.namespace()?, pod),
                self.garden_port,
            ))),
            (Some(_), None) => Err(missing("kubernetes client", "--k8s-pod is set")),
            (None, _) => Ok(DialStrategy::Direct(DirectDialer::new(
                self.garden_address.clone(),
            ))),
        }
    }

    pub fn postgres_opener(&self, client: Option<&kube::Client>) -> Result<PostgresOpener, ConfigError> {
        let source = match (&self.k8s_web_pod, client) {
            (Some(pod), Some(client)) => ProfileSource::WebNode(WebNodeOpener {
                source: KubeParameterSource::new(client.clone(), self.namespace()?),
                pod_name: pod.clone(),
                hostname_policy: self.postgres.hostname_policy(),
            }),
            (Some(_), None) => return Err(missing("kubernetes client", "--k8s-web-pod is set")),
            (None, _) => ProfileSource::Static(self.postgres.static_profile()),
        };
        Ok(PostgresOpener {
            source,
            connect_timeout: self.postgres.connect_timeout.map(Duration::from_secs),
        })
    }

    pub fn accountant_config(&self) -> AccountantConfig {
        AccountantConfig {
            own_team_checks_only: self.own_team_checks_only,
        }
    }

    /// Build the worker and accountant, creating one Kubernetes client from
    /// the ambient configuration when any pod is referenced.
    pub async fn build(&self) -> Result<(GardenWorker, DbAccountant), Error> {
        let client = if self.needs_kube() {
            let client = kube::Client::try_default()
                .await
                .map_err(|e| ConfigError::SourceUnavailable {
                    what: "kubernetes client configuration".to_string(),
                    source: Box::new(e),
                })?;
            Some(client)
        } else {
            None
        };

        let dialer = self.dial_strategy(client.as_ref())?;
        let opener = self.postgres_opener(client.as_ref())?;
        info!(
            garden = %dialer.describe(),
            web_pod = self.k8s_web_pod.as_deref().unwrap_or("-"),
            own_team_checks_only = self.own_team_checks_only,
            "Configured workload accounting"
        );
        Ok((
            GardenWorker::new(dialer),
            DbAccountant::new(opener, self.accountant_config()),
        ))
    }
}
