// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Reads connection parameters from the web container of a Concourse pod.
//!
//! Each parameter is an env var on the container. String parameters are
//! either literal values or `secretKeyRef`s. File parameters hold a path
//! that is followed through the container's volume mounts to a
//! secret-backed volume, and from there to a key of the secret.

use std::path::{Component, Path};

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, Volume, VolumeMount};
use tracing::{debug, warn};

use super::{ConnectionProfile, DEFAULT_SSLMODE, HostnamePolicy, pair_identity};
use crate::errors::ConfigError;
use crate::k8s::ParameterSource;

/// Connection parameters the web container may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Host,
    Port,
    User,
    Password,
    SslMode,
    Database,
    CaCert,
    ClientCert,
    ClientKey,
}

impl Param {
    pub const fn env_var(self) -> &'static str {
        match self {
            Param::Host => "CONCOURSE_POSTGRES_HOST",
            Param::Port => "CONCOURSE_POSTGRES_PORT",
            Param::User => "CONCOURSE_POSTGRES_USER",
            Param::Password => "CONCOURSE_POSTGRES_PASSWORD",
            Param::SslMode => "CONCOURSE_POSTGRES_SSLMODE",
            Param::Database => "CONCOURSE_POSTGRES_DATABASE",
            Param::CaCert => "CONCOURSE_POSTGRES_CA_CERT",
            Param::ClientCert => "CONCOURSE_POSTGRES_CLIENT_CERT",
            Param::ClientKey => "CONCOURSE_POSTGRES_CLIENT_KEY",
        }
    }
}

/// Where the bytes of a parameter live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    Literal(String),
    SecretRef { secret: String, key: String },
    SecretFile {
        volume: String,
        secret: String,
        key: String,
    },
}

impl ParamSource {
    pub async fn fetch<S: ParameterSource>(&self, source: &S) -> Result<Vec<u8>, ConfigError> {
        match self {
            ParamSource::Literal(value) => Ok(value.clone().into_bytes()),
            ParamSource::SecretRef { secret, key } | ParamSource::SecretFile { secret, key, .. } => {
                source.get_secret(secret, key).await
            }
        }
    }

    async fn fetch_string<S: ParameterSource>(&self, source: &S) -> Result<String, ConfigError> {
        match self {
            ParamSource::Literal(value) => Ok(value.clone()),
            ParamSource::SecretRef { secret, key } | ParamSource::SecretFile { secret, key, .. } => {
                let bytes = source.get_secret(secret, key).await?;
                String::from_utf8(bytes).map_err(|_| ConfigError::NonUtf8Secret {
                    secret: secret.clone(),
                    key: key.clone(),
                })
            }
        }
    }
}

/// The pod's single web container together with the pod spec it lives in.
#[derive(Debug, Clone, Copy)]
pub struct WebPod<'a> {
    spec: &'a PodSpec,
    container: &'a Container,
}

impl<'a> WebPod<'a> {
    pub fn new(pod: &'a Pod) -> Result<Self, ConfigError> {
        let spec = pod.spec.as_ref().ok_or(ConfigError::WebContainerNotFound)?;
        let container = find_web_container(spec)?;
        Ok(Self { spec, container })
    }

    pub fn container_name(&self) -> &str {
        &self.container.name
    }

    fn env_var(&self, param: Param) -> Option<&'a EnvVar> {
        self.container
            .env
            .iter()
            .flatten()
            .find(|var| var.name == param.env_var())
    }

    fn require_env_var(&self, param: Param) -> Result<&'a EnvVar, ConfigError> {
        self.env_var(param)
            .ok_or_else(|| ConfigError::MissingParameter {
                container: self.container.name.clone(),
                param: param.env_var().to_string(),
            })
    }

    /// Source of a string-valued parameter.
    pub fn value_source(&self, param: Param) -> Result<ParamSource, ConfigError> {
        let var = self.require_env_var(param)?;
        if let Some(value) = var.value.as_deref().filter(|v| !v.is_empty()) {
            return Ok(ParamSource::Literal(value.to_string()));
        }
        let Some(value_from) = &var.value_from else {
            return Ok(ParamSource::Literal(String::new()));
        };
        let Some(secret_ref) = &value_from.secret_key_ref else {
            return Err(ConfigError::UnsupportedValueSource {
                param: param.env_var().to_string(),
            });
        };
        let secret = secret_ref
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::UnnamedSecretRef {
                param: param.env_var().to_string(),
            })?;
        Ok(ParamSource::SecretRef {
            secret,
            key: secret_ref.key.clone(),
        })
    }

    /// Source of a file-valued parameter: path -> mount -> volume -> secret item.
    pub fn file_source(&self, param: Param) -> Result<ParamSource, ConfigError> {
        let var = self.require_env_var(param)?;
        let path = var
            .value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::EmptyParameter {
                container: self.container.name.clone(),
                param: param.env_var().to_string(),
            })?;

        let (mount, relative) = self.volume_mount(path)?;
        let volume = self.volume(mount)?;
        let secret_volume =
            volume
                .secret
                .as_ref()
                .ok_or_else(|| ConfigError::VolumeNotSecretBacked {
                    volume: volume.name.clone(),
                })?;
        let secret = secret_volume
            .secret_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::VolumeNotSecretBacked {
                volume: volume.name.clone(),
            })?;

        let key = match secret_volume.items.as_deref().filter(|items| !items.is_empty()) {
            Some(items) => items
                .iter()
                .find(|item| same_path(Path::new(&item.path), Path::new(&relative)))
                .map(|item| item.key.clone()),
            // Without items every key is projected under its own name.
            None => Some(relative.clone()).filter(|key| !key.is_empty()),
        }
        .ok_or_else(|| ConfigError::NoMatchingSecretItem {
            volume: volume.name.clone(),
            path: relative,
        })?;

        Ok(ParamSource::SecretFile {
            volume: volume.name.clone(),
            secret,
            key,
        })
    }

    /// The mount whose path is the longest component-wise prefix of `path`,
    /// with the remainder of `path` below it.
    fn volume_mount(&self, path: &str) -> Result<(&'a VolumeMount, String), ConfigError> {
        let target = Path::new(path);
        self.container
            .volume_mounts
            .iter()
            .flatten()
            .filter_map(|mount| {
                target
                    .strip_prefix(&mount.mount_path)
                    .ok()
                    .map(|rest| (mount, rest.to_string_lossy().into_owned()))
            })
            .max_by_key(|(mount, _)| Path::new(&mount.mount_path).components().count())
            .ok_or_else(|| ConfigError::NoMatchingVolumeMount {
                path: path.to_string(),
            })
    }

    fn volume(&self, mount: &VolumeMount) -> Result<&'a Volume, ConfigError> {
        self.spec
            .volumes
            .iter()
            .flatten()
            .find(|volume| volume.name == mount.name)
            .ok_or_else(|| ConfigError::NoMatchingVolume {
                volume: mount.name.clone(),
                mount_path: mount.mount_path.clone(),
            })
    }

    async fn string<S: ParameterSource>(
        &self,
        param: Param,
        source: &S,
    ) -> Result<String, ConfigError> {
        self.value_source(param)?.fetch_string(source).await
    }

    async fn required<S: ParameterSource>(
        &self,
        param: Param,
        source: &S,
    ) -> Result<String, ConfigError> {
        let value = self.string(param, source).await?;
        if value.is_empty() {
            return Err(ConfigError::EmptyParameter {
                container: self.container.name.clone(),
                param: param.env_var().to_string(),
            });
        }
        Ok(value)
    }

    async fn optional<S: ParameterSource>(&self, param: Param, source: &S) -> Option<String> {
        match self.string(param, source).await {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!(param = param.env_var(), error = %e, "Optional parameter not available");
                None
            }
        }
    }

    async fn optional_file<S: ParameterSource>(
        &self,
        param: Param,
        source: &S,
    ) -> Result<Option<Vec<u8>>, ConfigError> {
        if self.env_var(param).is_none() {
            return Ok(None);
        }
        let bytes = self.file_source(param)?.fetch(source).await?;
        Ok(Some(bytes))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    fn normal(p: &Path) -> Vec<Component<'_>> {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }
    normal(a) == normal(b)
}

/// The single container whose name contains "web".
pub fn find_web_container(spec: &PodSpec) -> Result<&Container, ConfigError> {
    let mut matches = spec.containers.iter().filter(|c| c.name.contains("web"));
    let Some(first) = matches.next() else {
        return Err(ConfigError::WebContainerNotFound);
    };
    let rest: Vec<&Container> = matches.collect();
    if rest.is_empty() {
        return Ok(first);
    }
    Err(ConfigError::MultipleWebContainers {
        names: std::iter::once(first)
            .chain(rest)
            .map(|c| c.name.clone())
            .collect(),
    })
}

/// Build a [`ConnectionProfile`] from the web container of `pod`.
///
/// Host, user and password are mandatory and resolved in that order; the
/// first failure aborts. Port, sslmode and database fall back to defaults.
pub async fn resolve<S: ParameterSource>(
    pod: &Pod,
    source: &S,
    hostname_policy: HostnamePolicy,
) -> Result<ConnectionProfile, ConfigError> {
    let web = WebPod::new(pod)?;
    debug!(container = web.container_name(), "Resolving postgres parameters");

    let host = web.required(Param::Host, source).await?;
    let user = web.required(Param::User, source).await?;
    let password = web.required(Param::Password, source).await?;

    let port = match web.optional(Param::Port, source).await {
        Some(value) => Some(
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort { value })?,
        ),
        None => None,
    };

    let sslmode = match web.string(Param::SslMode, source).await {
        Ok(mode) => mode,
        Err(e) => {
            if web.env_var(Param::SslMode).is_some() {
                warn!(error = %e, "Could not read sslmode, using '{DEFAULT_SSLMODE}'");
            }
            DEFAULT_SSLMODE.to_string()
        }
    };

    let database = web.optional(Param::Database, source).await;
    let root_ca = web.optional_file(Param::CaCert, source).await?;
    let cert = web.optional_file(Param::ClientCert, source).await?;
    let key = web.optional_file(Param::ClientKey, source).await?;
    let client_identity = pair_identity(
        cert,
        key,
        Param::ClientCert.env_var(),
        Param::ClientKey.env_var(),
    )?;

    Ok(ConnectionProfile {
        host,
        port,
        user,
        password,
        sslmode,
        database,
        root_ca,
        client_identity,
        hostname_policy,
    })
}
