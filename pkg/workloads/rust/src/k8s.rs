// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Kubernetes API access for the web pod and its secrets.
//!
//! Uses the ambient configuration (in-cluster or `~/.kube/config`). The
//! resolver only depends on [`ParameterSource`] so tests can substitute
//! in-memory pods and secrets.

use std::future::Future;

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{Api, Client};

use crate::errors::ConfigError;

/// Where connection parameters come from: the web pod descriptor and the
/// secrets it references.
pub trait ParameterSource: Sync {
    fn get_pod(&self, name: &str) -> impl Future<Output = Result<Pod, ConfigError>> + Send;

    fn get_secret(
        &self,
        name: &str,
        key: &str,
    ) -> impl Future<Output = Result<Vec<u8>, ConfigError>> + Send;
}

/// [`ParameterSource`] backed by the Kubernetes API, scoped to one namespace.
#[derive(Clone)]
pub struct KubeParameterSource {
    client: Client,
    namespace: String,
}

impl KubeParameterSource {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl ParameterSource for KubeParameterSource {
    async fn get_pod(&self, name: &str) -> Result<Pod, ConfigError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = pods
            .get(name)
            .await
            .map_err(|e| ConfigError::SourceUnavailable {
                what: format!("pod {}/{name}", self.namespace),
                source: Box::new(e),
            })?;
        tracing::debug!(pod = name, namespace = %self.namespace, "Fetched web pod");
        Ok(pod)
    }

    async fn get_secret(&self, name: &str, key: &str) -> Result<Vec<u8>, ConfigError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets
            .get(name)
            .await
            .map_err(|e| ConfigError::SourceUnavailable {
                what: format!("secret {}/{name}", self.namespace),
                source: Box::new(e),
            })?;
        secret_value(&secret, name, key)
    }
}

/// Extract one key from a secret, accepting both `data` and `stringData`.
pub(crate) fn secret_value(secret: &Secret, name: &str, key: &str) -> Result<Vec<u8>, ConfigError> {
    if let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return Ok(value.0.clone());
    }
    if let Some(value) = secret.string_data.as_ref().and_then(|data| data.get(key)) {
        return Ok(value.clone().into_bytes());
    }
    Err(ConfigError::SecretKeyNotFound {
        secret: name.to_string(),
        key: key.to_string(),
    })
}
