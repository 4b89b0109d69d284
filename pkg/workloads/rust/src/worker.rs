// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::future::Future;

use tracing::info;

use crate::accountant::{Accountant, Sample};
use crate::errors::{Error, WorkerError};
use crate::garden::{DialStrategy, client};

/// A container as reported by Garden.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Container {
    pub handle: String,
}

impl Container {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }
}

pub trait Worker {
    fn containers(&self) -> impl Future<Output = Result<Vec<Container>, WorkerError>> + Send;
}

/// Lists containers from a Garden server through a [`DialStrategy`].
#[derive(Clone)]
pub struct GardenWorker {
    dialer: DialStrategy,
}

impl GardenWorker {
    pub fn new(dialer: DialStrategy) -> Self {
        Self { dialer }
    }

    pub fn dialer(&self) -> &DialStrategy {
        &self.dialer
    }
}

impl Worker for GardenWorker {
    async fn containers(&self) -> Result<Vec<Container>, WorkerError> {
        let stream = self.dialer.dial().await?;
        let handles = client::list_containers(stream).await?;
        info!(
            garden = %self.dialer.describe(),
            count = handles.len(),
            "Listed worker containers"
        );
        Ok(handles.into_iter().map(Container::new).collect())
    }
}

/// List the worker's containers and attribute them to workloads.
pub async fn account<W, A>(worker: &W, accountant: &A) -> Result<Vec<Sample>, Error>
where
    W: Worker,
    A: Accountant,
{
    let containers = worker.containers().await?;
    accountant.account(&containers).await
}
