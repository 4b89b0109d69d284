// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Attribute the containers running on a Concourse worker to the checks and
//! builds that created them.
//!
//! The tool lists container handles from Garden, either directly or through a
//! Kubernetes port-forward tunnel to the worker pod, and joins them against the
//! ATC database. Database credentials can be given on the command line or
//! inferred from the environment and secret volumes of the web pod, in which
//! case the TLS upgrade to PostgreSQL is performed by this crate.
//!
//! ## Components
//!
//! 1. **Resolver** (`postgres::resolver`) - reads connection parameters from
//!    the web container's env vars, secret references and secret volumes.
//!
//! 2. **Dialer** (`postgres::dialer`) - sends the PostgreSQL SSLRequest and
//!    upgrades the socket with rustls before handing it to `tokio-postgres`.
//!
//! 3. **Garden transport** (`garden`) - direct TCP or a port-forward session
//!    wrapped as a plain byte stream for the HTTP client.
//!
//! 4. **Accountant** (`accountant`) - classifies handles into check and build
//!    workloads.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod accountant;
pub mod config;
mod errors;
pub mod garden;
pub mod k8s;
pub mod postgres;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use accountant::{
    Accountant, AccountantConfig, ContainerType, DbAccountant, Sample, Workload,
};
pub use errors::{BoxError, ConfigError, DatabaseError, Error, TransportError, WorkerError};
pub use garden::{DialStrategy, GardenStream};
pub use postgres::{ConnectionProfile, HostnamePolicy, PostgresOpener};
pub use worker::{Container, GardenWorker, Worker, account};
