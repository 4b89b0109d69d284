// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The deployment does not describe a usable database connection.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not find a 'web' container")]
    WebContainerNotFound,

    #[error("found multiple 'web' containers: {}", names.join(", "))]
    MultipleWebContainers { names: Vec<String> },

    #[error("container '{container}' does not have '{param}' specified")]
    MissingParameter { container: String, param: String },

    #[error("'{param}' is set to an empty value on container '{container}'")]
    EmptyParameter { container: String, param: String },

    #[error("'{param}' uses a value source other than a literal or a secret key reference")]
    UnsupportedValueSource { param: String },

    #[error("'{param}' references a secret key without naming the secret")]
    UnnamedSecretRef { param: String },

    #[error("pod has no volume mounts matching '{path}'")]
    NoMatchingVolumeMount { path: String },

    #[error("pod has no volume named '{volume}' (mounted at '{mount_path}')")]
    NoMatchingVolume { volume: String, mount_path: String },

    #[error("volume '{volume}' is not backed by a secret")]
    VolumeNotSecretBacked { volume: String },

    #[error("secret volume '{volume}' does not project an item at '{path}'")]
    NoMatchingSecretItem { volume: String, path: String },

    #[error("secret '{secret}' has no key '{key}'")]
    SecretKeyNotFound { secret: String, key: String },

    #[error("secret '{secret}' key '{key}' is not valid UTF-8")]
    NonUtf8Secret { secret: String, key: String },

    #[error("failed to look up {what}: {source}")]
    SourceUnavailable {
        what: String,
        #[source]
        source: BoxError,
    },

    #[error("'{present}' is configured without '{missing}'")]
    UnpairedClientCertificate { present: String, missing: String },

    #[error("invalid port '{value}'")]
    InvalidPort { value: String },

    #[error("couldn't parse pem in {param}: {reason}")]
    InvalidPem { param: String, reason: String },

    #[error("sslmode '{sslmode}' requires a root certificate")]
    MissingRootCertificate { sslmode: String },

    #[error("{flag} is required: {reason}")]
    MissingFlag { flag: String, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A stream to Garden or PostgreSQL could not be established.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("dial to {addr} was cancelled")]
    Cancelled { addr: String },

    #[error("SSL is not enabled on the server (responded {response:#04x})")]
    SslNotSupportedByServer { response: u8 },

    #[error("SSL negotiation with {addr} failed: {source}")]
    Negotiation {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid server name '{host}'")]
    InvalidServerName { host: String },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to open port-forward session to {target}: {source}")]
    Upgrade {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("port-forward session to {target} has no {kind} stream for port {port}")]
    SubStream {
        target: String,
        kind: &'static str,
        port: u16,
    },
}

/// The ATC database could not be reached or queried.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("failed to connect to postgres: {0}")]
    Connect(#[source] tokio_postgres::Error),

    #[error("{join} query failed: {source}")]
    Query {
        join: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Listing containers from Garden failed.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("garden request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid garden request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("garden responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode garden response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("garden connection failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}
