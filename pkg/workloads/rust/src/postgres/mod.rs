// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Connections to the ATC database.
//!
//! A [`ConnectionProfile`] is either built from command-line flags
//! ([`StaticPostgres`]) or inferred from the web pod ([`WebNodeOpener`]).
//! Either way the socket is opened by [`dialer::Dialer`], which performs the
//! SSLRequest/TLS upgrade itself, and the resulting stream is handed to
//! `tokio-postgres` with TLS disabled.

pub mod dialer;
pub mod files;
pub mod resolver;
pub mod tls;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::errors::{ConfigError, DatabaseError, Error};
use crate::k8s::{KubeParameterSource, ParameterSource};

pub use dialer::{Dialer, PgStream};
pub use files::{ScopedFiles, TlsFiles};
pub use resolver::{Param, ParamSource, WebPod, resolve};

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "atc";
pub const DEFAULT_SSLMODE: &str = "disable";

/// When to check that the server certificate matches the host we dialed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostnamePolicy {
    /// Skip the server-name check for sslmode "", "require" and "verify-ca";
    /// the chain is still verified against the root certificate.
    #[default]
    Relaxed,
    /// Always check the server name.
    Strict,
}

impl HostnamePolicy {
    pub fn verifies_hostname(self, sslmode: &str) -> bool {
        match self {
            HostnamePolicy::Strict => true,
            HostnamePolicy::Relaxed => !matches!(sslmode, "" | "require" | "verify-ca"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a connection to the ATC database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    pub database: Option<String>,
    /// PEM-encoded root certificates.
    pub root_ca: Option<Vec<u8>>,
    pub client_identity: Option<ClientIdentity>,
    pub hostname_policy: HostnamePolicy,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("sslmode", &self.sslmode)
            .field("database", &self.database)
            .field("root_ca", &self.root_ca.as_ref().map(Vec::len))
            .field("client_identity", &self.client_identity)
            .field("hostname_policy", &self.hostname_policy)
            .finish()
    }
}

impl ConnectionProfile {
    /// The dialer only takes over the TLS upgrade when there is certificate
    /// material to use; otherwise it hands back a plain socket.
    pub fn overrides_default_dialer(&self) -> bool {
        self.root_ca.as_ref().is_some_and(|ca| !ca.is_empty()) || self.client_identity.is_some()
    }

    /// Whether dials upgrade to TLS. An sslmode that demands TLS is honored
    /// even without certificates; the server is then encrypted-to but not
    /// verified, as libpq does for "require".
    pub fn upgrades_tls(&self) -> bool {
        self.overrides_default_dialer() || requires_tls(&self.sslmode)
    }

    pub fn verifies_hostname(&self) -> bool {
        self.hostname_policy.verifies_hostname(&self.sslmode)
    }

    pub fn address(&self) -> String {
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }

    /// Driver configuration for a stream that is already upgraded (or that
    /// never will be), so the driver itself never negotiates TLS.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port.unwrap_or(DEFAULT_PORT))
            .user(&self.user)
            .password(&self.password)
            .dbname(self.database.as_deref().unwrap_or(DEFAULT_DATABASE))
            .application_name(env!("CARGO_PKG_NAME"))
            .ssl_mode(SslMode::Disable);
        config
    }

    /// libpq-style connection string. Without `tls_files` the sslmode is
    /// reported as "disable" whenever this crate performs the upgrade itself.
    pub fn dsn(&self, tls_files: Option<&TlsFiles>) -> String {
        self.render_dsn(&self.password, tls_files)
    }

    pub fn redacted_dsn(&self) -> String {
        self.render_dsn("********", None)
    }

    fn render_dsn(&self, password: &str, tls_files: Option<&TlsFiles>) -> String {
        let mut parts = vec![format!("host={}", quote(&self.host))];
        if let Some(port) = self.port {
            parts.push(format!("port={port}"));
        }
        parts.push(format!("user={}", quote(&self.user)));
        parts.push(format!("password={}", quote(password)));
        if let Some(database) = &self.database {
            parts.push(format!("dbname={}", quote(database)));
        }
        match tls_files {
            Some(files) => {
                parts.push(format!("sslmode={}", quote(&self.sslmode)));
                for (name, path) in [
                    ("sslrootcert", &files.root_cert),
                    ("sslcert", &files.client_cert),
                    ("sslkey", &files.client_key),
                ] {
                    if let Some(path) = path {
                        parts.push(format!("{name}={}", quote(&path.to_string_lossy())));
                    }
                }
            }
            None if self.overrides_default_dialer() => parts.push("sslmode=disable".to_string()),
            None => parts.push(format!("sslmode={}", quote(&self.sslmode))),
        }
        parts.join(" ")
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn requires_tls(sslmode: &str) -> bool {
    matches!(sslmode, "require" | "verify-ca" | "verify-full")
}

/// Connection parameters given on the command line.
#[derive(Clone, Default)]
pub struct StaticPostgres {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    pub database: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub hostname_policy: HostnamePolicy,
}

impl fmt::Debug for StaticPostgres {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticPostgres")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("sslmode", &self.sslmode)
            .field("database", &self.database)
            .field("ca_cert", &self.ca_cert)
            .field("client_cert", &self.client_cert)
            .field("client_key", &self.client_key)
            .field("hostname_policy", &self.hostname_policy)
            .finish()
    }
}

impl StaticPostgres {
    pub fn profile(&self) -> Result<ConnectionProfile, ConfigError> {
        let root_ca = self.ca_cert.as_deref().map(read_file).transpose()?;
        let cert = self.client_cert.as_deref().map(read_file).transpose()?;
        let key = self.client_key.as_deref().map(read_file).transpose()?;
        Ok(ConnectionProfile {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            sslmode: self.sslmode.clone(),
            database: self.database.clone(),
            root_ca,
            client_identity: pair_identity(cert, key, "--postgres-client-cert", "--postgres-client-key")?,
            hostname_policy: self.hostname_policy,
        })
    }
}

pub(crate) fn read_file(path: &std::path::Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn pair_identity(
    cert: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
    cert_name: &str,
    key_name: &str,
) -> Result<Option<ClientIdentity>, ConfigError> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(ClientIdentity { cert, key })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::UnpairedClientCertificate {
            present: cert_name.to_string(),
            missing: key_name.to_string(),
        }),
        (None, Some(_)) => Err(ConfigError::UnpairedClientCertificate {
            present: key_name.to_string(),
            missing: cert_name.to_string(),
        }),
    }
}

/// Infers the connection profile from a running web pod.
#[derive(Clone)]
pub struct WebNodeOpener<S = KubeParameterSource> {
    pub source: S,
    pub pod_name: String,
    pub hostname_policy: HostnamePolicy,
}

impl<S> fmt::Debug for WebNodeOpener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebNodeOpener")
            .field("pod_name", &self.pod_name)
            .field("hostname_policy", &self.hostname_policy)
            .finish_non_exhaustive()
    }
}

impl<S: ParameterSource> WebNodeOpener<S> {
    pub async fn profile(&self) -> Result<ConnectionProfile, ConfigError> {
        let pod = self.source.get_pod(&self.pod_name).await?;
        resolve(&pod, &self.source, self.hostname_policy).await
    }
}

#[derive(Debug, Clone)]
pub enum ProfileSource {
    Static(StaticPostgres),
    WebNode(WebNodeOpener),
}

/// Opens a fresh database client from the configured profile source.
#[derive(Debug, Clone)]
pub struct PostgresOpener {
    pub source: ProfileSource,
    pub connect_timeout: Option<Duration>,
}

impl PostgresOpener {
    pub async fn profile(&self) -> Result<ConnectionProfile, ConfigError> {
        match &self.source {
            ProfileSource::Static(flags) => flags.profile(),
            ProfileSource::WebNode(opener) => opener.profile().await,
        }
    }

    pub async fn open(&self) -> Result<Client, Error> {
        let profile = self.profile().await?;
        connect(&profile, self.connect_timeout).await
    }
}

/// Dial the database described by `profile` and start the driver.
pub async fn connect(
    profile: &ConnectionProfile,
    connect_timeout: Option<Duration>,
) -> Result<Client, Error> {
    let dialer = Dialer::new(profile)?;
    let addr = profile.address();
    info!(
        dsn = %profile.redacted_dsn(),
        tls = dialer.upgrades(),
        "Connecting to postgres"
    );

    let stream = match connect_timeout {
        Some(timeout) => dialer.dial_timeout(&addr, timeout).await?,
        None => dialer.dial(&addr).await?,
    };

    let (client, connection) = profile
        .pg_config()
        .connect_raw(stream, NoTls)
        .await
        .map_err(DatabaseError::Connect)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "Postgres connection closed with error");
        }
    });

    Ok(client)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::test_utils::{TestPki, fake_postgres};

    fn profile() -> ConnectionProfile {
        ConnectionProfile {
            host: "db.example.com".to_string(),
            port: None,
            user: "concourse".to_string(),
            password: "s3cret".to_string(),
            sslmode: "disable".to_string(),
            database: None,
            root_ca: None,
            client_identity: None,
            hostname_policy: HostnamePolicy::Relaxed,
        }
    }

    #[test]
    fn test_relaxed_policy_skips_hostname_for_lenient_modes() {
        for mode in ["", "require", "verify-ca"] {
            assert!(!HostnamePolicy::Relaxed.verifies_hostname(mode), "{mode}");
        }
        for mode in ["disable", "prefer", "verify-full"] {
            assert!(HostnamePolicy::Relaxed.verifies_hostname(mode), "{mode}");
        }
    }

    #[test]
    fn test_strict_policy_always_verifies_hostname() {
        for mode in ["", "require", "verify-ca", "verify-full"] {
            assert!(HostnamePolicy::Strict.verifies_hostname(mode), "{mode}");
        }
    }

    #[test]
    fn test_overrides_default_dialer_only_with_tls_material() {
        let mut p = profile();
        assert!(!p.overrides_default_dialer());

        p.root_ca = Some(Vec::new());
        assert!(!p.overrides_default_dialer());

        p.root_ca = Some(b"pem".to_vec());
        assert!(p.overrides_default_dialer());

        p.root_ca = None;
        p.client_identity = Some(ClientIdentity {
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
        });
        assert!(p.overrides_default_dialer());
    }

    #[test]
    fn test_address_defaults_port_and_brackets_ipv6() {
        let mut p = profile();
        assert_eq!(p.address(), "db.example.com:5432");
        p.port = Some(6543);
        assert_eq!(p.address(), "db.example.com:6543");
        p.host = "::1".to_string();
        assert_eq!(p.address(), "[::1]:6543");
    }

    #[test]
    fn test_dsn_matches_libpq_format() {
        let mut p = profile();
        assert_eq!(
            p.dsn(None),
            "host=db.example.com user=concourse password=s3cret sslmode=disable"
        );

        p.port = Some(5433);
        p.sslmode = "verify-ca".to_string();
        p.root_ca = Some(b"pem".to_vec());
        p.password = "it's secret".to_string();
        assert_eq!(
            p.dsn(None),
            "host=db.example.com port=5433 user=concourse password='it\\'s secret' sslmode=disable"
        );
    }

    #[test]
    fn test_redacted_dsn_hides_password() {
        let dsn = profile().redacted_dsn();
        assert!(!dsn.contains("s3cret"));
        assert!(dsn.contains("password=********"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut p = profile();
        p.client_identity = Some(ClientIdentity {
            cert: b"cert".to_vec(),
            key: b"very-private".to_vec(),
        });
        let debug = format!("{p:?}");
        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains("very-private"));
    }

    #[test]
    fn test_opener_debug_redacts_password() {
        let opener = PostgresOpener {
            source: ProfileSource::Static(StaticPostgres {
                host: "db".to_string(),
                user: "concourse".to_string(),
                password: "s3cret".to_string(),
                ..Default::default()
            }),
            connect_timeout: None,
        };
        let debug = format!("{opener:?}");
        assert!(debug.contains("\"db\""));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_static_profile_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&ca, "ca").unwrap();
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();

        let flags = StaticPostgres {
            host: "127.0.0.1".to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            sslmode: "verify-ca".to_string(),
            ca_cert: Some(ca),
            client_cert: Some(cert),
            client_key: Some(key),
            ..Default::default()
        };
        let p = flags.profile().unwrap();
        assert_eq!(p.root_ca.as_deref(), Some(b"ca".as_slice()));
        let identity = p.client_identity.unwrap();
        assert_eq!(identity.cert, b"cert");
        assert_eq!(identity.key, b"key");
    }

    #[test]
    fn test_static_profile_rejects_unpaired_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("key.pem");
        std::fs::write(&key, "key").unwrap();
        let flags = StaticPostgres {
            client_key: Some(key),
            ..Default::default()
        };
        let err = flags.profile().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnpairedClientCertificate { ref present, .. } if present == "--postgres-client-key"
        ));
    }

    #[test]
    fn test_static_profile_missing_file() {
        let flags = StaticPostgres {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            flags.profile().unwrap_err(),
            ConfigError::UnreadableFile { .. }
        ));
    }

    #[test]
    fn test_upgrades_tls_when_sslmode_demands_it() {
        let mut p = profile();
        assert!(!p.upgrades_tls());
        p.sslmode = "prefer".to_string();
        assert!(!p.upgrades_tls());
        for mode in ["require", "verify-ca", "verify-full"] {
            p.sslmode = mode.to_string();
            assert!(p.upgrades_tls(), "{mode}");
        }
    }

    #[tokio::test]
    async fn test_connect_require_without_certificates_encrypts() {
        let pki = TestPki::generate();
        let server = fake_postgres(Some(pki.server_config(false))).await;
        let mut p = profile();
        p.host = "127.0.0.1".to_string();
        p.port = Some(server.port());
        p.sslmode = "require".to_string();

        let client = connect(&p, None).await.unwrap();
        client.batch_execute(";").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_require_against_plaintext_server() {
        let server = fake_postgres(None).await;
        let mut p = profile();
        p.host = "127.0.0.1".to_string();
        p.port = Some(server.port());
        p.sslmode = "require".to_string();

        let err = connect(&p, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::SslNotSupportedByServer { response: b'N' })
        ));
    }

    #[tokio::test]
    async fn test_connect_verify_ca_without_root_certificate() {
        let mut p = profile();
        p.sslmode = "verify-ca".to_string();
        let err = connect(&p, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::MissingRootCertificate { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_plain_and_ping() {
        let server = fake_postgres(None).await;
        let mut p = profile();
        p.host = "127.0.0.1".to_string();
        p.port = Some(server.port());

        let client = connect(&p, Some(Duration::from_secs(5))).await.unwrap();
        client.batch_execute(";").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_over_tls_and_ping() {
        let pki = TestPki::generate();
        let server = fake_postgres(Some(pki.server_config(true))).await;
        let mut p = profile();
        p.host = "127.0.0.1".to_string();
        p.port = Some(server.port());
        p.sslmode = "verify-ca".to_string();
        p.root_ca = Some(pki.ca_pem.clone());
        p.client_identity = Some(pki.client_identity());

        let client = connect(&p, None).await.unwrap();
        client.batch_execute(";").await.unwrap();
    }
}
