// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Fixtures for pods, secrets and certificates, plus fake PostgreSQL and
//! Garden servers.
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, KeyToPath, Pod, PodSpec, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::errors::ConfigError;
use crate::k8s::ParameterSource;
use crate::postgres::ClientIdentity;
use crate::postgres::dialer::SSL_REQUEST;

/// In-memory pods and secrets.
#[derive(Default, Clone)]
pub struct MemorySource {
    pub pod: Option<Pod>,
    pub secrets: HashMap<(String, String), Vec<u8>>,
}

impl MemorySource {
    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pod = Some(pod);
        self
    }

    pub fn with_secret(mut self, secret: &str, key: &str, value: &[u8]) -> Self {
        self.secrets
            .insert((secret.to_string(), key.to_string()), value.to_vec());
        self
    }
}

impl ParameterSource for MemorySource {
    async fn get_pod(&self, name: &str) -> Result<Pod, ConfigError> {
        self.pod.clone().ok_or_else(|| ConfigError::SourceUnavailable {
            what: format!("pod {name}"),
            source: "not found".into(),
        })
    }

    async fn get_secret(&self, name: &str, key: &str) -> Result<Vec<u8>, ConfigError> {
        self.secrets
            .get(&(name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ConfigError::SecretKeyNotFound {
                secret: name.to_string(),
                key: key.to_string(),
            })
    }
}

pub fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// The mandatory parameters as literals.
pub fn web_env() -> Vec<EnvVar> {
    vec![
        env("CONCOURSE_POSTGRES_HOST", "db.example.com"),
        env("CONCOURSE_POSTGRES_USER", "concourse"),
        env("CONCOURSE_POSTGRES_PASSWORD", "hunter2"),
    ]
}

pub fn container(name: &str, env: Vec<EnvVar>) -> Container {
    Container {
        name: name.to_string(),
        env: Some(env),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn secret_volume(name: &str, secret: &str, items: &[(&str, &str)]) -> Volume {
    let items = (!items.is_empty()).then(|| {
        items
            .iter()
            .map(|(key, path)| KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                mode: None,
            })
            .collect()
    });
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod(containers: Vec<Container>, volumes: Vec<Volume>) -> Pod {
    Pod {
        spec: Some(PodSpec {
            containers,
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A throwaway CA with a server certificate for "localhost" and a client
/// certificate, all signed by it.
pub struct TestPki {
    pub ca_pem: Vec<u8>,
    ca_der: CertificateDer<'static>,
    server_der: CertificateDer<'static>,
    server_key_der: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "workload-accounts test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&server_key, &ca, &ca_key)
            .unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "concourse");
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca_pem: ca.pem().into_bytes(),
            ca_der: ca.der().clone(),
            server_der: server.der().clone(),
            server_key_der: server_key.serialize_der(),
            client_cert_pem: client.pem().into_bytes(),
            client_key_pem: client_key.serialize_pem().into_bytes(),
        }
    }

    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            cert: self.client_cert_pem.clone(),
            key: self.client_key_pem.clone(),
        }
    }

    pub fn server_config(&self, require_client_cert: bool) -> Arc<ServerConfig> {
        let builder = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap();
        let builder = if require_client_cert {
            let mut roots = RootCertStore::empty();
            roots.add(self.ca_der.clone()).unwrap();
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key_der.clone()));
        Arc::new(
            builder
                .with_single_cert(vec![self.server_der.clone()], key)
                .unwrap(),
        )
    }
}

/// A PostgreSQL server that answers the SSLRequest, accepts any startup
/// message and replies to simple queries with EmptyQueryResponse.
pub struct FakePostgres {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FakePostgres {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for FakePostgres {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// With `tls` the server answers 'S' and upgrades, otherwise 'N'.
pub async fn fake_postgres(tls: Option<Arc<ServerConfig>>) -> FakePostgres {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            let tls = tls.clone();
            tokio::spawn(async move {
                let _ = serve(conn, tls).await;
            });
        }
    });
    FakePostgres { addr, task }
}

async fn serve(mut conn: TcpStream, tls: Option<Arc<ServerConfig>>) -> std::io::Result<()> {
    let first = read_startup(&mut conn).await?;
    if first.as_slice() != &SSL_REQUEST[4..] {
        return run_session(conn).await;
    }
    let Some(config) = tls else {
        conn.write_all(b"N").await?;
        return Ok(());
    };
    conn.write_all(b"S").await?;
    let mut stream = TlsAcceptor::from(config).accept(conn).await?;
    read_startup(&mut stream).await?;
    run_session(stream).await
}

async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    let mut body = vec![0u8; len.saturating_sub(4)];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> std::io::Result<()> {
    // AuthenticationOk, ReadyForQuery(idle)
    stream.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await?;
    stream.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await?;
    stream.flush().await?;
    loop {
        let tag = match stream.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let len = stream.read_u32().await? as usize;
        let mut body = vec![0u8; len.saturating_sub(4)];
        stream.read_exact(&mut body).await?;
        match tag {
            b'X' => return Ok(()),
            b'Q' => {
                stream.write_all(&[b'I', 0, 0, 0, 4]).await?;
                stream.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await?;
                stream.flush().await?;
            }
            _ => {}
        }
    }
}

/// A Garden server answering every request with the same status and body.
pub struct FakeGarden {
    addr: SocketAddr,
    paths: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeGarden {
    pub async fn start(status: StatusCode, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let paths = Arc::new(Mutex::new(Vec::new()));
        let recorded = paths.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_recording(conn, status, body, recorded.clone()));
            }
        });
        Self { addr, paths, task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Request paths seen so far.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

impl Drop for FakeGarden {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve Garden HTTP on one already-established stream.
pub async fn serve_garden<S>(io: S, status: StatusCode, body: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    serve_recording(io, status, body, Arc::new(Mutex::new(Vec::new()))).await;
}

async fn serve_recording<S>(
    io: S,
    status: StatusCode,
    body: &'static str,
    paths: Arc<Mutex<Vec<String>>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        paths.lock().unwrap().push(req.uri().path().to_string());
        async move {
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(Full::new(Bytes::from_static(body.as_bytes())))
                    .unwrap(),
            )
        }
    });
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}
