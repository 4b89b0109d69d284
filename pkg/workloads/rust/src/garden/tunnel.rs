// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Garden through a Kubernetes port-forward session.
//!
//! The API server multiplexes a data stream and an error stream per forwarded
//! port over one upgraded connection. [`TunnelConnection`] exposes the data
//! stream as an ordinary byte stream so the HTTP client does not need to know
//! it is tunnelled, and logs whatever arrives on the error stream.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::TransportError;

pub const DEFAULT_GARDEN_PORT: u16 = 7777;

/// Reported as both ends of a tunnelled connection.
pub const TUNNEL_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexIo for T {}

/// One multiplexed port-forward session.
pub trait ForwardSession: Send {
    fn take_data(&mut self, port: u16) -> Option<Box<dyn DuplexIo>>;

    /// Resolves with the first error message the server reports for `port`,
    /// or `None` when the error stream ends quietly.
    fn take_error(&mut self, port: u16) -> Option<BoxFuture<'static, Option<String>>>;

    fn abort(&mut self);
}

impl ForwardSession for Portforwarder {
    fn take_data(&mut self, port: u16) -> Option<Box<dyn DuplexIo>> {
        self.take_stream(port)
            .map(|stream| Box::new(stream) as Box<dyn DuplexIo>)
    }

    fn take_error(&mut self, port: u16) -> Option<BoxFuture<'static, Option<String>>> {
        Portforwarder::take_error(self, port).map(FutureExt::boxed)
    }

    fn abort(&mut self) {
        Portforwarder::abort(self);
    }
}

/// Opens port-forward sessions to one target.
pub trait SessionOpener: Send + Sync {
    /// Human-readable name of the target, for errors and logs.
    fn target(&self) -> String;

    fn open(&self, port: u16) -> BoxFuture<'_, Result<Box<dyn ForwardSession>, TransportError>>;
}

/// Port-forwards to a pod through the Kubernetes API server.
#[derive(Clone)]
pub struct KubePortForward {
    client: Client,
    namespace: String,
    pod: String,
}

impl KubePortForward {
    pub fn new(client: Client, namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            pod: pod.into(),
        }
    }
}

impl SessionOpener for KubePortForward {
    fn target(&self) -> String {
        format!("{}/{}", self.namespace, self.pod)
    }

    fn open(&self, port: u16) -> BoxFuture<'_, Result<Box<dyn ForwardSession>, TransportError>> {
        Box::pin(async move {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
            let forwarder = pods
                .portforward(&self.pod, &[port])
                .await
                .map_err(|e| TransportError::Upgrade {
                    target: self.target(),
                    source: Box::new(e),
                })?;
            Ok(Box::new(forwarder) as Box<dyn ForwardSession>)
        })
    }
}

#[derive(Clone)]
pub struct TunnelDialer {
    opener: Arc<dyn SessionOpener>,
    port: u16,
}

impl TunnelDialer {
    pub fn new(opener: impl SessionOpener + 'static, port: u16) -> Self {
        Self {
            opener: Arc::new(opener),
            port,
        }
    }

    pub fn target(&self) -> String {
        self.opener.target()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a session and take both sub-streams for the port. A session that
    /// lacks either is aborted before returning the error.
    pub async fn dial(&self) -> Result<TunnelConnection, TransportError> {
        let target = self.opener.target();
        let mut session = self.opener.open(self.port).await?;

        let Some(data) = session.take_data(self.port) else {
            session.abort();
            return Err(TransportError::SubStream {
                target,
                kind: "data",
                port: self.port,
            });
        };
        let Some(errors) = session.take_error(self.port) else {
            session.abort();
            return Err(TransportError::SubStream {
                target,
                kind: "error",
                port: self.port,
            });
        };

        info!(target = %target, port = self.port, "Opened port-forward to garden");
        Ok(TunnelConnection {
            data,
            session,
            drain: Some(ErrorDrain::spawn(target, errors)),
        })
    }
}

/// Background task that logs the error sub-stream until it ends or is
/// cancelled.
struct ErrorDrain {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ErrorDrain {
    fn spawn(target: String, errors: BoxFuture<'static, Option<String>>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                message = errors => {
                    if let Some(message) = message {
                        warn!(target = %target, "Port-forward error: {message}");
                    }
                }
            }
        });
        Self { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            warn!("Port-forward error drain panicked");
        }
    }
}

/// The data stream of a port-forward session.
///
/// Deadlines are accepted and ignored; both addresses are [`TUNNEL_ADDR`].
pub struct TunnelConnection {
    data: Box<dyn DuplexIo>,
    session: Box<dyn ForwardSession>,
    drain: Option<ErrorDrain>,
}

impl TunnelConnection {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(TUNNEL_ADDR)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(TUNNEL_ADDR)
    }

    pub fn set_deadline(&mut self, _deadline: Option<Instant>) {}

    pub fn set_read_deadline(&mut self, _deadline: Option<Instant>) {}

    pub fn set_write_deadline(&mut self, _deadline: Option<Instant>) {}

    /// Shut the data stream, abort the session and wait for the error drain.
    pub async fn close(mut self) -> io::Result<()> {
        let shutdown = self.data.shutdown().await;
        self.session.abort();
        if let Some(drain) = self.drain.take() {
            drain.stop().await;
        }
        debug!("Closed port-forward session");
        shutdown
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.cancel.cancel();
            self.session.abort();
        }
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().data).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_shutdown(cx)
    }
}
