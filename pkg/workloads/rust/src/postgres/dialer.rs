// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Opens sockets to PostgreSQL and performs the SSLRequest upgrade.
//!
//! The server must be told that the client wants TLS before the handshake:
//! the client sends an 8-byte SSLRequest and the server answers with a
//! single byte, `S` to proceed or anything else to refuse. Only then does
//! the TLS handshake start on the same socket.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnectionProfile, tls};
use crate::errors::{Error, TransportError};

/// Length 8, then the SSLRequest code 1234 << 16 | 5679, both big-endian.
pub const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

const SSL_ACCEPTED: u8 = b'S';

/// Send the SSLRequest and return the server's one-byte answer.
pub async fn negotiate_ssl<S>(stream: &mut S) -> io::Result<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&SSL_REQUEST).await?;
    stream.flush().await?;
    stream.read_u8().await
}

struct Upgrade {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Dials the database described by one profile.
pub struct Dialer {
    upgrade: Option<Upgrade>,
}

impl Dialer {
    /// Returns plain sockets unless the profile carries certificate material
    /// or its sslmode demands TLS.
    pub fn new(profile: &ConnectionProfile) -> Result<Self, Error> {
        if !profile.upgrades_tls() {
            return Ok(Self { upgrade: None });
        }
        let config = tls::client_config(profile)?;
        let server_name = ServerName::try_from(profile.host.clone()).map_err(|_| {
            TransportError::InvalidServerName {
                host: profile.host.clone(),
            }
        })?;
        Ok(Self {
            upgrade: Some(Upgrade {
                connector: TlsConnector::from(Arc::new(config)),
                server_name,
            }),
        })
    }

    pub fn upgrades(&self) -> bool {
        self.upgrade.is_some()
    }

    pub async fn dial(&self, addr: &str) -> Result<PgStream, TransportError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        self.upgrade(tcp, addr).await
    }

    /// Like [`Dialer::dial`], with `timeout` bounding the TCP connect.
    pub async fn dial_timeout(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<PgStream, TransportError> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: format!("connect to {addr} after {timeout:?}"),
            })?
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        self.upgrade(tcp, addr).await
    }

    /// Like [`Dialer::dial`], abandoning the TCP connect when `cancel` fires.
    pub async fn dial_cancellable(
        &self,
        addr: &str,
        cancel: &CancellationToken,
    ) -> Result<PgStream, TransportError> {
        let tcp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::Cancelled { addr: addr.to_string() });
            }
            result = TcpStream::connect(addr) => result.map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?,
        };
        self.upgrade(tcp, addr).await
    }

    async fn upgrade(&self, mut tcp: TcpStream, addr: &str) -> Result<PgStream, TransportError> {
        let Some(upgrade) = &self.upgrade else {
            return Ok(PgStream::Plain(tcp));
        };

        let response = negotiate_ssl(&mut tcp)
            .await
            .map_err(|source| TransportError::Negotiation {
                addr: addr.to_string(),
                source,
            })?;
        if response != SSL_ACCEPTED {
            return Err(TransportError::SslNotSupportedByServer { response });
        }

        let stream = upgrade
            .connector
            .connect(upgrade.server_name.clone(), tcp)
            .await
            .map_err(|source| TransportError::Handshake {
                addr: addr.to_string(),
                source,
            })?;
        debug!(addr, "Upgraded postgres connection to TLS");
        Ok(PgStream::Tls(Box::new(stream)))
    }
}

/// A socket to PostgreSQL, upgraded or not.
pub enum PgStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PgStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls(_))
    }
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
