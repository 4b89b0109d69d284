// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Byte streams to a Garden server, direct or tunnelled.

pub mod client;
pub mod direct;
pub mod tunnel;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::errors::TransportError;

pub use direct::{DEFAULT_GARDEN_ADDRESS, DirectConnection, DirectDialer};
pub use tunnel::{
    DEFAULT_GARDEN_PORT, ForwardSession, KubePortForward, SessionOpener, TunnelConnection,
    TunnelDialer,
};

/// How to reach Garden, chosen once when the worker is built.
#[derive(Clone)]
pub enum DialStrategy {
    Direct(DirectDialer),
    Tunneled(TunnelDialer),
}

impl DialStrategy {
    pub async fn dial(&self) -> Result<GardenStream, TransportError> {
        match self {
            DialStrategy::Direct(dialer) => dialer.dial().await.map(GardenStream::Direct),
            DialStrategy::Tunneled(dialer) => dialer.dial().await.map(GardenStream::Tunneled),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DialStrategy::Direct(dialer) => dialer.address().to_string(),
            DialStrategy::Tunneled(dialer) => {
                format!("port-forward {}:{}", dialer.target(), dialer.port())
            }
        }
    }
}

/// A connection to Garden.
pub enum GardenStream {
    Direct(DirectConnection),
    Tunneled(TunnelConnection),
}

impl GardenStream {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            GardenStream::Direct(c) => c.local_addr(),
            GardenStream::Tunneled(c) => c.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            GardenStream::Direct(c) => c.peer_addr(),
            GardenStream::Tunneled(c) => c.peer_addr(),
        }
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        match self {
            GardenStream::Direct(c) => c.set_deadline(deadline),
            GardenStream::Tunneled(c) => c.set_deadline(deadline),
        }
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        match self {
            GardenStream::Direct(c) => c.set_read_deadline(deadline),
            GardenStream::Tunneled(c) => c.set_read_deadline(deadline),
        }
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        match self {
            GardenStream::Direct(c) => c.set_write_deadline(deadline),
            GardenStream::Tunneled(c) => c.set_write_deadline(deadline),
        }
    }

    pub async fn close(self) -> io::Result<()> {
        match self {
            GardenStream::Direct(c) => c.close().await,
            GardenStream::Tunneled(c) => c.close().await,
        }
    }
}

impl AsyncRead for GardenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GardenStream::Direct(c) => Pin::new(c).poll_read(cx, buf),
            GardenStream::Tunneled(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GardenStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            GardenStream::Direct(c) => Pin::new(c).poll_write(cx, buf),
            GardenStream::Tunneled(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GardenStream::Direct(c) => Pin::new(c).poll_flush(cx),
            GardenStream::Tunneled(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            GardenStream::Direct(c) => Pin::new(c).poll_shutdown(cx),
            GardenStream::Tunneled(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}
