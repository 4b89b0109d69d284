// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Plain TCP to a Garden server reachable from this host.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::errors::TransportError;

pub const DEFAULT_GARDEN_ADDRESS: &str = "127.0.0.1:7777";

#[derive(Debug, Clone)]
pub struct DirectDialer {
    address: String,
}

impl DirectDialer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn dial(&self) -> Result<DirectConnection, TransportError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.address.clone(),
                source,
            })?;
        Ok(DirectConnection::new(stream))
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_GARDEN_ADDRESS)
    }
}

/// A TCP stream whose reads and writes fail with `TimedOut` once their
/// deadline has passed.
pub struct DirectConnection {
    stream: TcpStream,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl DirectConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    pub async fn close(mut self) -> io::Result<()> {
        match self.stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    deadline
        .as_mut()
        .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready())
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline exceeded"))
}

impl AsyncRead for DirectConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DirectConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
