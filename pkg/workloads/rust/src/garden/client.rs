// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The one Garden API call this tool needs: `GET /containers`.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::debug;

use super::GardenStream;
use crate::errors::WorkerError;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(rename = "Handles", default)]
    handles: Option<Vec<String>>,
}

/// List container handles over `stream`, then close it.
///
/// The stream is closed even when the request fails, so a tunnel session is
/// always torn down before this returns. A request error takes precedence
/// over a failure to close.
pub async fn list_containers(stream: GardenStream) -> Result<Vec<String>, WorkerError> {
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(conn.without_shutdown());

    let result = request_handles(&mut sender).await;
    drop(sender);

    // A failed driver has already dropped the stream, which tears it down.
    let closed = match driver.await {
        Ok(Ok(parts)) => parts.io.into_inner().close().await.map_err(WorkerError::from),
        Ok(Err(e)) => Err(WorkerError::from(e)),
        Err(e) => Err(WorkerError::Io(std::io::Error::other(e))),
    };

    let handles = result?;
    closed?;
    Ok(handles)
}

async fn request_handles(
    sender: &mut http1::SendRequest<Empty<Bytes>>,
) -> Result<Vec<String>, WorkerError> {
    let request = Request::builder()
        .method(Method::GET)
        .uri("/containers")
        .header(HOST, "garden")
        .header(ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    if !status.is_success() {
        return Err(WorkerError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }

    let list: ListResponse = serde_json::from_slice(&body)?;
    let handles = list.handles.unwrap_or_default();
    debug!(count = handles.len(), "Listed garden containers");
    Ok(handles)
}
