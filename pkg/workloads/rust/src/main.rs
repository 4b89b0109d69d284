// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use workload_accounts::config::Command;
use workload_accounts::{Accountant, Sample, Worker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize tracing - RUST_LOG takes precedence, fallback to info.
    // Logs go to stderr so stdout only carries the table.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let command = Command::parse();
    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    command.validate().context("config error")?;
    let (worker, accountant) = command.build().await.context("config error")?;

    let containers = worker.containers().await.context("worker error")?;
    let samples = accountant
        .account(&containers)
        .await
        .context("accountant error")?;

    let stdout = io::stdout();
    render_table(&samples, &mut stdout.lock()).context("io error")
}

const HEADERS: [&str; 3] = ["HANDLE", "TYPE", "WORKLOADS"];

fn render_table(samples: &[Sample], out: &mut impl Write) -> io::Result<()> {
    let rows: Vec<[String; 3]> = samples
        .iter()
        .map(|s| {
            [
                s.container.handle.clone(),
                s.container_type.to_string(),
                s.labels().join(","),
            ]
        })
        .collect();

    let handle_width = rows
        .iter()
        .map(|[handle, _, _]| handle.len())
        .chain([HEADERS[0].len()])
        .max()
        .unwrap_or_default();
    let type_width = rows
        .iter()
        .map(|[_, ty, _]| ty.len())
        .chain([HEADERS[1].len()])
        .max()
        .unwrap_or_default();

    let [h, t, w] = HEADERS;
    writeln!(out, "{h:<handle_width$}  {t:<type_width$}  {w}")?;
    for [handle, ty, workloads] in &rows {
        writeln!(out, "{handle:<handle_width$}  {ty:<type_width$}  {workloads}")?;
    }
    out.flush()
}
