// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Temporary on-disk copies of resolved certificate material, for consumers
//! that need file paths (such as a libpq connection string).
//!
//! Library surface only: the `workload-accounts` binary keeps certificates in
//! memory and hands them to rustls, so nothing here runs on its path.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::ConnectionProfile;

/// A private directory of files that is removed, with its contents, when
/// dropped.
#[derive(Debug)]
pub struct ScopedFiles {
    dir: TempDir,
    written: Vec<PathBuf>,
}

impl ScopedFiles {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("workload-accounts-")
            .tempdir()?;
        Ok(Self {
            dir,
            written: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Write `contents` to `name` inside the directory, readable only by the
    /// current user.
    pub fn persist(&mut self, name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        self.written.push(path.clone());
        Ok(path)
    }
}

/// Paths of the certificate material written for one profile.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub root_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl ConnectionProfile {
    pub fn persist_tls_files(&self, files: &mut ScopedFiles) -> io::Result<TlsFiles> {
        let root_cert = match &self.root_ca {
            Some(pem) => Some(files.persist("root.crt", pem)?),
            None => None,
        };
        let (client_cert, client_key) = match &self.client_identity {
            Some(identity) => (
                Some(files.persist("postgresql.crt", &identity.cert)?),
                Some(files.persist("postgresql.key", &identity.key)?),
            ),
            None => (None, None),
        };
        Ok(TlsFiles {
            root_cert,
            client_cert,
            client_key,
        })
    }
}
