// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! rustls client configuration for a [`ConnectionProfile`].
//!
//! | root CA | sslmode               | server certificate check              |
//! |---------|-----------------------|---------------------------------------|
//! | present | any                   | chain; server name per hostname policy |
//! | absent  | verify-ca/verify-full | configuration error                   |
//! | absent  | anything else         | none (handshake signatures only)      |
//!
//! rustls does not renegotiate. A TLS 1.2 server HelloRequest is answered with
//! a `no_renegotiation` alert, and a server that insists will close the session.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::ConnectionProfile;
use crate::errors::{ConfigError, Error, TransportError};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the client configuration used to upgrade connections for `profile`.
pub fn client_config(profile: &ConnectionProfile) -> Result<ClientConfig, Error> {
    let provider = provider();

    let verifier: Arc<dyn ServerCertVerifier> = match profile.root_ca.as_deref() {
        Some(pem) if !pem.is_empty() => {
            let roots = root_store(pem)?;
            let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| TransportError::TlsConfig(format!("server verifier error: {e}")))?;
            if profile.verifies_hostname() {
                webpki
            } else {
                Arc::new(SkipServerName { inner: webpki })
            }
        }
        _ if matches!(profile.sslmode.as_str(), "verify-ca" | "verify-full") => {
            return Err(ConfigError::MissingRootCertificate {
                sslmode: profile.sslmode.clone(),
            }
            .into());
        }
        _ => Arc::new(AcceptAnyServerCert {
            provider: provider.clone(),
        }),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::TlsConfig(format!("protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match &profile.client_identity {
        Some(identity) => {
            let certs = parse_certificates(&identity.cert, "client certificate")?;
            let key = parse_private_key(&identity.key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsConfig(format!("client certificate: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(pem, "root certificate")? {
        roots.add(cert).map_err(|e| ConfigError::InvalidPem {
            param: "root certificate".to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(roots)
}

fn parse_certificates(pem: &[u8], param: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidPem {
            param: param.to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidPem {
            param: param.to_string(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConfigError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|e| ConfigError::InvalidPem {
        param: "client key".to_string(),
        reason: e.to_string(),
    })
}

/// Verifies the chain but accepts a certificate issued for another name.
#[derive(Debug)]
struct SkipServerName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipServerName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// libpq `require` without a root certificate: encrypt, but trust any
/// server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::postgres::{ClientIdentity, HostnamePolicy};
    use crate::test_utils::TestPki;

    fn profile(sslmode: &str) -> ConnectionProfile {
        ConnectionProfile {
            host: "127.0.0.1".to_string(),
            port: None,
            user: "concourse".to_string(),
            password: "pw".to_string(),
            sslmode: sslmode.to_string(),
            database: None,
            root_ca: None,
            client_identity: None,
            hostname_policy: HostnamePolicy::Relaxed,
        }
    }

    #[test]
    fn test_verify_modes_need_root_certificate() {
        for mode in ["verify-ca", "verify-full"] {
            let err = client_config(&profile(mode)).unwrap_err();
            assert!(
                matches!(err, Error::Config(ConfigError::MissingRootCertificate { .. })),
                "{mode}: {err}"
            );
        }
    }

    #[test]
    fn test_require_without_root_certificate_builds() {
        let pki = TestPki::generate();
        let mut p = profile("require");
        p.client_identity = Some(pki.client_identity());
        let config = client_config(&p).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_rejects_garbage_root_certificate() {
        let mut p = profile("verify-ca");
        p.root_ca = Some(b"not a certificate".to_vec());
        let err = client_config(&p).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidPem { .. })));
    }

    #[test]
    fn test_rejects_garbage_client_key() {
        let pki = TestPki::generate();
        let mut p = profile("verify-ca");
        p.root_ca = Some(pki.ca_pem.clone());
        p.client_identity = Some(ClientIdentity {
            cert: pki.client_cert_pem.clone(),
            key: b"nope".to_vec(),
        });
        let err = client_config(&p).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InvalidPem { ref param, .. }) if param == "client key"
        ));
    }
}
