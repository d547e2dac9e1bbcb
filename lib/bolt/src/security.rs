//! Security plan: decides whether and how to run TLS from the configured
//! trust mode, and produces the TLS client context when one is required.

use serde_derive::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use strut::logging;
use strut::logging::Logger;

use crate::config::Config;
use crate::error::{Error, Result};

/// Encryption is the default; opting out is explicit.
pub const ENCRYPTION_DEFAULT: bool = true;

/// Certificate trust modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Trust {
    #[serde(rename = "TRUST_ALL_CERTIFICATES")]
    AllCertificates,
    #[serde(rename = "TRUST_SYSTEM_CA_SIGNED_CERTIFICATES")]
    SystemCaSignedCertificates,
    #[serde(rename = "TRUST_CUSTOM_CA_SIGNED_CERTIFICATES")]
    CustomCaSignedCertificates,
    /// Legacy; deprecated and incompatible with routing.
    #[serde(rename = "TRUST_ON_FIRST_USE")]
    OnFirstUse,
    /// Legacy alias for system CA verification; deprecated.
    #[serde(rename = "TRUST_SIGNED_CERTIFICATES")]
    SignedCertificates,
}

impl Default for Trust {
    fn default() -> Trust {
        Trust::AllCertificates
    }
}

static DEPRECATION_WARNED: AtomicBool = AtomicBool::new(false);

/// The outcome of resolving the security configuration: whether to encrypt,
/// the TLS context to do it with, and whether the resulting connections may
/// be used for routing.
#[derive(Clone)]
pub struct SecurityPlan {
    pub encrypted: bool,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub routing_compatible: bool,
}

impl SecurityPlan {
    /// Plain TCP, no TLS.
    pub fn off() -> SecurityPlan {
        SecurityPlan {
            encrypted: false,
            tls: None,
            routing_compatible: true,
        }
    }

    pub fn build<'a, L: Into<Option<&'a Logger>>>(config: &Config, log: L) -> Result<SecurityPlan> {
        let log = log.into();
        let encrypted = config.encrypted.unwrap_or(ENCRYPTION_DEFAULT);
        if !encrypted {
            return Ok(SecurityPlan::off());
        }
        match config.trust {
            Trust::AllCertificates => Ok(SecurityPlan {
                encrypted: true,
                tls: Some(Arc::new(unverified_tls_config())),
                routing_compatible: true,
            }),
            Trust::OnFirstUse => {
                warn_deprecated(log, "TRUST_ON_FIRST_USE", "TRUST_ALL_CERTIFICATES");
                Ok(SecurityPlan {
                    encrypted: true,
                    tls: Some(Arc::new(unverified_tls_config())),
                    routing_compatible: false,
                })
            }
            Trust::SignedCertificates => {
                warn_deprecated(
                    log,
                    "TRUST_SIGNED_CERTIFICATES",
                    "TRUST_SYSTEM_CA_SIGNED_CERTIFICATES",
                );
                Ok(SecurityPlan {
                    encrypted: true,
                    tls: Some(Arc::new(system_ca_tls_config()?)),
                    routing_compatible: true,
                })
            }
            Trust::SystemCaSignedCertificates => Ok(SecurityPlan {
                encrypted: true,
                tls: Some(Arc::new(system_ca_tls_config()?)),
                routing_compatible: true,
            }),
            Trust::CustomCaSignedCertificates => Err(Error::Configuration(
                "custom CA support is not implemented".to_string(),
            )),
        }
    }
}

fn warn_deprecated(log: Option<&Logger>, deprecated: &str, replacement: &str) {
    if DEPRECATION_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    if let Some(log) = log {
        logging::warn!(log, "deprecated trust mode configured";
                       "deprecated" => deprecated,
                       "replacement" => replacement);
    }
}

/// TLS without certificate verification. SSLv2/SSLv3 are not a concern
/// here: the context only speaks TLS 1.2 and 1.3.
fn unverified_tls_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    config
}

/// TLS verified against the system CA store.
fn system_ca_tls_config() -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|err| Error::Configuration(format!("cannot load system CA store: {}", err)))?;
    for cert in certs {
        // Unusable entries in the system store are skipped, as openssl does.
        let _ = roots.add(&rustls::Certificate(cert.0));
    }
    Ok(rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

struct AcceptAnyCertificate;

impl rustls::client::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(encrypted: Option<bool>, trust: Trust) -> Config {
        Config {
            encrypted,
            trust,
            ..Config::default()
        }
    }

    #[test]
    fn test_unencrypted_plan() {
        let plan = SecurityPlan::build(&config(Some(false), Trust::AllCertificates), None).unwrap();
        assert!(!plan.encrypted);
        assert!(plan.tls.is_none());
        assert!(plan.routing_compatible);
    }

    #[test]
    fn test_encryption_is_the_default() {
        let plan = SecurityPlan::build(&config(None, Trust::AllCertificates), None).unwrap();
        assert!(plan.encrypted);
        assert!(plan.tls.is_some());
    }

    #[test]
    fn test_trust_all_builds_a_context() {
        let plan = SecurityPlan::build(&config(Some(true), Trust::AllCertificates), None).unwrap();
        assert!(plan.encrypted);
        assert!(plan.tls.is_some());
        assert!(plan.routing_compatible);
    }

    #[test]
    fn test_custom_ca_is_not_implemented() {
        match SecurityPlan::build(&config(Some(true), Trust::CustomCaSignedCertificates), None) {
            Err(Error::Configuration(message)) => assert!(message.contains("not implemented")),
            other => panic!("unexpected plan {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_trust_on_first_use_is_routing_incompatible() {
        let plan = SecurityPlan::build(&config(Some(true), Trust::OnFirstUse), None).unwrap();
        assert!(plan.encrypted);
        assert!(!plan.routing_compatible);
    }
}
