//! TLS configuration for the secure server.
//!
//! Builds a rustls server configuration from PEM material supplied by the
//! caller. Encrypted PKCS#8 keys are decrypted with the password callback.

use std::fmt;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// Returns the password protecting an encrypted private key.
pub type PasswordCallback = Arc<dyn Fn() -> String + Send + Sync>;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const DH_PARAMS_LABEL: &str = "DH PARAMETERS";

/// Key agreement mode selected by `init_ssl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreement {
    /// No DH parameters supplied; the crypto provider's default groups are used.
    Static,
    /// DH parameters were supplied and validated.
    Ephemeral,
}

/// A ready-to-use TLS acceptor plus the settings it was built from.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    key_agreement: KeyAgreement,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("key_agreement", &self.key_agreement)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Build from a PEM certificate chain and private key.
    ///
    /// `password` is only invoked when the key is an encrypted PKCS#8 block.
    pub fn from_pem(
        cert: &str,
        key: &str,
        password: Option<PasswordCallback>,
        dh: Option<&str>,
    ) -> Result<Self, ServerError> {
        let certs = load_certs(cert)?;
        let key = load_private_key(key, password.as_ref())?;

        let key_agreement = match dh {
            Some(dh) => {
                check_dh_params(dh)?;
                KeyAgreement::Ephemeral
            }
            None => KeyAgreement::Static,
        };

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(format!("Failed to load certificate and key: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tracing::debug!(?key_agreement, "Built TLS server configuration");

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            key_agreement,
        })
    }

    pub fn key_agreement(&self) -> KeyAgreement {
        self.key_agreement
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("Failed to parse certificate: {e:?}")))?;

    if certs.is_empty() {
        return Err(ServerError::Tls("No certificate found in PEM".to_string()));
    }
    Ok(certs)
}

fn load_private_key(
    pem: &str,
    password: Option<&PasswordCallback>,
) -> Result<PrivateKeyDer<'static>, ServerError> {
    if pem.contains(&format!("-----BEGIN {ENCRYPTED_KEY_LABEL}-----")) {
        let password = password.ok_or_else(|| {
            ServerError::Tls("Private key is encrypted but no password callback was given".to_string())
        })?;
        return decrypt_private_key(pem, password);
    }

    PrivateKeyDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| ServerError::Tls(format!("Failed to parse private key: {e:?}")))
}

fn decrypt_private_key(
    pem: &str,
    password: &PasswordCallback,
) -> Result<PrivateKeyDer<'static>, ServerError> {
    let (_, document) = pkcs8::Document::from_pem(pem)
        .map_err(|e| ServerError::Tls(format!("Failed to parse encrypted private key: {e}")))?;
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| ServerError::Tls(format!("Failed to parse encrypted private key: {e}")))?;

    let decrypted = info
        .decrypt(password().as_bytes())
        .map_err(|e| ServerError::Tls(format!("Failed to decrypt private key: {e}")))?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

fn check_dh_params(pem: &str) -> Result<(), ServerError> {
    let (label, _) = pkcs8::Document::from_pem(pem)
        .map_err(|e| ServerError::Tls(format!("Failed to parse DH parameters: {e}")))?;

    if label != DH_PARAMS_LABEL {
        return Err(ServerError::Tls(format!(
            "Expected {DH_PARAMS_LABEL} PEM block, found {label}"
        )));
    }
    Ok(())
}
