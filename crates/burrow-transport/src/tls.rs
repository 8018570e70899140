//! Client TLS identity built from PEM material.
//!
//! Certificates and keys arrive as PEM text (usually straight from the
//! environment). They are parsed once at connect time so a bad pair fails
//! fast with a configuration error instead of during the TLS handshake.

use std::fmt;

use crate::traits::TransportError;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PKCS8_KEY_TAG: &str = "PRIVATE KEY";
const LEGACY_KEY_TAGS: [&str; 2] = ["RSA PRIVATE KEY", "EC PRIVATE KEY"];

/// A parsed client certificate chain and private key.
#[derive(Clone)]
pub struct TlsIdentity {
    /// DER certificates, leaf first.
    chain: Vec<Vec<u8>>,
    /// PKCS#8 DER private key.
    key: Vec<u8>,
    /// Extra trust anchors in PEM form.
    ca: Option<String>,
}

impl TlsIdentity {
    /// Parse a PEM certificate chain and PKCS#8 private key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if either document is malformed,
    /// holds no certificate, or holds no PKCS#8 key.
    pub fn from_pem(cert: &str, key: &str, ca: Option<&str>) -> Result<Self, TransportError> {
        let chain: Vec<Vec<u8>> = pem::parse_many(cert)
            .map_err(|e| TransportError::Tls(format!("invalid certificate PEM: {e}")))?
            .into_iter()
            .filter(|p| p.tag() == CERTIFICATE_TAG)
            .map(pem::Pem::into_contents)
            .collect();

        if chain.is_empty() {
            return Err(TransportError::Tls("no certificate found in PEM".into()));
        }

        let keys = pem::parse_many(key)
            .map_err(|e| TransportError::Tls(format!("invalid private key PEM: {e}")))?;

        let key = match keys.into_iter().next() {
            Some(p) if p.tag() == PKCS8_KEY_TAG => p.into_contents(),
            Some(p) if LEGACY_KEY_TAGS.contains(&p.tag()) => {
                return Err(TransportError::Tls(format!(
                    "unsupported key format {:?}, convert it to PKCS#8",
                    p.tag()
                )))
            }
            _ => return Err(TransportError::Tls("no private key found in PEM".into())),
        };

        let ca = match ca.map(str::trim).filter(|s| !s.is_empty()) {
            Some(ca) => {
                pem::parse_many(ca)
                    .map_err(|e| TransportError::Tls(format!("invalid CA PEM: {e}")))?;
                Some(ca.to_string())
            }
            None => None,
        };

        Ok(Self { chain, key, ca })
    }

    /// Number of certificates in the chain.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Extra trust anchors, if any.
    #[must_use]
    pub fn ca(&self) -> Option<&str> {
        self.ca.as_deref()
    }

    /// Package the identity as a PKCS#12 archive protected by `password`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if a certificate is not valid X.509
    /// or the archive cannot be written.
    #[cfg(feature = "amqp")]
    pub fn to_pkcs12(&self, password: &str) -> Result<Vec<u8>, TransportError> {
        use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};

        let certs = self
            .chain
            .iter()
            .map(|der| Certificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Tls(format!("invalid certificate: {e}")))?;

        let mut store = KeyStore::new();
        store.add_entry(
            "client",
            KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(&self.key, b"burrow", certs)),
        );

        store
            .writer(password)
            .write()
            .map_err(|e| TransportError::Tls(format!("failed to build PKCS#12 identity: {e}")))
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"<KEY>")
            .field("ca", &self.ca.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem_block(tag: &str, contents: &[u8]) -> String {
        pem::encode(&pem::Pem::new(tag, contents.to_vec()))
    }

    #[test]
    fn test_from_pem_parses_chain_and_key() {
        let cert = format!(
            "{}{}",
            pem_block("CERTIFICATE", b"leaf"),
            pem_block("CERTIFICATE", b"intermediate")
        );
        let key = pem_block("PRIVATE KEY", b"key");

        let identity = TlsIdentity::from_pem(&cert, &key, None).unwrap();
        assert_eq!(identity.chain_len(), 2);
        assert!(identity.ca().is_none());
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        let key = pem_block("PRIVATE KEY", b"key");
        assert!(matches!(
            TlsIdentity::from_pem("not a certificate", &key, None),
            Err(TransportError::Tls(_))
        ));

        let cert = pem_block("CERTIFICATE", b"leaf");
        assert!(matches!(
            TlsIdentity::from_pem(&cert, "", None),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_from_pem_rejects_legacy_key() {
        let cert = pem_block("CERTIFICATE", b"leaf");
        let key = pem_block("RSA PRIVATE KEY", b"key");

        match TlsIdentity::from_pem(&cert, &key, None) {
            Err(TransportError::Tls(msg)) => assert!(msg.contains("PKCS#8")),
            other => panic!("Expected Tls error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_pem_blank_ca_is_none() {
        let cert = pem_block("CERTIFICATE", b"leaf");
        let key = pem_block("PRIVATE KEY", b"key");
        let identity = TlsIdentity::from_pem(&cert, &key, Some("  \n")).unwrap();
        assert!(identity.ca().is_none());
    }
}
