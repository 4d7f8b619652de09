//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! Construction of OpenSSL acceptors and connectors from the TLS
//! configuration.

use std::fmt;
use std::fs;
use std::path::Path;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;

use super::error::Error;
use super::system_config::TlsConfig;

/// A private key and the certificate chain proving it.
pub struct Identity {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub chain: Vec<X509>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Identity")
            .field("chain", &self.chain.len())
            .finish()
    }
}

impl Identity {
    /// Load the identity described by `config`, with relative paths resolved
    /// against `root`.
    ///
    /// Returns `None` if the configuration names no identity at all.
    pub fn load(config: &TlsConfig, root: &Path) -> Result<Option<Self>, Error> {
        if let Some(ref keystore) = config.keystore {
            let der = read(root, keystore)?;
            let parsed = Pkcs12::from_der(&der)?
                .parse2(&config.keystore_passphrase)?;
            let private_key = parsed.pkey.ok_or_else(|| {
                Error::Config(format!(
                    "Keystore {} has no private key",
                    keystore.display()
                ))
            })?;
            let certificate = parsed.cert.ok_or_else(|| {
                Error::Config(format!(
                    "Keystore {} has no certificate",
                    keystore.display()
                ))
            })?;
            let chain = parsed
                .ca
                .map(|stack| stack.into_iter().collect())
                .unwrap_or_default();

            return Ok(Some(Identity {
                private_key,
                certificate,
                chain,
            }));
        }

        match (&config.private_key, &config.certificate_chain) {
            (None, None) => Ok(None),
            (Some(key), Some(chain)) => {
                let private_key =
                    PKey::private_key_from_pem(&read(root, key)?)?;
                let mut chain = X509::stack_from_pem(&read(root, chain)?)?;
                if chain.is_empty() {
                    return Err(Error::Config(
                        "Certificate chain is empty".to_owned(),
                    ));
                }
                let certificate = chain.remove(0);
                Ok(Some(Identity {
                    private_key,
                    certificate,
                    chain,
                }))
            }
            _ => Err(Error::Config(
                "private_key and certificate_chain must be set together"
                    .to_owned(),
            )),
        }
    }

    pub fn acceptor(&self) -> Result<SslAcceptor, Error> {
        let mut acceptor =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor.set_private_key(&self.private_key)?;
        acceptor.set_certificate(&self.certificate)?;
        for cert in &self.chain {
            acceptor.add_extra_chain_cert(cert.clone())?;
        }
        acceptor.check_private_key()?;
        Ok(acceptor.build())
    }
}

/// Build a connector for outbound connections to a peer.
///
/// If `identity` is given, it is presented as a client certificate.
pub fn connector(
    config: &TlsConfig,
    root: &Path,
    identity: Option<&Identity>,
    allow_insecure: bool,
) -> Result<SslConnector, Error> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    if let Some(ref ca_file) = config.ca_file {
        connector.set_ca_file(root.join(ca_file))?;
    }

    if let Some(identity) = identity {
        connector.set_private_key(&identity.private_key)?;
        connector.set_certificate(&identity.certificate)?;
        for cert in &identity.chain {
            connector.add_extra_chain_cert(cert.clone())?;
        }
    }

    if allow_insecure {
        connector.set_verify(SslVerifyMode::NONE);
    }

    Ok(connector.build())
}

fn read(root: &Path, path: &Path) -> Result<Vec<u8>, Error> {
    let path = root.join(path);
    fs::read(&path).map_err(|e| {
        Error::Config(format!("Unable to read '{}': {}", path.display(), e))
    })
}


#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn no_identity_configured() {
        let root = TempDir::new().unwrap();
        assert!(Identity::load(&TlsConfig::default(), root.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn half_configured_identity_is_rejected() {
        let root = TempDir::new().unwrap();
        let config = TlsConfig {
            private_key: Some("key.pem".into()),
            ..TlsConfig::default()
        };
        assert_matches!(
            Err(Error::Config(..)),
            Identity::load(&config, root.path())
        );
    }

    #[test]
    fn test_certificate_is_well_formed() {
        let identity = test_identity::identity();
        let cert = &identity.certificate;
        assert_eq!(2, cert.version());
        assert!(cert.verify(&identity.private_key).unwrap());

        let now = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
        assert!(cert.not_before().diff(&now).unwrap().days > 0);
        assert!(now.diff(cert.not_after()).unwrap().days >= 1);
    }

    #[test]
    fn pem_identity_round_trip() {
        let root = TempDir::new().unwrap();
        let identity = test_identity::identity();
        fs::write(
            root.path().join("key.pem"),
            identity.private_key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();
        fs::write(
            root.path().join("cert.pem"),
            identity.certificate.to_pem().unwrap(),
        )
        .unwrap();

        let config = TlsConfig {
            private_key: Some("key.pem".into()),
            certificate_chain: Some("cert.pem".into()),
            ..TlsConfig::default()
        };
        let loaded = Identity::load(&config, root.path()).unwrap().unwrap();
        assert_eq!(
            identity.certificate.to_der().unwrap(),
            loaded.certificate.to_der().unwrap()
        );
        assert!(loaded.chain.is_empty());
        loaded.acceptor().unwrap();
    }

    #[test]
    fn pkcs12_identity() {
        let root = TempDir::new().unwrap();
        let identity = test_identity::identity();
        let keystore = Pkcs12::builder()
            .name("sync")
            .pkey(&identity.private_key)
            .cert(&identity.certificate)
            .build2("hunter2")
            .unwrap();
        fs::write(root.path().join("sync.p12"), keystore.to_der().unwrap())
            .unwrap();

        let config = TlsConfig {
            keystore: Some("sync.p12".into()),
            keystore_passphrase: "hunter2".to_owned(),
            ..TlsConfig::default()
        };
        let loaded = Identity::load(&config, root.path()).unwrap().unwrap();
        assert_eq!(
            identity.certificate.to_der().unwrap(),
            loaded.certificate.to_der().unwrap()
        );

        let bad_config = TlsConfig {
            keystore_passphrase: "hunter3".to_owned(),
            ..config
        };
        assert!(Identity::load(&bad_config, root.path()).is_err());
    }
}
