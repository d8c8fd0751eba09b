use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, IsCa, KeyPair, SanType, SerialNumber,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{any_supported_type, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tracing::{debug, info, warn};

use crate::error::CertificateError;

/// Capability interface for dynamic TLS termination: given the server name a
/// client asked for, produce a certificate the proxy can present. Injected
/// into the TLS server configuration instead of being captured as ambient
/// state.
pub trait CertificateProvider: Send + Sync {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError>;
}

/// Issuing CA backed by rcgen. The CA certificate/key pair is loaded from
/// disk when present, otherwise generated and persisted so clients only need
/// to trust it once. Minted leaves are cached per hostname.
pub struct IssuingCa {
    ca: RcgenCertificate,
    ca_der: Vec<u8>,
    leaves: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl IssuingCa {
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let ca = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            let key_pair = KeyPair::from_pem(&key_pem)?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)?;
            info!(cert = %cert_path.display(), "loaded interception CA");
            RcgenCertificate::from_params(params)?
        } else {
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Phisherman Interception CA");
            dn.push(DnType::OrganizationName, "Phisherman");
            params.distinguished_name = dn;
            let ca = RcgenCertificate::from_params(params)?;
            std::fs::write(cert_path, ca.serialize_pem()?)?;
            std::fs::write(key_path, ca.serialize_private_key_pem())?;
            info!(
                cert = %cert_path.display(),
                "generated interception CA; install it in client trust stores"
            );
            ca
        };
        let ca_der = ca.serialize_der()?;
        Ok(Self {
            ca,
            ca_der,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    fn mint(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(SerialNumber::from(
            rand::random::<u64>().to_be_bytes().to_vec(),
        ));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match server_name.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(server_name.to_string()),
        }];

        let leaf = RcgenCertificate::from_params(params)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.ca)?;
        let key_der = leaf.serialize_private_key_der();

        let signing_key = any_supported_type(&PrivateKey(key_der))
            .map_err(|_| CertificateError::BadKey)?;
        let chain = vec![Certificate(leaf_der), Certificate(self.ca_der.clone())];
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

impl CertificateProvider for IssuingCa {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        if let Some(cached) = self.leaves.lock().unwrap().get(server_name) {
            return Ok(Arc::clone(cached));
        }
        let key = self.mint(server_name)?;
        debug!(server_name, "issued interception certificate");
        self.leaves
            .lock()
            .unwrap()
            .insert(server_name.to_string(), Arc::clone(&key));
        Ok(key)
    }
}

/// Bridges a `CertificateProvider` into rustls' per-handshake certificate
/// selection.
struct ProviderResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl std::fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderResolver")
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        match self.provider.issue(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(server_name, error = %e, "certificate issuance failed");
                None
            }
        }
    }
}

/// TLS server configuration that terminates client connections with
/// dynamically issued certificates.
pub fn interception_server_config(provider: Arc<dyn CertificateProvider>) -> Arc<ServerConfig> {
    Arc::new(
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ProviderResolver { provider })),
    )
}
