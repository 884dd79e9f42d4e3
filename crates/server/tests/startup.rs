//! Engine wiring and TLS serving, end to end, without a real CA

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keygate_common::{DomainRecord, MemoryRegistry};
use keygate_config::{Config, DeploymentMode};
use keygate_server::acme::cache::verify_binding;
use keygate_server::acme::{AcmeError, CertificateIssuer, IssuedCertificate, IssuerConfig};
use keygate_server::{Engine, EngineError, Listeners};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

const ADMIN: &str = "admin.example.com";
const PUBLIC: &str = "login.example.net";

fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::new(ADMIN, "ops@example.com");
    config.mode = DeploymentMode::Production;
    config.admin.cert_path = dir.path().join("certs/admin.crt");
    config.admin.key_path = dir.path().join("certs/admin.key");
    config.acme.storage_path = dir.path().join("acme");
    config
}

/// Issuer that hands out one pre-generated certificate
struct StaticIssuer {
    cert_pem: String,
    key_pem: String,
    der: CertificateDer<'static>,
}

impl StaticIssuer {
    fn new(domain: &str) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        Self {
            cert_pem: generated.cert.pem(),
            key_pem: generated.signing_key.serialize_pem(),
            der: generated.cert.der().clone(),
        }
    }
}

#[async_trait]
impl CertificateIssuer for StaticIssuer {
    async fn issue(
        &self,
        _config: &IssuerConfig,
        domain: &str,
    ) -> Result<IssuedCertificate, AcmeError> {
        Ok(IssuedCertificate {
            domain: domain.to_string(),
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
        })
    }
}

/// Backend that writes `tag` to every connection and closes it
async fn tagging_backend(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(tag.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

fn connector(root: CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(root).unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn pem_cert(path: &Path) -> CertificateDer<'static> {
    let pem = std::fs::read(path).unwrap();
    let cert = rustls_pemfile::certs(&mut &pem[..]).next().unwrap().unwrap();
    cert
}

async fn fetch(
    connector: &TlsConnector,
    addr: SocketAddr,
    name: &str,
) -> std::io::Result<String> {
    let tcp = tokio::net::TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut tls = connector.connect(server_name, tcp).await?;
    let mut body = String::new();
    tls.read_to_string(&mut body).await?;
    Ok(body)
}

#[test]
fn test_build_bootstraps_admin_certificate_and_binds_cache() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let registry = Arc::new(MemoryRegistry::new());

    let engine = Engine::build(config.clone(), registry).unwrap();

    assert!(config.admin.cert_path.exists());
    assert!(config.admin.key_path.exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&config.admin.key_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let issuer_config = engine.manager().config();
    assert!(verify_binding(issuer_config).is_ok());
    let resolved = issuer_config.cache().resolve_domain(PUBLIC).unwrap();
    assert!(Arc::ptr_eq(&resolved, issuer_config));
}

#[tokio::test]
async fn test_development_mode_builds() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.mode = DeploymentMode::Development;

    let engine = Engine::build(config, Arc::new(MemoryRegistry::new())).unwrap();

    let environment = engine.manager().config().environment();
    assert!(environment.trusted_roots().is_some());
    assert_eq!(
        engine.manager().config().directory_url(),
        "https://127.0.0.1:14000/dir"
    );
}

#[test]
fn test_incomplete_admin_certificate_aborts_before_storage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    std::fs::create_dir_all(config.admin.key_path.parent().unwrap()).unwrap();
    std::fs::write(&config.admin.key_path, "orphaned key").unwrap();

    let err = Engine::build(config.clone(), Arc::new(MemoryRegistry::new())).unwrap_err();

    assert!(matches!(err, EngineError::IncompleteAdminCertificate { .. }));
    assert!(!config.acme.storage_path.exists());
}

#[tokio::test]
async fn test_serves_admin_and_registered_hostnames_only() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.admin.backend = tagging_backend("admin").await;
    config.listeners.backend = tagging_backend("public").await;
    config.listeners.https = "127.0.0.1:0".parse().unwrap();
    config.listeners.http = "127.0.0.1:0".parse().unwrap();

    let registry = Arc::new(MemoryRegistry::with_records(vec![
        DomainRecord::new(PUBLIC, true),
        DomainRecord::new("parked.example.net", false),
    ]));
    let issuer = Arc::new(StaticIssuer::new(PUBLIC));
    let public_root = issuer.der.clone();

    let engine = Engine::build_with_issuer(config.clone(), registry, issuer).unwrap();
    let listeners = Listeners::bind(&config.listeners).await.unwrap();
    let https = listeners.https.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(engine.serve(listeners, shutdown_rx));

    let admin = connector(pem_cert(&config.admin.cert_path));
    assert_eq!(fetch(&admin, https, ADMIN).await.unwrap(), "admin");

    let public = connector(public_root);
    assert_eq!(fetch(&public, https, PUBLIC).await.unwrap(), "public");

    assert!(fetch(&public, https, "parked.example.net").await.is_err());
    assert!(fetch(&public, https, "evil.example.org").await.is_err());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
}
