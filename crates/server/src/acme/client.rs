//! ACME client implementation using instant-acme
//!
//! Drives one HTTP-01 order per hostname. Account credentials are persisted in
//! the certificate store and restored on the next start.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::RootCertStore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::cache::IssuerConfig;
use super::challenge::ChallengeManager;
use super::environment::CaEnvironment;
use super::error::AcmeError;

/// Initial interval for polling order status during validation
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum interval for order polling
const ORDER_POLL_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Attempts before the poll interval doubles
const ORDER_POLL_BACKOFF_STEP: u32 = 5;

/// Maximum number of order polling attempts
const ORDER_POLL_MAX_ATTEMPTS: u32 = 60;

/// Interval for polling certificate availability after finalization
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum number of certificate download attempts
const CERT_POLL_MAX_ATTEMPTS: u32 = 30;

/// A certificate freshly obtained from the CA
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    /// PEM-encoded certificate chain, leaf first
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Something that can obtain a certificate for one hostname
///
/// Authorization has already been checked by the caller.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        config: &IssuerConfig,
        domain: &str,
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// Wrapper around Arc<dyn HttpClient> that implements HttpClient
///
/// Lets one TLS client with custom roots serve every account operation.
struct SharedHttpClient(Arc<dyn HttpClient>);

impl HttpClient for SharedHttpClient {
    fn request(
        &self,
        req: hyper::Request<Full<Bytes>>,
    ) -> Pin<
        Box<dyn Future<Output = Result<instant_acme::BytesResponse, instant_acme::Error>> + Send>,
    > {
        self.0.request(req)
    }
}

/// HTTP-01 ACME client
pub struct AcmeClient {
    /// Account, created or restored on first use
    account: RwLock<Option<Account>>,
    challenges: ChallengeManager,
    /// HTTP client trusting custom roots; `None` uses instant-acme's default
    http_client: Option<Arc<dyn HttpClient>>,
}

impl AcmeClient {
    /// Create a client for the given CA environment
    ///
    /// Environments with their own trust roots get a dedicated HTTPS client
    /// that trusts only those roots.
    pub fn new(
        environment: &CaEnvironment,
        challenges: ChallengeManager,
    ) -> Result<Self, AcmeError> {
        let http_client = match environment.trusted_roots() {
            Some(roots) => Some(http_client_with_roots(Arc::clone(roots))?),
            None => None,
        };

        Ok(Self {
            account: RwLock::new(None),
            challenges,
            http_client,
        })
    }

    pub fn has_custom_roots(&self) -> bool {
        self.http_client.is_some()
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Return the account, creating or restoring it on first use
    async fn account(&self, config: &IssuerConfig) -> Result<Account, AcmeError> {
        if let Some(account) = self.account.read().await.as_ref() {
            return Ok(account.clone());
        }

        let mut account_guard = self.account.write().await;
        if let Some(account) = account_guard.as_ref() {
            return Ok(account.clone());
        }

        let account = match config.storage().load_credentials_json()? {
            Some(json) => self.restore_account(&json).await?,
            None => self.create_account(config).await?,
        };

        *account_guard = Some(account.clone());
        Ok(account)
    }

    async fn restore_account(&self, credentials_json: &str) -> Result<Account, AcmeError> {
        info!("Restoring ACME account from storage");

        let credentials: AccountCredentials = serde_json::from_str(credentials_json)
            .map_err(|e| AcmeError::Account(format!("failed to parse credentials: {}", e)))?;

        let account = match self.http_client {
            Some(ref http) => {
                Account::from_credentials_and_http(
                    credentials,
                    Box::new(SharedHttpClient(Arc::clone(http))),
                )
                .await
            }
            None => Account::from_credentials(credentials).await,
        };

        account.map_err(|e| AcmeError::Account(format!("failed to restore account: {}", e)))
    }

    async fn create_account(&self, config: &IssuerConfig) -> Result<Account, AcmeError> {
        let environment = config.environment();
        info!(
            directory = %config.directory_url(),
            email = %environment.account_email(),
            "Creating new ACME account"
        );

        let contact = format!("mailto:{}", environment.account_email());
        let contact_refs = [contact.as_str()];
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: environment.agreed_to_terms(),
            only_return_existing: false,
        };

        let created = match self.http_client {
            Some(ref http) => {
                Account::create_with_http(
                    &new_account,
                    config.directory_url(),
                    None,
                    Box::new(SharedHttpClient(Arc::clone(http))),
                )
                .await
            }
            None => Account::create(&new_account, config.directory_url(), None).await,
        };
        let (account, credentials) =
            created.map_err(|e| AcmeError::Account(format!("failed to create account: {}", e)))?;

        let credentials_json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(format!("failed to serialize credentials: {}", e)))?;
        config.storage().save_credentials_json(&credentials_json)?;

        info!("ACME account created and credentials saved");
        Ok(account)
    }

    /// Publish HTTP-01 responses for every pending authorization and wait
    /// until the order is ready for finalization
    async fn complete_challenges(&self, order: &mut Order, domain: &str) -> Result<(), AcmeError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::Challenge(format!("failed to get authorizations: {}", e)))?;

        let mut published = Vec::new();
        for auth in &authorizations {
            if matches!(auth.status, AuthorizationStatus::Valid) {
                debug!(domain = %domain, "Authorization already valid");
                continue;
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AcmeError::Challenge(format!("no HTTP-01 challenge offered for {}", domain))
                })?;

            let key_auth = order.key_authorization(challenge);
            published.push(self.challenges.publish(domain, &challenge.token, key_auth.as_str()));

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| {
                    AcmeError::Challenge(format!("failed to set challenge ready: {}", e))
                })?;
        }

        wait_for_order_ready(order, domain).await
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(
        &self,
        config: &IssuerConfig,
        domain: &str,
    ) -> Result<IssuedCertificate, AcmeError> {
        let account = self.account(config).await?;

        info!(domain = %domain, directory = %config.directory_url(), "Requesting certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreation(format!("failed to create order: {}", e)))?;

        if !matches!(order.state().status, OrderStatus::Ready | OrderStatus::Valid) {
            self.complete_challenges(&mut order, domain).await?;
        }

        let (csr, key_pair) = generate_csr(domain)?;
        let cert_pem = finalize_order(&mut order, &csr, domain).await?;

        Ok(IssuedCertificate {
            domain: domain.to_string(),
            cert_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("custom_roots", &self.has_custom_roots())
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

/// Build an HTTPS client that trusts only `roots`
fn http_client_with_roots(roots: Arc<RootCertStore>) -> Result<Arc<dyn HttpClient>, AcmeError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AcmeError::Account(format!("failed to configure TLS client: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_only()
        .enable_http1()
        .build();

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(connector);
    Ok(Arc::new(client))
}

/// Generate a CSR and fresh key pair for one hostname
pub fn generate_csr(domain: &str) -> Result<(Vec<u8>, KeyPair), AcmeError> {
    let key_pair = KeyPair::generate()
        .map_err(|e| AcmeError::CertGeneration(format!("failed to generate key pair: {}", e)))?;

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::CertGeneration(format!("invalid domain {}: {}", domain, e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::CertGeneration(format!("failed to create CSR: {}", e)))?;

    Ok((csr.der().to_vec(), key_pair))
}

/// Poll until the order leaves the pending state
async fn wait_for_order_ready(order: &mut Order, domain: &str) -> Result<(), AcmeError> {
    let mut poll_interval = ORDER_POLL_INTERVAL;

    for attempt in 1..=ORDER_POLL_MAX_ATTEMPTS {
        tokio::time::sleep(poll_interval).await;

        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::Challenge(format!("failed to refresh order: {}", e)))?;

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                debug!(domain = %domain, attempts = attempt, "Authorization validated");
                return Ok(());
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::Challenge(format!(
                    "authorization for {} failed",
                    domain
                )));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                debug!(
                    domain = %domain,
                    attempt = attempt,
                    max_attempts = ORDER_POLL_MAX_ATTEMPTS,
                    status = ?state.status,
                    "Waiting for authorization"
                );
            }
        }

        if attempt % ORDER_POLL_BACKOFF_STEP == 0 {
            poll_interval = (poll_interval * 2).min(ORDER_POLL_MAX_INTERVAL);
        }
    }

    warn!(domain = %domain, "Gave up waiting for authorization");
    Err(AcmeError::Challenge(format!(
        "authorization for {} timed out after {} attempts",
        domain, ORDER_POLL_MAX_ATTEMPTS
    )))
}

/// Finalize an order and download the certificate chain
async fn finalize_order(order: &mut Order, csr: &[u8], domain: &str) -> Result<String, AcmeError> {
    order
        .finalize(csr)
        .await
        .map_err(|e| AcmeError::Issuance(format!("failed to finalize order: {}", e)))?;

    for _ in 0..CERT_POLL_MAX_ATTEMPTS {
        match order.certificate().await {
            Ok(Some(cert)) => {
                info!(domain = %domain, "Certificate downloaded");
                return Ok(cert);
            }
            Ok(None) => {
                debug!(domain = %domain, "Certificate not ready yet, waiting");
                tokio::time::sleep(CERT_POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(AcmeError::Issuance(format!(
                    "failed to get certificate: {}",
                    e
                )));
            }
        }
    }

    Err(AcmeError::Issuance(format!(
        "certificate for {} not available after {} attempts",
        domain, CERT_POLL_MAX_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_config::DeploymentMode;

    #[test]
    fn test_generate_csr() {
        let (csr, key_pair) = generate_csr("login.example.net").unwrap();

        assert!(!csr.is_empty());
        assert!(key_pair.serialize_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_production_uses_default_http_client() {
        let env = CaEnvironment::select(DeploymentMode::Production, "ops@example.com").unwrap();
        let client = AcmeClient::new(&env, ChallengeManager::new()).unwrap();

        assert!(!client.has_custom_roots());
    }

    #[tokio::test]
    async fn test_development_uses_custom_roots() {
        let env = CaEnvironment::select(DeploymentMode::Development, "ops@example.com").unwrap();
        let client = AcmeClient::new(&env, ChallengeManager::new()).unwrap();

        assert!(client.has_custom_roots());
    }
}
