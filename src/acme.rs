//! ACME (Let's Encrypt) certificate issuance
//!
//! Certificates are obtained per hostname with the HTTP-01 challenge. The
//! key authorization is kept in memory for the HTTP listeners and, when a
//! webroot is configured, also written to
//! `<webroot>/.well-known/acme-challenge/<token>`. Issued certificates land in
//! the certificate store read by [`CertResolver`](crate::certs::CertResolver).
//!
//! # Security Considerations
//!
//! The ACME account key and certificate private keys are stored unencrypted
//! with 0600 permissions on Unix. Keep the account directory and the
//! certificate root on a filesystem only the service user can read.

use crate::certs::{is_cert_valid_for_days, load_pair, save_pair};
use crate::collab::CertificateIssuer;
use crate::config::AcmeConfig;
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Challenge tokens are base64url; anything else is refused before it can
/// reach the filesystem
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 256
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Issues certificates for single hostnames through an ACME directory
pub struct AcmeIssuer {
    config: AcmeConfig,
    account_dir: PathBuf,
    cert_root: PathBuf,
    renew_before_days: u64,
    webroot: Option<PathBuf>,
    challenges: Http01Challenges,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(
        config: AcmeConfig,
        cert_root: impl Into<PathBuf>,
        challenges: Http01Challenges,
    ) -> anyhow::Result<Self> {
        let account_dir = validate_cache_dir(&config.account_dir)?;
        Ok(Self {
            config,
            account_dir,
            cert_root: cert_root.into(),
            renew_before_days: 30,
            webroot: None,
            challenges,
            account: OnceCell::new(),
        })
    }

    pub fn with_webroot(mut self, webroot: Option<PathBuf>) -> Self {
        self.webroot = webroot;
        self
    }

    pub fn with_renew_before_days(mut self, days: u64) -> Self {
        self.renew_before_days = days;
        self
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    /// Load or create the ACME account
    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.account_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        info!("Creating new ACME account");
        let email = self.config.email.as_ref().ok_or_else(|| {
            anyhow::anyhow!("ACME email is required for account creation")
        })?;

        let directory_url = self
            .config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        std::fs::create_dir_all(&self.account_dir)?;
        let data = serde_json::to_string_pretty(&credentials)?;
        write_private(&account_path, &data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.get_or_create_account())
            .await
    }

    /// Publish a key authorization in memory and in the webroot
    async fn publish_challenge(&self, token: &str, key_authorization: &str) -> anyhow::Result<()> {
        self.challenges
            .set(token.to_string(), key_authorization.to_string())
            .await;

        if let Some(webroot) = &self.webroot {
            let dir = webroot.join(".well-known").join("acme-challenge");
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(token), key_authorization).await?;
        }
        Ok(())
    }

    async fn retract_challenge(&self, token: &str) {
        self.challenges.remove(token).await;
        if let Some(webroot) = &self.webroot {
            let path = webroot.join(".well-known").join("acme-challenge").join(token);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "Failed to remove challenge file");
            }
        }
    }

    /// Mark the challenge ready and poll until the authorization settles
    async fn await_authorization(
        &self,
        order: &mut Order,
        challenge_url: &str,
        identifier: &str,
    ) -> anyhow::Result<()> {
        order.set_challenge_ready(challenge_url).await?;

        let mut attempts = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current_auth = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

            match current_auth.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Authorization timeout for {}", identifier);
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", identifier);
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "Authorization status");
                }
                None => {
                    anyhow::bail!("Authorization not found for {}", identifier);
                }
            }
        }
    }

    /// Run one order for `hostname`, returning the PEM chain and key
    async fn obtain_certificate(&self, hostname: &str) -> anyhow::Result<(String, String)> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(hostname.to_string())];

        info!(hostname, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 not offered for {}", identifier))?;

            if !is_valid_token(&challenge.token) {
                anyhow::bail!("ACME server sent an unusable challenge token");
            }

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "Setting up HTTP-01 challenge");
            self.publish_challenge(&challenge.token, key_auth.as_str())
                .await?;

            let outcome = self
                .await_authorization(&mut order, &challenge.url, &identifier)
                .await;

            self.retract_challenge(&challenge.token).await;
            outcome?;
        }

        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
                OrderStatus::Invalid => {
                    anyhow::bail!("Order invalid");
                }
            }
        }

        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();

            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        info!(hostname, "Certificate obtained successfully");
        Ok((cert_chain_pem, private_key.serialize_pem()))
    }

    /// Whether the store already holds a certificate that is not due for renewal
    fn has_valid_certificate(&self, hostname: &str) -> bool {
        match load_pair(&self.cert_root.join(hostname)) {
            Ok(Some((certs, _))) => certs
                .first()
                .map(|c| is_cert_valid_for_days(c, self.renew_before_days))
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!(hostname, error = %e, "Stored certificate unreadable, reissuing");
                false
            }
        }
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn ensure_certificate(&self, hostname: &str) -> anyhow::Result<()> {
        if self.has_valid_certificate(hostname) {
            debug!(hostname, "Certificate still valid, skipping issuance");
            return Ok(());
        }

        let (cert_pem, key_pem) = self.obtain_certificate(hostname).await?;
        save_pair(&self.cert_root, hostname, &cert_pem, &key_pem)?;
        Ok(())
    }
}

fn write_private(path: &Path, contents: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}

/// Validate and canonicalize the ACME account directory path
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("ACME account directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME account directory '{}': {}", path, e)
        })?;

        if !canonical.is_dir() {
            anyhow::bail!("ACME account path '{}' exists but is not a directory", path);
        }

        return Ok(canonical);
    }

    if let Some(parent) = path_buf.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(path_buf);
        }

        if parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| {
                anyhow::anyhow!("Failed to canonicalize parent directory: {}", e)
            })?;

            if let Some(file_name) = path_buf.file_name() {
                return Ok(canonical_parent.join(file_name));
            }
        }
    }

    // will fail later on create
    Ok(path_buf)
}
