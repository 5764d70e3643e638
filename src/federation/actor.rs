//! Remote actor discovery
//!
//! Fetches actor documents from origin servers and caches them as
//! `Actor` rows on first contact.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FederationConfig;
use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Strip the fragment from an actor or key URI
pub fn actor_uri(actor_or_key_id: &str) -> &str {
    actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id)
}

/// True if both URIs name the same actor, ignoring fragments
pub fn actor_matches(a: &str, b: &str) -> bool {
    actor_uri(a) == actor_uri(b)
}

/// Extract and validate remote actor domain from an actor URL or key ID URL.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(actor_uri(actor_or_key_id))
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Actor document fields this server keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActorProfile {
    pub id: String,
    pub preferred_username: String,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub manually_approves_followers: bool,
    /// `publicKey.id`
    pub public_key_id: Option<String>,
    /// `publicKey.publicKeyPem`
    pub public_key_pem: Option<String>,
}

impl RemoteActorProfile {
    /// Parse an ActivityPub actor document
    ///
    /// # Errors
    /// `Federation` if the document has no `id`
    pub fn from_document(document: &Value) -> Result<Self, AppError> {
        let field = |key: &str| document.get(key).and_then(Value::as_str).map(str::to_string);

        let id = field("id")
            .ok_or_else(|| AppError::Federation("Missing id in actor document".to_string()))?;
        let preferred_username = field("preferredUsername")
            .unwrap_or_else(|| id.rsplit('/').next().unwrap_or_default().to_string());
        let shared_inbox = document
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let public_key = document.get("publicKey");

        Ok(Self {
            preferred_username,
            inbox: field("inbox"),
            outbox: field("outbox"),
            shared_inbox,
            manually_approves_followers: document
                .get("manuallyApprovesFollowers")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            public_key_id: public_key
                .and_then(|key| key.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            public_key_pem: public_key
                .and_then(|key| key.get("publicKeyPem"))
                .and_then(Value::as_str)
                .map(str::to_string),
            id,
        })
    }

    /// Remote actor row for first contact
    pub fn into_actor(self) -> Actor {
        let now = Utc::now();
        Actor {
            id: EntityId::new().0,
            remote_id: self.id,
            username: self.preferred_username,
            local: false,
            inbox: self.inbox,
            outbox: self.outbox,
            shared_inbox: self.shared_inbox,
            manually_approves_followers: self.manually_approves_followers,
            public_key_pem: self.public_key_pem,
            private_key_pem: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Source of remote actor documents
#[async_trait]
pub trait ActorFetcher: Send + Sync {
    /// Fetch and parse the actor document at `actor_uri`
    async fn fetch_actor(&self, actor_uri: &str) -> Result<RemoteActorProfile, AppError>;
}

/// HTTP client for outbound federation traffic.
///
/// Redirects are never followed: every destination must pass
/// [`DestinationGuard::check`] and a redirect would skip it.
pub fn federation_client(config: &FederationConfig) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("fedireads/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.fetch_timeout_seconds))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}

/// Rejects outbound URLs that point at loopback or private networks
#[derive(Debug, Clone, Copy)]
pub struct DestinationGuard {
    allow_private_addresses: bool,
}

impl DestinationGuard {
    pub fn new(allow_private_addresses: bool) -> Self {
        Self {
            allow_private_addresses,
        }
    }

    /// # Errors
    /// `Forbidden` for local/private destinations, `Validation` for bad URLs
    pub async fn check(&self, url: &str) -> Result<(), AppError> {
        if self.allow_private_addresses {
            return Ok(());
        }

        // Resolve DNS before connecting and reject local/private destinations.
        let domain = extract_actor_domain(url)?;
        let port = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.port_or_known_default())
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&domain, port).await
    }
}

/// Fetches actor documents over HTTP with SSRF guards
pub struct HttpActorFetcher {
    http_client: Arc<reqwest::Client>,
    guard: DestinationGuard,
}

impl HttpActorFetcher {
    pub fn new(http_client: Arc<reqwest::Client>, guard: DestinationGuard) -> Self {
        Self { http_client, guard }
    }
}

#[async_trait]
impl ActorFetcher for HttpActorFetcher {
    async fn fetch_actor(&self, uri: &str) -> Result<RemoteActorProfile, AppError> {
        let url = actor_uri(uri);
        self.guard.check(url).await?;

        tracing::debug!(actor = %url, "Fetching remote actor");
        crate::metrics::FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", "actor_fetch"])
            .inc();

        let response = self
            .http_client
            .get(url)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch actor: HTTP {}",
                response.status()
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

        let profile = RemoteActorProfile::from_document(&document)?;
        if profile.id != url {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                profile.id, url
            )));
        }

        Ok(profile)
    }
}

/// Maps actor URIs to stored actors, fetching remote ones on first contact
#[derive(Clone)]
pub struct ActorResolver {
    db: Arc<Database>,
    fetcher: Arc<dyn ActorFetcher>,
}

impl ActorResolver {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn ActorFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Stored actor for `uri` without any remote fetch
    pub async fn find_cached(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        self.db.get_actor_by_remote_id(actor_uri(uri)).await
    }

    /// Local account addressed by `uri`
    ///
    /// # Errors
    /// `NotFound` unless `uri` names a local actor
    pub async fn resolve_local(&self, uri: &str) -> Result<Actor, AppError> {
        match self.find_cached(uri).await? {
            Some(actor) if actor.local => Ok(actor),
            _ => Err(AppError::NotFound),
        }
    }

    /// Stored actor for `uri`, fetching and caching it if unknown
    pub async fn resolve(&self, uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.find_cached(uri).await? {
            return Ok(actor);
        }

        let profile = self.fetcher.fetch_actor(uri).await?;
        let actor = self.db.insert_actor_if_absent(&profile.into_actor()).await?;
        tracing::info!(actor = %actor.remote_id, "Cached remote actor");
        Ok(actor)
    }
}
