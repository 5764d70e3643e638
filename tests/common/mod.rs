//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fedireads::data::{Actor, Database, EntityId, Status};
use fedireads::error::AppError;
use fedireads::federation::{
    ActivityRouter, ActorFetcher, ActorResolver, HttpSignatureVerifier, InboxProcessor,
    PublicKeyCache, RecordingDelivery, RemoteActorProfile, TaskQueue, WorkerPool, sign_request,
};
use fedireads::{AppState, config};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Domain the test instance believes it is served from
pub const LOCAL_DOMAIN: &str = "local.com";

/// Remote actor profiles served without touching the network
#[derive(Default)]
pub struct StubFetcher {
    profiles: Mutex<HashMap<String, RemoteActorProfile>>,
}

impl StubFetcher {
    pub fn insert(&self, profile: RemoteActorProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl ActorFetcher for StubFetcher {
    async fn fetch_actor(&self, actor_uri: &str) -> Result<RemoteActorProfile, AppError> {
        self.profiles
            .lock()
            .unwrap()
            .get(actor_uri)
            .cloned()
            .ok_or(AppError::NotFound)
    }
}

/// A remote identity with a signing key
pub struct RemoteIdentity {
    pub actor_id: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteIdentity {
    pub fn generate(actor_id: &str) -> Self {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        Self {
            actor_id: actor_id.to_string(),
            private_key_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_key_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_id)
    }

    pub fn profile(&self) -> RemoteActorProfile {
        RemoteActorProfile {
            id: self.actor_id.clone(),
            preferred_username: self
                .actor_id
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            inbox: Some(format!("{}/inbox", self.actor_id)),
            outbox: None,
            shared_inbox: None,
            manually_approves_followers: false,
            public_key_id: Some(self.key_id()),
            public_key_pem: Some(self.public_key_pem.clone()),
        }
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub fetcher: Arc<StubFetcher>,
    pub delivery: Arc<RecordingDelivery>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        federation: config::FederationConfig::default(),
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a test server running the full inbox pipeline
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Create a test server whose inbox admits into `queue` instead of the workers
    pub async fn with_queue(queue: Arc<dyn TaskQueue>) -> Self {
        Self::build(Some(queue)).await
    }

    async fn build(queue: Option<Arc<dyn TaskQueue>>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let db = Arc::new(Database::connect(&config.database.path).await.unwrap());
        let fetcher = Arc::new(StubFetcher::default());
        let delivery = Arc::new(RecordingDelivery::new());

        let keys = Arc::new(PublicKeyCache::new(
            db.clone(),
            fetcher.clone(),
            Some(Duration::from_secs(60)),
        ));
        let verifier = Arc::new(HttpSignatureVerifier::new(
            keys,
            config.federation.signature_max_age_seconds,
        ));

        let queue: Arc<dyn TaskQueue> = match queue {
            Some(queue) => queue,
            None => {
                let processor = Arc::new(InboxProcessor::new(
                    db.clone(),
                    ActorResolver::new(db.clone(), fetcher.clone()),
                    delivery.clone(),
                ));
                let (queue, _pool) = WorkerPool::spawn(processor, &config.federation);
                Arc::new(queue)
            }
        };

        let inbox = Arc::new(ActivityRouter::new(verifier, queue));
        let state = AppState::from_parts(config, db, inbox);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = fedireads::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            fetcher,
            delivery,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local user at `http://local.com/user/{username}`
    pub async fn create_local_user(&self, username: &str, manually_approves: bool) -> Actor {
        let remote_id = format!("http://{}/user/{}", LOCAL_DOMAIN, username);
        let identity = RemoteIdentity::generate(&remote_id);
        let now = Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            remote_id: remote_id.clone(),
            username: username.to_string(),
            local: true,
            inbox: Some(format!("{}/inbox", remote_id)),
            outbox: Some(format!("{}/outbox", remote_id)),
            shared_inbox: Some(format!("http://{}/inbox", LOCAL_DOMAIN)),
            manually_approves_followers: manually_approves,
            public_key_pem: Some(identity.public_key_pem),
            private_key_pem: Some(identity.private_key_pem),
            created_at: now,
            updated_at: now,
        };
        self.state.db.insert_actor(&actor).await.unwrap();
        actor
    }

    /// Generate a remote identity and make its profile fetchable
    pub fn remote_identity(&self, actor_id: &str) -> RemoteIdentity {
        let identity = RemoteIdentity::generate(actor_id);
        self.fetcher.insert(identity.profile());
        identity
    }

    /// Store a status owned by `owner`
    pub async fn create_status(&self, owner: &Actor, remote_id: &str) -> Status {
        let status = Status {
            id: EntityId::new().0,
            remote_id: remote_id.to_string(),
            actor_id: owner.id.clone(),
            content: "Three stars. The ending drags.".to_string(),
            local: owner.local,
            created_at: Utc::now(),
        };
        self.state.db.insert_status(&status).await.unwrap();
        status
    }

    /// POST an activity to `path`, signed by `signer` when given
    pub async fn post_activity(
        &self,
        path: &str,
        activity: &serde_json::Value,
        signer: Option<&RemoteIdentity>,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let mut request = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/activity+json");

        if let Some(signer) = signer {
            // Signed against the public host the instance is configured for.
            let public_url = format!("http://{}{}", LOCAL_DOMAIN, path);
            let headers = sign_request(
                "POST",
                &public_url,
                Some(&body),
                &signer.private_key_pem,
                &signer.key_id(),
            )
            .unwrap();
            request = request
                .header("Host", LOCAL_DOMAIN)
                .header("Date", headers.date)
                .header("Signature", headers.signature);
            if let Some(digest) = headers.digest {
                request = request.header("Digest", digest);
            }
        }

        request.body(body).send().await.unwrap()
    }

    /// Poll until `check` holds or give up after a few seconds
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}
