//! Activity delivery
//!
//! Handles delivering activities to remote servers.

use std::sync::{Arc, Mutex};

use super::actor::DestinationGuard;
use crate::data::{Actor, EntityId};
use crate::error::AppError;
use crate::metrics::DELIVERIES_TOTAL;

/// A signed POST of one activity to one inbox
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryJob {
    /// Target inbox URL
    pub inbox: String,
    pub activity: serde_json::Value,
    /// Key ID of the sending actor (actor#main-key)
    pub key_id: String,
    pub private_key_pem: String,
}

impl DeliveryJob {
    /// Job sending `activity` from a local actor to `inbox`
    ///
    /// # Errors
    /// `Internal` if the sender has no private key
    pub fn from_local(sender: &Actor, inbox: &str, activity: serde_json::Value) -> Result<Self, AppError> {
        let private_key_pem = sender.private_key_pem.clone().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Local actor {} has no private key",
                sender.remote_id
            ))
        })?;

        Ok(Self {
            inbox: inbox.to_string(),
            activity,
            key_id: sender.key_id(),
            private_key_pem,
        })
    }
}

/// Accepts outbound deliveries without waiting for them
pub trait DeliverySink: Send + Sync {
    /// Hand off a job; failures are logged, never returned
    fn submit(&self, job: DeliveryJob);
}

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
    guard: DestinationGuard,
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(http_client: Arc<reqwest::Client>, guard: DestinationGuard) -> Self {
        Self { http_client, guard }
    }

    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// Returns error if delivery fails (blocked target, network, signature, rejection)
    pub async fn deliver(&self, job: &DeliveryJob) -> Result<(), AppError> {
        // Inbox URLs come from remote actor documents.
        self.guard.check(&job.inbox).await?;

        let body = serde_json::to_vec(&job.activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let sig_headers = crate::federation::sign_request(
            "POST",
            &job.inbox,
            Some(&body),
            &job.private_key_pem,
            &job.key_id,
        )?;

        let mut request = self
            .http_client
            .post(&job.inbox)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", job.inbox, e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                job.inbox,
                response.status()
            )));
        }

        tracing::info!("Successfully delivered activity to {}", job.inbox);
        Ok(())
    }
}

impl DeliverySink for ActivityDelivery {
    fn submit(&self, job: DeliveryJob) {
        let delivery = self.clone();
        tokio::spawn(async move {
            match delivery.deliver(&job).await {
                Ok(()) => DELIVERIES_TOTAL.with_label_values(&["success"]).inc(),
                Err(e) => {
                    DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                    tracing::warn!(inbox = %job.inbox, error = %e, "Delivery failed");
                }
            }
        });
    }
}

/// Keeps submitted jobs in memory instead of sending them
#[derive(Default)]
pub struct RecordingDelivery {
    jobs: Mutex<Vec<DeliveryJob>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs submitted so far
    pub fn jobs(&self) -> Vec<DeliveryJob> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

impl DeliverySink for RecordingDelivery {
    fn submit(&self, job: DeliveryJob) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
    }
}

/// Accept for an auto-approved Follow, addressed to the follower's inbox
///
/// # Returns
/// `None` if the follower advertises no inbox.
pub fn accept_follow_job(
    accepter: &Actor,
    follower: &Actor,
    follow_id: Option<&str>,
) -> Result<Option<DeliveryJob>, AppError> {
    let Some(inbox) = follower.delivery_inbox() else {
        return Ok(None);
    };

    let accept_id = match follow_id {
        Some(id) => format!("{}#accepts", id),
        None => format!("{}#accepts/follows/{}", accepter.remote_id, EntityId::new().0),
    };
    let mut follow = builder::follow(follow_id, &follower.remote_id, &accepter.remote_id);
    if let Some(object) = follow.as_object_mut() {
        object.remove("@context");
    }

    let activity = builder::accept(&accept_id, &accepter.remote_id, follow);
    DeliveryJob::from_local(accepter, inbox, activity).map(Some)
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID, when the Follow has one
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: Option<&str>, actor: &str, object: &str) -> Value {
        let mut activity = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "actor": actor,
            "object": object
        });
        if let (Some(id), Some(map)) = (id, activity.as_object_mut()) {
            map.insert("id".to_string(), Value::from(id));
        }
        activity
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
