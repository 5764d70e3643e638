//! Inbox admission
//!
//! Decides synchronously whether a delivered activity is accepted, then
//! hands accepted activities to the task queue.
//!
//! Checks run in a fixed order, and the first failure determines the
//! response:
//! 1. body is a JSON object with an `object` field (400)
//! 2. HTTP signature, unless the declared type is exempt (401)
//! 3. type is routable (404) and carries the fields its handler needs (400)
//! 4. queue accepts the task (503)

use std::sync::Arc;

use serde_json::Value;

use super::activity::{ActivityType, InboxActivity, is_signature_exempt, reference_id};
use super::queue::{InboxTask, TaskQueue};
use super::signature::{SignatureVerifier, SignedRequest};
use crate::data::Actor;
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FEDERATION_REQUESTS_TOTAL};

/// Admits inbound activities into the processing queue
pub struct ActivityRouter {
    verifier: Arc<dyn SignatureVerifier>,
    queue: Arc<dyn TaskQueue>,
}

impl ActivityRouter {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { verifier, queue }
    }

    /// Admit one delivery.
    ///
    /// `request.actor` is filled from the payload before verification.
    /// `recipient` is the local owner of a per-user inbox.
    ///
    /// # Errors
    /// - `Validation` for malformed payloads
    /// - `Unauthorized` for a failed signature on a non-exempt type
    /// - `UnsupportedActivity` for types without a handler
    /// - `QueueUnavailable` when the queue refuses the task
    pub async fn admit(
        &self,
        mut request: SignedRequest,
        recipient: Option<&Actor>,
    ) -> Result<(), AppError> {
        let payload: Value = serde_json::from_slice(&request.body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

        if !payload.is_object() {
            return Err(AppError::Validation(
                "Activity must be a JSON object".to_string(),
            ));
        }
        if payload.get("object").is_none() {
            return Err(AppError::Validation("Missing object field".to_string()));
        }

        let declared_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let type_label = ActivityType::parse(&declared_type)
            .map(|kind| kind.as_str())
            .unwrap_or("unknown");
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[type_label])
            .inc();

        request.actor = payload.get("actor").and_then(reference_id);
        if let Err(e) = self.verifier.verify(&request).await {
            if is_signature_exempt(&declared_type) {
                tracing::warn!(
                    activity = %declared_type,
                    actor = ?request.actor,
                    error = %e,
                    "Processing unverified activity"
                );
            } else {
                tracing::info!(
                    activity = %declared_type,
                    actor = ?request.actor,
                    error = %e,
                    "Rejecting activity with invalid signature"
                );
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["inbound", "unauthorized"])
                    .inc();
                return Err(AppError::Unauthorized);
            }
        }

        let activity = InboxActivity::decode(&payload)?;
        let task = InboxTask::new(activity, recipient.map(|actor| actor.id.clone()));
        tracing::debug!(activity = task.activity.kind(), "Activity admitted");
        self.queue.enqueue(task)?;

        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "success"])
            .inc();
        Ok(())
    }
}
