//! ActivityPub federation module
//!
//! Handles:
//! - Inbox admission (signature gate, routing)
//! - Activity processing by background workers
//! - HTTP Signatures
//! - Actor fetching and public key caching
//! - Activity delivery

mod activity;
mod actor;
mod delivery;
mod key_cache;
mod processor;
mod queue;
mod router;
mod signature;

pub use activity::{
    ActivityType, DeleteActivity, FavoriteActivity, FollowActivity, FollowReference,
    FollowResponseActivity, InboxActivity, SIGNATURE_EXEMPT_TYPES, UnfavoriteActivity,
    UndoReferenceActivity, UnfollowActivity, is_signature_exempt,
};
pub use actor::{
    ActorFetcher, ActorResolver, DestinationGuard, HttpActorFetcher, RemoteActorProfile,
    extract_actor_domain, federation_client,
};
pub use delivery::{
    ActivityDelivery, DeliveryJob, DeliverySink, RecordingDelivery, accept_follow_job,
};
pub use key_cache::PublicKeyCache;
pub use processor::{ActivityOutcome, InboxProcessor};
pub use queue::{ChannelQueue, InMemoryQueue, InboxTask, TaskQueue, WorkerPool};
pub use router::ActivityRouter;
pub use signature::{
    HttpSignatureVerifier, SignatureHeaders, SignatureVerifier, SignedRequest, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};

#[cfg(test)]
pub use signature::MockSignatureVerifier;
