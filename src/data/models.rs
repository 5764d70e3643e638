//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local account or a cached remote identity
///
/// `remote_id` is the ActivityPub actor URI and is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// ActivityPub actor URI
    pub remote_id: String,
    /// preferredUsername for remote actors, account name for local ones
    pub username: String,
    /// true if this actor is hosted on this instance
    pub local: bool,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub shared_inbox: Option<String>,
    /// Follow requests must be approved before an edge is created
    pub manually_approves_followers: bool,
    /// RSA public key (PEM format)
    pub public_key_pem: Option<String>,
    /// RSA private key (PEM format), local actors only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Key ID used when signing requests on behalf of this actor
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.remote_id)
    }

    /// Preferred delivery target for this actor
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.shared_inbox.as_deref().or(self.inbox.as_deref())
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// A pending follow proposal (subject asks to follow object)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRequest {
    pub id: String,
    /// ActivityPub Follow activity URI
    pub remote_id: Option<String>,
    pub subject_id: String,
    pub object_id: String,
    pub created_at: DateTime<Utc>,
}

/// An established follow edge (subject follows object)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub id: String,
    /// ActivityPub Follow activity URI that led to this edge
    pub remote_id: Option<String>,
    pub subject_id: String,
    pub object_id: String,
    pub created_at: DateTime<Utc>,
}

/// Relationship state for an ordered actor pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipState {
    None,
    Requested,
    Followed,
}

// =============================================================================
// Content
// =============================================================================

/// A review, comment or other content item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub object URI (globally unique)
    pub remote_id: String,
    /// Owner of this status
    pub actor_id: String,
    /// HTML content
    pub content: String,
    /// true if authored on this instance
    pub local: bool,
    pub created_at: DateTime<Utc>,
}

/// A favorite received for a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Favorite {
    pub id: String,
    /// Like activity URI (globally unique)
    pub remote_id: String,
    pub status_id: String,
    pub actor_id: String,
    /// When the remote actor says the favorite happened
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notification
// =============================================================================

/// Notification for a local actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    /// Local actor receiving this notification
    pub recipient_id: String,
    /// Type: FOLLOW, FOLLOW_REQUEST, FAVORITE
    pub notification_type: String,
    /// Who triggered this notification
    pub related_actor_id: Option<String>,
    /// Related status (if applicable)
    pub related_status_id: Option<String>,
    /// Whether the recipient has seen this
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Build an unread notification
    pub fn new(
        recipient_id: &str,
        notification_type: NotificationType,
        related_actor_id: Option<&str>,
        related_status_id: Option<&str>,
    ) -> Self {
        Self {
            id: EntityId::new().0,
            recipient_id: recipient_id.to_string(),
            notification_type: notification_type.as_str().to_string(),
            related_actor_id: related_actor_id.map(str::to_string),
            related_status_id: related_status_id.map(str::to_string),
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Notification types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Follow,
    FollowRequest,
    Favorite,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "FOLLOW",
            Self::FollowRequest => "FOLLOW_REQUEST",
            Self::Favorite => "FAVORITE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FOLLOW" => Some(Self::Follow),
            "FOLLOW_REQUEST" => Some(Self::FollowRequest),
            "FAVORITE" => Some(Self::Favorite),
            _ => None,
        }
    }
}
