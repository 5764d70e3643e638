//! Inbound activity model
//!
//! Incoming JSON is decoded into a closed set of variants, one per
//! activity this inbox acts on. Each variant carries only the fields its
//! handler needs, and decoding fails if any of them are absent.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::actor::actor_matches;
use crate::error::AppError;

/// ActivityPub activity types this inbox routes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Accept,
    Reject,
    Like,
    Create,
    Delete,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Like" => Some(Self::Like),
            "Create" => Some(Self::Create),
            "Delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Like => "Like",
            Self::Create => "Create",
            Self::Delete => "Delete",
        }
    }
}

/// Declared types processed even when signature verification fails.
///
/// Undoing or deleting something we no longer need to protect is low risk,
/// and the origin server may already have discarded the signing key.
pub const SIGNATURE_EXEMPT_TYPES: &[&str] = &["Undo", "Delete"];

/// Return true if `declared_type` may bypass a failed signature check
pub fn is_signature_exempt(declared_type: &str) -> bool {
    SIGNATURE_EXEMPT_TYPES.contains(&declared_type)
}

/// A Follow, top-level or embedded in Undo/Accept/Reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowActivity {
    /// Follow activity URI
    pub id: Option<String>,
    /// Requesting actor URI
    pub actor: String,
    /// Target actor URI
    pub object: String,
}

/// How a wrapping activity points at the Follow it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowReference {
    /// Full Follow object with actor and object
    Embedded(FollowActivity),
    /// Only the Follow activity URI
    Id(String),
}

impl FollowReference {
    /// Follow activity URI, if known
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Embedded(follow) => follow.id.as_deref(),
            Self::Id(id) => Some(id),
        }
    }
}

/// Undo of a Follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfollowActivity {
    pub id: Option<String>,
    /// Undoing actor, when the top-level activity names one
    pub actor: Option<String>,
    pub follow: FollowReference,
}

/// Accept or Reject of a Follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowResponseActivity {
    pub id: Option<String>,
    /// Responding actor, expected to be the Follow's object
    pub actor: Option<String>,
    pub follow: FollowReference,
}

/// A Like of a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteActivity {
    /// Like activity URI, the natural key of the favorite
    pub id: String,
    pub actor: String,
    /// Liked status URI
    pub object: String,
    pub published: Option<DateTime<Utc>>,
}

/// Undo of a Like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfavoriteActivity {
    pub id: Option<String>,
    pub actor: String,
    /// URI of the Like being undone
    pub like_id: String,
}

/// Undo whose object is a bare activity URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoReferenceActivity {
    pub id: Option<String>,
    pub actor: Option<String>,
    /// URI of the undone activity (Follow or Like)
    pub object: String,
}

/// Delete of a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteActivity {
    pub id: Option<String>,
    pub actor: Option<String>,
    /// URI of the deleted object
    pub object: String,
}

/// Decoded inbox activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxActivity {
    Follow(FollowActivity),
    Unfollow(UnfollowActivity),
    Unfavorite(UnfavoriteActivity),
    UndoReference(UndoReferenceActivity),
    Accept(FollowResponseActivity),
    Reject(FollowResponseActivity),
    Favorite(FavoriteActivity),
    Delete(DeleteActivity),
}

impl InboxActivity {
    /// Decode a raw activity document.
    ///
    /// # Errors
    /// - `Validation` if `type`/`object` or a field the variant needs is missing
    /// - `UnsupportedActivity` if the type (or the wrapped type) has no handler
    pub fn decode(value: &Value) -> Result<Self, AppError> {
        let declared_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        let activity_type = ActivityType::parse(declared_type)
            .ok_or_else(|| AppError::UnsupportedActivity(declared_type.to_string()))?;

        let object = value
            .get("object")
            .ok_or_else(|| AppError::Validation("Missing object field".to_string()))?;

        let id = string_field(value, "id");
        let actor = value.get("actor").and_then(reference_id);

        match activity_type {
            ActivityType::Follow => Ok(Self::Follow(decode_follow(value)?)),
            ActivityType::Undo => decode_undo(id, actor, object),
            ActivityType::Accept => Ok(Self::Accept(FollowResponseActivity {
                id,
                actor,
                follow: decode_follow_reference(object, "Accept")?,
            })),
            ActivityType::Reject => Ok(Self::Reject(FollowResponseActivity {
                id,
                actor,
                follow: decode_follow_reference(object, "Reject")?,
            })),
            ActivityType::Like => Ok(Self::Favorite(decode_favorite(value, None)?)),
            ActivityType::Create => {
                if object_type(object) != Some("Like") {
                    return Err(AppError::UnsupportedActivity(format!(
                        "Create({})",
                        object_type(object).unwrap_or("unknown")
                    )));
                }
                Ok(Self::Favorite(decode_favorite(object, actor.as_deref())?))
            }
            ActivityType::Delete => {
                let target = delete_target(object)
                    .ok_or_else(|| AppError::Validation("Invalid object in Delete".to_string()))?;
                Ok(Self::Delete(DeleteActivity {
                    id,
                    actor,
                    object: target,
                }))
            }
        }
    }

    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Follow(_) => "Follow",
            Self::Unfollow(_) => "Undo(Follow)",
            Self::Unfavorite(_) => "Undo(Like)",
            Self::UndoReference(_) => "Undo",
            Self::Accept(_) => "Accept",
            Self::Reject(_) => "Reject",
            Self::Favorite(_) => "Like",
            Self::Delete(_) => "Delete",
        }
    }
}

/// Id of an object reference: a bare URI or an embedded object's `id`
pub fn reference_id(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
        .map(str::to_string)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn object_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn required_reference(value: &Value, key: &str, context: &str) -> Result<String, AppError> {
    value
        .get(key)
        .and_then(reference_id)
        .ok_or_else(|| AppError::Validation(format!("Missing {} in {}", key, context)))
}

fn decode_follow(value: &Value) -> Result<FollowActivity, AppError> {
    Ok(FollowActivity {
        id: string_field(value, "id"),
        actor: required_reference(value, "actor", "Follow")?,
        object: required_reference(value, "object", "Follow")?,
    })
}

fn decode_follow_reference(object: &Value, wrapper: &str) -> Result<FollowReference, AppError> {
    if let Some(id) = object.as_str() {
        return Ok(FollowReference::Id(id.to_string()));
    }

    match object_type(object) {
        Some("Follow") => Ok(FollowReference::Embedded(decode_follow(object)?)),
        Some(other) => Err(AppError::UnsupportedActivity(format!(
            "{}({})",
            wrapper, other
        ))),
        None => object
            .get("id")
            .and_then(Value::as_str)
            .map(|id| FollowReference::Id(id.to_string()))
            .ok_or_else(|| AppError::Validation(format!("Invalid object in {}", wrapper))),
    }
}

fn decode_undo(
    id: Option<String>,
    actor: Option<String>,
    object: &Value,
) -> Result<InboxActivity, AppError> {
    if let Some(reference) = object.as_str() {
        return Ok(InboxActivity::UndoReference(UndoReferenceActivity {
            id,
            actor,
            object: reference.to_string(),
        }));
    }

    match object_type(object) {
        Some("Follow") => Ok(InboxActivity::Unfollow(UnfollowActivity {
            id,
            actor,
            follow: FollowReference::Embedded(decode_follow(object)?),
        })),
        Some("Like") => {
            let like_id = string_field(object, "id")
                .ok_or_else(|| AppError::Validation("Missing id in undone Like".to_string()))?;
            let actor = actor
                .or_else(|| object.get("actor").and_then(reference_id))
                .ok_or_else(|| AppError::Validation("Missing actor in Undo".to_string()))?;
            Ok(InboxActivity::Unfavorite(UnfavoriteActivity {
                id,
                actor,
                like_id,
            }))
        }
        Some(other) => Err(AppError::UnsupportedActivity(format!("Undo({})", other))),
        None => {
            let reference = string_field(object, "id")
                .ok_or_else(|| AppError::Validation("Invalid object in Undo".to_string()))?;
            Ok(InboxActivity::UndoReference(UndoReferenceActivity {
                id,
                actor,
                object: reference,
            }))
        }
    }
}

/// `signer` is the actor of a wrapping Create; the favorite is always theirs.
fn decode_favorite(value: &Value, signer: Option<&str>) -> Result<FavoriteActivity, AppError> {
    let id = string_field(value, "id")
        .ok_or_else(|| AppError::Validation("Missing id in Like".to_string()))?;
    let inner_actor = value.get("actor").and_then(reference_id);
    let actor = match (signer, inner_actor) {
        (Some(signer), Some(inner)) if !actor_matches(signer, &inner) => {
            return Err(AppError::Validation(
                "Like actor does not match Create actor".to_string(),
            ));
        }
        (Some(signer), _) => signer.to_string(),
        (None, Some(inner)) => inner,
        (None, None) => {
            return Err(AppError::Validation("Missing actor in Like".to_string()));
        }
    };
    let object = required_reference(value, "object", "Like")?;
    let published = value
        .get("published")
        .and_then(Value::as_str)
        .and_then(parse_published);

    Ok(FavoriteActivity {
        id,
        actor,
        object,
        published,
    })
}

fn delete_target(object: &Value) -> Option<String> {
    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    if object_type(object).is_some_and(|kind| kind.eq_ignore_ascii_case("Tombstone")) {
        return object
            .get("object")
            .and_then(Value::as_str)
            .or_else(|| object.get("id").and_then(Value::as_str))
            .map(str::to_string);
    }

    object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse `published` in RFC 3339 or RFC 2822 (`Mon, 25 May 2020 19:31:20 GMT`)
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_follow_with_string_target() {
        let activity = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/users/rat/follows/123",
            "type": "Follow",
            "actor": "https://example.com/users/rat",
            "object": "http://local.com/user/mouse"
        });

        assert_eq!(
            InboxActivity::decode(&activity).unwrap(),
            InboxActivity::Follow(FollowActivity {
                id: Some("https://example.com/users/rat/follows/123".to_string()),
                actor: "https://example.com/users/rat".to_string(),
                object: "http://local.com/user/mouse".to_string(),
            })
        );
    }

    #[test]
    fn decode_follow_accepts_embedded_actor_and_object() {
        let activity = json!({
            "type": "Follow",
            "actor": { "id": "https://example.com/users/rat", "type": "Person" },
            "object": { "id": "http://local.com/user/mouse" }
        });

        let InboxActivity::Follow(follow) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Follow");
        };
        assert_eq!(follow.actor, "https://example.com/users/rat");
        assert_eq!(follow.object, "http://local.com/user/mouse");
        assert_eq!(follow.id, None);
    }

    #[test]
    fn decode_follow_without_actor_is_malformed() {
        let activity = json!({ "type": "Follow", "object": "http://local.com/user/mouse" });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::Validation(msg)) if msg.contains("actor")
        ));
    }

    #[test]
    fn decode_rejects_missing_object() {
        let activity = json!({ "type": "Follow", "actor": "https://example.com/users/rat" });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::Validation(msg)) if msg.contains("object")
        ));
    }

    #[test]
    fn decode_unknown_type_is_unsupported() {
        let activity = json!({ "type": "Fish", "object": "exists" });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::UnsupportedActivity(kind)) if kind == "Fish"
        ));
    }

    #[test]
    fn decode_undo_follow_without_top_level_actor() {
        let activity = json!({
            "type": "Undo",
            "@context": "https://www.w3.org/ns/activitystreams",
            "object": {
                "id": "https://example.com/users/rat/follows/123",
                "type": "Follow",
                "actor": "https://example.com/users/rat",
                "object": "http://local.com/user/mouse"
            }
        });

        let InboxActivity::Unfollow(undo) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Unfollow");
        };
        assert_eq!(undo.actor, None);
        assert_eq!(
            undo.follow.remote_id(),
            Some("https://example.com/users/rat/follows/123")
        );
    }

    #[test]
    fn decode_undo_like_uses_nested_actor_as_fallback() {
        let activity = json!({
            "type": "Undo",
            "object": {
                "id": "http://example.com/fav/1",
                "type": "Like",
                "actor": "https://example.com/users/rat",
                "object": "http://local.com/status/1"
            }
        });

        assert_eq!(
            InboxActivity::decode(&activity).unwrap(),
            InboxActivity::Unfavorite(UnfavoriteActivity {
                id: None,
                actor: "https://example.com/users/rat".to_string(),
                like_id: "http://example.com/fav/1".to_string(),
            })
        );
    }

    #[test]
    fn decode_undo_of_announce_is_unsupported() {
        let activity = json!({
            "type": "Undo",
            "actor": "https://example.com/users/rat",
            "object": { "id": "https://example.com/boosts/1", "type": "Announce" }
        });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::UnsupportedActivity(kind)) if kind == "Undo(Announce)"
        ));
    }

    #[test]
    fn decode_accept_with_bare_follow_id() {
        let activity = json!({ "type": "Accept", "object": "exists" });
        assert_eq!(
            InboxActivity::decode(&activity).unwrap(),
            InboxActivity::Accept(FollowResponseActivity {
                id: None,
                actor: None,
                follow: FollowReference::Id("exists".to_string()),
            })
        );
    }

    #[test]
    fn decode_reject_with_embedded_follow() {
        let activity = json!({
            "id": "https://example.com/users/rat/follows/123#accepts",
            "type": "Reject",
            "actor": "https://example.com/users/rat",
            "object": {
                "id": "https://example.com/users/rat/follows/123",
                "type": "Follow",
                "actor": "http://local.com/user/mouse",
                "object": "https://example.com/users/rat"
            }
        });

        let InboxActivity::Reject(reject) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Reject");
        };
        assert_eq!(reject.actor.as_deref(), Some("https://example.com/users/rat"));
        let FollowReference::Embedded(follow) = reject.follow else {
            panic!("expected embedded follow");
        };
        assert_eq!(follow.actor, "http://local.com/user/mouse");
    }

    #[test]
    fn decode_like_parses_rfc2822_published() {
        let activity = json!({
            "id": "http://example.com/fav/1",
            "type": "Like",
            "actor": "https://example.com/users/rat",
            "published": "Mon, 25 May 2020 19:31:20 GMT",
            "object": "http://local.com/status/1"
        });

        let InboxActivity::Favorite(favorite) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Favorite");
        };
        assert_eq!(
            favorite.published.map(|p| p.to_rfc3339()),
            Some("2020-05-25T19:31:20+00:00".to_string())
        );
    }

    #[test]
    fn decode_like_without_id_is_malformed() {
        let activity = json!({
            "type": "Like",
            "actor": "https://example.com/users/rat",
            "object": "http://local.com/status/1"
        });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn decode_create_wrapping_like_is_a_favorite() {
        let activity = json!({
            "type": "Create",
            "actor": "https://example.com/users/rat",
            "object": {
                "id": "http://example.com/fav/2",
                "type": "Like",
                "object": "http://local.com/status/1"
            }
        });

        let InboxActivity::Favorite(favorite) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Favorite");
        };
        assert_eq!(favorite.actor, "https://example.com/users/rat");
        assert_eq!(favorite.id, "http://example.com/fav/2");
    }

    #[test]
    fn decode_create_credits_the_create_actor() {
        let activity = json!({
            "type": "Create",
            "actor": "https://example.com/users/rat",
            "object": {
                "id": "http://example.com/fav/3",
                "type": "Like",
                "actor": "https://example.com/users/rat#main-key",
                "object": "http://local.com/status/1"
            }
        });

        let InboxActivity::Favorite(favorite) = InboxActivity::decode(&activity).unwrap() else {
            panic!("expected Favorite");
        };
        assert_eq!(favorite.actor, "https://example.com/users/rat");
    }

    #[test]
    fn decode_create_rejects_like_by_another_actor() {
        let activity = json!({
            "type": "Create",
            "actor": "https://example.com/users/mallory",
            "object": {
                "id": "http://example.com/fav/4",
                "type": "Like",
                "actor": "https://example.com/users/rat",
                "object": "http://local.com/status/1"
            }
        });

        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn decode_create_note_is_unsupported() {
        let activity = json!({
            "type": "Create",
            "actor": "https://example.com/users/rat",
            "object": { "id": "https://example.com/notes/1", "type": "Note" }
        });
        assert!(matches!(
            InboxActivity::decode(&activity),
            Err(AppError::UnsupportedActivity(kind)) if kind == "Create(Note)"
        ));
    }

    #[test]
    fn decode_delete_accepts_tombstone_and_bare_uri() {
        let tombstone = json!({
            "type": "Delete",
            "actor": "https://example.com/users/rat",
            "object": { "type": "Tombstone", "id": "https://example.com/status/9" }
        });
        let bare = json!({ "type": "Delete", "object": "exists" });

        let InboxActivity::Delete(delete) = InboxActivity::decode(&tombstone).unwrap() else {
            panic!("expected Delete");
        };
        assert_eq!(delete.object, "https://example.com/status/9");

        let InboxActivity::Delete(delete) = InboxActivity::decode(&bare).unwrap() else {
            panic!("expected Delete");
        };
        assert_eq!(delete.object, "exists");
        assert_eq!(delete.actor, None);
    }

    #[test]
    fn only_undo_and_delete_are_signature_exempt() {
        assert!(is_signature_exempt("Undo"));
        assert!(is_signature_exempt("Delete"));
        for kind in ["Follow", "Accept", "Reject", "Like", "Create", "Test", ""] {
            assert!(!is_signature_exempt(kind), "{kind} must not be exempt");
        }
    }
}
