//! Inbox activity handlers
//!
//! Applies decoded activities to the social graph. Every handler is
//! idempotent: redelivering an activity leaves storage and notifications
//! exactly as the first delivery did.

use chrono::Utc;
use std::sync::Arc;

use super::activity::{
    DeleteActivity, FavoriteActivity, FollowActivity, FollowReference, FollowResponseActivity,
    InboxActivity, UnfavoriteActivity, UndoReferenceActivity, UnfollowActivity,
};
use super::actor::{ActorResolver, actor_matches};
use super::delivery::{DeliverySink, accept_follow_job};
use super::queue::InboxTask;
use crate::data::{
    Actor, Database, EntityId, Favorite, FollowEdge, FollowRequest, Notification, NotificationType,
    RelationshipState,
};
use crate::error::AppError;
use crate::metrics::INBOX_TASKS_TOTAL;

/// What applying an activity did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// State changed
    Applied,
    /// The activity had already been applied
    Duplicate,
    /// Nothing to act on (stale, unknown, or not permitted)
    Ignored,
}

impl ActivityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
        }
    }
}

/// Applies inbox activities
pub struct InboxProcessor {
    db: Arc<Database>,
    actors: ActorResolver,
    delivery: Arc<dyn DeliverySink>,
}

impl InboxProcessor {
    pub fn new(db: Arc<Database>, actors: ActorResolver, delivery: Arc<dyn DeliverySink>) -> Self {
        Self {
            db,
            actors,
            delivery,
        }
    }

    /// Apply a queued task, logging the result
    pub async fn process(&self, task: InboxTask) {
        let kind = task.activity.kind();
        let waited_ms = task.waited_ms();
        let outcome = match self.apply(&task.activity).await {
            Ok(outcome) => {
                tracing::debug!(
                    activity = kind,
                    outcome = outcome.as_str(),
                    recipient = ?task.recipient_id,
                    waited_ms,
                    "Inbox task finished"
                );
                outcome.as_str()
            }
            Err(AppError::NotFound) => {
                tracing::warn!(activity = kind, waited_ms, "Inbox task references unknown object");
                "not_found"
            }
            Err(e) => {
                tracing::error!(activity = kind, waited_ms, error = %e, "Inbox task failed");
                "error"
            }
        };

        INBOX_TASKS_TOTAL.with_label_values(&[kind, outcome]).inc();
    }

    /// Dispatch an activity to its handler
    pub async fn apply(&self, activity: &InboxActivity) -> Result<ActivityOutcome, AppError> {
        match activity {
            InboxActivity::Follow(follow) => self.handle_follow(follow).await,
            InboxActivity::Unfollow(undo) => self.handle_unfollow(undo).await,
            InboxActivity::Unfavorite(undo) => self.handle_unfavorite(undo).await,
            InboxActivity::UndoReference(undo) => self.handle_undo_reference(undo).await,
            InboxActivity::Accept(accept) => self.handle_follow_accept(accept).await,
            InboxActivity::Reject(reject) => self.handle_follow_reject(reject).await,
            InboxActivity::Favorite(like) => self.handle_favorite(like).await,
            InboxActivity::Delete(delete) => self.handle_delete(delete).await,
        }
    }

    /// A remote actor asks to follow a local one.
    ///
    /// # Errors
    /// `NotFound` if the target is not a local actor
    pub async fn handle_follow(&self, follow: &FollowActivity) -> Result<ActivityOutcome, AppError> {
        let object = self.actors.resolve_local(&follow.object).await?;
        let subject = self.actors.resolve(&follow.actor).await?;

        if subject.id == object.id {
            tracing::warn!(actor = %subject.remote_id, "Ignoring self-follow");
            return Ok(ActivityOutcome::Ignored);
        }

        if self.db.get_relationship(&subject.id, &object.id).await? == RelationshipState::Followed {
            return Ok(ActivityOutcome::Duplicate);
        }

        if object.manually_approves_followers {
            let request = FollowRequest {
                id: EntityId::new().0,
                remote_id: follow.id.clone(),
                subject_id: subject.id.clone(),
                object_id: object.id.clone(),
                created_at: Utc::now(),
            };
            let notification = Notification::new(
                &object.id,
                NotificationType::FollowRequest,
                Some(&subject.id),
                None,
            );

            if !self.db.record_follow_request(&request, &notification).await? {
                return Ok(ActivityOutcome::Duplicate);
            }

            tracing::info!(
                subject = %subject.remote_id,
                object = %object.remote_id,
                "Follow request pending approval"
            );
            return Ok(ActivityOutcome::Applied);
        }

        let edge = FollowEdge {
            id: EntityId::new().0,
            remote_id: follow.id.clone(),
            subject_id: subject.id.clone(),
            object_id: object.id.clone(),
            created_at: Utc::now(),
        };
        let notification =
            Notification::new(&object.id, NotificationType::Follow, Some(&subject.id), None);

        if !self.db.record_follow(&edge, Some(&notification)).await? {
            return Ok(ActivityOutcome::Duplicate);
        }

        tracing::info!(
            subject = %subject.remote_id,
            object = %object.remote_id,
            "Follow accepted automatically"
        );
        self.send_accept(&object, &subject, follow.id.as_deref());
        Ok(ActivityOutcome::Applied)
    }

    /// The follower withdraws a follow or pending request.
    pub async fn handle_unfollow(
        &self,
        undo: &UnfollowActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let follow = match &undo.follow {
            FollowReference::Embedded(follow) => follow,
            FollowReference::Id(id) => {
                return self.undo_follow_by_remote_id(id, undo.actor.as_deref()).await;
            }
        };

        if let Some(actor) = undo.actor.as_deref() {
            if !actor_matches(actor, &follow.actor) {
                tracing::warn!(
                    actor = %actor,
                    follower = %follow.actor,
                    "Ignoring Undo of a Follow sent by another actor"
                );
                return Ok(ActivityOutcome::Ignored);
            }
        }

        let (Some(subject), Some(object)) = (
            self.actors.find_cached(&follow.actor).await?,
            self.actors.find_cached(&follow.object).await?,
        ) else {
            return Ok(ActivityOutcome::Ignored);
        };

        self.remove_follow(&subject, &object).await
    }

    /// The target of a local actor's follow request approves it.
    pub async fn handle_follow_accept(
        &self,
        accept: &FollowResponseActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let Some(request) = self.find_follow_request(accept).await? else {
            tracing::debug!(
                follow = ?accept.follow.remote_id(),
                "Accept for unknown follow request"
            );
            return Ok(ActivityOutcome::Ignored);
        };

        if self.db.accept_follow_request(&request).await? {
            tracing::info!(request = %request.id, "Follow request accepted");
            Ok(ActivityOutcome::Applied)
        } else {
            Ok(ActivityOutcome::Duplicate)
        }
    }

    /// The target of a local actor's follow request declines it.
    pub async fn handle_follow_reject(
        &self,
        reject: &FollowResponseActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let Some(request) = self.find_follow_request(reject).await? else {
            tracing::debug!(
                follow = ?reject.follow.remote_id(),
                "Reject for unknown follow request"
            );
            return Ok(ActivityOutcome::Ignored);
        };

        if self.db.reject_follow_request(&request.id).await? {
            tracing::info!(request = %request.id, "Follow request rejected");
            Ok(ActivityOutcome::Applied)
        } else {
            Ok(ActivityOutcome::Duplicate)
        }
    }

    /// A remote actor likes a known status.
    ///
    /// # Errors
    /// `NotFound` if the status is unknown
    pub async fn handle_favorite(
        &self,
        like: &FavoriteActivity,
    ) -> Result<ActivityOutcome, AppError> {
        if self.db.favorite_exists(&like.id).await? {
            return Ok(ActivityOutcome::Duplicate);
        }

        let status = self
            .db
            .get_status_by_remote_id(&like.object)
            .await?
            .ok_or(AppError::NotFound)?;
        let actor = self.actors.resolve(&like.actor).await?;

        let now = Utc::now();
        let favorite = Favorite {
            id: EntityId::new().0,
            remote_id: like.id.clone(),
            status_id: status.id.clone(),
            actor_id: actor.id.clone(),
            published_at: like.published.unwrap_or(now),
            created_at: now,
        };

        let owner = self.db.get_actor(&status.actor_id).await?;
        let notification = owner
            .filter(|owner| owner.local && owner.id != actor.id)
            .map(|owner| {
                Notification::new(
                    &owner.id,
                    NotificationType::Favorite,
                    Some(&actor.id),
                    Some(&status.id),
                )
            });

        if !self
            .db
            .record_favorite(&favorite, notification.as_ref())
            .await?
        {
            return Ok(ActivityOutcome::Duplicate);
        }

        tracing::info!(actor = %actor.remote_id, status = %status.remote_id, "Status favorited");
        Ok(ActivityOutcome::Applied)
    }

    /// A remote actor withdraws a like.
    pub async fn handle_unfavorite(
        &self,
        undo: &UnfavoriteActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let Some(actor) = self.actors.find_cached(&undo.actor).await? else {
            return Ok(ActivityOutcome::Ignored);
        };

        if self.db.delete_favorite(&undo.like_id, &actor.id).await? {
            tracing::info!(actor = %actor.remote_id, like = %undo.like_id, "Favorite removed");
            Ok(ActivityOutcome::Applied)
        } else {
            Ok(ActivityOutcome::Ignored)
        }
    }

    /// Undo naming only the undone activity's URI.
    ///
    /// The URI is matched against stored follows first, then favorites.
    pub async fn handle_undo_reference(
        &self,
        undo: &UndoReferenceActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let outcome = self
            .undo_follow_by_remote_id(&undo.object, undo.actor.as_deref())
            .await?;
        if outcome != ActivityOutcome::Ignored {
            return Ok(outcome);
        }

        let Some(favorite) = self.db.get_favorite_by_remote_id(&undo.object).await? else {
            return Ok(ActivityOutcome::Ignored);
        };
        if !self.sent_by(undo.actor.as_deref(), &favorite.actor_id).await? {
            return Ok(ActivityOutcome::Ignored);
        }

        if self
            .db
            .delete_favorite(&favorite.remote_id, &favorite.actor_id)
            .await?
        {
            Ok(ActivityOutcome::Applied)
        } else {
            Ok(ActivityOutcome::Ignored)
        }
    }

    /// A remote actor deletes one of its statuses.
    pub async fn handle_delete(
        &self,
        delete: &DeleteActivity,
    ) -> Result<ActivityOutcome, AppError> {
        let Some(actor_uri) = delete.actor.as_deref() else {
            tracing::debug!(object = %delete.object, "Delete without actor");
            return Ok(ActivityOutcome::Ignored);
        };
        let Some(actor) = self.actors.find_cached(actor_uri).await? else {
            return Ok(ActivityOutcome::Ignored);
        };

        if self.db.delete_remote_status(&delete.object, &actor.id).await? {
            tracing::info!(actor = %actor.remote_id, status = %delete.object, "Remote status deleted");
            Ok(ActivityOutcome::Applied)
        } else {
            Ok(ActivityOutcome::Ignored)
        }
    }

    async fn remove_follow(
        &self,
        subject: &Actor,
        object: &Actor,
    ) -> Result<ActivityOutcome, AppError> {
        let removed = self.db.remove_follow(&subject.id, &object.id).await?;
        if !removed.removed_anything() {
            return Ok(ActivityOutcome::Ignored);
        }

        tracing::info!(
            subject = %subject.remote_id,
            object = %object.remote_id,
            edge = removed.edge_removed,
            request = removed.request_removed,
            "Follow undone"
        );
        Ok(ActivityOutcome::Applied)
    }

    async fn undo_follow_by_remote_id(
        &self,
        follow_id: &str,
        actor: Option<&str>,
    ) -> Result<ActivityOutcome, AppError> {
        let pair = match self.db.get_follow_by_remote_id(follow_id).await? {
            Some(edge) => Some((edge.subject_id, edge.object_id)),
            None => self
                .db
                .get_follow_request_by_remote_id(follow_id)
                .await?
                .map(|request| (request.subject_id, request.object_id)),
        };
        let Some((subject_id, object_id)) = pair else {
            return Ok(ActivityOutcome::Ignored);
        };

        if !self.sent_by(actor, &subject_id).await? {
            tracing::warn!(follow = %follow_id, "Ignoring Undo of a Follow sent by another actor");
            return Ok(ActivityOutcome::Ignored);
        }

        let (Some(subject), Some(object)) = (
            self.db.get_actor(&subject_id).await?,
            self.db.get_actor(&object_id).await?,
        ) else {
            return Ok(ActivityOutcome::Ignored);
        };

        self.remove_follow(&subject, &object).await
    }

    /// True if `actor` is absent or is the stored actor `actor_id`
    async fn sent_by(&self, actor: Option<&str>, actor_id: &str) -> Result<bool, AppError> {
        let Some(actor) = actor else {
            return Ok(true);
        };
        Ok(self
            .db
            .get_actor(actor_id)
            .await?
            .is_some_and(|stored| actor_matches(actor, &stored.remote_id)))
    }

    async fn find_follow_request(
        &self,
        response: &FollowResponseActivity,
    ) -> Result<Option<FollowRequest>, AppError> {
        let request = match &response.follow {
            FollowReference::Embedded(follow) => {
                if let Some(actor) = response.actor.as_deref() {
                    if !actor_matches(actor, &follow.object) {
                        tracing::warn!(
                            actor = %actor,
                            object = %follow.object,
                            "Ignoring response from an actor the Follow was not sent to"
                        );
                        return Ok(None);
                    }
                }

                let by_pair = match (
                    self.actors.find_cached(&follow.actor).await?,
                    self.actors.find_cached(&follow.object).await?,
                ) {
                    (Some(subject), Some(object)) => {
                        self.db.get_follow_request(&subject.id, &object.id).await?
                    }
                    _ => None,
                };

                match (by_pair, follow.id.as_deref()) {
                    (Some(request), _) => Some(request),
                    (None, Some(id)) => self.db.get_follow_request_by_remote_id(id).await?,
                    (None, None) => None,
                }
            }
            FollowReference::Id(id) => self.db.get_follow_request_by_remote_id(id).await?,
        };

        let Some(request) = request else {
            return Ok(None);
        };

        // Only the requested actor may answer.
        if let Some(actor) = response.actor.as_deref() {
            if !self.sent_by(Some(actor), &request.object_id).await? {
                return Ok(None);
            }
        }

        Ok(Some(request))
    }

    fn send_accept(&self, accepter: &Actor, follower: &Actor, follow_id: Option<&str>) {
        if follower.local {
            return;
        }

        match accept_follow_job(accepter, follower, follow_id) {
            Ok(Some(job)) => self.delivery.submit(job),
            Ok(None) => {
                tracing::debug!(follower = %follower.remote_id, "Follower has no inbox; Accept not sent")
            }
            Err(e) => tracing::warn!(error = %e, "Cannot build Accept"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Status;
    use crate::federation::activity::parse_published;
    use crate::federation::actor::{ActorFetcher, RemoteActorProfile};
    use crate::federation::delivery::RecordingDelivery;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const MOUSE: &str = "http://local.com/user/mouse";
    const RAT: &str = "https://example.com/users/rat";
    const FOLLOW_ID: &str = "https://example.com/users/rat/follows/123";

    /// Serves a profile for any `example.com` actor
    struct StubFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActorFetcher for StubFetcher {
        async fn fetch_actor(&self, uri: &str) -> Result<RemoteActorProfile, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !uri.starts_with("https://example.com/") {
                return Err(AppError::Federation(format!("unreachable {uri}")));
            }
            Ok(RemoteActorProfile {
                id: uri.to_string(),
                preferred_username: uri.rsplit('/').next().unwrap_or_default().to_string(),
                inbox: Some(format!("{uri}/inbox")),
                outbox: None,
                shared_inbox: None,
                manually_approves_followers: false,
                public_key_id: None,
                public_key_pem: None,
            })
        }
    }

    struct Fixture {
        processor: InboxProcessor,
        db: Arc<Database>,
        delivery: Arc<RecordingDelivery>,
        fetcher: Arc<StubFetcher>,
        mouse: Actor,
        _dir: TempDir,
    }

    async fn fixture(manually_approves_followers: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("inbox.db")).await.unwrap());
        let now = Utc::now();
        let mouse = Actor {
            id: EntityId::new().0,
            remote_id: MOUSE.to_string(),
            username: "mouse".to_string(),
            local: true,
            inbox: Some(format!("{MOUSE}/inbox")),
            outbox: None,
            shared_inbox: None,
            manually_approves_followers,
            public_key_pem: Some("mouse-public".to_string()),
            private_key_pem: Some("mouse-private".to_string()),
            created_at: now,
            updated_at: now,
        };
        db.insert_actor(&mouse).await.unwrap();

        let fetcher = Arc::new(StubFetcher {
            calls: AtomicUsize::new(0),
        });
        let delivery = Arc::new(RecordingDelivery::new());
        let processor = InboxProcessor::new(
            db.clone(),
            ActorResolver::new(db.clone(), fetcher.clone()),
            delivery.clone(),
        );

        Fixture {
            processor,
            db,
            delivery,
            fetcher,
            mouse,
            _dir: dir,
        }
    }

    fn follow(id: Option<&str>) -> FollowActivity {
        FollowActivity {
            id: id.map(str::to_string),
            actor: RAT.to_string(),
            object: MOUSE.to_string(),
        }
    }

    async fn rat(fx: &Fixture) -> Actor {
        fx.db.get_actor_by_remote_id(RAT).await.unwrap().expect("rat cached")
    }

    async fn local_status(fx: &Fixture) -> Status {
        let status = Status {
            id: EntityId::new().0,
            remote_id: format!("{MOUSE}/status/1"),
            actor_id: fx.mouse.id.clone(),
            content: "Reading Dune".to_string(),
            local: true,
            created_at: Utc::now(),
        };
        fx.db.insert_status(&status).await.unwrap();
        status
    }

    fn like(id: &str, object: &str) -> FavoriteActivity {
        FavoriteActivity {
            id: id.to_string(),
            actor: RAT.to_string(),
            object: object.to_string(),
            published: None,
        }
    }

    #[tokio::test]
    async fn follow_of_open_account_creates_edge_and_notification() {
        let fx = fixture(false).await;

        let outcome = fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Applied);

        let rat = rat(&fx).await;
        assert!(!rat.local);
        assert_eq!(
            fx.db.get_relationship(&rat.id, &fx.mouse.id).await.unwrap(),
            RelationshipState::Followed
        );
        assert_eq!(fx.db.count_follow_requests().await.unwrap(), 0);

        let notifications = fx.db.get_notifications(&fx.mouse.id, 10).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].notification_type, "FOLLOW");
        assert_eq!(notifications[0].related_actor_id.as_deref(), Some(rat.id.as_str()));

        let followers = fx.db.get_followers(&fx.mouse.id).await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].remote_id, RAT);
    }

    #[tokio::test]
    async fn follow_of_open_account_sends_accept() {
        let fx = fixture(false).await;
        fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();

        let jobs = fx.delivery.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].inbox, format!("{RAT}/inbox"));
        assert_eq!(jobs[0].activity["type"], "Accept");
        assert_eq!(jobs[0].activity["object"]["id"], FOLLOW_ID);
    }

    #[tokio::test]
    async fn follow_of_locked_account_creates_request() {
        let fx = fixture(true).await;

        let outcome = fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Applied);

        let rat = rat(&fx).await;
        let requests = fx.db.get_follow_requests_for(&fx.mouse.id).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].subject_id, rat.id);
        assert_eq!(requests[0].remote_id.as_deref(), Some(FOLLOW_ID));
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);

        let notifications = fx.db.get_notifications(&fx.mouse.id, 10).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].notification_type, "FOLLOW_REQUEST");
        assert!(fx.delivery.jobs().is_empty());
    }

    #[tokio::test]
    async fn redelivered_follow_is_a_duplicate() {
        for locked in [false, true] {
            let fx = fixture(locked).await;
            fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();

            let outcome = fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();
            assert_eq!(outcome, ActivityOutcome::Duplicate);

            assert_eq!(
                fx.db.count_follows().await.unwrap() + fx.db.count_follow_requests().await.unwrap(),
                1
            );
            assert_eq!(fx.db.count_notifications().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn remote_actor_is_fetched_once() {
        let fx = fixture(true).await;
        fx.processor.handle_follow(&follow(None)).await.unwrap();
        fx.processor.handle_follow(&follow(None)).await.unwrap();

        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn follow_of_unknown_local_actor_is_not_found() {
        let fx = fixture(false).await;
        let activity = FollowActivity {
            id: None,
            actor: RAT.to_string(),
            object: "http://local.com/user/nobody".to_string(),
        };

        assert!(matches!(
            fx.processor.handle_follow(&activity).await,
            Err(AppError::NotFound)
        ));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn follow_from_unreachable_actor_fails_without_state() {
        let fx = fixture(false).await;
        let activity = FollowActivity {
            id: None,
            actor: "https://gone.example/users/ghost".to_string(),
            object: MOUSE.to_string(),
        };

        assert!(fx.processor.handle_follow(&activity).await.is_err());
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);
        assert_eq!(fx.db.count_notifications().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_follow_removes_edge() {
        let fx = fixture(false).await;
        fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();

        let undo = UnfollowActivity {
            id: None,
            actor: None,
            follow: FollowReference::Embedded(follow(Some(FOLLOW_ID))),
        };
        assert_eq!(
            fx.processor.handle_unfollow(&undo).await.unwrap(),
            ActivityOutcome::Applied
        );
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);

        // Repeating it finds nothing to remove.
        assert_eq!(
            fx.processor.handle_unfollow(&undo).await.unwrap(),
            ActivityOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn undo_follow_withdraws_pending_request() {
        let fx = fixture(true).await;
        fx.processor.handle_follow(&follow(None)).await.unwrap();

        let undo = UnfollowActivity {
            id: None,
            actor: Some(RAT.to_string()),
            follow: FollowReference::Embedded(follow(None)),
        };
        assert_eq!(
            fx.processor.handle_unfollow(&undo).await.unwrap(),
            ActivityOutcome::Applied
        );
        assert_eq!(fx.db.count_follow_requests().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_follow_by_another_actor_is_ignored() {
        let fx = fixture(false).await;
        fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();

        let undo = UnfollowActivity {
            id: None,
            actor: Some("https://example.com/users/cat".to_string()),
            follow: FollowReference::Embedded(follow(Some(FOLLOW_ID))),
        };
        assert_eq!(
            fx.processor.handle_unfollow(&undo).await.unwrap(),
            ActivityOutcome::Ignored
        );
        assert_eq!(fx.db.count_follows().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undo_follow_of_unknown_actor_does_not_fetch() {
        let fx = fixture(false).await;
        let undo = UnfollowActivity {
            id: None,
            actor: None,
            follow: FollowReference::Embedded(follow(None)),
        };

        assert_eq!(
            fx.processor.handle_unfollow(&undo).await.unwrap(),
            ActivityOutcome::Ignored
        );
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undo_by_bare_follow_id_removes_edge() {
        let fx = fixture(false).await;
        fx.processor.handle_follow(&follow(Some(FOLLOW_ID))).await.unwrap();

        let undo = UndoReferenceActivity {
            id: None,
            actor: Some(RAT.to_string()),
            object: FOLLOW_ID.to_string(),
        };
        assert_eq!(
            fx.processor.handle_undo_reference(&undo).await.unwrap(),
            ActivityOutcome::Applied
        );
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);
    }

    /// Local mouse has asked remote rat to follow; rat answers.
    async fn pending_outbound_request(fx: &Fixture) -> Actor {
        let rat = fx
            .processor
            .actors
            .resolve(RAT)
            .await
            .expect("rat resolvable");
        let request = FollowRequest {
            id: EntityId::new().0,
            remote_id: None,
            subject_id: fx.mouse.id.clone(),
            object_id: rat.id.clone(),
            created_at: Utc::now(),
        };
        let notification =
            Notification::new(&rat.id, NotificationType::FollowRequest, Some(&fx.mouse.id), None);
        fx.db.record_follow_request(&request, &notification).await.unwrap();
        rat
    }

    fn response_to_mouse(actor: Option<&str>) -> FollowResponseActivity {
        FollowResponseActivity {
            id: Some(format!("{FOLLOW_ID}#accepts")),
            actor: actor.map(str::to_string),
            follow: FollowReference::Embedded(FollowActivity {
                id: Some(FOLLOW_ID.to_string()),
                actor: MOUSE.to_string(),
                object: RAT.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn accept_turns_request_into_edge() {
        let fx = fixture(false).await;
        let rat = pending_outbound_request(&fx).await;
        let before = fx.db.count_notifications().await.unwrap();

        let outcome = fx
            .processor
            .handle_follow_accept(&response_to_mouse(Some(RAT)))
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Applied);

        assert_eq!(fx.db.count_follow_requests().await.unwrap(), 0);
        assert_eq!(
            fx.db.get_relationship(&fx.mouse.id, &rat.id).await.unwrap(),
            RelationshipState::Followed
        );
        let following = fx.db.get_following(&fx.mouse.id).await.unwrap();
        assert_eq!(following[0].remote_id, RAT);
        assert_eq!(fx.db.count_notifications().await.unwrap(), before);

        // A replayed Accept has nothing left to accept.
        assert_eq!(
            fx.processor
                .handle_follow_accept(&response_to_mouse(Some(RAT)))
                .await
                .unwrap(),
            ActivityOutcome::Ignored
        );
        assert_eq!(fx.db.count_follows().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn accept_from_third_party_is_ignored() {
        let fx = fixture(false).await;
        pending_outbound_request(&fx).await;

        let outcome = fx
            .processor
            .handle_follow_accept(&response_to_mouse(Some("https://example.com/users/cat")))
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Ignored);
        assert_eq!(fx.db.count_follow_requests().await.unwrap(), 1);
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn accept_of_unknown_follow_id_is_ignored() {
        let fx = fixture(false).await;
        let accept = FollowResponseActivity {
            id: None,
            actor: None,
            follow: FollowReference::Id("exists".to_string()),
        };

        assert_eq!(
            fx.processor.handle_follow_accept(&accept).await.unwrap(),
            ActivityOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn reject_drops_request_without_edge() {
        let fx = fixture(false).await;
        pending_outbound_request(&fx).await;

        let outcome = fx
            .processor
            .handle_follow_reject(&response_to_mouse(None))
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Applied);
        assert_eq!(fx.db.count_follow_requests().await.unwrap(), 0);
        assert_eq!(fx.db.count_follows().await.unwrap(), 0);

        assert_eq!(
            fx.processor
                .handle_follow_reject(&response_to_mouse(None))
                .await
                .unwrap(),
            ActivityOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn like_of_local_status_records_favorite_and_notifies_owner() {
        let fx = fixture(false).await;
        let status = local_status(&fx).await;

        let mut activity = like("http://example.com/fav/1", &status.remote_id);
        activity.published = parse_published("Mon, 25 May 2020 19:31:20 GMT");
        let outcome = fx.processor.handle_favorite(&activity).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Applied);

        let favorite = fx
            .db
            .get_favorite_by_remote_id("http://example.com/fav/1")
            .await
            .unwrap()
            .expect("favorite stored");
        assert_eq!(favorite.status_id, status.id);
        assert_eq!(favorite.actor_id, rat(&fx).await.id);
        assert_eq!(favorite.published_at.to_rfc3339(), "2020-05-25T19:31:20+00:00");

        let notifications = fx.db.get_notifications(&fx.mouse.id, 10).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].notification_type, "FAVORITE");
        assert_eq!(notifications[0].related_status_id.as_deref(), Some(status.id.as_str()));
    }

    #[tokio::test]
    async fn redelivered_like_is_a_duplicate() {
        let fx = fixture(false).await;
        let status = local_status(&fx).await;
        let activity = like("http://example.com/fav/1", &status.remote_id);

        fx.processor.handle_favorite(&activity).await.unwrap();
        assert_eq!(
            fx.processor.handle_favorite(&activity).await.unwrap(),
            ActivityOutcome::Duplicate
        );

        assert_eq!(fx.db.get_favorites_for_status(&status.id).await.unwrap().len(), 1);
        assert_eq!(fx.db.count_notifications().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn like_of_unknown_status_is_not_found() {
        let fx = fixture(false).await;
        let activity = like("http://example.com/fav/1", "http://local.com/status/404");

        assert!(matches!(
            fx.processor.handle_favorite(&activity).await,
            Err(AppError::NotFound)
        ));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undo_like_removes_favorite_once() {
        let fx = fixture(false).await;
        let status = local_status(&fx).await;
        fx.processor
            .handle_favorite(&like("http://example.com/fav/1", &status.remote_id))
            .await
            .unwrap();

        let undo = UnfavoriteActivity {
            id: None,
            actor: RAT.to_string(),
            like_id: "http://example.com/fav/1".to_string(),
        };
        assert_eq!(
            fx.processor.handle_unfavorite(&undo).await.unwrap(),
            ActivityOutcome::Applied
        );
        assert_eq!(
            fx.processor.handle_unfavorite(&undo).await.unwrap(),
            ActivityOutcome::Ignored
        );
        assert!(fx.db.get_favorites_for_status(&status.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undo_by_bare_like_id_removes_favorite() {
        let fx = fixture(false).await;
        let status = local_status(&fx).await;
        fx.processor
            .handle_favorite(&like("http://example.com/fav/1", &status.remote_id))
            .await
            .unwrap();

        let undo = UndoReferenceActivity {
            id: None,
            actor: Some(RAT.to_string()),
            object: "http://example.com/fav/1".to_string(),
        };
        assert_eq!(
            fx.processor.handle_undo_reference(&undo).await.unwrap(),
            ActivityOutcome::Applied
        );
    }

    #[tokio::test]
    async fn delete_removes_only_the_actors_remote_status() {
        let fx = fixture(false).await;
        let own = local_status(&fx).await;
        fx.processor.actors.resolve(RAT).await.unwrap();
        let rat = rat(&fx).await;
        let remote = Status {
            id: EntityId::new().0,
            remote_id: format!("{RAT}/status/9"),
            actor_id: rat.id.clone(),
            content: "a review".to_string(),
            local: false,
            created_at: Utc::now(),
        };
        fx.db.insert_status(&remote).await.unwrap();

        // Cannot delete someone else's status.
        let forged = DeleteActivity {
            id: None,
            actor: Some(RAT.to_string()),
            object: own.remote_id.clone(),
        };
        assert_eq!(
            fx.processor.handle_delete(&forged).await.unwrap(),
            ActivityOutcome::Ignored
        );
        assert!(fx.db.get_status_by_remote_id(&own.remote_id).await.unwrap().is_some());

        let delete = DeleteActivity {
            id: None,
            actor: Some(RAT.to_string()),
            object: remote.remote_id.clone(),
        };
        assert_eq!(
            fx.processor.handle_delete(&delete).await.unwrap(),
            ActivityOutcome::Applied
        );
        assert!(fx.db.get_status_by_remote_id(&remote.remote_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn process_swallows_handler_errors() {
        let fx = fixture(false).await;
        let task = InboxTask::new(
            InboxActivity::Favorite(like("http://example.com/fav/1", "http://local.com/status/404")),
            None,
        );

        fx.processor.process(task).await;
        assert_eq!(fx.db.count_notifications().await.unwrap(), 0);
    }
}
