//! Follow service
//!
//! Starts following remote actors so their outboxes are harvested.

use std::sync::Arc;
use std::time::Duration;

use crate::data::{Database, LocalUser, RecipientKey};
use crate::error::AppError;
use crate::federation::{BoxResolver, DeliveryEngine, Transport, builder, resolve_webfinger};

pub struct FollowService {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    boxes: Arc<BoxResolver>,
    delivery: Arc<DeliveryEngine>,
    timeout: Duration,
}

impl FollowService {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        boxes: Arc<BoxResolver>,
        delivery: Arc<DeliveryEngine>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            boxes,
            delivery,
            timeout,
        }
    }

    /// Actor URI for a handle or URI.
    pub async fn resolve_target(&self, target: &str) -> Result<String, AppError> {
        if target.starts_with("https://") || target.starts_with("http://") {
            return Ok(target.to_string());
        }
        resolve_webfinger(&self.db, self.transport.as_ref(), target, self.timeout)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Follow `target` (`user@host` or actor URI) as `owner`.
    ///
    /// The Follow activity is only sent the first time. Returns the actor URI.
    pub async fn follow(&self, owner: &LocalUser, target: &str) -> Result<String, AppError> {
        let actor = self.resolve_target(target).await?;
        if self.boxes.resolve(&actor).await?.is_none() {
            return Err(AppError::NotFound);
        }

        if !self.db.add_follow(&owner.id, &actor).await? {
            tracing::debug!(%actor, "Already following");
            return Ok(actor);
        }

        let follow = builder::follow(owner, &actor);
        let message = serde_json::to_vec(&follow).map_err(|e| AppError::Internal(e.into()))?;
        let outcome = self
            .delivery
            .deliver(owner, &RecipientKey::actor(actor.clone()), &message)
            .await?;
        tracing::info!(user = %owner.username, %actor, outcome = outcome.as_str(), "Following");
        Ok(actor)
    }
}
