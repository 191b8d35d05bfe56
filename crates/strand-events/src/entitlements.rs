//! Write entitlement checks.
//!
//! Every write asks an [`Entitlements`] backend first. The backend is picked
//! once at startup from configuration and shared as `Arc<dyn Entitlements>`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strand_types::{Address, StreamId};
use tracing::warn;

/// What a user is trying to do to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
}

/// Decides whether a user may act on a stream.
#[async_trait]
pub trait Entitlements: Send + Sync + std::fmt::Debug {
    /// True while all writes are paused.
    async fn is_disabled(&self) -> bool;

    async fn is_entitled(&self, stream_id: &StreamId, user: &Address, permission: Permission)
    -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Entitlements for AllowAll {
    async fn is_disabled(&self) -> bool {
        false
    }

    async fn is_entitled(&self, _: &StreamId, _: &Address, _: Permission) -> bool {
        true
    }
}

/// Fixed rules: a global pause switch plus per-stream deny lists.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    paused: bool,
    denied: HashMap<StreamId, HashSet<Address>>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Denies every permission on `stream_id` to `user`.
    pub fn deny(mut self, stream_id: StreamId, user: Address) -> Self {
        self.denied.entry(stream_id).or_default().insert(user);
        self
    }
}

#[async_trait]
impl Entitlements for StaticEntitlements {
    async fn is_disabled(&self) -> bool {
        self.paused
    }

    async fn is_entitled(
        &self,
        stream_id: &StreamId,
        user: &Address,
        permission: Permission,
    ) -> bool {
        let denied = self
            .denied
            .get(stream_id)
            .is_some_and(|users| users.contains(user));
        if denied {
            warn!(stream_id = %stream_id, user = %user, ?permission, "entitlement denied");
        }
        !denied
    }
}

/// Backend selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementsBackend {
    #[default]
    AllowAll,
    Static,
}

impl EntitlementsBackend {
    /// Builds the chosen backend. `paused` and `denied` only apply to
    /// [`EntitlementsBackend::Static`].
    pub fn build(
        self,
        paused: bool,
        denied: impl IntoIterator<Item = (StreamId, Address)>,
    ) -> Arc<dyn Entitlements> {
        match self {
            EntitlementsBackend::AllowAll => Arc::new(AllowAll),
            EntitlementsBackend::Static => Arc::new(
                denied
                    .into_iter()
                    .fold(StaticEntitlements::new().paused(paused), |rules, (id, user)| {
                        rules.deny(id, user)
                    }),
            ),
        }
    }
}
