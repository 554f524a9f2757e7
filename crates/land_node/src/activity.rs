//! Active/passive bookkeeping of players.
//!
//! A fresh position update marks a player active; a slow sweep demotes
//! players whose last transition is too old. The two thresholds are
//! independent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use land_proto::{DocumentFields, DocumentStore, StoreError, UserActivity};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::runtime_util::lock_state;
use crate::LandError;

pub const DEFAULT_ACTIVE_REFRESH_MS: i64 = 10 * 60 * 1000;
pub const DEFAULT_PASSIVE_AFTER_MS: i64 = 15 * 60 * 1000;

const FIELD_ACTIVE: &str = "active";
const FIELD_UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityThresholds {
    /// An active player is re-marked active once its flag is older than this.
    pub active_refresh_ms: i64,
    /// An active player is demoted by the sweep once its flag is older than this.
    pub passive_after_ms: i64,
}

impl Default for ActivityThresholds {
    fn default() -> Self {
        Self {
            active_refresh_ms: DEFAULT_ACTIVE_REFRESH_MS,
            passive_after_ms: DEFAULT_PASSIVE_AFTER_MS,
        }
    }
}

/// Whether a fresh update for this player must be written as an active
/// transition.
pub fn is_change_active_status(
    activity: Option<&UserActivity>,
    now_ms: i64,
    thresholds: ActivityThresholds,
) -> bool {
    match activity {
        None => true,
        Some(activity) if !activity.active => true,
        Some(activity) => {
            activity
                .updated_at_ms
                .saturating_add(thresholds.active_refresh_ms)
                < now_ms
        }
    }
}

pub fn is_player_passive(
    activity: &UserActivity,
    now_ms: i64,
    thresholds: ActivityThresholds,
) -> bool {
    activity.active
        && activity
            .updated_at_ms
            .saturating_add(thresholds.passive_after_ms)
            < now_ms
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub demoted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserDocument {
    #[serde(default)]
    active: bool,
    #[serde(rename = "updatedAt", default)]
    updated_at_ms: i64,
}

pub struct ActivityTracker {
    users: Mutex<BTreeMap<String, UserActivity>>,
    store: Arc<dyn DocumentStore>,
    collection: String,
    thresholds: ActivityThresholds,
}

impl ActivityTracker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        thresholds: ActivityThresholds,
    ) -> Self {
        Self {
            users: Mutex::new(BTreeMap::new()),
            store,
            collection: collection.into(),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> ActivityThresholds {
        self.thresholds
    }

    /// Seeds the in-memory view from the users collection so the sweep can
    /// demote players left active by a previous process.
    pub fn restore_from_store(&self) -> Result<usize, LandError> {
        let documents =
            self.store
                .read_all(&self.collection)
                .map_err(|err| LandError::Persistence {
                    reason: err.to_string(),
                })?;
        let mut users = lock_state(&self.users);
        let mut restored = 0;
        for document in documents {
            let user: UserDocument = match document.decode(&self.collection) {
                Ok(user) => user,
                Err(err) => {
                    warn!(user_id = %document.id, error = %err, "skipping undecodable user");
                    continue;
                }
            };
            users.insert(
                document.id.clone(),
                UserActivity::new(document.id, user.active, user.updated_at_ms),
            );
            restored += 1;
        }
        Ok(restored)
    }

    /// Re-evaluates a player after a non-stale position update. Returns
    /// whether an active transition was written.
    pub fn on_fresh_update(&self, id: &str, now_ms: i64) -> Result<bool, LandError> {
        let change = {
            let users = lock_state(&self.users);
            is_change_active_status(users.get(id), now_ms, self.thresholds)
        };
        if !change {
            return Ok(false);
        }
        self.set_active(id, true, now_ms)?;
        Ok(true)
    }

    /// Demotes every active player whose flag is older than the passive
    /// threshold. A failed write is reported and does not stop the batch.
    pub fn sweep_passive(&self, now_ms: i64) -> SweepReport {
        let candidates: Vec<String> = lock_state(&self.users)
            .values()
            .filter(|activity| is_player_passive(activity, now_ms, self.thresholds))
            .map(|activity| activity.id.clone())
            .collect();

        let mut report = SweepReport::default();
        for id in candidates {
            // A fresh update may have landed since the candidates were taken.
            {
                let mut users = lock_state(&self.users);
                let Some(activity) = users.get_mut(&id) else {
                    continue;
                };
                if !is_player_passive(activity, now_ms, self.thresholds) {
                    debug!(player_id = %id, "refreshed before demotion, skipped");
                    continue;
                }
                *activity = UserActivity::new(id.as_str(), false, now_ms);
            }
            debug!(player_id = %id, active = false, "activity changed");
            match self.persist_activity(&id, false, now_ms) {
                Ok(()) => report.demoted.push(id),
                Err(err) => {
                    warn!(player_id = %id, error = %err, "passive transition not persisted");
                    report.failed.push(id);
                }
            }
        }
        if !report.demoted.is_empty() || !report.failed.is_empty() {
            info!(
                demoted = report.demoted.len(),
                failed = report.failed.len(),
                "passive sweep finished"
            );
        }
        report
    }

    /// Updates the in-memory flag, then persists it. The in-memory change is
    /// kept even when the write fails.
    pub fn set_active(&self, id: &str, active: bool, now_ms: i64) -> Result<(), LandError> {
        lock_state(&self.users).insert(id.to_string(), UserActivity::new(id, active, now_ms));
        debug!(player_id = %id, active, "activity changed");
        self.persist_activity(id, active, now_ms)
    }

    fn persist_activity(&self, id: &str, active: bool, now_ms: i64) -> Result<(), LandError> {
        self.store
            .update_in_transaction(&self.collection, id, &mut |current| {
                let mut fields: DocumentFields = current
                    .map(|document| document.fields.clone())
                    .unwrap_or_default();
                fields.insert(FIELD_ACTIVE.to_string(), serde_json::Value::Bool(active));
                fields.insert(FIELD_UPDATED_AT.to_string(), serde_json::Value::from(now_ms));
                Ok::<_, StoreError>(fields)
            })
            .map_err(|err| LandError::Persistence {
                reason: format!("set active={active} for {id}: {err}"),
            })
    }

    pub fn activity(&self, id: &str) -> Option<UserActivity> {
        lock_state(&self.users).get(id).cloned()
    }

    pub fn exists_active_player(&self) -> bool {
        lock_state(&self.users).values().any(|activity| activity.active)
    }

    pub fn active_count(&self) -> usize {
        lock_state(&self.users)
            .values()
            .filter(|activity| activity.active)
            .count()
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("collection", &self.collection)
            .field("thresholds", &self.thresholds)
            .field("tracked", &lock_state(&self.users).len())
            .finish()
    }
}
