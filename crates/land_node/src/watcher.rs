//! Change-feed consumers for the player and field collections.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use land_proto::{ChangeBatch, ChangeKind, ChangeStream, FieldTile, PlayerRecord, Position};
use tracing::{debug, warn};

use crate::activity::ActivityTracker;
use crate::field::{parse_tile_id, FieldMap};
use crate::position_cache::PositionCache;
use crate::LandError;

/// Pulls batches until `stop_rx` fires or is dropped. A stream error or a
/// handler error ends the loop with that error.
pub fn run_watch_loop<F>(
    collection: &str,
    stream: &mut dyn ChangeStream,
    poll: Duration,
    stop_rx: &Receiver<()>,
    mut on_batch: F,
) -> Result<(), LandError>
where
    F: FnMut(ChangeBatch) -> Result<(), LandError>,
{
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {}
        }
        match stream.next_batch(poll) {
            Ok(Some(batch)) => on_batch(batch)?,
            Ok(None) => {}
            Err(err) => {
                return Err(LandError::Stream {
                    collection: collection.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerBatchReport {
    pub applied: usize,
    pub stale: usize,
    pub activated: usize,
    pub ignored_removals: usize,
}

/// Sole writer of the [`PositionCache`].
#[derive(Debug, Clone)]
pub struct PlayerWatcher {
    collection: String,
    cache: Arc<PositionCache>,
    activity: Arc<ActivityTracker>,
    stale_window_ms: i64,
}

impl PlayerWatcher {
    pub fn new(
        collection: impl Into<String>,
        cache: Arc<PositionCache>,
        activity: Arc<ActivityTracker>,
        stale_window_ms: i64,
    ) -> Self {
        Self {
            collection: collection.into(),
            cache,
            activity,
            stale_window_ms,
        }
    }

    pub fn collection(&self) -> &str {
        self.collection.as_str()
    }

    /// Decodes the whole batch before touching the cache, so an undecodable
    /// document leaves the cache unchanged and fails the feed.
    pub fn apply_batch(
        &self,
        batch: &ChangeBatch,
        now_ms: i64,
    ) -> Result<PlayerBatchReport, LandError> {
        let mut report = PlayerBatchReport::default();
        let mut records = Vec::with_capacity(batch.changes.len());
        for change in &batch.changes {
            if change.kind == ChangeKind::Removed {
                debug!(player_id = %change.document.id, "player removal ignored");
                report.ignored_removals += 1;
                continue;
            }
            let mut position: Position = change
                .document
                .decode(&self.collection)
                .map_err(|err| LandError::Stream {
                    collection: self.collection.clone(),
                    reason: err.to_string(),
                })?;
            position.id = change.document.id.clone();
            records.push(PlayerRecord::new(position, change.document.update_time_ms));
        }

        let fresh: Vec<String> = records
            .iter()
            .filter(|record| !record.is_stale(now_ms, self.stale_window_ms))
            .map(|record| record.id().to_string())
            .collect();
        report.applied = records.len();
        report.stale = records.len() - fresh.len();
        self.cache.apply_batch(records);

        for id in fresh {
            match self.activity.on_fresh_update(&id, now_ms) {
                Ok(true) => report.activated += 1,
                Ok(false) => {}
                Err(err) => warn!(player_id = %id, error = %err, "active transition not persisted"),
            }
        }
        Ok(report)
    }
}

/// Copies field documents into the [`FieldMap`]. A malformed id or an
/// out-of-range tile fails the feed.
pub fn apply_field_batch(
    field: &FieldMap,
    batch: &ChangeBatch,
) -> Result<usize, LandError> {
    let stream_error = |reason: String| LandError::Stream {
        collection: batch.collection.clone(),
        reason,
    };
    let mut stored = 0;
    for change in &batch.changes {
        if change.kind == ChangeKind::Removed {
            debug!(tile_id = %change.document.id, "field removal ignored");
            continue;
        }
        let (row, col) = parse_tile_id(&change.document.id)
            .map_err(|err| stream_error(err.to_string()))?;
        let mut tile: FieldTile = change
            .document
            .decode(&batch.collection)
            .map_err(|err| stream_error(err.to_string()))?;
        tile.row = row;
        tile.col = col;
        field.set(tile).map_err(|err| stream_error(err.to_string()))?;
        stored += 1;
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityThresholds;
    use land_proto::{Document, DocumentChange, DocumentFields, DocumentStore};
    use land_store::InMemoryDocumentStore;
    use std::sync::mpsc;

    const PLAYERS: &str = "world-default-land-home-player-position";
    const USERS: &str = "world-default-users";
    const FIELD: &str = "world-default-land-home";
    const NOW: i64 = 1_000_000;
    const STALE_MS: i64 = 10_000;

    fn change(kind: ChangeKind, id: &str, fields: serde_json::Value, at: i64) -> DocumentChange {
        let fields: DocumentFields = match fields {
            serde_json::Value::Object(map) => map,
            _ => DocumentFields::new(),
        };
        DocumentChange {
            kind,
            document: Document {
                id: id.to_string(),
                fields,
                update_time_ms: at,
            },
        }
    }

    fn batch(collection: &str, changes: Vec<DocumentChange>) -> ChangeBatch {
        ChangeBatch {
            collection: collection.to_string(),
            changes,
        }
    }

    fn watcher(store: &InMemoryDocumentStore) -> (PlayerWatcher, Arc<PositionCache>, Arc<ActivityTracker>) {
        let cache = Arc::new(PositionCache::new());
        let activity = Arc::new(ActivityTracker::new(
            Arc::new(store.clone()),
            USERS,
            ActivityThresholds::default(),
        ));
        let watcher = PlayerWatcher::new(PLAYERS, Arc::clone(&cache), Arc::clone(&activity), STALE_MS);
        (watcher, cache, activity)
    }

    #[test]
    fn fresh_players_are_cached_and_activated() {
        let store = InMemoryDocumentStore::new();
        let (watcher, cache, activity) = watcher(&store);
        let report = watcher
            .apply_batch(
                &batch(
                    PLAYERS,
                    vec![
                        change(ChangeKind::Added, "fresh", serde_json::json!({"x": 900.0, "y": 1000.0, "isMove": true}), NOW),
                        change(ChangeKind::Added, "old", serde_json::json!({"x": 10.0, "y": 20.0}), NOW - STALE_MS - 1),
                    ],
                ),
                NOW,
            )
            .expect("apply");

        assert_eq!(
            report,
            PlayerBatchReport {
                applied: 2,
                stale: 1,
                activated: 1,
                ignored_removals: 0
            }
        );
        let fresh = cache.get("fresh").expect("cached");
        assert_eq!(fresh.id, "fresh");
        assert!(fresh.is_moving);
        assert!(cache.get("old").is_some());
        assert!(activity.activity("fresh").expect("tracked").active);
        assert!(activity.activity("old").is_none());
        assert_eq!(store.write_count(USERS), 1);
    }

    #[test]
    fn undecodable_player_fails_the_feed_without_partial_apply() {
        let store = InMemoryDocumentStore::new();
        let (watcher, cache, _activity) = watcher(&store);
        let err = watcher
            .apply_batch(
                &batch(
                    PLAYERS,
                    vec![
                        change(ChangeKind::Added, "ok", serde_json::json!({"x": 1.0, "y": 2.0}), NOW),
                        change(ChangeKind::Modified, "bad", serde_json::json!({"x": "left"}), NOW),
                    ],
                ),
                NOW,
            )
            .expect_err("decode failure");
        assert!(matches!(err, LandError::Stream { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn removals_do_not_evict_cached_players() {
        let store = InMemoryDocumentStore::new();
        let (watcher, cache, _activity) = watcher(&store);
        watcher
            .apply_batch(
                &batch(PLAYERS, vec![change(ChangeKind::Added, "p", serde_json::json!({"x": 1.0, "y": 2.0}), NOW)]),
                NOW,
            )
            .expect("add");
        let report = watcher
            .apply_batch(
                &batch(PLAYERS, vec![change(ChangeKind::Removed, "p", serde_json::json!({}), NOW)]),
                NOW,
            )
            .expect("remove");
        assert_eq!(report.ignored_removals, 1);
        assert!(cache.get("p").is_some());
    }

    #[test]
    fn activation_failure_does_not_fail_the_batch() {
        let store = InMemoryDocumentStore::new();
        store.set_failing_writes(USERS, true);
        let (watcher, cache, activity) = watcher(&store);
        let report = watcher
            .apply_batch(
                &batch(PLAYERS, vec![change(ChangeKind::Added, "p", serde_json::json!({"x": 1.0, "y": 2.0}), NOW)]),
                NOW,
            )
            .expect("apply");
        assert_eq!(report.activated, 0);
        assert!(cache.get("p").is_some());
        // the in-memory flag still reflects the attempted transition
        assert!(activity.exists_active_player());
    }

    #[test]
    fn field_batch_places_tiles_by_id() {
        let field = FieldMap::new();
        let stored = apply_field_batch(
            &field,
            &batch(
                FIELD,
                vec![change(ChangeKind::Added, "row-002-col-010", serde_json::json!({"chip": 3, "hitPoint": 5.5}), NOW)],
            ),
        )
        .expect("apply");
        assert_eq!(stored, 1);
        let tile = field.get(2, 10).expect("in range").expect("stored");
        assert_eq!((tile.row, tile.col, tile.chip_id), (2, 10, 3));
        assert_eq!(tile.hit_point, 5.5);
    }

    #[test]
    fn field_batch_rejects_bad_ids_and_bounds() {
        let field = FieldMap::new();
        for id in ["tile-7", "row-200-col-000"] {
            let err = apply_field_batch(
                &field,
                &batch(FIELD, vec![change(ChangeKind::Added, id, serde_json::json!({"chip": 1}), NOW)]),
            )
            .expect_err("rejected");
            assert!(matches!(err, LandError::Stream { .. }), "{id}");
        }
    }

    #[test]
    fn watch_loop_applies_batches_until_stopped() {
        let store = InMemoryDocumentStore::new();
        let mut fields = DocumentFields::new();
        fields.insert("x".to_string(), serde_json::json!(1.0));
        fields.insert("y".to_string(), serde_json::json!(2.0));
        store.upsert(PLAYERS, "p", fields).expect("seed");

        let mut stream = store.watch(PLAYERS).expect("watch");
        let (stop_tx, stop_rx) = mpsc::channel();
        let mut seen = 0;
        run_watch_loop(PLAYERS, stream.as_mut(), Duration::from_millis(5), &stop_rx, |batch| {
            seen += batch.changes.len();
            stop_tx.send(()).expect("stop");
            Ok(())
        })
        .expect("clean stop");
        assert_eq!(seen, 1);
    }

    #[test]
    fn watch_loop_surfaces_stream_failure() {
        let store = InMemoryDocumentStore::new();
        let mut stream = store.watch(PLAYERS).expect("watch");
        store.fail_watchers(PLAYERS, "transport reset");
        let (_stop_tx, stop_rx) = mpsc::channel::<()>();
        let err = run_watch_loop(PLAYERS, stream.as_mut(), Duration::from_millis(5), &stop_rx, |_| Ok(()))
            .expect_err("stream failure");
        match err {
            LandError::Stream { collection, reason } => {
                assert_eq!(collection, PLAYERS);
                assert!(reason.contains("transport reset"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
