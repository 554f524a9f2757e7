use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use land_proto::{DocumentStore, FieldTile, Position};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub mod activity;
pub mod config;
pub mod control;
mod error;
pub mod field;
pub mod grid;
pub mod oracle;
pub mod position_cache;
mod runtime_util;
pub mod sensory;
pub mod watcher;

pub use activity::{ActivityThresholds, ActivityTracker, SweepReport};
pub use config::{CollectionNames, ConfigError, LandConfig};
pub use control::{
    default_agent, AgentController, AgentPhase, AgentState, AgentTickReport, ControlDeps,
    TickOutcome,
};
pub use error::LandError;
pub use field::{FieldError, FieldMap};
pub use grid::{to_grid_cell, GridCell};
pub use oracle::{
    Action, Decision, DecisionOracle, Facing, HttpDecisionOracle, OracleConfig, OracleError,
};
pub use position_cache::{PositionCache, PositionSnapshot};
pub use runtime_util::now_unix_ms;
pub use sensory::{build_sensory_grid, SensoryGrid};
pub use watcher::{PlayerWatcher, PlayerBatchReport};

use runtime_util::lock_state;
use watcher::{apply_field_batch, run_watch_loop};

const THREAD_PLAYER_WATCH: &str = "land-player-watch";
const THREAD_FIELD_WATCH: &str = "land-field-watch";
const THREAD_PASSIVE_SWEEP: &str = "land-passive-sweep";
const THREAD_AGENT_CONTROL: &str = "land-agent-control";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandSnapshot {
    pub world_id: String,
    pub running: bool,
    pub control_ticks: u64,
    pub sweep_runs: u64,
    pub last_tick_unix_ms: Option<i64>,
    pub cached_players: usize,
    pub active_players: usize,
    pub loaded_tiles: usize,
    pub agents: BTreeMap<String, Position>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct RuntimeState {
    control_ticks: u64,
    sweep_runs: u64,
    last_tick_unix_ms: Option<i64>,
    agents: BTreeMap<String, Position>,
    last_error: Option<String>,
}

/// Read-only view of a running world, shareable with other threads.
#[derive(Debug, Clone)]
pub struct LandStatusHandle {
    world_id: String,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<RuntimeState>>,
    cache: Arc<PositionCache>,
    activity: Arc<ActivityTracker>,
    field: Arc<FieldMap>,
}

impl LandStatusHandle {
    pub fn snapshot(&self) -> LandSnapshot {
        let state = lock_state(&self.state).clone();
        LandSnapshot {
            world_id: self.world_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            control_ticks: state.control_ticks,
            sweep_runs: state.sweep_runs,
            last_tick_unix_ms: state.last_tick_unix_ms,
            cached_players: self.cache.len(),
            active_players: self.activity.active_count(),
            loaded_tiles: self.field.loaded(),
            agents: state.agents,
            last_error: state.last_error,
        }
    }

    pub fn player(&self, id: &str) -> Option<Position> {
        self.cache.get(id)
    }

    pub fn field_tile(&self, row: usize, col: usize) -> Result<Option<FieldTile>, FieldError> {
        self.field.get(row, col)
    }
}

/// Owns the four units of concurrency of one world: the player watcher, the
/// field watcher, the passivity sweep and the agent control loop.
pub struct LandRuntime {
    config: LandConfig,
    store: Arc<dyn DocumentStore>,
    oracle: Arc<dyn DecisionOracle>,
    cache: Arc<PositionCache>,
    activity: Arc<ActivityTracker>,
    field: Arc<FieldMap>,
    seed_agents: Vec<Position>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<RuntimeState>>,
    stop_txs: Vec<mpsc::Sender<()>>,
    workers: Vec<(String, JoinHandle<()>)>,
    fatal_tx: mpsc::Sender<LandError>,
    fatal_rx: mpsc::Receiver<LandError>,
}

impl LandRuntime {
    pub fn new(
        config: LandConfig,
        store: Arc<dyn DocumentStore>,
        oracle: Arc<dyn DecisionOracle>,
    ) -> Self {
        let activity = Arc::new(ActivityTracker::new(
            Arc::clone(&store),
            config.collections.users.clone(),
            config.thresholds,
        ));
        let (fatal_tx, fatal_rx) = mpsc::channel();
        Self {
            config,
            store,
            oracle,
            cache: Arc::new(PositionCache::new()),
            activity,
            field: Arc::new(FieldMap::new()),
            seed_agents: vec![default_agent()],
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RuntimeState::default())),
            stop_txs: Vec::new(),
            workers: Vec::new(),
            fatal_tx,
            fatal_rx,
        }
    }

    /// Replaces the agents seeded at the next `start`.
    pub fn with_agents(mut self, agents: Vec<Position>) -> Self {
        self.seed_agents = agents;
        self
    }

    pub fn config(&self) -> &LandConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PositionCache> {
        &self.cache
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn field(&self) -> &Arc<FieldMap> {
        &self.field
    }

    pub fn status_handle(&self) -> LandStatusHandle {
        LandStatusHandle {
            world_id: self.config.world_id.clone(),
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
            activity: Arc::clone(&self.activity),
            field: Arc::clone(&self.field),
        }
    }

    pub fn snapshot(&self) -> LandSnapshot {
        self.status_handle().snapshot()
    }

    pub fn start(&mut self) -> Result<(), LandError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LandError::AlreadyRunning);
        }
        *lock_state(&self.state) = RuntimeState::default();

        match self.activity.restore_from_store() {
            Ok(restored) => info!(restored, "user activity restored"),
            Err(err) => warn!(error = %err, "user activity not restored"),
        }

        if let Err(err) = self.spawn_workers() {
            self.shutdown_workers();
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!(
            world_id = %self.config.world_id,
            agents = self.seed_agents.len(),
            "land runtime started"
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), LandError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LandError::NotRunning);
        }
        let failed = self.shutdown_workers();
        self.running.store(false, Ordering::SeqCst);
        info!(world_id = %self.config.world_id, "land runtime stopped");
        match failed.into_iter().next() {
            Some(thread) => Err(LandError::ThreadJoinFailed { thread }),
            None => Ok(()),
        }
    }

    /// Non-blocking check for a unit that terminated on a fatal error.
    pub fn take_fatal_error(&self) -> Option<LandError> {
        self.fatal_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a fatal error.
    pub fn wait_fatal_error(&self, timeout: Duration) -> Option<LandError> {
        self.fatal_rx.recv_timeout(timeout).ok()
    }

    fn spawn_workers(&mut self) -> Result<(), LandError> {
        let collections = self.config.collections.clone();
        let poll = self.config.watch_poll();

        let mut player_stream =
            self.store
                .watch(&collections.players)
                .map_err(|err| LandError::Stream {
                    collection: collections.players.clone(),
                    reason: err.to_string(),
                })?;
        let mut field_stream =
            self.store
                .watch(&collections.field)
                .map_err(|err| LandError::Stream {
                    collection: collections.field.clone(),
                    reason: err.to_string(),
                })?;

        let watcher = PlayerWatcher::new(
            collections.players.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.activity),
            self.config.stale_window_ms,
        );
        let state = Arc::clone(&self.state);
        let fatal_tx = self.fatal_tx.clone();
        self.spawn_worker(THREAD_PLAYER_WATCH, move |stop_rx| {
            let collection = watcher.collection().to_string();
            let result = run_watch_loop(&collection, player_stream.as_mut(), poll, &stop_rx, |batch| {
                watcher.apply_batch(&batch, now_unix_ms()).map(|_| ())
            });
            report_watch_exit(THREAD_PLAYER_WATCH, result, &state, &fatal_tx);
        })?;

        let field = Arc::clone(&self.field);
        let field_collection = collections.field.clone();
        let state = Arc::clone(&self.state);
        let fatal_tx = self.fatal_tx.clone();
        self.spawn_worker(THREAD_FIELD_WATCH, move |stop_rx| {
            let result = run_watch_loop(&field_collection, field_stream.as_mut(), poll, &stop_rx, |batch| {
                apply_field_batch(&field, &batch).map(|_| ())
            });
            report_watch_exit(THREAD_FIELD_WATCH, result, &state, &fatal_tx);
        })?;

        let activity = Arc::clone(&self.activity);
        let sweep_interval = self.config.sweep_interval();
        let state = Arc::clone(&self.state);
        self.spawn_worker(THREAD_PASSIVE_SWEEP, move |stop_rx| loop {
            match stop_rx.recv_timeout(sweep_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    activity.sweep_passive(now_unix_ms());
                    let mut current = lock_state(&state);
                    current.sweep_runs = current.sweep_runs.saturating_add(1);
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        })?;

        let mut controller = AgentController::new(
            ControlDeps {
                cache: Arc::clone(&self.cache),
                activity: Arc::clone(&self.activity),
                oracle: Arc::clone(&self.oracle),
                store: Arc::clone(&self.store),
                monster_collection: collections.monsters.clone(),
            },
            self.config.stale_window_ms,
        );
        for agent in &self.seed_agents {
            controller.add_agent(agent.clone());
        }
        lock_state(&self.state).agents = controller.positions();
        let tick_interval = self.config.tick_interval();
        let state = Arc::clone(&self.state);
        self.spawn_worker(THREAD_AGENT_CONTROL, move |stop_rx| loop {
            match stop_rx.recv_timeout(tick_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let now_ms = now_unix_ms();
                    controller.tick(now_ms);
                    let mut current = lock_state(&state);
                    current.control_ticks = current.control_ticks.saturating_add(1);
                    current.last_tick_unix_ms = Some(now_ms);
                    current.agents = controller.positions();
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(())
    }

    fn spawn_worker<F>(&mut self, name: &str, body: F) -> Result<(), LandError>
    where
        F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_rx))
            .map_err(|err| LandError::ThreadSpawnFailed {
                reason: format!("{name}: {err}"),
            })?;
        self.stop_txs.push(stop_tx);
        self.workers.push((name.to_string(), worker));
        Ok(())
    }

    /// Signals and joins every worker; returns the names of threads that
    /// panicked.
    fn shutdown_workers(&mut self) -> Vec<String> {
        for stop_tx in self.stop_txs.drain(..) {
            let _ = stop_tx.send(());
        }
        let mut failed = Vec::new();
        for (name, worker) in self.workers.drain(..) {
            if worker.join().is_err() {
                failed.push(name);
            }
        }
        failed
    }
}

impl std::fmt::Debug for LandRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LandRuntime")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for LandRuntime {
    fn drop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown_workers();
        self.running.store(false, Ordering::SeqCst);
    }
}

fn report_watch_exit(
    thread: &str,
    result: Result<(), LandError>,
    state: &Mutex<RuntimeState>,
    fatal_tx: &mpsc::Sender<LandError>,
) {
    match result {
        Ok(()) => info!(thread, "watcher stopped"),
        Err(err) => {
            error!(thread, error = %err, "change feed failed");
            lock_state(state).last_error = Some(err.to_string());
            let _ = fatal_tx.send(err);
        }
    }
}

#[cfg(test)]
mod tests;
