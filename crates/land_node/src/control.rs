//! Fixed-tick monster control.
//!
//! Each tick walks every agent through `Idle -> Sensing -> Deciding ->
//! Applying -> Idle`. One agent's failure, including a panic, ends only that
//! agent's tick.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use land_proto::{encode_fields, DocumentStore, Position};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::activity::ActivityTracker;
use crate::oracle::{Action, Decision, DecisionOracle, STEP_SPEED};
use crate::position_cache::{PositionCache, PositionSnapshot};
use crate::sensory::build_sensory_grid;

pub const DEFAULT_AGENT_ID: &str = "dummy";

/// Seed of the single monster a fresh process controls.
pub fn default_agent() -> Position {
    Position::new(DEFAULT_AGENT_ID, 950.0, 1000.0)
        .with_angle(180.0)
        .with_speed(STEP_SPEED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentPhase {
    Idle,
    Sensing,
    Deciding,
    Applying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub position: Position,
    pub phase: AgentPhase,
    /// Ticks that reached `Applying`.
    pub tick_count: u64,
    pub last_decision: Option<Decision>,
}

impl AgentState {
    pub fn new(position: Position) -> Self {
        Self {
            position,
            phase: AgentPhase::Idle,
            tick_count: 0,
            last_decision: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickOutcome {
    Moved { action: Action, x: f64, y: f64 },
    Stayed,
    NoActivePlayer,
    OracleFailed { reason: String },
    Panicked { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTickReport {
    pub agent_id: String,
    pub outcome: TickOutcome,
    /// Set when the decision was applied in memory but not persisted.
    pub persist_error: Option<String>,
}

impl AgentTickReport {
    fn new(agent_id: &str, outcome: TickOutcome) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            outcome,
            persist_error: None,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(
            self.outcome,
            TickOutcome::Moved { .. } | TickOutcome::Stayed
        )
    }
}

/// Collaborators of the control loop, injected at construction.
#[derive(Clone)]
pub struct ControlDeps {
    pub cache: Arc<PositionCache>,
    pub activity: Arc<ActivityTracker>,
    pub oracle: Arc<dyn DecisionOracle>,
    pub store: Arc<dyn DocumentStore>,
    pub monster_collection: String,
}

impl fmt::Debug for ControlDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlDeps")
            .field("cache", &self.cache)
            .field("activity", &self.activity)
            .field("monster_collection", &self.monster_collection)
            .finish_non_exhaustive()
    }
}

/// Sole owner and writer of every [`AgentState`].
#[derive(Debug)]
pub struct AgentController {
    agents: BTreeMap<String, AgentState>,
    deps: ControlDeps,
    stale_window_ms: i64,
}

impl AgentController {
    pub fn new(deps: ControlDeps, stale_window_ms: i64) -> Self {
        Self {
            agents: BTreeMap::new(),
            deps,
            stale_window_ms,
        }
    }

    /// Registers an agent, replacing any agent with the same id.
    pub fn add_agent(&mut self, seed: Position) {
        debug!(agent_id = %seed.id, x = seed.x, y = seed.y, "agent added");
        self.agents.insert(seed.id.clone(), AgentState::new(seed));
    }

    pub fn agent(&self, id: &str) -> Option<&AgentState> {
        self.agents.get(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values()
    }

    pub fn positions(&self) -> BTreeMap<String, Position> {
        self.agents
            .iter()
            .map(|(id, state)| (id.clone(), state.position.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Runs one tick for every agent, in id order.
    pub fn tick(&mut self, now_ms: i64) -> Vec<AgentTickReport> {
        if !self.deps.activity.exists_active_player() {
            return self
                .agents
                .keys()
                .map(|id| AgentTickReport::new(id, TickOutcome::NoActivePlayer))
                .collect();
        }

        let players = self.deps.cache.snapshot();
        let mut reports = Vec::with_capacity(self.agents.len());
        for (id, state) in self.agents.iter_mut() {
            let deps = &self.deps;
            let stale_window_ms = self.stale_window_ms;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                tick_agent(deps, state, &players, now_ms, stale_window_ms)
            }));
            let report = match result {
                Ok(report) => report,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(agent_id = %id, panic = %message, "agent tick panicked");
                    state.phase = AgentPhase::Idle;
                    AgentTickReport::new(id, TickOutcome::Panicked { message })
                }
            };
            reports.push(report);
        }
        reports
    }
}

fn tick_agent(
    deps: &ControlDeps,
    state: &mut AgentState,
    players: &PositionSnapshot,
    now_ms: i64,
    stale_window_ms: i64,
) -> AgentTickReport {
    let agent_id = state.position.id.clone();

    state.phase = AgentPhase::Sensing;
    let grid = build_sensory_grid(&state.position, players, now_ms, stale_window_ms);

    state.phase = AgentPhase::Deciding;
    let decision = match deps.oracle.predict(&grid) {
        Ok(decision) => decision,
        Err(err) => {
            warn!(agent_id = %agent_id, error = %err, "oracle call failed, tick skipped");
            state.phase = AgentPhase::Idle;
            return AgentTickReport::new(
                &agent_id,
                TickOutcome::OracleFailed {
                    reason: err.to_string(),
                },
            );
        }
    };

    state.phase = AgentPhase::Applying;
    let position = &mut state.position;
    position.x += decision.dx * position.speed;
    position.y += decision.dy * position.speed;
    position.is_moving = decision.is_moving;
    position.angle = decision.facing.degrees();
    state.tick_count += 1;
    state.last_decision = Some(decision);

    let outcome = if decision.is_moving {
        TickOutcome::Moved {
            action: decision.action,
            x: state.position.x,
            y: state.position.y,
        }
    } else {
        TickOutcome::Stayed
    };
    let mut report = AgentTickReport::new(&agent_id, outcome);
    if let Err(reason) = persist_agent(deps, &state.position) {
        warn!(agent_id = %agent_id, error = %reason, "agent position not persisted");
        report.persist_error = Some(reason);
    }
    state.phase = AgentPhase::Idle;
    report
}

fn persist_agent(deps: &ControlDeps, position: &Position) -> Result<(), String> {
    let fields = encode_fields(position).map_err(|err| err.to_string())?;
    deps.store
        .upsert(&deps.monster_collection, &position.id, fields)
        .map_err(|err| err.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
