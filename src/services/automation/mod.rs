//! Automation manager - triggers, guards, runs and scheduling
//!
//! Each port owns one manager built from its `automation:` and `scripts:`
//! config. Triggers fire from the lossless state-change feed, the port's
//! packet broadcast, interval/cron schedules, and startup. A triggered
//! automation evaluates its guards (trigger-level AND automation-level) to
//! pick the `then` or `else` branch, then runs the branch as a spawned task
//! under a cancellation token. Execution modes: `single` skips while a run
//! is in flight, `restart` cancels it, `parallel` always spawns.

pub mod actions;
#[cfg(test)]
mod tests;

use crate::domain::expr::{EvalContext, ExprEngine, ExprValue};
use crate::domain::types::{BridgeEvent, Packet, StateChange};
use crate::infra::bus::EventBus;
use crate::infra::config::{
    ActionConfig, AutomationConfig, AutomationMode, MatchPredicate, PacketDefaults,
    ScriptConfig, TriggerConfig,
};
use crate::infra::counters::PortCounters;
use crate::io::mqtt::MqttClient;
use crate::services::command::CommandManager;
use crate::services::framer::frame_body;
use crate::services::state::StateStore;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared dependencies handed to every action run.
pub struct AutomationContext {
    pub port_id: String,
    pub port_params: PacketDefaults,
    pub engine: Arc<ExprEngine>,
    pub store: StateStore,
    pub command: Arc<CommandManager>,
    pub mqtt: Arc<dyn MqttClient>,
    pub bus: EventBus,
    pub scripts: FxHashMap<String, Arc<ScriptConfig>>,
}

struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
}

pub struct AutomationManager {
    ctx: Arc<AutomationContext>,
    automations: Arc<Vec<AutomationConfig>>,
    labels: Vec<String>,
    /// Active run per automation index (single/restart bookkeeping).
    runs: Arc<Mutex<FxHashMap<usize, ActiveRun>>>,
    /// Leading-edge debounce: last fire per (automation, trigger).
    debounce: Mutex<FxHashMap<(usize, usize), Instant>>,
    root: CancellationToken,
    counters: Arc<PortCounters>,
    next_run_id: AtomicU64,
}

impl AutomationManager {
    pub fn new(
        automations: Vec<AutomationConfig>,
        ctx: AutomationContext,
        counters: Arc<PortCounters>,
    ) -> Arc<Self> {
        let labels = automations
            .iter()
            .enumerate()
            .map(|(i, a)| a.label(i))
            .collect();
        Arc::new(Self {
            ctx: Arc::new(ctx),
            automations: Arc::new(automations),
            labels,
            runs: Arc::new(Mutex::new(FxHashMap::default())),
            debounce: Mutex::new(FxHashMap::default()),
            root: CancellationToken::new(),
            counters,
            next_run_id: AtomicU64::new(1),
        })
    }

    /// Spawn the trigger loops: state/packet event routing, schedules, and
    /// the one-shot startup triggers.
    pub fn start(
        self: &Arc<Self>,
        mut state_rx: mpsc::Receiver<Arc<StateChange>>,
        mut packet_rx: broadcast::Receiver<Packet>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.root.cancelled() => return,
                    change = state_rx.recv() => {
                        match change {
                            Some(change) => manager.on_state_change(&change).await,
                            None => return,
                        }
                    }
                    packet = packet_rx.recv() => {
                        match packet {
                            Ok(packet) => manager.on_packet(&packet).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = %n, "automation_packet_feed_lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });

        for (index, automation) in self.automations.iter().enumerate() {
            for trigger in &automation.trigger {
                match trigger {
                    TriggerConfig::Schedule { every_ms: Some(ms), guard, .. } => {
                        self.spawn_interval(index, *ms, guard.clone());
                    }
                    TriggerConfig::Schedule { cron: Some(expr), guard, .. } => {
                        self.spawn_cron(index, expr.clone(), guard.clone());
                    }
                    TriggerConfig::Startup { guard } => {
                        let manager = self.clone();
                        let guard = guard.clone();
                        tokio::spawn(async move {
                            let payload = map_payload(&[("type", ExprValue::Str("startup".into()))]);
                            manager.fire(index, payload, guard.as_deref(), None).await;
                        });
                    }
                    _ => {}
                }
            }
        }
        info!(port_id = %self.ctx.port_id, automations = %self.automations.len(), "automation_manager_started");
    }

    /// Cancel every run and scheduled timer.
    pub fn stop(&self) {
        self.root.cancel();
        let mut runs = self.runs.lock();
        for (_, run) in runs.drain() {
            run.token.cancel();
        }
    }

    /// Run a script by id, under the manager's cancellation root.
    pub async fn run_script(&self, name: &str) -> Result<(), actions::ActionError> {
        let script = self
            .ctx
            .scripts
            .get(name)
            .cloned()
            .ok_or_else(|| actions::ActionError::Failed(format!("unknown script {name:?}")))?;
        let token = self.root.child_token();
        self.ctx.bus.publish(BridgeEvent::ScriptAction {
            port_id: self.ctx.port_id.clone(),
            script: name.to_string(),
            action: "start".to_string(),
        });
        actions::run_actions(&self.ctx, name, &script.sequence, &ExprValue::Null, &token).await
    }

    async fn on_state_change(&self, change: &StateChange) {
        for (index, automation) in self.automations.iter().enumerate() {
            for (trigger_index, trigger) in automation.trigger.iter().enumerate() {
                let TriggerConfig::State {
                    entity_id,
                    attribute,
                    predicate,
                    debounce_ms,
                    guard,
                } = trigger
                else {
                    continue;
                };
                if entity_id != &change.entity_id {
                    continue;
                }
                let attribute = attribute.as_deref().unwrap_or("state");
                let Some(new_value) = change.changes.get(attribute) else {
                    continue;
                };
                if let Some(predicate) = predicate {
                    if !predicate_matches(predicate, new_value) {
                        continue;
                    }
                }
                if let Some(window) = debounce_ms {
                    if self.debounced(index, trigger_index, *window) {
                        debug!(automation = %self.labels[index], "trigger_debounced");
                        continue;
                    }
                }
                let payload = map_payload(&[
                    ("type", ExprValue::Str("state".into())),
                    ("entity_id", ExprValue::Str(change.entity_id.clone())),
                    ("attribute", ExprValue::Str(attribute.to_string())),
                    ("value", ExprValue::from_json(new_value)),
                    (
                        "old_value",
                        change
                            .old_state
                            .get(attribute)
                            .map(ExprValue::from_json)
                            .unwrap_or(ExprValue::Null),
                    ),
                ]);
                self.fire(index, payload, guard.as_deref(), None).await;
            }
        }
    }

    async fn on_packet(&self, packet: &Packet) {
        let Some(body) = frame_body(&self.ctx.port_params, &packet.raw) else {
            return;
        };
        for (index, automation) in self.automations.iter().enumerate() {
            for trigger in &automation.trigger {
                let TriggerConfig::Packet { schema, guard } = trigger else {
                    continue;
                };
                if !schema.matches(body) {
                    continue;
                }
                let payload = map_payload(&[
                    ("type", ExprValue::Str("packet".into())),
                    (
                        "data",
                        ExprValue::List(body.iter().map(|&b| ExprValue::Int(b as i64)).collect()),
                    ),
                ]);
                self.fire(index, payload, guard.as_deref(), Some(body)).await;
            }
        }
    }

    /// True (and records the hit) when the trigger already fired within its
    /// debounce window.
    fn debounced(&self, index: usize, trigger_index: usize, window_ms: u64) -> bool {
        let mut debounce = self.debounce.lock();
        let now = Instant::now();
        if let Some(last) = debounce.get(&(index, trigger_index)) {
            if now.duration_since(*last) < Duration::from_millis(window_ms) {
                return true;
            }
        }
        debounce.insert((index, trigger_index), now);
        false
    }

    /// Evaluate guards, pick the branch, apply the execution mode and spawn
    /// the run.
    async fn fire(
        &self,
        index: usize,
        trigger_payload: ExprValue,
        trigger_guard: Option<&str>,
        packet_body: Option<&[u8]>,
    ) {
        let automation = &self.automations[index];
        let label = self.labels[index].clone();

        let mut passed = match trigger_guard {
            Some(guard) => self.eval_trigger_guard(guard, &trigger_payload, packet_body),
            None => true,
        };
        if passed {
            if let Some(condition) = &automation.condition {
                passed = actions::eval_guard(&self.ctx, condition, &trigger_payload);
            }
        }
        self.ctx.bus.publish(BridgeEvent::AutomationGuard {
            port_id: self.ctx.port_id.clone(),
            automation: label.clone(),
            passed,
        });

        let branch: &[ActionConfig] =
            if passed { &automation.then } else { &automation.otherwise };
        if branch.is_empty() {
            return;
        }
        let branch = branch.to_vec();

        let token = self.root.child_token();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        match automation.mode {
            AutomationMode::Single => {
                let mut runs = self.runs.lock();
                if let Some(active) = runs.get(&index) {
                    if !active.token.is_cancelled() {
                        debug!(automation = %label, "run_skipped_already_running");
                        return;
                    }
                }
                runs.insert(index, ActiveRun { run_id, token: token.clone() });
            }
            AutomationMode::Restart => {
                let mut runs = self.runs.lock();
                if let Some(active) = runs.remove(&index) {
                    debug!(automation = %label, "run_restarted");
                    active.token.cancel();
                }
                runs.insert(index, ActiveRun { run_id, token: token.clone() });
            }
            AutomationMode::Parallel => {}
        }

        self.counters.record_automation_run();
        let ctx = self.ctx.clone();
        let runs = self.runs.clone();
        let tracked = automation.mode != AutomationMode::Parallel;
        tokio::spawn(async move {
            let result =
                actions::run_actions(&ctx, &label, &branch, &trigger_payload, &token).await;
            match result {
                Ok(()) => debug!(automation = %label, "run_completed"),
                Err(actions::ActionError::Cancelled) => {
                    debug!(automation = %label, "run_cancelled");
                }
                Err(actions::ActionError::Failed(e)) => {
                    warn!(automation = %label, error = %e, "run_failed");
                }
            }
            if tracked {
                let mut runs = runs.lock();
                if runs.get(&index).is_some_and(|active| active.run_id == run_id) {
                    runs.remove(&index);
                }
            }
        });
    }

    /// Packet trigger guards see the packet body as `data`; other guards
    /// get the snapshot and trigger payload only.
    fn eval_trigger_guard(
        &self,
        guard: &str,
        trigger_payload: &ExprValue,
        packet_body: Option<&[u8]>,
    ) -> bool {
        let states = self.ctx.store.snapshot();
        let eval_ctx = EvalContext {
            data: packet_body.unwrap_or(&[]),
            states: Some(&states),
            trigger: trigger_payload.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        };
        match self.ctx.engine.eval_guard(guard, &eval_ctx) {
            Ok(truthy) => truthy,
            Err(e) => {
                debug!(error = %e, "trigger_guard_failed");
                false
            }
        }
    }

    fn spawn_interval(self: &Arc<Self>, index: usize, every_ms: u64, guard: Option<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(every_ms.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` is immediate; schedules fire
            // after one period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.root.cancelled() => return,
                    _ = ticker.tick() => {
                        let payload = map_payload(&[("type", ExprValue::Str("schedule".into()))]);
                        manager.fire(index, payload, guard.as_deref(), None).await;
                    }
                }
            }
        });
    }

    /// Local wall-clock cron with a single-shot timer rescheduled from
    /// `next()` after each firing.
    fn spawn_cron(self: &Arc<Self>, index: usize, expr: String, guard: Option<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = match next_cron_wait(&expr) {
                    Some(wait) => wait,
                    None => {
                        warn!(cron = %expr, "cron_expression_invalid");
                        return;
                    }
                };
                tokio::select! {
                    _ = manager.root.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {
                        let payload = map_payload(&[
                            ("type", ExprValue::Str("schedule".into())),
                            ("cron", ExprValue::Str(expr.clone())),
                        ]);
                        manager.fire(index, payload, guard.as_deref(), None).await;
                    }
                }
            }
        });
    }
}

/// Time until the next local-time occurrence of a cron expression.
pub fn next_cron_wait(expr: &str) -> Option<Duration> {
    let now = chrono::Local::now();
    let next = cron_parser::parse(expr, &now).ok()?;
    (next - now).to_std().ok()
}

fn map_payload(pairs: &[(&str, ExprValue)]) -> ExprValue {
    let mut map = BTreeMap::new();
    for (key, value) in pairs {
        map.insert(key.to_string(), value.clone());
    }
    ExprValue::Map(map)
}

/// State trigger predicates. Literal strings compare case-insensitively so
/// `match: "on"` fires on the canonical `"ON"` state.
pub fn predicate_matches(predicate: &MatchPredicate, value: &serde_json::Value) -> bool {
    match predicate {
        MatchPredicate::Literal(literal) => loose_eq(literal, value),
        MatchPredicate::Compare { eq, gt, gte, lt, lte, regex } => {
            if let Some(expected) = eq {
                if !loose_eq(expected, value) {
                    return false;
                }
            }
            let number = value.as_f64();
            for (bound, check) in [
                (gt, (|v: f64, b: f64| v > b) as fn(f64, f64) -> bool),
                (gte, |v, b| v >= b),
                (lt, |v, b| v < b),
                (lte, |v, b| v <= b),
            ] {
                if let Some(bound) = bound {
                    match number {
                        Some(v) if check(v, *bound) => {}
                        _ => return false,
                    }
                }
            }
            if let Some(pattern) = regex {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match fancy_regex::Regex::new(pattern) {
                    Ok(compiled) if matches!(compiled.is_match(&text), Ok(true)) => {}
                    _ => return false,
                }
            }
            true
        }
    }
}

fn loose_eq(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    if expected == actual {
        return true;
    }
    match (expected, actual) {
        (serde_json::Value::String(a), serde_json::Value::String(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}
