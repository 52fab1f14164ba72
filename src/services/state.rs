//! State manager - merge, diff, dedup and retained publish
//!
//! Single writer per port: the transport read loop feeds parser output in
//! packet-arrival order. Readers (automation expressions) see an atomic
//! snapshot through the shared store. Publishes are retained and
//! deduplicated: at most one publish per distinct payload per entity.

use crate::domain::expr::StatesView;
use crate::domain::types::{BridgeEvent, StateBag, StateChange};
use crate::infra::bus::EventBus;
use crate::infra::counters::PortCounters;
use crate::io::mqtt::MqttClient;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shared, atomically readable snapshot of every entity's state.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<StatesView>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> StateBag {
        self.inner.read().get(entity_id).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatesView {
        self.inner.read().clone()
    }

    fn put(&self, entity_id: &str, state: StateBag) {
        self.inner.write().insert(entity_id.to_string(), state);
    }
}

pub struct StateManager {
    port_id: String,
    prefix: String,
    mqtt: Arc<dyn MqttClient>,
    bus: EventBus,
    store: StateStore,
    counters: Arc<PortCounters>,
    /// Last JSON payload published per entity, for dedup.
    last_published: FxHashMap<String, String>,
    /// Lossless feed into the automation manager.
    change_tx: Option<mpsc::Sender<Arc<StateChange>>>,
}

impl StateManager {
    pub fn new(
        port_id: String,
        prefix: String,
        mqtt: Arc<dyn MqttClient>,
        bus: EventBus,
        counters: Arc<PortCounters>,
    ) -> Self {
        Self {
            port_id,
            prefix,
            mqtt,
            bus,
            store: StateStore::new(),
            counters,
            last_published: FxHashMap::default(),
            change_tx: None,
        }
    }

    /// Attach the lossless state-change feed (automation manager input).
    pub fn with_change_tx(mut self, tx: mpsc::Sender<Arc<StateChange>>) -> Self {
        self.change_tx = Some(tx);
        self
    }

    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    pub fn state_topic(&self, entity_id: &str) -> String {
        format!("{}/{}/{}/state", self.prefix, self.port_id, entity_id)
    }

    /// Merge a partial update, publish on change, fan out the transition.
    /// Returns true when a publish actually happened (discovery keys off
    /// this).
    pub async fn apply(&mut self, entity_id: &str, updates: StateBag) -> bool {
        if updates.is_empty() {
            return false;
        }
        let prev = self.store.get(entity_id);
        let mut next = prev.clone();
        let mut changes = StateBag::new();
        for (key, value) in updates {
            if prev.get(&key) != Some(&value) {
                changes.insert(key.clone(), value.clone());
            }
            next.insert(key, value);
        }

        let payload = serde_json::Value::Object(next.clone()).to_string();
        if changes.is_empty() && self.last_published.get(entity_id) == Some(&payload) {
            debug!(entity = %entity_id, "state_unchanged");
            return false;
        }

        self.store.put(entity_id, next.clone());
        self.last_published.insert(entity_id.to_string(), payload.clone());

        let topic = self.state_topic(entity_id);
        if let Err(e) = self.mqtt.publish(&topic, payload.into_bytes(), true).await {
            warn!(topic = %topic, error = %e, "state_publish_failed");
        } else {
            self.counters.record_state_publish();
        }

        let change = Arc::new(StateChange {
            port_id: self.port_id.clone(),
            entity_id: entity_id.to_string(),
            state: next,
            old_state: prev,
            changes,
        });
        if let Some(tx) = &self.change_tx {
            // Lossless: block rather than drop state transitions.
            if tx.send(change.clone()).await.is_err() {
                debug!(entity = %entity_id, "state_change_feed_closed");
            }
        }
        self.bus.publish(BridgeEvent::StateChanged(change));
        true
    }
}
