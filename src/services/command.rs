//! Command manager - serialized transmit with ACK wait and retry
//!
//! One active transmission per port: the writer slot is a mutex that also
//! carries the last-transmit timestamp so the configured `tx_delay` gap is
//! enforced between frames. ACK waiters subscribe to the port's packet
//! broadcast before the bytes hit the wire, so a fast reply can never be
//! missed. Retries re-arm the waiter per attempt.

use crate::domain::types::{BridgeEvent, Packet, StateBag};
use crate::infra::bus::EventBus;
use crate::infra::config::PacketDefaults;
use crate::infra::counters::PortCounters;
use crate::infra::error::CommandError;
use crate::services::device::EntityRuntime;
use crate::services::framer::frame_body;
use crate::services::state::StateStore;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type WriteSink = Box<dyn AsyncWrite + Unpin + Send>;

struct WriterSlot {
    sink: Option<WriteSink>,
    last_tx: Option<Instant>,
}

pub struct CommandManager {
    port_id: String,
    writer: Mutex<WriterSlot>,
    /// Port packet stream; ACK waiters attach here.
    packets: broadcast::Sender<Packet>,
    /// Entity runtimes, rebuilt on every port (re)start.
    registry: parking_lot::RwLock<FxHashMap<String, Arc<EntityRuntime>>>,
    store: StateStore,
    /// State updates (optimistic confirmations) funneled back through the
    /// single-writer state task.
    updates_tx: mpsc::Sender<(String, StateBag)>,
    bus: EventBus,
    counters: Arc<PortCounters>,
}

impl CommandManager {
    pub fn new(
        port_id: String,
        packets: broadcast::Sender<Packet>,
        store: StateStore,
        updates_tx: mpsc::Sender<(String, StateBag)>,
        bus: EventBus,
        counters: Arc<PortCounters>,
    ) -> Self {
        Self {
            port_id,
            writer: Mutex::new(WriterSlot { sink: None, last_tx: None }),
            packets,
            registry: parking_lot::RwLock::new(FxHashMap::default()),
            store,
            updates_tx,
            bus,
            counters,
        }
    }

    pub fn set_registry(&self, runtimes: &[Arc<EntityRuntime>]) {
        let mut registry = self.registry.write();
        registry.clear();
        for runtime in runtimes {
            registry.insert(runtime.id().to_string(), runtime.clone());
        }
    }

    /// Install the transport write half on port start.
    pub async fn attach_writer(&self, sink: WriteSink) {
        let mut slot = self.writer.lock().await;
        slot.sink = Some(sink);
        slot.last_tx = None;
    }

    /// Drop the write half; in-flight and later sends fail with
    /// `TransportClosed`.
    pub async fn detach_writer(&self) {
        self.writer.lock().await.sink = None;
    }

    /// Build and send a command by entity id and command name. This is the
    /// entry point for MQTT set topics and automation command intents.
    pub async fn command(
        &self,
        entity_id: &str,
        command: &str,
        value: &serde_json::Value,
    ) -> Result<(), CommandError> {
        let runtime = self
            .registry
            .read()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownEntity(entity_id.to_string()))?;

        let snapshot = self.store.snapshot();
        let mut request = runtime.build_command(command, value, Some(&snapshot))?;
        let optimistic = request.optimistic_update.take();

        self.send(entity_id, request.packet, &runtime.params, request.ack.as_ref())
            .await?;

        if let Some(update) = optimistic {
            if !update.is_empty() {
                let _ = self.updates_tx.send((entity_id.to_string(), update)).await;
            }
        }
        Ok(())
    }

    /// Transmit a framed packet under the entity's (or port's) packet
    /// parameters, optionally waiting for a matching acknowledgement.
    pub async fn send(
        &self,
        entity_id: &str,
        packet: Vec<u8>,
        params: &PacketDefaults,
        ack: Option<&crate::domain::schema::Schema>,
    ) -> Result<(), CommandError> {
        // Virtual command: nothing to transmit, success by definition.
        if packet.is_empty() {
            debug!(entity = %entity_id, "virtual_command");
            return Ok(());
        }

        // The retry budget covers ACK timeouts and transport write errors
        // alike; a send with no expected ACK returns right after the first
        // successful write.
        let attempts = params.tx_retry_cnt.max(1);
        let mut last_error = CommandError::AckTimeout(params.tx_timeout);

        for attempt in 1..=attempts {
            // Arm the waiter before the bytes go out.
            let ack_rx = ack.map(|_| self.packets.subscribe());

            match self.transmit(&packet, Duration::from_millis(params.tx_delay)).await {
                Ok(()) => {}
                Err(CommandError::TransportClosed) => return Err(CommandError::TransportClosed),
                Err(e) => {
                    warn!(entity = %entity_id, attempt = %attempt, error = %e, "command_write_failed");
                    last_error = e;
                    continue;
                }
            }
            self.counters.record_command_sent();
            self.bus.publish(BridgeEvent::CommandPacket {
                port_id: self.port_id.clone(),
                entity_id: entity_id.to_string(),
                payload: hex::encode_upper(&packet),
            });

            let (Some(schema), Some(mut rx)) = (ack, ack_rx) else {
                return Ok(());
            };

            match self.wait_for_ack(&mut rx, schema, params, params.tx_timeout).await {
                Ok(()) => {
                    debug!(entity = %entity_id, attempt = %attempt, "command_acked");
                    return Ok(());
                }
                Err(e) => {
                    self.counters.record_ack_failure();
                    info!(entity = %entity_id, attempt = %attempt, "ack_timeout");
                    last_error = e;
                }
            }
        }

        if attempts > 1 {
            Err(CommandError::MaxRetriesExceeded(attempts))
        } else {
            Err(last_error)
        }
    }

    async fn wait_for_ack(
        &self,
        rx: &mut broadcast::Receiver<Packet>,
        schema: &crate::domain::schema::Schema,
        params: &PacketDefaults,
        timeout_ms: u64,
    ) -> Result<(), CommandError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommandError::AckTimeout(timeout_ms));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(packet)) => {
                    if let Some(body) = frame_body(params, &packet.raw) {
                        if schema.matches(body) {
                            return Ok(());
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CommandError::TransportClosed);
                }
                Err(_) => return Err(CommandError::AckTimeout(timeout_ms)),
            }
        }
    }

    /// Exclusive write with the inter-frame gap enforced under the lock.
    async fn transmit(&self, bytes: &[u8], gap: Duration) -> Result<(), CommandError> {
        let mut slot = self.writer.lock().await;
        if let Some(last) = slot.last_tx {
            let since = last.elapsed();
            if since < gap {
                tokio::time::sleep(gap - since).await;
            }
        }
        let sink = slot.sink.as_mut().ok_or(CommandError::TransportClosed)?;
        sink.write_all(bytes)
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        sink.flush()
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        slot.last_tx = Some(Instant::now());
        Ok(())
    }
}
