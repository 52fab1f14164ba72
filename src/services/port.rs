//! Port engine - one RS-485 bus end to end
//!
//! Owns the transport, framer, entity runtimes, state/command/discovery/
//! automation managers and the MQTT subscriber for a single port. The
//! transport read task is the sole framer writer; parsing and state merging
//! run on the state task so an entity's previous state is always current
//! when the next packet for it arrives. Transport failures put the port
//! into `reconnecting` with exponential backoff; errors never leave the
//! port.

use crate::domain::expr::ExprEngine;
use crate::domain::types::{
    BridgeEvent, ErrorSource, Packet, PortStatus, Severity, StateBag, StatusCause,
};
use crate::infra::bus::EventBus;
use crate::infra::config::{PortConfig, Settings};
use crate::infra::counters::PortCounters;
use crate::io::mqtt::MqttClient;
use crate::io::transport;
use crate::services::automation::{AutomationContext, AutomationManager};
use crate::services::command::CommandManager;
use crate::services::device::EntityRuntime;
use crate::services::discovery::{DiscoveryEvent, DiscoveryManager};
use crate::services::framer::Framer;
use crate::services::state::StateManager;
use crate::services::subscriber::Subscriber;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const COUNTERS_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct PortEngine {
    config: PortConfig,
    settings: Settings,
    mqtt: Arc<dyn MqttClient>,
    bus: EventBus,
    counters: Arc<PortCounters>,
    status_tx: watch::Sender<PortStatus>,
    status_rx: watch::Receiver<PortStatus>,
    /// Raw-data tap toggle; off the critical path unless enabled.
    raw_listener: Arc<AtomicBool>,
}

impl PortEngine {
    pub fn new(
        config: PortConfig,
        settings: Settings,
        mqtt: Arc<dyn MqttClient>,
        bus: EventBus,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(PortStatus::Idle);
        Self {
            config,
            settings,
            mqtt,
            bus,
            counters: Arc::new(PortCounters::new()),
            status_tx,
            status_rx,
            raw_listener: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn port_id(&self) -> &str {
        self.config.port_id()
    }

    pub fn status(&self) -> watch::Receiver<PortStatus> {
        self.status_rx.clone()
    }

    pub fn counters(&self) -> Arc<PortCounters> {
        self.counters.clone()
    }

    pub fn start_raw_listener(&self) {
        self.raw_listener.store(true, Ordering::Relaxed);
    }

    pub fn stop_raw_listener(&self) {
        self.raw_listener.store(false, Ordering::Relaxed);
    }

    fn set_status(&self, status: PortStatus) {
        debug!(port_id = %self.port_id(), status = %status.as_str(), "port_status");
        let _ = self.status_tx.send(status);
    }

    /// Build the managers, open the transport and run until shutdown.
    /// Entities and automations are rebuilt from config on every call.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.set_status(PortStatus::Starting);
        let port_id = self.port_id().to_string();
        let prefix = self.settings.prefix.clone();

        let engine = Arc::new(ExprEngine::new());
        let entities = self.config.entities()?;
        let runtimes: Vec<Arc<EntityRuntime>> = entities
            .iter()
            .cloned()
            .map(|e| Arc::new(EntityRuntime::new(e, &self.config.packet_defaults, engine.clone())))
            .collect();

        // Packet fan-out: ACK waiters, automation packet triggers, raw tap.
        let (packet_tx, _) = broadcast::channel::<Packet>(256);
        // Framed packets into the state task, in arrival order.
        let (parse_tx, mut parse_rx) = mpsc::channel::<Packet>(256);
        // Optimistic command confirmations into the state task.
        let (updates_tx, mut updates_rx) = mpsc::channel::<(String, StateBag)>(64);
        // Lossless state transitions into the automation manager.
        let (change_tx, change_rx) = mpsc::channel(256);
        // Discovery events (first state, renames).
        let (discovery_tx, discovery_rx) = mpsc::channel::<DiscoveryEvent>(64);

        let mut state = StateManager::new(
            port_id.clone(),
            prefix.clone(),
            self.mqtt.clone(),
            self.bus.clone(),
            self.counters.clone(),
        )
        .with_change_tx(change_tx);
        let store = state.store();

        let command = Arc::new(CommandManager::new(
            port_id.clone(),
            packet_tx.clone(),
            store.clone(),
            updates_tx.clone(),
            self.bus.clone(),
            self.counters.clone(),
        ));
        command.set_registry(&runtimes);

        let scripts: FxHashMap<String, Arc<_>> = self
            .config
            .scripts
            .iter()
            .map(|s| (s.id.clone(), Arc::new(s.clone())))
            .collect();
        let automation = AutomationManager::new(
            self.config.automation.clone(),
            AutomationContext {
                port_id: port_id.clone(),
                port_params: self.config.packet_defaults.clone(),
                engine,
                store: store.clone(),
                command: command.clone(),
                mqtt: self.mqtt.clone(),
                bus: self.bus.clone(),
                scripts,
            },
            self.counters.clone(),
        );
        automation.start(change_rx, packet_tx.subscribe());

        let discovery = DiscoveryManager::new(
            port_id.clone(),
            prefix.clone(),
            self.mqtt.clone(),
            entities,
            self.config.devices.clone(),
        );
        tokio::spawn(discovery.run(discovery_rx, shutdown.clone()));

        let subscriber =
            Subscriber::new(port_id.clone(), prefix.clone(), command.clone());
        tokio::spawn(subscriber.run(self.mqtt.clone(), shutdown.clone()));

        // Rename events arrive over the bus (admin surface publishes them).
        {
            let mut bus_rx = self.bus.subscribe();
            let discovery_tx = discovery_tx.clone();
            let own_port = port_id.clone();
            let mut bus_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = bus_shutdown.changed() => {
                            if *bus_shutdown.borrow() {
                                return;
                            }
                        }
                        event = bus_rx.recv() => {
                            match event {
                                Ok(BridgeEvent::EntityRenamed { port_id, entity_id, new_name, .. })
                                    if port_id == own_port =>
                                {
                                    let _ = discovery_tx
                                        .send(DiscoveryEvent::Renamed { entity_id, new_name })
                                        .await;
                                }
                                Ok(_) => {}
                                Err(broadcast::error::RecvError::Lagged(_)) => {}
                                Err(broadcast::error::RecvError::Closed) => return,
                            }
                        }
                    }
                }
            });
        }

        // State task: parse packets in arrival order, merge, notify
        // discovery on actual publishes.
        {
            let runtimes = runtimes.clone();
            let store = store.clone();
            let mut task_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = task_shutdown.changed() => {
                            if *task_shutdown.borrow() {
                                return;
                            }
                        }
                        packet = parse_rx.recv() => {
                            let Some(packet) = packet else { return };
                            for runtime in &runtimes {
                                let prev = store.get(runtime.id());
                                if let Some(updates) = runtime.parse(&packet, &prev) {
                                    if state.apply(runtime.id(), updates).await {
                                        let _ = discovery_tx
                                            .send(DiscoveryEvent::StateChanged {
                                                entity_id: runtime.id().to_string(),
                                            })
                                            .await;
                                    }
                                }
                            }
                        }
                        update = updates_rx.recv() => {
                            let Some((entity_id, updates)) = update else { return };
                            if state.apply(&entity_id, updates).await {
                                let _ = discovery_tx
                                    .send(DiscoveryEvent::StateChanged { entity_id })
                                    .await;
                            }
                        }
                    }
                }
            });
        }

        // Periodic counters summary.
        {
            let counters = self.counters.clone();
            let log_port = port_id.clone();
            let mut log_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(COUNTERS_LOG_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = log_shutdown.changed() => {
                            if *log_shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => counters.summary().log(&log_port),
                    }
                }
            });
        }

        self.bus.publish(BridgeEvent::CoreStarted { port_id: port_id.clone() });

        // Transport loop with reconnect backoff. Ends only on shutdown.
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut shutdown_rx = shutdown.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match transport::open(&self.config.serial, self.settings.serial_wait_timeout).await
            {
                Ok((reader, writer)) => {
                    info!(port_id = %port_id, "port_started");
                    self.set_status(PortStatus::Started);
                    backoff = RECONNECT_BACKOFF_START;

                    command.attach_writer(writer).await;
                    let ended = self
                        .read_loop(reader, &packet_tx, &parse_tx, &mut shutdown_rx)
                        .await;
                    command.detach_writer().await;

                    match ended {
                        ReadEnd::Shutdown => break,
                        ReadEnd::Closed(message) => {
                            warn!(port_id = %port_id, error = %message, "transport_lost");
                            self.set_status(PortStatus::Reconnecting(StatusCause::new(
                                ErrorSource::Serial,
                                "transport_lost",
                                message,
                                Severity::Warning,
                                true,
                            )));
                        }
                    }
                }
                Err(e) => {
                    warn!(port_id = %port_id, error = %e, "transport_open_failed");
                    self.set_status(PortStatus::Reconnecting(StatusCause::new(
                        ErrorSource::Serial,
                        "open_failed",
                        e.to_string(),
                        Severity::Error,
                        true,
                    )));
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }

        automation.stop();
        self.set_status(PortStatus::Stopped);
        self.bus.publish(BridgeEvent::CoreStopped { port_id: port_id.clone() });
        info!(port_id = %port_id, "port_stopped");
        Ok(())
    }

    async fn read_loop(
        &self,
        mut reader: impl tokio::io::AsyncRead + Unpin,
        packet_tx: &broadcast::Sender<Packet>,
        parse_tx: &mpsc::Sender<Packet>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadEnd {
        let mut framer = Framer::new(
            self.config.packet_defaults.clone(),
            self.probe_lengths(),
        );
        let mut buf = [0u8; 256];
        let mut dropped_before: u64 = 0;
        let mut last_packet_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return ReadEnd::Shutdown;
                    }
                }
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => return ReadEnd::Closed("transport closed".to_string()),
                        Ok(n) => n,
                        Err(e) => return ReadEnd::Closed(e.to_string()),
                    };
                    let packets = framer.push(&buf[..n]);
                    let dropped = framer.dropped_bytes();
                    if dropped > dropped_before {
                        self.counters.record_dropped_bytes(dropped - dropped_before);
                        dropped_before = dropped;
                    }
                    for packet in packets {
                        self.counters.record_packet();
                        if self.raw_listener.load(Ordering::Relaxed) {
                            let now = Instant::now();
                            self.bus.publish(BridgeEvent::RawData {
                                port_id: self.port_id().to_string(),
                                payload: packet.hex(),
                            });
                            if let Some(last) = last_packet_at {
                                self.bus.publish(BridgeEvent::RawDataWithInterval {
                                    port_id: self.port_id().to_string(),
                                    payload: packet.hex(),
                                    interval_ms: now.duration_since(last).as_millis() as u64,
                                });
                            }
                            last_packet_at = Some(now);
                        }
                        let _ = packet_tx.send(packet.clone());
                        if parse_tx.send(packet).await.is_err() {
                            return ReadEnd::Closed("state task gone".to_string());
                        }
                    }
                }
            }
        }
    }

    fn probe_lengths(&self) -> Vec<usize> {
        let engine = Arc::new(ExprEngine::new());
        self.config
            .entities()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| {
                EntityRuntime::new(e, &self.config.packet_defaults, engine.clone()).probe_length()
            })
            .collect()
    }
}

enum ReadEnd {
    Shutdown,
    Closed(String),
}
