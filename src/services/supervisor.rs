//! Bridge supervisor - N independent port engines over one MQTT client
//!
//! Ports share only the MQTT client and the process-wide event bus; each
//! engine keeps its own status and its errors never cross the port
//! boundary. The supervisor exposes the aggregate view.

use crate::domain::types::{BridgeEvent, PortStatus};
use crate::infra::bus::EventBus;
use crate::infra::config::BridgeConfig;
use crate::io::mqtt::MqttClient;
use crate::services::port::PortEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

pub struct BridgeSupervisor {
    ports: Vec<Arc<PortEngine>>,
    bus: EventBus,
}

impl BridgeSupervisor {
    pub fn new(config: BridgeConfig, mqtt: Arc<dyn MqttClient>, bus: EventBus) -> Self {
        let ports = config
            .ports
            .iter()
            .cloned()
            .map(|port| {
                Arc::new(PortEngine::new(
                    port,
                    config.settings.clone(),
                    mqtt.clone(),
                    bus.clone(),
                ))
            })
            .collect();
        Self { ports, bus }
    }

    pub fn ports(&self) -> &[Arc<PortEngine>] {
        &self.ports
    }

    /// Per-port status snapshot.
    pub fn statuses(&self) -> Vec<(String, PortStatus)> {
        self.ports
            .iter()
            .map(|port| (port.port_id().to_string(), port.status().borrow().clone()))
            .collect()
    }

    pub fn all_started(&self) -> bool {
        self.ports
            .iter()
            .all(|port| matches!(*port.status().borrow(), PortStatus::Started))
    }

    /// Announce a rename; the owning port's discovery manager reacts.
    pub fn rename_entity(&self, port_id: &str, entity_id: &str, old_name: &str, new_name: &str) {
        self.bus.publish(BridgeEvent::EntityRenamed {
            port_id: port_id.to_string(),
            entity_id: entity_id.to_string(),
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
    }

    /// Run every port engine until shutdown. A port failing to start does
    /// not stop its siblings.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(ports = %self.ports.len(), "bridge_supervisor_started");
        let mut handles = Vec::new();
        for port in &self.ports {
            let port = port.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = port.run(shutdown).await {
                    error!(port_id = %port.port_id(), error = %e, "port_run_failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("bridge_supervisor_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mqtt::RecordingMqtt;

    const TWO_PORTS: &str = r#"
homenet_bridge:
  - serial: {port_id: a, path: /dev/ttyUSB0}
  - serial: {port_id: b, path: "10.0.0.2:8899"}
"#;

    #[tokio::test]
    async fn test_supervisor_builds_all_ports() {
        let config = BridgeConfig::from_yaml_str(TWO_PORTS).unwrap();
        let supervisor =
            BridgeSupervisor::new(config, Arc::new(RecordingMqtt::new()), EventBus::new());
        assert_eq!(supervisor.ports().len(), 2);
        let statuses = supervisor.statuses();
        assert_eq!(statuses[0].0, "a");
        assert_eq!(statuses[1].0, "b");
        assert!(matches!(statuses[0].1, PortStatus::Idle));
        assert!(!supervisor.all_started());
    }

    #[tokio::test]
    async fn test_rename_event_reaches_bus() {
        let config = BridgeConfig::from_yaml_str(TWO_PORTS).unwrap();
        let bus = EventBus::new();
        let supervisor =
            BridgeSupervisor::new(config, Arc::new(RecordingMqtt::new()), bus.clone());
        let mut rx = bus.subscribe();
        supervisor.rename_entity("a", "switch1", "A", "B");
        match rx.recv().await.unwrap() {
            BridgeEvent::EntityRenamed { port_id, entity_id, old_name, new_name } => {
                assert_eq!(port_id, "a");
                assert_eq!(entity_id, "switch1");
                assert_eq!(old_name, "A");
                assert_eq!(new_name, "B");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
