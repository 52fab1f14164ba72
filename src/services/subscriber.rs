//! MQTT command topic subscriber
//!
//! Routes `<prefix>/<portId>/<entityId>/set` and
//! `<prefix>/<portId>/<entityId>/<attr>/set` payloads into the command
//! manager. Generic payloads map action words (ON/OFF/OPEN/...) onto flag
//! commands; attribute topics carry the parsed literal as the command
//! value. A missing `command_mode`-style field falls back to the
//! value-named flag command (`mode: heat` -> `command_heat`).

use crate::infra::error::CommandError;
use crate::io::mqtt::{MqttClient, MqttMessage};
use crate::services::command::CommandManager;
use crate::services::device::handlers;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Subscriber {
    port_id: String,
    prefix: String,
    command: Arc<CommandManager>,
}

impl Subscriber {
    pub fn new(port_id: String, prefix: String, command: Arc<CommandManager>) -> Self {
        Self { port_id, prefix, command }
    }

    /// Subscribe to the port's set topics and dispatch until shutdown.
    pub async fn run(self, mqtt: Arc<dyn MqttClient>, mut shutdown: watch::Receiver<bool>) {
        let generic = format!("{}/{}/+/set", self.prefix, self.port_id);
        let attribute = format!("{}/{}/+/+/set", self.prefix, self.port_id);
        let mut generic_rx = match mqtt.subscribe(&generic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(filter = %generic, error = %e, "command_subscribe_failed");
                return;
            }
        };
        let mut attribute_rx = match mqtt.subscribe(&attribute).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(filter = %attribute, error = %e, "command_subscribe_failed");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                message = generic_rx.recv() => {
                    match message {
                        Some(message) => self.handle(&message).await,
                        None => return,
                    }
                }
                message = attribute_rx.recv() => {
                    match message {
                        Some(message) => self.handle(&message).await,
                        None => return,
                    }
                }
            }
        }
    }

    pub async fn handle(&self, message: &MqttMessage) {
        let payload = message.payload_str();
        let Some((entity_id, attr)) = self.parse_topic(&message.topic) else {
            return;
        };
        debug!(entity = %entity_id, attr = ?attr, payload = %payload, "command_topic");

        let (command, value) = match &attr {
            None => handlers::set_payload_command(&payload),
            Some(attr) => (attr.clone(), handlers::parse_payload(&payload)),
        };

        match self.command.command(&entity_id, &command, &value).await {
            Ok(()) => {}
            // A missing value-taking command can still exist as a flag
            // command named by the payload itself.
            Err(CommandError::UnknownCommand { .. }) => {
                let fallback = payload.trim().to_ascii_lowercase();
                if fallback.is_empty() {
                    warn!(entity = %entity_id, command = %command, "unknown_command");
                    return;
                }
                if let Err(e) = self
                    .command
                    .command(&entity_id, &fallback, &serde_json::Value::Null)
                    .await
                {
                    warn!(entity = %entity_id, command = %command, error = %e, "command_failed");
                }
            }
            Err(e) => {
                warn!(entity = %entity_id, command = %command, error = %e, "command_failed");
            }
        }
    }

    /// `prefix/port/entity/set` -> (entity, None);
    /// `prefix/port/entity/attr/set` -> (entity, Some(attr)).
    fn parse_topic(&self, topic: &str) -> Option<(String, Option<String>)> {
        let rest = topic
            .strip_prefix(&self.prefix)?
            .strip_prefix('/')?
            .strip_prefix(&self.port_id)?
            .strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [entity, "set"] => Some((entity.to_string(), None)),
            [entity, attr, "set"] => Some((entity.to_string(), Some(attr.to_string()))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expr::ExprEngine;
    use crate::domain::types::Packet;
    use crate::infra::bus::EventBus;
    use crate::infra::config::BridgeConfig;
    use crate::infra::counters::PortCounters;
    use crate::services::device::EntityRuntime;
    use crate::services::state::StateStore;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::sync::{broadcast, mpsc};

    const CATALOG: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  light:
    - id: light_1
      state: {offset: 0, data: [0x30]}
      command_on: {data: [0x31, 0x01]}
      command_off: {data: [0x31, 0x00]}
  fan:
    - id: fan_1
      state: {offset: 0, data: [0x40]}
      command_speed: {data: [0x41, 0x00], value_offset: 1}
  climate:
    - id: clim_1
      state: {offset: 0, data: [0x20]}
      command_heat: {data: [0x21, 0x04]}
"#;

    async fn build() -> (Subscriber, Arc<Mutex<Vec<u8>>>) {
        let config = BridgeConfig::from_yaml_str(CATALOG).unwrap();
        let port = config.ports[0].clone();
        let engine = Arc::new(ExprEngine::new());
        let runtimes: Vec<Arc<EntityRuntime>> = port
            .entities()
            .unwrap()
            .into_iter()
            .map(|e| Arc::new(EntityRuntime::new(e, &port.packet_defaults, engine.clone())))
            .collect();

        let (packets, _) = broadcast::channel::<Packet>(16);
        let (updates_tx, _updates_rx) = mpsc::channel(16);
        let command = Arc::new(CommandManager::new(
            "main".to_string(),
            packets,
            StateStore::new(),
            updates_tx,
            EventBus::new(),
            Arc::new(PortCounters::new()),
        ));
        command.set_registry(&runtimes);

        let (client, mut server) = tokio::io::duplex(256);
        command.attach_writer(Box::new(client)).await;
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = server.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                sink.lock().extend_from_slice(&buf[..n]);
            }
        });

        (Subscriber::new("main".to_string(), "homenet".to_string(), command), written)
    }

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage { topic: topic.to_string(), payload: payload.as_bytes().to_vec() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_on_payload() {
        let (subscriber, written) = build().await;
        subscriber.handle(&message("homenet/main/light_1/set", "ON")).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*written.lock(), vec![0x31, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attribute_percentage_routes_to_speed() {
        let (subscriber, written) = build().await;
        subscriber.handle(&message("homenet/main/fan_1/percentage/set", "50")).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*written.lock(), vec![0x41, 0x32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_falls_back_to_value_named_command() {
        let (subscriber, written) = build().await;
        subscriber.handle(&message("homenet/main/clim_1/mode/set", "heat")).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*written.lock(), vec![0x21, 0x04]);
    }

    #[tokio::test]
    async fn test_foreign_topic_is_ignored() {
        let (subscriber, written) = build().await;
        subscriber.handle(&message("homenet/other/light_1/set", "ON")).await;
        subscriber.handle(&message("homenet/main/light_1/state", "ON")).await;
        assert!(written.lock().is_empty());
    }

    #[test]
    fn test_parse_topic_shapes() {
        let (packets, _) = broadcast::channel::<Packet>(1);
        let (updates_tx, _rx) = mpsc::channel(1);
        let command = Arc::new(CommandManager::new(
            "main".to_string(),
            packets,
            StateStore::new(),
            updates_tx,
            EventBus::new(),
            Arc::new(PortCounters::new()),
        ));
        let subscriber = Subscriber::new("main".to_string(), "homenet".to_string(), command);

        assert_eq!(
            subscriber.parse_topic("homenet/main/light_1/set"),
            Some(("light_1".to_string(), None))
        );
        assert_eq!(
            subscriber.parse_topic("homenet/main/fan_1/percentage/set"),
            Some(("fan_1".to_string(), Some("percentage".to_string())))
        );
        assert_eq!(subscriber.parse_topic("homenet/main/fan_1/state"), None);
        assert_eq!(subscriber.parse_topic("other/main/fan_1/set"), None);
    }
}
