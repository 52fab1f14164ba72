//! Home Assistant MQTT discovery
//!
//! Publishes retained config payloads under `homeassistant/<component>/
//! <unique_id>/config`. By default an entity is announced only after its
//! first state change, so a catalog entry for hardware that is not actually
//! on this bus never shows up in Home Assistant; `discovery_always: true`
//! announces immediately and `discovery_linked_id` borrows another
//! entity's first state. A rename clears the retained config, waits, and
//! republishes so Home Assistant tracks the rename instead of duplicating
//! the entity.

use crate::infra::config::{DeviceConfig, EntityConfig, EntityType};
use crate::io::mqtt::MqttClient;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delay between the retained clear and the republish during a rename.
const RENAME_REPUBLISH_DELAY: Duration = Duration::from_secs(2);

/// Events the port engine feeds into the discovery task.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    StateChanged { entity_id: String },
    Renamed { entity_id: String, new_name: String },
}

pub struct DiscoveryManager {
    port_id: String,
    prefix: String,
    mqtt: Arc<dyn MqttClient>,
    entities: Vec<EntityConfig>,
    devices: FxHashMap<String, DeviceConfig>,
    /// Entity ids already announced.
    published: FxHashSet<String>,
    /// Entity ids that have produced at least one state change.
    state_seen: FxHashSet<String>,
    /// Renames applied after config load.
    name_overrides: FxHashMap<String, String>,
}

impl DiscoveryManager {
    pub fn new(
        port_id: String,
        prefix: String,
        mqtt: Arc<dyn MqttClient>,
        entities: Vec<EntityConfig>,
        devices: Vec<DeviceConfig>,
    ) -> Self {
        Self {
            port_id,
            prefix,
            mqtt,
            entities,
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            published: FxHashSet::default(),
            state_seen: FxHashSet::default(),
            name_overrides: FxHashMap::default(),
        }
    }

    /// Mark the bridge online and announce the `discovery_always` entities.
    pub async fn start(&mut self) {
        self.publish_availability().await;
        let always: Vec<String> = self
            .entities
            .iter()
            .filter(|e| e.discovery_always && !e.internal)
            .map(|e| e.id.clone())
            .collect();
        for id in always {
            self.announce(&id).await;
        }
    }

    pub async fn publish_availability(&self) {
        let topic = format!("{}/bridge/status", self.prefix);
        if let Err(e) = self.mqtt.publish(&topic, b"online".to_vec(), true).await {
            warn!(topic = %topic, error = %e, "availability_publish_failed");
        }
    }

    /// First state for an entity unlocks its own announcement and any
    /// entity linked to it.
    pub async fn on_state_changed(&mut self, entity_id: &str) {
        self.state_seen.insert(entity_id.to_string());
        let unlocked: Vec<String> = self
            .entities
            .iter()
            .filter(|e| {
                !e.internal
                    && !self.published.contains(&e.id)
                    && (e.id == entity_id
                        || e.discovery_linked_id.as_deref() == Some(entity_id))
            })
            .map(|e| e.id.clone())
            .collect();
        for id in unlocked {
            self.announce(&id).await;
        }
    }

    /// Home Assistant restarted: republish availability and every config
    /// that was already announced.
    pub async fn on_ha_restart(&mut self) {
        info!(port_id = %self.port_id, "ha_restart_republish");
        self.publish_availability().await;
        let announced: Vec<String> = self.published.iter().cloned().collect();
        for id in announced {
            self.publish_config(&id).await;
        }
    }

    /// Retained clear, settle delay, republish under the new name.
    pub async fn on_renamed(&mut self, entity_id: &str, new_name: &str) {
        let Some(topic) = self.config_topic(entity_id) else {
            return;
        };
        if self.published.contains(entity_id) {
            if let Err(e) = self.mqtt.publish(&topic, Vec::new(), true).await {
                warn!(topic = %topic, error = %e, "discovery_clear_failed");
            }
            tokio::time::sleep(RENAME_REPUBLISH_DELAY).await;
        }
        self.name_overrides.insert(entity_id.to_string(), new_name.to_string());
        if self.published.contains(entity_id) {
            self.publish_config(entity_id).await;
        }
    }

    async fn announce(&mut self, entity_id: &str) {
        if self.published.contains(entity_id) {
            return;
        }
        self.publish_config(entity_id).await;
        self.published.insert(entity_id.to_string());
    }

    async fn publish_config(&self, entity_id: &str) {
        let Some(entity) = self.entities.iter().find(|e| e.id == entity_id) else {
            return;
        };
        let Some(topic) = self.config_topic(entity_id) else {
            return;
        };
        let payload = self.config_payload(entity);
        debug!(topic = %topic, "discovery_publish");
        if let Err(e) = self.mqtt.publish(&topic, payload.to_string().into_bytes(), true).await {
            warn!(topic = %topic, error = %e, "discovery_publish_failed");
        }
    }

    pub fn unique_id(&self, entity: &EntityConfig) -> String {
        entity
            .unique_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}_{}", self.prefix, self.port_id, entity.id))
    }

    fn config_topic(&self, entity_id: &str) -> Option<String> {
        let entity = self.entities.iter().find(|e| e.id == entity_id)?;
        Some(format!(
            "homeassistant/{}/{}/config",
            entity.entity_type.ha_component(),
            self.unique_id(entity)
        ))
    }

    fn entity_name(&self, entity: &EntityConfig) -> String {
        self.name_overrides
            .get(&entity.id)
            .cloned()
            .unwrap_or_else(|| entity.display_name().to_string())
    }

    fn device_block(&self, entity: &EntityConfig) -> Value {
        if let Some(device) = entity.device.as_ref().and_then(|id| self.devices.get(id)) {
            let mut block = Map::new();
            block.insert(
                "identifiers".into(),
                json!([format!("{}_{}_{}", self.prefix, self.port_id, device.id)]),
            );
            block.insert(
                "name".into(),
                json!(device.name.clone().unwrap_or_else(|| device.id.clone())),
            );
            if let Some(manufacturer) = &device.manufacturer {
                block.insert("manufacturer".into(), json!(manufacturer));
            }
            if let Some(model) = &device.model {
                block.insert("model".into(), json!(model));
            }
            if let Some(sw) = &device.sw_version {
                block.insert("sw_version".into(), json!(sw));
            }
            return Value::Object(block);
        }
        json!({
            "identifiers": [format!("{}_bridge_{}", self.prefix, self.port_id)],
            "name": format!("Homenet Bridge ({})", self.port_id),
            "manufacturer": "homenet-bridge",
        })
    }

    /// Build the retained discovery payload for one entity.
    pub fn config_payload(&self, entity: &EntityConfig) -> Value {
        let base = format!("{}/{}/{}", self.prefix, self.port_id, entity.id);
        let state_topic = format!("{base}/state");
        let command_topic = format!("{base}/set");
        let name = self.entity_name(entity);

        let mut payload = Map::new();
        payload.insert("name".into(), json!(name));
        payload.insert("unique_id".into(), json!(self.unique_id(entity)));
        payload.insert("object_id".into(), json!(slug(&name)));
        payload.insert("state_topic".into(), json!(state_topic));
        payload.insert(
            "availability_topic".into(),
            json!(format!("{}/bridge/status", self.prefix)),
        );
        payload.insert("device".into(), self.device_block(entity));
        if let Some(area) = &entity.area {
            payload.insert("suggested_area".into(), json!(area));
        }

        let has_commands = !entity.command_fields.is_empty();
        match entity.entity_type {
            EntityType::Light => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("state_value_template".into(), json!("{{ value_json.state }}"));
                payload.insert("payload_on".into(), json!("ON"));
                payload.insert("payload_off".into(), json!("OFF"));
                if entity.state_field("brightness").is_some()
                    || entity.command_field("brightness").is_some()
                {
                    payload.insert("brightness_state_topic".into(), json!(state_topic));
                    payload.insert(
                        "brightness_value_template".into(),
                        json!("{{ value_json.brightness }}"),
                    );
                    payload.insert(
                        "brightness_command_topic".into(),
                        json!(format!("{base}/brightness/set")),
                    );
                    payload.insert("brightness_scale".into(), json!(255));
                }
                if entity.command_field("color_temp").is_some() {
                    payload.insert("color_temp_state_topic".into(), json!(state_topic));
                    payload.insert(
                        "color_temp_value_template".into(),
                        json!("{{ value_json.color_temp }}"),
                    );
                    payload.insert(
                        "color_temp_command_topic".into(),
                        json!(format!("{base}/color_temp/set")),
                    );
                }
                if entity.command_field("rgb").is_some() {
                    payload.insert("rgb_state_topic".into(), json!(state_topic));
                    payload
                        .insert("rgb_value_template".into(), json!("{{ value_json.rgb }}"));
                    payload.insert(
                        "rgb_command_topic".into(),
                        json!(format!("{base}/rgb/set")),
                    );
                }
            }
            EntityType::Switch => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("value_template".into(), json!("{{ value_json.state }}"));
                payload.insert("payload_on".into(), json!("ON"));
                payload.insert("payload_off".into(), json!("OFF"));
                payload.insert("state_on".into(), json!("ON"));
                payload.insert("state_off".into(), json!("OFF"));
            }
            EntityType::Fan => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("state_value_template".into(), json!("{{ value_json.state }}"));
                payload.insert("payload_on".into(), json!("ON"));
                payload.insert("payload_off".into(), json!("OFF"));
                if entity.state_field("speed").is_some()
                    || entity.command_field("speed").is_some()
                    || entity.command_field("percentage").is_some()
                {
                    payload.insert("percentage_state_topic".into(), json!(state_topic));
                    payload.insert(
                        "percentage_value_template".into(),
                        json!("{{ value_json.speed if value_json.speed is defined else value_json.percentage }}"),
                    );
                    payload.insert(
                        "percentage_command_topic".into(),
                        json!(format!("{base}/percentage/set")),
                    );
                }
                if let Some(presets) = entity.presentation.get("preset_modes") {
                    payload.insert("preset_modes".into(), presets.clone());
                    payload.insert("preset_mode_state_topic".into(), json!(state_topic));
                    payload.insert(
                        "preset_mode_value_template".into(),
                        json!("{{ value_json.preset_mode }}"),
                    );
                    payload.insert(
                        "preset_mode_command_topic".into(),
                        json!(format!("{base}/preset/set")),
                    );
                }
                if entity.state_field("oscillating_on").is_some()
                    || entity.command_field("oscillation").is_some()
                {
                    payload.insert("oscillation_state_topic".into(), json!(state_topic));
                    payload.insert(
                        "oscillation_value_template".into(),
                        json!("{{ 'oscillate_on' if value_json.oscillating else 'oscillate_off' }}"),
                    );
                    payload.insert(
                        "oscillation_command_topic".into(),
                        json!(format!("{base}/oscillation/set")),
                    );
                }
            }
            EntityType::Climate => {
                payload.insert("current_temperature_topic".into(), json!(state_topic));
                payload.insert(
                    "current_temperature_template".into(),
                    json!("{{ value_json.current_temperature }}"),
                );
                payload.insert("temperature_state_topic".into(), json!(state_topic));
                payload.insert(
                    "temperature_state_template".into(),
                    json!("{{ value_json.target_temperature }}"),
                );
                payload.insert(
                    "temperature_command_topic".into(),
                    json!(format!("{base}/temperature/set")),
                );
                payload.insert("mode_state_topic".into(), json!(state_topic));
                payload.insert("mode_state_template".into(), json!("{{ value_json.mode }}"));
                payload.insert(
                    "mode_command_topic".into(),
                    json!(format!("{base}/mode/set")),
                );
                let modes = entity
                    .presentation
                    .get("modes")
                    .cloned()
                    .unwrap_or_else(|| climate_modes(entity));
                payload.insert("modes".into(), modes);
                for key in ["min_temp", "max_temp", "temp_step"] {
                    if let Some(value) = entity.presentation.get(key) {
                        payload.insert(key.into(), value.clone());
                    }
                }
            }
            EntityType::Valve => {
                payload.insert("command_topic".into(), json!(command_topic));
                let reports_position = entity.state_field("position").is_some();
                payload.insert("reports_position".into(), json!(reports_position));
                if reports_position {
                    payload
                        .insert("value_template".into(), json!("{{ value_json.position }}"));
                } else {
                    payload.insert("value_template".into(), json!("{{ value_json.state }}"));
                    payload.insert("state_open".into(), json!("OPEN"));
                    payload.insert("state_opening".into(), json!("OPENING"));
                    payload.insert("state_closed".into(), json!("CLOSED"));
                    payload.insert("state_closing".into(), json!("CLOSING"));
                }
                payload.insert("payload_open".into(), json!("OPEN"));
                payload.insert("payload_close".into(), json!("CLOSE"));
                payload.insert("payload_stop".into(), json!("STOP"));
            }
            EntityType::Button => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("payload_press".into(), json!("PRESS"));
                payload.remove("state_topic");
            }
            EntityType::Sensor | EntityType::TextSensor => {
                payload.insert(
                    "value_template".into(),
                    json!(format!("{{{{ value_json.{} }}}}", primary_value_key(entity))),
                );
            }
            EntityType::BinarySensor => {
                payload.insert("value_template".into(), json!("{{ value_json.state }}"));
                payload.insert("payload_on".into(), json!("ON"));
                payload.insert("payload_off".into(), json!("OFF"));
            }
            EntityType::Lock => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("value_template".into(), json!("{{ value_json.state }}"));
                payload.insert("payload_lock".into(), json!("LOCK"));
                payload.insert("payload_unlock".into(), json!("UNLOCK"));
                payload.insert("state_locked".into(), json!("LOCKED"));
                payload.insert("state_unlocked".into(), json!("UNLOCKED"));
            }
            EntityType::Number => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert(
                    "value_template".into(),
                    json!(format!("{{{{ value_json.{} }}}}", primary_value_key(entity))),
                );
                for key in ["min", "max", "step", "mode"] {
                    if let Some(value) = entity.presentation.get(key) {
                        payload.insert(key.into(), value.clone());
                    }
                }
            }
            EntityType::Select => {
                payload.insert("command_topic".into(), json!(command_topic));
                payload.insert("value_template".into(), json!("{{ value_json.state }}"));
                if let Some(options) = entity.presentation.get("options") {
                    payload.insert("options".into(), options.clone());
                }
            }
            EntityType::Text => {
                payload.insert("command_topic".into(), json!(format!("{base}/text/set")));
                payload.insert("value_template".into(), json!("{{ value_json.text }}"));
            }
        }

        if !has_commands {
            payload.remove("command_topic");
        }
        // Presentation extras not claimed above pass through verbatim
        // (device_class, unit_of_measurement, icon, entity_category, ...).
        for (key, value) in &entity.presentation {
            if !payload.contains_key(key)
                && !matches!(key.as_str(), "modes" | "options" | "preset_modes")
            {
                payload.insert(key.clone(), value.clone());
            }
        }

        Value::Object(payload)
    }

    /// Run loop: consumes engine events and Home Assistant status messages.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ha_status = match self.mqtt.subscribe("homeassistant/status").await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "ha_status_subscribe_failed");
                return;
            }
        };
        self.start().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(DiscoveryEvent::StateChanged { entity_id }) => {
                            self.on_state_changed(&entity_id).await;
                        }
                        Some(DiscoveryEvent::Renamed { entity_id, new_name }) => {
                            self.on_renamed(&entity_id, &new_name).await;
                        }
                        None => return,
                    }
                }
                message = ha_status.recv() => {
                    match message {
                        Some(message) if message.payload_str() == "online" => {
                            self.on_ha_restart().await;
                        }
                        Some(_) => {}
                        None => return,
                    }
                }
            }
        }
    }
}

/// Modes advertised for a climate entity, derived from its flag fields.
fn climate_modes(entity: &EntityConfig) -> Value {
    let known = ["off", "heat", "cool", "auto", "dry", "fan_only"];
    let modes: Vec<&str> = known
        .iter()
        .copied()
        .filter(|mode| entity.state_field(mode).is_some() || entity.command_field(mode).is_some())
        .collect();
    if modes.is_empty() {
        json!(["off", "heat"])
    } else {
        json!(modes)
    }
}

/// Key the sensor/number templates read from the state bag.
fn primary_value_key(entity: &EntityConfig) -> String {
    if entity.state_field("value").is_some() {
        return "value".to_string();
    }
    entity
        .state_fields
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "state".to_string())
}

/// Lowercase, alphanumerics kept, everything else collapsed to '_'.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_sep = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::BridgeConfig;
    use crate::io::mqtt::RecordingMqtt;

    const CATALOG: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  devices:
    - id: wallpad
      name: Wall Pad
      manufacturer: Samsung SDS
  switch:
    - id: switch1
      name: A
      device: wallpad
      state: {offset: 0, data: [0x30]}
      state_on: {offset: 1, data: [0x01]}
      command_on: {data: [0x31, 0x01]}
      command_off: {data: [0x31, 0x00]}
  sensor:
    - id: power_use
      discovery_linked_id: switch1
      device_class: power
      unit_of_measurement: W
      state: {offset: 0, data: [0x40]}
      state_value: {offset: 1, length: 2}
  light:
    - id: always_there
      discovery_always: true
      state: {offset: 0, data: [0x50]}
      state_on: {offset: 1, data: [0x01]}
      command_on: {data: [0x51, 0x01]}
  binary_sensor:
    - id: hidden
      internal: true
      state: {offset: 0, data: [0x60]}
      state_on: {offset: 1, data: [0x01]}
"#;

    fn build(mqtt: Arc<RecordingMqtt>) -> DiscoveryManager {
        let config = BridgeConfig::from_yaml_str(CATALOG).unwrap();
        let port = &config.ports[0];
        DiscoveryManager::new(
            "main".to_string(),
            "homenet".to_string(),
            mqtt,
            port.entities().unwrap(),
            port.devices.clone(),
        )
    }

    #[tokio::test]
    async fn test_start_announces_only_always_entities() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;

        let topics = mqtt.published_topics();
        assert!(topics.contains(&"homenet/bridge/status".to_string()));
        assert!(topics.contains(&"homeassistant/light/homenet_main_always_there/config".to_string()));
        // Deferred until state: the switch must not be announced yet.
        assert!(!topics.iter().any(|t| t.contains("switch1")));
    }

    #[tokio::test]
    async fn test_deferred_until_state_changed() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;

        manager.on_state_changed("switch1").await;
        let topics = mqtt.published_topics();
        assert!(topics.contains(&"homeassistant/switch/homenet_main_switch1/config".to_string()));
        // Linked entity rides along.
        assert!(topics.contains(&"homeassistant/sensor/homenet_main_power_use/config".to_string()));
    }

    #[tokio::test]
    async fn test_internal_entity_never_announced() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;
        manager.on_state_changed("hidden").await;
        assert!(!mqtt.published_topics().iter().any(|t| t.contains("hidden")));
    }

    #[tokio::test]
    async fn test_announce_is_once_per_entity() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;
        manager.on_state_changed("switch1").await;
        manager.on_state_changed("switch1").await;
        let count = mqtt
            .published_topics()
            .iter()
            .filter(|t| t.contains("switch1"))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_payload_shape_switch() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let manager = build(mqtt);
        let config = BridgeConfig::from_yaml_str(CATALOG).unwrap();
        let entities = config.ports[0].entities().unwrap();
        let switch = entities.iter().find(|e| e.id == "switch1").unwrap();

        let payload = manager.config_payload(switch);
        assert_eq!(payload["name"], json!("A"));
        assert_eq!(payload["unique_id"], json!("homenet_main_switch1"));
        assert_eq!(payload["object_id"], json!("a"));
        assert_eq!(payload["state_topic"], json!("homenet/main/switch1/state"));
        assert_eq!(payload["command_topic"], json!("homenet/main/switch1/set"));
        assert_eq!(payload["availability_topic"], json!("homenet/bridge/status"));
        assert_eq!(payload["device"]["name"], json!("Wall Pad"));
        assert_eq!(payload["device"]["manufacturer"], json!("Samsung SDS"));
    }

    #[tokio::test]
    async fn test_payload_shape_sensor_extras() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let manager = build(mqtt);
        let config = BridgeConfig::from_yaml_str(CATALOG).unwrap();
        let entities = config.ports[0].entities().unwrap();
        let sensor = entities.iter().find(|e| e.id == "power_use").unwrap();

        let payload = manager.config_payload(sensor);
        assert_eq!(payload["device_class"], json!("power"));
        assert_eq!(payload["unit_of_measurement"], json!("W"));
        assert_eq!(payload["value_template"], json!("{{ value_json.value }}"));
        // Sensors take no commands.
        assert!(payload.get("command_topic").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_clears_then_republishes() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;
        manager.on_state_changed("switch1").await;
        manager.on_renamed("switch1", "B").await;

        let payloads = mqtt.payloads_for("homeassistant/switch/homenet_main_switch1/config");
        assert_eq!(payloads.len(), 3); // announce, clear, republish
        assert!(payloads[1].is_empty());
        let republished: Value = serde_json::from_str(&payloads[2]).unwrap();
        assert_eq!(republished["name"], json!("B"));
        assert_eq!(republished["object_id"], json!("b"));
        assert_eq!(republished["unique_id"], json!("homenet_main_switch1"));
    }

    #[tokio::test]
    async fn test_ha_restart_republishes_announced_only() {
        let mqtt = Arc::new(RecordingMqtt::new());
        let mut manager = build(mqtt.clone());
        manager.start().await;
        manager.on_state_changed("switch1").await;

        let before = mqtt.published.lock().len();
        manager.on_ha_restart().await;
        let after = mqtt.published.lock().len();
        // availability + switch + linked sensor + always light
        assert_eq!(after - before, 4);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Living Room Light"), "living_room_light");
        assert_eq!(slug("B"), "b");
        assert_eq!(slug("  안방 Light!  "), "light");
        assert_eq!(slug("fan#2"), "fan_2");
    }
}
