//! Configuration loading from YAML files
//!
//! The document root is `homenet_bridge:` holding either one port
//! definition or a list of them; an optional sibling `mqtt:` block carries
//! the broker endpoint. Entity catalogs are declared per port as typed
//! arrays (`light:`, `switch:`, ...) whose `state_*` / `command_*` fields
//! are schemas or expression strings (`!lambda` / `!homenet_logic` tagged
//! scalars load unchanged as expressions).
//!
//! Process-level knobs come from the environment: `MQTT_URL`,
//! `MQTT_CONNECT_TIMEOUT_MS`, `SERIAL_PATH_WAIT_TIMEOUT_MS`, `CONFIG_ROOT`.

use crate::domain::checksum::{Checksum, Checksum2};
use crate::domain::schema::{Matcher, Schema};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default config file, relative to `CONFIG_ROOT` when that is set.
pub const DEFAULT_CONFIG_FILE: &str = "homenet_bridge.yaml";

// ---------------------------------------------------------------------------
// Serial / transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Stop bits: 1, 1.5 or 2 in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u8),
            Float(f64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(1) => Ok(StopBits::One),
            Raw::Int(2) => Ok(StopBits::Two),
            Raw::Float(f) if f == 1.0 => Ok(StopBits::One),
            Raw::Float(f) if f == 1.5 => Ok(StopBits::OnePointFive),
            Raw::Float(f) if f == 2.0 => Ok(StopBits::Two),
            _ => Err(serde::de::Error::custom("stop_bits must be 1, 1.5 or 2")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Stable identifier used in MQTT topics and logs.
    #[serde(default = "default_port_id")]
    pub port_id: String,
    /// Filesystem device, or `host:port` for a TCP bridge.
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
}

fn default_port_id() -> String {
    "main".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

impl SerialConfig {
    pub fn is_tcp(&self) -> bool {
        self.path.contains(':')
    }
}

// ---------------------------------------------------------------------------
// Packet parameters
// ---------------------------------------------------------------------------

/// Per-port framing and checksum defaults (`packet_defaults`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacketDefaults {
    pub rx_length: Option<usize>,
    pub rx_header: Vec<u8>,
    pub rx_footer: Vec<u8>,
    pub rx_checksum: Checksum,
    pub rx_checksum2: Checksum2,
    pub tx_header: Vec<u8>,
    pub tx_footer: Vec<u8>,
    pub tx_checksum: Checksum,
    pub tx_checksum2: Checksum2,
    /// Minimum gap between outbound packets, milliseconds.
    pub tx_delay: u64,
    /// ACK wait per attempt, milliseconds.
    pub tx_timeout: u64,
    /// Total send attempts before giving up.
    pub tx_retry_cnt: u32,
}

impl Default for PacketDefaults {
    fn default() -> Self {
        Self {
            rx_length: None,
            rx_header: Vec::new(),
            rx_footer: Vec::new(),
            rx_checksum: Checksum::None,
            rx_checksum2: Checksum2::None,
            tx_header: Vec::new(),
            tx_footer: Vec::new(),
            tx_checksum: Checksum::None,
            tx_checksum2: Checksum2::None,
            tx_delay: 50,
            tx_timeout: 500,
            tx_retry_cnt: 3,
        }
    }
}

/// Entity-level `packet_parameters` override. Only the fields present in
/// YAML override the port defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacketOverride {
    pub rx_length: Option<usize>,
    pub rx_header: Option<Vec<u8>>,
    pub rx_footer: Option<Vec<u8>>,
    pub rx_checksum: Option<Checksum>,
    pub rx_checksum2: Option<Checksum2>,
    pub tx_header: Option<Vec<u8>>,
    pub tx_footer: Option<Vec<u8>>,
    pub tx_checksum: Option<Checksum>,
    pub tx_checksum2: Option<Checksum2>,
    pub tx_delay: Option<u64>,
    pub tx_timeout: Option<u64>,
    pub tx_retry_cnt: Option<u32>,
}

impl PacketDefaults {
    pub fn merge(&self, over: &PacketOverride) -> PacketDefaults {
        PacketDefaults {
            rx_length: over.rx_length.or(self.rx_length),
            rx_header: over.rx_header.clone().unwrap_or_else(|| self.rx_header.clone()),
            rx_footer: over.rx_footer.clone().unwrap_or_else(|| self.rx_footer.clone()),
            rx_checksum: over.rx_checksum.unwrap_or(self.rx_checksum),
            rx_checksum2: over.rx_checksum2.unwrap_or(self.rx_checksum2),
            tx_header: over.tx_header.clone().unwrap_or_else(|| self.tx_header.clone()),
            tx_footer: over.tx_footer.clone().unwrap_or_else(|| self.tx_footer.clone()),
            tx_checksum: over.tx_checksum.unwrap_or(self.tx_checksum),
            tx_checksum2: over.tx_checksum2.unwrap_or(self.tx_checksum2),
            tx_delay: over.tx_delay.unwrap_or(self.tx_delay),
            tx_timeout: over.tx_timeout.unwrap_or(self.tx_timeout),
            tx_retry_cnt: over.tx_retry_cnt.unwrap_or(self.tx_retry_cnt),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Light,
    Switch,
    Fan,
    Climate,
    Valve,
    Button,
    Sensor,
    BinarySensor,
    Lock,
    Number,
    Select,
    Text,
    TextSensor,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Light => "light",
            EntityType::Switch => "switch",
            EntityType::Fan => "fan",
            EntityType::Climate => "climate",
            EntityType::Valve => "valve",
            EntityType::Button => "button",
            EntityType::Sensor => "sensor",
            EntityType::BinarySensor => "binary_sensor",
            EntityType::Lock => "lock",
            EntityType::Number => "number",
            EntityType::Select => "select",
            EntityType::Text => "text",
            EntityType::TextSensor => "text_sensor",
        }
    }

    /// Home Assistant discovery component. Text sensors announce as plain
    /// sensors; everything else maps one-to-one.
    pub fn ha_component(&self) -> &'static str {
        match self {
            EntityType::TextSensor => "sensor",
            other => other.as_str(),
        }
    }
}

/// Entity as it appears in YAML: known attributes plus a free-form tail of
/// `state_*` / `command_*` fields and presentation extras.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEntity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub discovery_always: bool,
    #[serde(default)]
    pub discovery_linked_id: Option<String>,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub packet_parameters: Option<PacketOverride>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_yaml::Value>,
}

/// Normalized entity: the parser and discovery work from this.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub entity_type: EntityType,
    pub id: String,
    pub name: Option<String>,
    pub device: Option<String>,
    pub area: Option<String>,
    pub unique_id: Option<String>,
    pub discovery_always: bool,
    pub discovery_linked_id: Option<String>,
    pub optimistic: bool,
    pub internal: bool,
    pub packet_parameters: Option<PacketOverride>,
    /// Primary match pattern; entities without one never parse packets.
    pub state: Option<Matcher>,
    /// `state_<key>` fields, keyed without the prefix.
    pub state_fields: BTreeMap<String, Matcher>,
    /// `command_<key>` fields, keyed without the prefix.
    pub command_fields: BTreeMap<String, Matcher>,
    /// Remaining scalar fields, passed through to discovery payloads
    /// (device_class, unit_of_measurement, options, min/max/step, ...).
    pub presentation: BTreeMap<String, serde_json::Value>,
}

impl RawEntity {
    fn normalize(self, entity_type: EntityType) -> anyhow::Result<EntityConfig> {
        let mut state = None;
        let mut state_fields = BTreeMap::new();
        let mut command_fields = BTreeMap::new();
        let mut presentation = BTreeMap::new();

        for (key, value) in self.fields {
            if key == "state" {
                let matcher: Matcher = serde_yaml::from_value(value)
                    .with_context(|| format!("entity {}: bad state field", self.id))?;
                state = Some(matcher);
            } else if let Some(rest) = key.strip_prefix("state_") {
                let matcher: Matcher = serde_yaml::from_value(value)
                    .with_context(|| format!("entity {}: bad field {key}", self.id))?;
                state_fields.insert(rest.to_string(), matcher);
            } else if let Some(rest) = key.strip_prefix("command_") {
                let matcher: Matcher = serde_yaml::from_value(value)
                    .with_context(|| format!("entity {}: bad field {key}", self.id))?;
                command_fields.insert(rest.to_string(), matcher);
            } else {
                presentation.insert(key, yaml_to_json(&value));
            }
        }

        Ok(EntityConfig {
            entity_type,
            id: self.id,
            name: self.name,
            device: self.device,
            area: self.area,
            unique_id: self.unique_id,
            discovery_always: self.discovery_always,
            discovery_linked_id: self.discovery_linked_id,
            optimistic: self.optimistic,
            internal: self.internal,
            packet_parameters: self.packet_parameters,
            state,
            state_fields,
            command_fields,
            presentation,
        })
    }
}

impl EntityConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn state_field(&self, key: &str) -> Option<&Matcher> {
        self.state_fields.get(key)
    }

    pub fn command_field(&self, key: &str) -> Option<&Matcher> {
        self.command_fields.get(key)
    }
}

/// Device registry entry referenced by `EntityConfig::device`, used to
/// group entities under one Home Assistant device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sw_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Automations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    /// Skip the trigger if a run is already in flight.
    #[default]
    Single,
    /// Cancel the in-flight run and start fresh.
    Restart,
    /// A new run per trigger.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// A duration in YAML: an integer (milliseconds) or a human string such as
/// "2s", "500ms", "1m".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> anyhow::Result<Duration> {
        match self {
            DurationValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("bad duration {text:?}"))?;
    let millis = match unit.trim() {
        "" | "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => bail!("unknown duration unit {other:?} in {text:?}"),
    };
    Ok(Duration::from_millis(millis as u64))
}

/// State trigger predicate: a comparison map or a bare literal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatchPredicate {
    Compare {
        #[serde(default)]
        eq: Option<serde_json::Value>,
        #[serde(default)]
        gt: Option<f64>,
        #[serde(default)]
        gte: Option<f64>,
        #[serde(default)]
        lt: Option<f64>,
        #[serde(default)]
        lte: Option<f64>,
        #[serde(default)]
        regex: Option<String>,
    },
    Literal(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Schema matched against each raw packet body.
    Packet {
        schema: Schema,
        #[serde(default)]
        guard: Option<String>,
    },
    /// Entity state attribute change.
    State {
        entity_id: String,
        /// Attribute inside the state bag, default "state".
        #[serde(default)]
        attribute: Option<String>,
        #[serde(default, rename = "match")]
        predicate: Option<MatchPredicate>,
        #[serde(default)]
        debounce_ms: Option<u64>,
        #[serde(default)]
        guard: Option<String>,
    },
    /// Fixed interval or local-time cron.
    Schedule {
        #[serde(default)]
        every_ms: Option<u64>,
        #[serde(default)]
        cron: Option<String>,
        #[serde(default)]
        guard: Option<String>,
    },
    /// Fired once after the port starts.
    Startup {
        #[serde(default)]
        guard: Option<String>,
    },
}

impl TriggerConfig {
    pub fn guard(&self) -> Option<&str> {
        match self {
            TriggerConfig::Packet { guard, .. }
            | TriggerConfig::State { guard, .. }
            | TriggerConfig::Schedule { guard, .. }
            | TriggerConfig::Startup { guard } => guard.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    /// `target` is an expression of the form `id(ENTITY).command_NAME(...)`.
    Command { target: String },
    Publish {
        topic: String,
        payload: serde_json::Value,
        #[serde(default)]
        retain: bool,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    Delay {
        #[serde(default)]
        milliseconds: Option<DurationValue>,
        #[serde(default)]
        duration: Option<DurationValue>,
        #[serde(default)]
        delay: Option<DurationValue>,
    },
    WaitUntil {
        condition: String,
        #[serde(default)]
        timeout: Option<DurationValue>,
        #[serde(default)]
        check_interval: Option<DurationValue>,
    },
    If {
        condition: String,
        #[serde(default)]
        then: Vec<ActionConfig>,
        #[serde(default, rename = "else")]
        otherwise: Vec<ActionConfig>,
    },
    /// Run a named script, or an inline expression with full context.
    Script {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    SendPacket {
        data: Vec<u8>,
        #[serde(default = "default_true")]
        auto_checksum: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ActionConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionConfig::Command { .. } => "command",
            ActionConfig::Publish { .. } => "publish",
            ActionConfig::Log { .. } => "log",
            ActionConfig::Delay { .. } => "delay",
            ActionConfig::WaitUntil { .. } => "wait_until",
            ActionConfig::If { .. } => "if",
            ActionConfig::Script { .. } => "script",
            ActionConfig::SendPacket { .. } => "send_packet",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub mode: AutomationMode,
    #[serde(alias = "triggers")]
    pub trigger: Vec<TriggerConfig>,
    /// Automation-level guard, ANDed with the trigger guard.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub then: Vec<ActionConfig>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<ActionConfig>,
}

impl AutomationConfig {
    /// Stable display id: explicit id, alias, or a positional fallback.
    pub fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.alias.clone())
            .unwrap_or_else(|| format!("automation_{index}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub sequence: Vec<ActionConfig>,
}

// ---------------------------------------------------------------------------
// Port + root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub serial: SerialConfig,
    #[serde(default)]
    pub packet_defaults: PacketDefaults,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub light: Vec<RawEntity>,
    #[serde(default)]
    pub switch: Vec<RawEntity>,
    #[serde(default)]
    pub fan: Vec<RawEntity>,
    #[serde(default)]
    pub climate: Vec<RawEntity>,
    #[serde(default)]
    pub valve: Vec<RawEntity>,
    #[serde(default)]
    pub button: Vec<RawEntity>,
    #[serde(default)]
    pub sensor: Vec<RawEntity>,
    #[serde(default)]
    pub binary_sensor: Vec<RawEntity>,
    #[serde(default)]
    pub lock: Vec<RawEntity>,
    #[serde(default)]
    pub number: Vec<RawEntity>,
    #[serde(default)]
    pub select: Vec<RawEntity>,
    #[serde(default)]
    pub text: Vec<RawEntity>,
    #[serde(default)]
    pub text_sensor: Vec<RawEntity>,
    #[serde(default)]
    pub automation: Vec<AutomationConfig>,
    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

impl PortConfig {
    pub fn port_id(&self) -> &str {
        &self.serial.port_id
    }

    /// All entities across the typed arrays, normalized.
    pub fn entities(&self) -> anyhow::Result<Vec<EntityConfig>> {
        let groups: [(EntityType, &Vec<RawEntity>); 13] = [
            (EntityType::Light, &self.light),
            (EntityType::Switch, &self.switch),
            (EntityType::Fan, &self.fan),
            (EntityType::Climate, &self.climate),
            (EntityType::Valve, &self.valve),
            (EntityType::Button, &self.button),
            (EntityType::Sensor, &self.sensor),
            (EntityType::BinarySensor, &self.binary_sensor),
            (EntityType::Lock, &self.lock),
            (EntityType::Number, &self.number),
            (EntityType::Select, &self.select),
            (EntityType::Text, &self.text),
            (EntityType::TextSensor, &self.text_sensor),
        ];
        let mut out = Vec::new();
        for (entity_type, raws) in groups {
            for raw in raws {
                out.push(raw.clone().normalize(entity_type)?);
            }
        }
        Ok(out)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(5..=8).contains(&self.serial.data_bits) {
            bail!("port {}: data_bits must be 5..=8", self.port_id());
        }
        let entities = self.entities()?;
        let mut seen = std::collections::HashSet::new();
        for entity in &entities {
            if !seen.insert(entity.id.clone()) {
                bail!("port {}: duplicate entity id {:?}", self.port_id(), entity.id);
            }
        }
        for device in &self.devices {
            if device.id.is_empty() {
                bail!("port {}: device with empty id", self.port_id());
            }
        }
        for (index, automation) in self.automation.iter().enumerate() {
            if automation.trigger.is_empty() {
                bail!("port {}: automation {} has no triggers", self.port_id(), index);
            }
            for trigger in &automation.trigger {
                if let TriggerConfig::Schedule { every_ms, cron, .. } = trigger {
                    match (every_ms, cron) {
                        (Some(_), Some(_)) | (None, None) => bail!(
                            "port {}: schedule trigger needs exactly one of every_ms / cron",
                            self.port_id()
                        ),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortsSection {
    One(Box<PortConfig>),
    Many(Vec<PortConfig>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RootConfig {
    homenet_bridge: PortsSection,
    #[serde(default)]
    mqtt: Option<MqttSection>,
}

/// Process-level settings resolved from YAML plus environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_url: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// Topic prefix for entity state/command topics, default "homenet".
    pub prefix: String,
    pub mqtt_connect_timeout: Duration,
    pub serial_wait_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mqtt_url: "mqtt://localhost:1883".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            prefix: "homenet".to_string(),
            mqtt_connect_timeout: Duration::from_secs(10),
            serial_wait_timeout: Duration::from_secs(15),
        }
    }
}

impl Settings {
    fn resolve(mqtt: Option<MqttSection>) -> Self {
        let mut settings = Settings::default();
        if let Some(section) = mqtt {
            if let Some(url) = section.url {
                settings.mqtt_url = url;
            }
            if let Some(prefix) = section.prefix {
                settings.prefix = prefix;
            }
            settings.mqtt_username = section.username;
            settings.mqtt_password = section.password;
        }
        if let Ok(url) = env::var("MQTT_URL") {
            settings.mqtt_url = url;
        }
        if let Some(ms) = env_ms("MQTT_CONNECT_TIMEOUT_MS") {
            settings.mqtt_connect_timeout = ms;
        }
        if let Some(ms) = env_ms("SERIAL_PATH_WAIT_TIMEOUT_MS") {
            settings.serial_wait_timeout = ms;
        }
        settings
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    env::var(name).ok()?.parse::<u64>().ok().map(Duration::from_millis)
}

/// Top-level configuration consumed by the supervisor.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ports: Vec<PortConfig>,
    pub settings: Settings,
}

impl BridgeConfig {
    /// Determine the config file path from `--config`, `CONFIG_ROOT`, or the
    /// default location.
    pub fn resolve_config_path(arg: Option<&str>) -> String {
        if let Some(path) = arg {
            return path.to_string();
        }
        if let Ok(root) = env::var("CONFIG_ROOT") {
            return Path::new(&root).join(DEFAULT_CONFIG_FILE).display().to_string();
        }
        format!("config/{DEFAULT_CONFIG_FILE}")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        // Load through serde_yaml::Value first so `!lambda` / `!homenet_logic`
        // tags can be stripped; the tagged scalars stay behind as plain
        // expression strings.
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).context("invalid YAML")?;
        let value = untag(value);
        let root: RootConfig =
            serde_yaml::from_value(value).context("invalid homenet_bridge config")?;

        let ports = match root.homenet_bridge {
            PortsSection::One(port) => vec![*port],
            PortsSection::Many(ports) => ports,
        };
        if ports.is_empty() {
            bail!("homenet_bridge declares no ports");
        }
        let mut seen = std::collections::HashSet::new();
        for port in &ports {
            port.validate()?;
            if !seen.insert(port.port_id().to_string()) {
                bail!("duplicate port id {:?}", port.port_id());
            }
        }

        Ok(Self { ports, settings: Settings::resolve(root.mqtt) })
    }
}

/// Strip YAML tags (`!lambda`, `!homenet_logic`) recursively, keeping the
/// underlying value unchanged.
fn untag(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Tagged(tagged) => untag(tagged.value),
        serde_yaml::Value::Sequence(items) => {
            serde_yaml::Value::Sequence(items.into_iter().map(untag).collect())
        }
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter().map(|(k, v)| (untag(k), untag(v))).collect(),
        ),
        other => other,
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::Number(i.into())
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            serde_json::Value::Array(items.iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map {
                if let serde_yaml::Value::String(key) = key {
                    object.insert(key.clone(), yaml_to_json(value));
                }
            }
            serde_json::Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}
