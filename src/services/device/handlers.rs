//! Type-specific entity behavior
//!
//! The generic schema engine treats every `state_<key>` field the same;
//! this module supplies the per-type interpretation: which fields are
//! match-flags (set a constant when the pattern matches), how parsed
//! updates are normalized, how MQTT command attributes map onto
//! `command_*` field names, and what an optimistic command implies.

use crate::domain::types::StateBag;
use crate::infra::config::EntityType;
use serde_json::{json, Value};

/// How a `state_<key>` field participates in parsing.
pub enum FieldKind {
    /// Pattern match sets `key` to `value`.
    Flag { key: &'static str, value: Value },
    /// Extracted value stored under the field's own key.
    Value,
}

pub fn classify(entity_type: EntityType, field: &str) -> FieldKind {
    match (entity_type, field) {
        (EntityType::Climate, "off")
        | (EntityType::Climate, "heat")
        | (EntityType::Climate, "cool")
        | (EntityType::Climate, "auto")
        | (EntityType::Climate, "dry")
        | (EntityType::Climate, "fan_only") => {
            FieldKind::Flag { key: "mode", value: json!(field) }
        }
        (EntityType::Climate, "away_on") => FieldKind::Flag { key: "away", value: json!("ON") },
        (EntityType::Climate, "away_off") => FieldKind::Flag { key: "away", value: json!("OFF") },

        (EntityType::Lock, "locked") => FieldKind::Flag { key: "state", value: json!("LOCKED") },
        (EntityType::Lock, "unlocked") => {
            FieldKind::Flag { key: "state", value: json!("UNLOCKED") }
        }
        (EntityType::Lock, "locking") => FieldKind::Flag { key: "state", value: json!("LOCKING") },
        (EntityType::Lock, "unlocking") => {
            FieldKind::Flag { key: "state", value: json!("UNLOCKING") }
        }
        (EntityType::Lock, "jammed") => FieldKind::Flag { key: "state", value: json!("JAMMED") },

        (EntityType::Valve, "open") => FieldKind::Flag { key: "state", value: json!("OPEN") },
        (EntityType::Valve, "closed") => FieldKind::Flag { key: "state", value: json!("CLOSED") },
        (EntityType::Valve, "opening") => {
            FieldKind::Flag { key: "state", value: json!("OPENING") }
        }
        (EntityType::Valve, "closing") => {
            FieldKind::Flag { key: "state", value: json!("CLOSING") }
        }

        (EntityType::Fan, "oscillating_on") => {
            FieldKind::Flag { key: "oscillating", value: json!(true) }
        }
        (EntityType::Fan, "oscillating_off") => {
            FieldKind::Flag { key: "oscillating", value: json!(false) }
        }
        (EntityType::Fan, "direction_forward") => {
            FieldKind::Flag { key: "direction", value: json!("forward") }
        }
        (EntityType::Fan, "direction_reverse") => {
            FieldKind::Flag { key: "direction", value: json!("reverse") }
        }

        (_, "on") => FieldKind::Flag { key: "state", value: json!("ON") },
        (_, "off") => FieldKind::Flag { key: "state", value: json!("OFF") },

        _ => FieldKind::Value,
    }
}

/// Post-parse normalization: clamp ranged values.
pub fn normalize(entity_type: EntityType, updates: &mut StateBag) {
    clamp(updates, "position", 0.0, 100.0);
    clamp(updates, "percentage", 0.0, 100.0);
    if entity_type == EntityType::Light {
        clamp(updates, "brightness", 0.0, 255.0);
    }
}

fn clamp(updates: &mut StateBag, key: &str, low: f64, high: f64) {
    let Some(value) = updates.get(key).and_then(Value::as_f64) else {
        return;
    };
    let clamped = value.clamp(low, high);
    if clamped != value {
        updates.insert(key.to_string(), crate::domain::schema::number(clamped));
    }
}

/// Command field candidates for an MQTT attribute, most specific first.
pub fn command_candidates(attr: &str) -> Vec<String> {
    let mut out = vec![attr.to_string()];
    let aliases: &[&str] = match attr {
        "percentage" => &["speed"],
        "speed" => &["percentage"],
        "option" => &["select"],
        "temperature" => &["target_temperature"],
        "preset" => &["preset_mode"],
        "preset_mode" => &["preset"],
        "fan_mode" => &["fan"],
        _ => &[],
    };
    out.extend(aliases.iter().map(|s| s.to_string()));
    out
}

/// Map a generic `/set` payload to a command name and value. Well-known
/// action words route to their flag command; anything else is a literal
/// handed to `command_set`.
pub fn set_payload_command(payload: &str) -> (String, Value) {
    match payload.trim() {
        "ON" => ("on".to_string(), Value::Null),
        "OFF" => ("off".to_string(), Value::Null),
        "OPEN" => ("open".to_string(), Value::Null),
        "CLOSE" => ("close".to_string(), Value::Null),
        "STOP" => ("stop".to_string(), Value::Null),
        "LOCK" => ("lock".to_string(), Value::Null),
        "UNLOCK" => ("unlock".to_string(), Value::Null),
        "PRESS" => ("press".to_string(), Value::Null),
        other => ("set".to_string(), parse_payload(other)),
    }
}

/// Numbers stay numbers, everything else is a string.
pub fn parse_payload(payload: &str) -> Value {
    let trimmed = payload.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return json!(f);
    }
    json!(trimmed)
}

/// State implied by a confirmed command, for `optimistic: true` entities.
pub fn optimistic_update(entity_type: EntityType, command: &str, value: &Value) -> StateBag {
    let mut bag = StateBag::new();
    match command {
        "on" => {
            bag.insert("state".into(), json!("ON"));
        }
        "off" => {
            bag.insert("state".into(), json!("OFF"));
        }
        "open" => {
            bag.insert("state".into(), json!("OPEN"));
        }
        "close" => {
            bag.insert("state".into(), json!("CLOSED"));
        }
        "lock" => {
            bag.insert("state".into(), json!("LOCKED"));
        }
        "unlock" => {
            bag.insert("state".into(), json!("UNLOCKED"));
        }
        "stop" | "press" => {}
        "set" => {
            if !value.is_null() {
                bag.insert("state".into(), value.clone());
            }
        }
        other => {
            if !value.is_null() {
                bag.insert(other.to_string(), value.clone());
                // Speed implies the fan is running.
                if entity_type == EntityType::Fan
                    && (other == "speed" || other == "percentage")
                {
                    bag.insert("state".into(), json!("ON"));
                }
            }
        }
    }
    bag
}
