//! Entity runtime - packet parsing and command construction
//!
//! One `EntityRuntime` per configured entity. Parsing walks the entity's
//! `state_*` fields against a validated frame and produces a partial state
//! bag; command construction mirrors it, turning a command name and value
//! into framed bytes. Type-specific behavior (flag fields, normalization,
//! command aliases) lives in `handlers`; everything else is the generic
//! schema/expression engine.

pub mod handlers;

use crate::domain::expr::{EvalContext, ExprEngine, ExprValue, StatesView};
use crate::domain::schema::{Matcher, Schema};
use crate::domain::types::{Packet, StateBag};
use crate::infra::config::{EntityConfig, PacketDefaults};
use crate::infra::error::CommandError;
use crate::services::framer::frame_body;
use std::sync::Arc;
use tracing::debug;

/// A fully framed outbound command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Complete frame (header, body, checksums, footer). Empty for a
    /// virtual/optimistic command that never touches the bus.
    pub packet: Vec<u8>,
    /// Pattern a reply must match for the send to count as acknowledged.
    pub ack: Option<Schema>,
    /// State to apply immediately for `optimistic: true` entities.
    pub optimistic_update: Option<StateBag>,
}

pub struct EntityRuntime {
    pub config: EntityConfig,
    /// Port packet defaults merged with the entity's `packet_parameters`.
    pub params: PacketDefaults,
    engine: Arc<ExprEngine>,
}

impl EntityRuntime {
    pub fn new(
        config: EntityConfig,
        port_defaults: &PacketDefaults,
        engine: Arc<ExprEngine>,
    ) -> Self {
        let params = match &config.packet_parameters {
            Some(over) => port_defaults.merge(over),
            None => port_defaults.clone(),
        };
        Self { config, params, engine }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Expected full-frame length if this entity's schemas pin one down;
    /// feeds the framer's probed mode.
    pub fn probe_length(&self) -> Option<usize> {
        if self.params.rx_length.is_some() || !self.params.rx_footer.is_empty() {
            return None;
        }
        let state = self.config.state.as_ref()?.as_schema()?;
        let mut span = state.offset + state.data.len();
        for matcher in self.config.state_fields.values() {
            if let Some(schema) = matcher.as_schema() {
                let end = schema.offset + schema.data.len().max(schema.length.unwrap_or(0));
                span = span.max(end);
            }
        }
        if span == 0 {
            return None;
        }
        Some(
            self.params.rx_header.len()
                + span
                + self.params.rx_checksum.len()
                + self.params.rx_checksum2.len(),
        )
    }

    /// Parse a packet against this entity. Returns the partial update bag,
    /// or `None` when the packet is not for this entity.
    pub fn parse(&self, packet: &Packet, prev: &StateBag) -> Option<StateBag> {
        let body = frame_body(&self.params, &packet.raw)?;
        let state_matcher = self.config.state.as_ref()?;
        if !self.matcher_matches(state_matcher, body, prev) {
            return None;
        }

        let mut updates = StateBag::new();
        for (key, matcher) in &self.config.state_fields {
            match handlers::classify(self.config.entity_type, key) {
                handlers::FieldKind::Flag { key: target, value } => {
                    if self.matcher_matches(matcher, body, prev) {
                        updates.insert(target.to_string(), value);
                    }
                }
                handlers::FieldKind::Value => {
                    if let Some(value) = self.extract_value(matcher, body, prev) {
                        updates.insert(key.clone(), value);
                    }
                }
            }
        }

        handlers::normalize(self.config.entity_type, &mut updates);
        if updates.is_empty() {
            None
        } else {
            Some(updates)
        }
    }

    /// Byte match plus optional guard. Errors are logged and count as no
    /// match.
    fn matcher_matches(&self, matcher: &Matcher, body: &[u8], prev: &StateBag) -> bool {
        match matcher {
            Matcher::Schema(schema) => {
                if !schema.matches(body) {
                    return false;
                }
                match &schema.guard {
                    None => true,
                    Some(guard) => self.eval_guard(guard, body, prev),
                }
            }
            Matcher::Expr(expr) => {
                let ctx = EvalContext {
                    data: body,
                    state: Some(prev),
                    ..Default::default()
                };
                match self.engine.eval_guard(expr, &ctx) {
                    Ok(truthy) => truthy,
                    Err(e) => {
                        debug!(entity = %self.config.id, error = %e, "match_expression_failed");
                        false
                    }
                }
            }
        }
    }

    fn eval_guard(&self, guard: &str, body: &[u8], prev: &StateBag) -> bool {
        let ctx = EvalContext { data: body, state: Some(prev), ..Default::default() };
        match self.engine.eval_guard(guard, &ctx) {
            Ok(truthy) => truthy,
            Err(e) => {
                debug!(entity = %self.config.id, error = %e, "guard_failed");
                false
            }
        }
    }

    /// Extract a value field. Schemas with match bytes only extract when
    /// they match; expressions yield whatever non-null value they produce.
    fn extract_value(
        &self,
        matcher: &Matcher,
        body: &[u8],
        prev: &StateBag,
    ) -> Option<serde_json::Value> {
        match matcher {
            Matcher::Schema(schema) => {
                if !schema.data.is_empty() && !schema.matches(body) {
                    return None;
                }
                if let Some(guard) = &schema.guard {
                    if !self.eval_guard(guard, body, prev) {
                        return None;
                    }
                }
                schema.extract(body)
            }
            Matcher::Expr(expr) => {
                let ctx = EvalContext { data: body, state: Some(prev), ..Default::default() };
                match self.engine.eval(expr, &ctx) {
                    Ok(ExprValue::Null) => None,
                    Ok(value) => Some(value.to_json()),
                    Err(e) => {
                        debug!(entity = %self.config.id, error = %e, "extract_expression_failed");
                        None
                    }
                }
            }
        }
    }

    /// Build the framed bytes for a command. `value` is the already-parsed
    /// payload (number, string or null for bare on/off commands).
    pub fn build_command(
        &self,
        command: &str,
        value: &serde_json::Value,
        states: Option<&StatesView>,
    ) -> Result<CommandRequest, CommandError> {
        let (resolved, matcher) = self
            .resolve_command(command)
            .ok_or_else(|| CommandError::UnknownCommand {
                entity: self.config.id.clone(),
                command: command.to_string(),
            })?;

        let (body, ack) = match matcher {
            Matcher::Schema(schema) => {
                let mut body = schema.data.clone();
                if schema.value_offset.is_some() {
                    schema
                        .encode(&mut body, value)
                        .map_err(|e| CommandError::BadPacket(e.to_string()))?;
                }
                (body, schema.ack.as_deref().cloned())
            }
            Matcher::Expr(expr) => {
                let prev = states.and_then(|s| s.get(self.id()));
                let ctx = EvalContext {
                    state: prev,
                    states,
                    x: ExprValue::from_json(value),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    ..Default::default()
                };
                let result = self
                    .engine
                    .eval(expr, &ctx)
                    .map_err(|e| CommandError::BadPacket(e.to_string()))?;
                expr_command_result(result)?
            }
        };

        // Empty body: virtual command, acknowledged by construction.
        let packet = if body.is_empty() {
            Vec::new()
        } else {
            frame_tx(&self.params, &body)
        };

        let optimistic_update = if self.config.optimistic {
            Some(handlers::optimistic_update(self.config.entity_type, &resolved, value))
        } else {
            None
        };

        Ok(CommandRequest { packet, ack, optimistic_update })
    }

    /// Exact command name first, then the attribute alias chain.
    fn resolve_command(&self, command: &str) -> Option<(String, &Matcher)> {
        for candidate in handlers::command_candidates(command) {
            if let Some(matcher) = self.config.command_field(&candidate) {
                return Some((candidate, matcher));
            }
        }
        None
    }
}

/// Interpret an expression result as a command body: a byte list, a
/// `{packet, ack}` map, or null for a virtual command.
fn expr_command_result(
    result: ExprValue,
) -> Result<(Vec<u8>, Option<Schema>), CommandError> {
    match result {
        ExprValue::Null => Ok((Vec::new(), None)),
        ExprValue::Map(map) => {
            let packet = map
                .get("packet")
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| {
                    CommandError::BadPacket("expression map needs a 'packet' byte list".into())
                })?;
            let ack = match map.get("ack") {
                None | Some(ExprValue::Null) => None,
                Some(value) => {
                    let schema: Schema = serde_json::from_value(value.to_json())
                        .map_err(|e| CommandError::BadPacket(format!("bad ack schema: {e}")))?;
                    Some(schema)
                }
            };
            Ok((packet, ack))
        }
        other => match other.as_bytes() {
            Some(bytes) => Ok((bytes, None)),
            None => Err(CommandError::BadPacket(format!(
                "expression produced {other:?}, expected a byte list"
            ))),
        },
    }
}

/// Wrap a command body with the port's tx framing.
pub fn frame_tx(params: &PacketDefaults, body: &[u8]) -> Vec<u8> {
    let mut out = params.tx_header.clone();
    out.extend_from_slice(body);
    let c1 = params.tx_checksum.compute(&params.tx_header, body);
    out.extend_from_slice(&c1);
    out.extend_from_slice(&params.tx_checksum2.compute(&params.tx_header, body, &c1));
    out.extend_from_slice(&params.tx_footer);
    out
}
