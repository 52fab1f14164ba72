//! Sequential action execution for automations and scripts
//!
//! Actions run strictly in declared order within one run. Cancellation is
//! checked at every step and inside every suspension (delay, wait_until),
//! so a `restart`-mode retrigger can abort a pending timer immediately.

use super::AutomationContext;
use crate::domain::expr::{EvalContext, ExprValue};
use crate::domain::types::BridgeEvent;
use crate::infra::config::{ActionConfig, DurationValue, LogLevel};
use crate::services::device::frame_tx;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WAIT_UNTIL_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_UNTIL_DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// Run a sequence of actions. Stops at the first failure or cancellation.
pub async fn run_actions(
    ctx: &AutomationContext,
    label: &str,
    actions: &[ActionConfig],
    trigger: &ExprValue,
    cancel: &CancellationToken,
) -> Result<(), ActionError> {
    for action in actions {
        if cancel.is_cancelled() {
            return Err(ActionError::Cancelled);
        }
        ctx.bus.publish(BridgeEvent::AutomationAction {
            port_id: ctx.port_id.clone(),
            automation: label.to_string(),
            action: action.kind().to_string(),
        });
        run_action(ctx, label, action, trigger, cancel).await?;
    }
    Ok(())
}

async fn run_action(
    ctx: &AutomationContext,
    label: &str,
    action: &ActionConfig,
    trigger: &ExprValue,
    cancel: &CancellationToken,
) -> Result<(), ActionError> {
    match action {
        ActionConfig::Command { target } => {
            let value = eval(ctx, target, trigger)?;
            execute_command_value(ctx, label, value).await
        }

        ActionConfig::Publish { topic, payload, retain } => {
            let bytes = match payload {
                serde_json::Value::String(text) => text.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            };
            ctx.mqtt
                .publish(topic, bytes, *retain)
                .await
                .map_err(|e| ActionError::Failed(format!("publish {topic}: {e}")))
        }

        ActionConfig::Log { level, message } => {
            match level {
                LogLevel::Info => info!(automation = %label, "{message}"),
                LogLevel::Warn => warn!(automation = %label, "{message}"),
                LogLevel::Error => error!(automation = %label, "{message}"),
            }
            Ok(())
        }

        ActionConfig::Delay { milliseconds, duration, delay } => {
            let wanted = [milliseconds, duration, delay]
                .into_iter()
                .flatten()
                .next()
                .ok_or_else(|| ActionError::Failed("delay without a duration".into()))?;
            let wanted = resolve_duration(wanted)?;
            tokio::select! {
                _ = cancel.cancelled() => Err(ActionError::Cancelled),
                _ = tokio::time::sleep(wanted) => Ok(()),
            }
        }

        ActionConfig::WaitUntil { condition, timeout, check_interval } => {
            let timeout = match timeout {
                Some(value) => resolve_duration(value)?,
                None => WAIT_UNTIL_DEFAULT_TIMEOUT,
            };
            let interval = match check_interval {
                Some(value) => resolve_duration(value)?,
                None => WAIT_UNTIL_DEFAULT_INTERVAL,
            };
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if eval_guard(ctx, condition, trigger) {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ActionError::Failed(format!(
                        "wait_until {condition:?} timed out"
                    )));
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ActionError::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        ActionConfig::If { condition, then, otherwise } => {
            let branch = if eval_guard(ctx, condition, trigger) { then } else { otherwise };
            Box::pin(run_actions(ctx, label, branch, trigger, cancel)).await
        }

        ActionConfig::Script { name, code } => {
            if let Some(name) = name {
                let script = ctx
                    .scripts
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ActionError::Failed(format!("unknown script {name:?}")))?;
                ctx.bus.publish(BridgeEvent::ScriptAction {
                    port_id: ctx.port_id.clone(),
                    script: name.clone(),
                    action: "start".to_string(),
                });
                return Box::pin(run_actions(ctx, name, &script.sequence, trigger, cancel))
                    .await;
            }
            let Some(code) = code else {
                return Err(ActionError::Failed("script action needs name or code".into()));
            };
            let value = eval(ctx, code, trigger)?;
            execute_command_value(ctx, label, value).await
        }

        ActionConfig::SendPacket { data, auto_checksum } => {
            let packet = if *auto_checksum {
                frame_tx(&ctx.port_params, data)
            } else {
                data.clone()
            };
            ctx.command
                .send(&format!("automation:{label}"), packet, &ctx.port_params, None)
                .await
                .map_err(|e| ActionError::Failed(format!("send_packet: {e}")))
        }
    }
}

/// Command intents (or lists of them) coming out of an expression; null is
/// a quiet no-op so conditional command expressions compose.
async fn execute_command_value(
    ctx: &AutomationContext,
    label: &str,
    value: ExprValue,
) -> Result<(), ActionError> {
    match value {
        ExprValue::Null => Ok(()),
        ExprValue::Command(intent) => {
            debug!(automation = %label, entity = %intent.entity_id, command = %intent.command, "automation_command");
            ctx.command
                .command(
                    &intent.entity_id,
                    &intent.command,
                    intent.argument.as_ref().unwrap_or(&serde_json::Value::Null),
                )
                .await
                .map_err(|e| ActionError::Failed(format!("command: {e}")))
        }
        ExprValue::List(items) => {
            for item in items {
                Box::pin(execute_command_value(ctx, label, item)).await?;
            }
            Ok(())
        }
        other => Err(ActionError::Failed(format!(
            "expression produced {other:?}, expected a command"
        ))),
    }
}

fn eval(
    ctx: &AutomationContext,
    source: &str,
    trigger: &ExprValue,
) -> Result<ExprValue, ActionError> {
    let states = ctx.store.snapshot();
    let eval_ctx = EvalContext {
        states: Some(&states),
        trigger: trigger.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        ..Default::default()
    };
    ctx.engine
        .eval(source, &eval_ctx)
        .map_err(|e| ActionError::Failed(format!("expression {source:?}: {e}")))
}

/// Guard-style evaluation: errors log and count as false.
pub fn eval_guard(ctx: &AutomationContext, source: &str, trigger: &ExprValue) -> bool {
    match eval(ctx, source, trigger) {
        Ok(value) => value.is_truthy(),
        Err(e) => {
            debug!(error = %e, "guard_evaluation_failed");
            false
        }
    }
}

fn resolve_duration(value: &DurationValue) -> Result<Duration, ActionError> {
    value.to_duration().map_err(|e| ActionError::Failed(e.to_string()))
}
