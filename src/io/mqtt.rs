//! Shared MQTT client service
//!
//! One rumqttc client serves every port engine. The event loop runs in its
//! own task and routes inbound publishes to registered subscriptions by
//! topic filter; on reconnect it resubscribes everything and republishes
//! the bridge availability topic. The core only sees the `MqttClient`
//! trait, which keeps managers testable without a broker.

use crate::domain::types::BridgeEvent;
use crate::infra::bus::EventBus;
use crate::infra::config::Settings;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// An inbound MQTT message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// The MQTT surface the core consumes: retained-capable publish plus
/// filter subscriptions. Implemented by the rumqttc-backed handle and by
/// test doubles.
#[async_trait]
pub trait MqttClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()>;
    async fn subscribe(&self, filter: &str) -> anyhow::Result<mpsc::Receiver<MqttMessage>>;
}

struct Subscription {
    filter: String,
    tx: mpsc::Sender<MqttMessage>,
}

/// Cloneable handle over the shared client.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    subs: Arc<Mutex<Vec<Subscription>>>,
    availability_topic: Arc<String>,
}

#[async_trait]
impl MqttClient for MqttHandle {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .with_context(|| format!("mqtt publish to {topic}"))
    }

    async fn subscribe(&self, filter: &str) -> anyhow::Result<mpsc::Receiver<MqttMessage>> {
        let (tx, rx) = mpsc::channel(256);
        self.subs.lock().push(Subscription { filter: filter.to_string(), tx });
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .with_context(|| format!("mqtt subscribe {filter}"))?;
        Ok(rx)
    }
}

/// Connect to the broker, wait for the first ConnAck (bounded by the
/// configured connect timeout) and spawn the event loop task.
pub async fn start(
    settings: &Settings,
    bus: EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<MqttHandle> {
    let (host, port) = parse_mqtt_url(&settings.mqtt_url)?;
    let availability_topic = format!("{}/bridge/status", settings.prefix);

    let mut options = MqttOptions::new("homenet-bridge", host.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        availability_topic.clone(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if let (Some(username), Some(password)) =
        (&settings.mqtt_username, &settings.mqtt_password)
    {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 100);
    let handle = MqttHandle {
        client,
        subs: Arc::new(Mutex::new(Vec::new())),
        availability_topic: Arc::new(availability_topic),
    };

    // Block startup until the broker answers; an unreachable broker is an
    // unrecoverable startup failure.
    let connect = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(anyhow::anyhow!("mqtt connect: {e}")),
            }
        }
    };
    tokio::time::timeout(settings.mqtt_connect_timeout, connect)
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "mqtt broker {host}:{port} did not answer within {} ms",
                settings.mqtt_connect_timeout.as_millis()
            )
        })??;
    info!(host = %host, port = %port, "mqtt_connected");

    let loop_handle = handle.clone();
    tokio::spawn(async move {
        run_event_loop(loop_handle, eventloop, bus, &mut shutdown).await;
    });

    Ok(handle)
}

async fn run_event_loop(
    handle: MqttHandle,
    mut eventloop: rumqttc::EventLoop,
    bus: EventBus,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    let _ = handle
                        .client
                        .publish(handle.availability_topic.as_str(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = handle.client.disconnect().await;
                    return;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = MqttMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        bus.publish(BridgeEvent::MqttMessage {
                            topic: message.topic.clone(),
                            payload: message.payload_str(),
                        });
                        route(&handle, message);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_reconnected");
                        // The LWT may have flipped availability to offline.
                        let _ = handle
                            .client
                            .publish(handle.availability_topic.as_str(), QoS::AtLeastOnce, true, "online")
                            .await;
                        resubscribe(&handle).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

fn route(handle: &MqttHandle, message: MqttMessage) {
    let mut subs = handle.subs.lock();
    subs.retain(|sub| !sub.tx.is_closed());
    for sub in subs.iter() {
        if topic_matches(&sub.filter, &message.topic) {
            if let Err(e) = sub.tx.try_send(message.clone()) {
                warn!(filter = %sub.filter, error = %e, "mqtt_subscription_backlogged");
            }
        }
    }
}

async fn resubscribe(handle: &MqttHandle) {
    let filters: Vec<String> =
        handle.subs.lock().iter().map(|sub| sub.filter.clone()).collect();
    for filter in filters {
        debug!(filter = %filter, "mqtt_resubscribe");
        if let Err(e) = handle.client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
            warn!(filter = %filter, error = %e, "mqtt_resubscribe_failed");
        }
    }
}

/// `mqtt://host[:port]`, `tcp://host[:port]` or bare `host[:port]`.
fn parse_mqtt_url(url: &str) -> anyhow::Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    if stripped.is_empty() {
        anyhow::bail!("empty MQTT_URL");
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().with_context(|| format!("bad MQTT port in {url:?}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-memory MQTT client for tests: records publishes and lets tests
/// inject inbound messages on subscribed filters.
#[cfg(test)]
pub struct RecordingMqtt {
    pub published: Mutex<Vec<(String, String, bool)>>,
    subs: Mutex<Vec<Subscription>>,
}

#[cfg(test)]
impl Default for RecordingMqtt {
    fn default() -> Self {
        Self { published: Mutex::new(Vec::new()), subs: Mutex::new(Vec::new()) }
    }
}

#[cfg(test)]
impl RecordingMqtt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _, _)| t.clone()).collect()
    }

    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    /// Deliver an inbound message to matching subscriptions.
    pub fn inject(&self, topic: &str, payload: &str) {
        let subs = self.subs.lock();
        for sub in subs.iter() {
            if topic_matches(&sub.filter, topic) {
                let _ = sub.tx.try_send(MqttMessage {
                    topic: topic.to_string(),
                    payload: payload.as_bytes().to_vec(),
                });
            }
        }
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for RecordingMqtt {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        self.published.lock().push((
            topic.to_string(),
            String::from_utf8_lossy(&payload).to_string(),
            retain,
        ));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> anyhow::Result<mpsc::Receiver<MqttMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.subs.lock().push(Subscription { filter: filter.to_string(), tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("homenet/main/+/set", "homenet/main/light_1/set"));
        assert!(topic_matches("homenet/main/+/+/set", "homenet/main/fan_1/percentage/set"));
        assert!(topic_matches("homeassistant/status", "homeassistant/status"));
        assert!(topic_matches("homenet/#", "homenet/main/light_1/state"));
        assert!(!topic_matches("homenet/main/+/set", "homenet/main/light_1/state"));
        assert!(!topic_matches("homenet/main/+/set", "homenet/other/light_1/set"));
        assert!(!topic_matches("homenet/main/+/set", "homenet/main/light_1/extra/set"));
    }

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(parse_mqtt_url("mqtt://broker:1884").unwrap(), ("broker".into(), 1884));
        assert_eq!(parse_mqtt_url("tcp://10.0.0.2").unwrap(), ("10.0.0.2".into(), 1883));
        assert_eq!(parse_mqtt_url("localhost").unwrap(), ("localhost".into(), 1883));
        assert!(parse_mqtt_url("mqtt://host:not_a_port").is_err());
        assert!(parse_mqtt_url("").is_err());
    }
}
