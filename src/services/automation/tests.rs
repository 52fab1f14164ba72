//! Automation manager tests over an in-memory transport

use super::actions::ActionError;
use super::*;
use crate::domain::expr::ExprEngine;
use crate::domain::types::StateBag;
use crate::infra::config::BridgeConfig;
use crate::io::mqtt::RecordingMqtt;
use crate::services::device::EntityRuntime;
use serde_json::json;
use tokio::io::AsyncReadExt;

struct Rig {
    manager: Arc<AutomationManager>,
    state_tx: mpsc::Sender<Arc<StateChange>>,
    packets: broadcast::Sender<Packet>,
    mqtt: Arc<RecordingMqtt>,
    written: Arc<Mutex<Vec<u8>>>,
}

/// Build a full automation rig from a one-port YAML document. Commands are
/// written to an in-memory duplex whose bytes land in `written`.
async fn rig(yaml: &str) -> Rig {
    let config = BridgeConfig::from_yaml_str(yaml).expect("yaml parses");
    let port = config.ports[0].clone();
    let engine = Arc::new(ExprEngine::new());
    let mqtt: Arc<RecordingMqtt> = Arc::new(RecordingMqtt::new());
    let bus = EventBus::new();
    let counters = Arc::new(PortCounters::new());
    let store = StateStore::new();

    let runtimes: Vec<Arc<EntityRuntime>> = port
        .entities()
        .expect("entities normalize")
        .into_iter()
        .map(|e| Arc::new(EntityRuntime::new(e, &port.packet_defaults, engine.clone())))
        .collect();

    let (packets, packet_rx) = broadcast::channel(64);
    let (updates_tx, _updates_rx) = mpsc::channel(64);
    let command = Arc::new(CommandManager::new(
        port.port_id().to_string(),
        packets.clone(),
        store.clone(),
        updates_tx,
        bus.clone(),
        counters.clone(),
    ));
    command.set_registry(&runtimes);

    let (client, mut server) = tokio::io::duplex(1024);
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

    let scripts: FxHashMap<String, Arc<crate::infra::config::ScriptConfig>> = port
        .scripts
        .iter()
        .map(|s| (s.id.clone(), Arc::new(s.clone())))
        .collect();

    let ctx = AutomationContext {
        port_id: port.port_id().to_string(),
        port_params: port.packet_defaults.clone(),
        engine,
        store,
        command,
        mqtt: mqtt.clone(),
        bus,
        scripts,
    };
    let manager = AutomationManager::new(port.automation.clone(), ctx, counters);

    let (state_tx, state_rx) = mpsc::channel(64);
    manager.start(state_rx, packet_rx);

    Rig { manager, state_tx, packets, mqtt, written }
}

fn change(entity_id: &str, key: &str, new: serde_json::Value, old: Option<serde_json::Value>) -> Arc<StateChange> {
    let mut changes = StateBag::new();
    changes.insert(key.to_string(), new.clone());
    let mut state = StateBag::new();
    state.insert(key.to_string(), new);
    let mut old_state = StateBag::new();
    if let Some(old) = old {
        old_state.insert(key.to_string(), old);
    }
    Arc::new(StateChange {
        port_id: "main".to_string(),
        entity_id: entity_id.to_string(),
        state,
        old_state,
        changes,
    })
}

const DOORBELL: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  switch:
    - id: door
      state: {offset: 0, data: [0x10]}
      state_on: {offset: 1, data: [0x01]}
      command_set:
        data: [0x00]
        value_offset: 0
        mapping: {1: D_BELL, 2: D_CALL, 3: D_OPEN}
  automation:
    - id: auto_open
      mode: restart
      trigger:
        - type: state
          entity_id: doorbell_private
          match: "on"
      then:
        - action: command
          target: "id('door').command_set('D_BELL')"
        - action: delay
          duration: 2s
        - action: command
          target: "id('door').command_set('D_CALL')"
        - action: delay
          duration: 3s
        - action: command
          target: "id('door').command_set('D_OPEN')"
"#;

#[tokio::test(start_paused = true)]
async fn test_doorbell_sequence_completes() {
    let rig = rig(DOORBELL).await;
    rig.state_tx
        .send(change("doorbell_private", "state", json!("ON"), Some(json!("OFF"))))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(*rig.written.lock(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_mode_cancels_pending_delay() {
    let rig = rig(DOORBELL).await;
    rig.state_tx
        .send(change("doorbell_private", "state", json!("ON"), Some(json!("OFF"))))
        .await
        .unwrap();

    // Let the first run send D_BELL and park in its 2 s delay.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*rig.written.lock(), vec![1]);

    // Second trigger at T=1s restarts the sequence from D_BELL.
    rig.state_tx
        .send(change("doorbell_private", "state", json!("ON"), Some(json!("OFF"))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    // First run's D_CALL/D_OPEN never fire: bell, bell, call, open.
    assert_eq!(*rig.written.lock(), vec![1, 1, 2, 3]);
}

const SINGLE: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  switch:
    - id: siren
      state: {offset: 0, data: [0x10]}
      command_on: {data: [0x0A]}
  automation:
    - id: alarm
      mode: single
      trigger:
        - type: state
          entity_id: motion
      then:
        - action: delay
          milliseconds: 1000
        - action: command
          target: "id('siren').command_on()"
"#;

#[tokio::test(start_paused = true)]
async fn test_single_mode_skips_concurrent_trigger() {
    let rig = rig(SINGLE).await;
    rig.state_tx.send(change("motion", "state", json!("ON"), None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.state_tx.send(change("motion", "state", json!("OFF"), Some(json!("ON")))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(*rig.written.lock(), vec![0x0A]);
}

const PARALLEL: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  switch:
    - id: siren
      state: {offset: 0, data: [0x10]}
      command_on: {data: [0x0A]}
  automation:
    - id: alarm
      mode: parallel
      trigger:
        - type: state
          entity_id: motion
      then:
        - action: delay
          milliseconds: 1000
        - action: command
          target: "id('siren').command_on()"
"#;

#[tokio::test(start_paused = true)]
async fn test_parallel_mode_runs_both() {
    let rig = rig(PARALLEL).await;
    rig.state_tx.send(change("motion", "state", json!("ON"), None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.state_tx.send(change("motion", "state", json!("OFF"), Some(json!("ON")))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(*rig.written.lock(), vec![0x0A, 0x0A]);
}

const GUARDED: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  automation:
    - id: branching
      condition: "trigger.value == 'ON'"
      trigger:
        - type: state
          entity_id: sensor_x
      then:
        - action: publish
          topic: events/then
          payload: fired
      else:
        - action: publish
          topic: events/else
          payload: fired
"#;

#[tokio::test(start_paused = true)]
async fn test_guard_selects_then_or_else() {
    let rig = rig(GUARDED).await;
    rig.state_tx.send(change("sensor_x", "state", json!("ON"), None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mqtt.payloads_for("events/then").len(), 1);
    assert_eq!(rig.mqtt.payloads_for("events/else").len(), 0);

    rig.state_tx.send(change("sensor_x", "state", json!("OFF"), Some(json!("ON")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mqtt.payloads_for("events/then").len(), 1);
    assert_eq!(rig.mqtt.payloads_for("events/else").len(), 1);
}

const PACKET_TRIGGER: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  packet_defaults:
    rx_header: [0xF7]
    rx_footer: [0xEE]
    rx_checksum: add
  automation:
    - id: doorbell_packet
      trigger:
        - type: packet
          schema: {offset: 0, data: [0x93]}
          guard: "data[1] == 0x01"
      then:
        - action: publish
          topic: events/doorbell
          payload: ding
"#;

#[tokio::test(start_paused = true)]
async fn test_packet_trigger_with_guard() {
    let rig = rig(PACKET_TRIGGER).await;
    let frame = |body: &[u8]| {
        let header = [0xF7];
        let mut raw = header.to_vec();
        raw.extend_from_slice(body);
        raw.extend(crate::domain::checksum::Checksum::Add.compute(&header, body));
        raw.push(0xEE);
        Packet::new(raw)
    };

    rig.packets.send(frame(&[0x93, 0x01])).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mqtt.payloads_for("events/doorbell").len(), 1);

    // Guard false: no publish.
    rig.packets.send(frame(&[0x93, 0x00])).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mqtt.payloads_for("events/doorbell").len(), 1);
}

const DEBOUNCE: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  automation:
    - id: chatty
      mode: parallel
      trigger:
        - type: state
          entity_id: sensor_x
          debounce_ms: 10000
      then:
        - action: publish
          topic: events/debounced
          payload: fired
"#;

#[tokio::test(start_paused = true)]
async fn test_debounce_suppresses_retrigger() {
    let rig = rig(DEBOUNCE).await;
    rig.state_tx.send(change("sensor_x", "state", json!("ON"), None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.state_tx.send(change("sensor_x", "state", json!("OFF"), Some(json!("ON")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.mqtt.payloads_for("events/debounced").len(), 1);

    // Past the window a new change fires again.
    tokio::time::sleep(Duration::from_secs(11)).await;
    rig.state_tx.send(change("sensor_x", "state", json!("ON"), Some(json!("OFF")))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.mqtt.payloads_for("events/debounced").len(), 2);
}

const SCHEDULE: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  automation:
    - id: heartbeat
      mode: parallel
      trigger:
        - type: schedule
          every_ms: 1000
      then:
        - action: publish
          topic: events/tick
          payload: tick
"#;

#[tokio::test(start_paused = true)]
async fn test_interval_schedule_fires() {
    let rig = rig(SCHEDULE).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let count = rig.mqtt.payloads_for("events/tick").len();
    assert!((2..=3).contains(&count), "expected 2-3 ticks, got {count}");
}

const STARTUP_WAIT: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  automation:
    - id: boot
      trigger:
        - type: startup
      then:
        - action: if
          condition: "1 == 1"
          then:
            - action: publish
              topic: events/boot
              payload: up
    - id: never_finishes
      trigger:
        - type: startup
      then:
        - action: wait_until
          condition: "false"
          timeout: 500
        - action: publish
          topic: events/never
          payload: nope
"#;

#[tokio::test(start_paused = true)]
async fn test_startup_if_and_wait_until_timeout() {
    let rig = rig(STARTUP_WAIT).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.mqtt.payloads_for("events/boot").len(), 1);
    // wait_until timed out, aborting that run before its publish.
    assert_eq!(rig.mqtt.payloads_for("events/never").len(), 0);
}

const SEND_PACKET: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  packet_defaults:
    tx_header: [0xF7]
    tx_footer: [0xEE]
    tx_checksum: add
  automation:
    - id: raw
      trigger:
        - type: startup
      then:
        - action: send_packet
          data: [0x30, 0x01]
"#;

#[tokio::test(start_paused = true)]
async fn test_send_packet_auto_checksum() {
    let rig = rig(SEND_PACKET).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let body = [0x30, 0x01];
    let mut expected = vec![0xF7];
    expected.extend_from_slice(&body);
    expected.extend(crate::domain::checksum::Checksum::Add.compute(&[0xF7], &body));
    expected.push(0xEE);
    assert_eq!(*rig.written.lock(), expected);
}

const SCRIPTS: &str = r#"
homenet_bridge:
  serial: {port_id: main, path: /dev/ttyUSB0}
  automation: []
  scripts:
    - id: announce
      sequence:
        - action: publish
          topic: events/script
          payload: ran
"#;

#[tokio::test]
async fn test_run_script_by_name() {
    let rig = rig(SCRIPTS).await;
    rig.manager.run_script("announce").await.unwrap();
    assert_eq!(rig.mqtt.payloads_for("events/script").len(), 1);

    match rig.manager.run_script("missing").await {
        Err(ActionError::Failed(_)) => {}
        other => panic!("expected failure for unknown script, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_everything() {
    let rig = rig(SCHEDULE).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let before = rig.mqtt.payloads_for("events/tick").len();
    assert!(before >= 1);
    rig.manager.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.mqtt.payloads_for("events/tick").len(), before);
}

#[test]
fn test_predicate_matching() {
    use crate::infra::config::MatchPredicate;

    let literal = MatchPredicate::Literal(json!("on"));
    assert!(predicate_matches(&literal, &json!("ON")));
    assert!(!predicate_matches(&literal, &json!("OFF")));

    let above: MatchPredicate = serde_yaml::from_str("{gt: 25}").unwrap();
    assert!(predicate_matches(&above, &json!(30)));
    assert!(!predicate_matches(&above, &json!(25)));
    assert!(!predicate_matches(&above, &json!("hot")));

    let range: MatchPredicate = serde_yaml::from_str("{gte: 10, lte: 20}").unwrap();
    assert!(predicate_matches(&range, &json!(10)));
    assert!(!predicate_matches(&range, &json!(21)));

    let pattern: MatchPredicate = serde_yaml::from_str("{regex: '^D_'}").unwrap();
    assert!(predicate_matches(&pattern, &json!("D_BELL")));
    assert!(!predicate_matches(&pattern, &json!("BELL")));

    let number = MatchPredicate::Literal(json!(50));
    assert!(predicate_matches(&number, &json!(50.0)));
}

#[test]
fn test_next_cron_wait_bounds() {
    // Every minute: the next occurrence is at most 60 s away.
    let wait = next_cron_wait("* * * * *").expect("valid cron");
    assert!(wait <= Duration::from_secs(60));

    // Daily at 10:00 local: at most 24 h away.
    let wait = next_cron_wait("0 10 * * *").expect("valid cron");
    assert!(wait <= Duration::from_secs(24 * 3600));

    assert!(next_cron_wait("not a cron").is_none());
}
