use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;

use super::state::CommandStatus;

pub const HEARTBEAT: &str = "heartbeat";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Event,
    Telemetry,
    Ack,
}

/// Something the component publishes.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub kind: Kind,
    pub name: &'static str,
    pub payload: Value,
}

impl Message {
    pub fn event(name: &'static str, payload: Value) -> Self {
        Self { kind: Kind::Event, name, payload }
    }

    pub fn telemetry(name: &'static str, payload: Value) -> Self {
        Self { kind: Kind::Telemetry, name, payload }
    }

    /// Command acknowledgement in the `{"id": status, "sequence_id": n}` shape.
    pub fn ack(sequence_id: i64, command: &str, status: CommandStatus, result: &str) -> Self {
        let status: &'static str = status.into();
        Self {
            kind: Kind::Ack,
            name: "ackcmd",
            payload: json!({
                "id": status,
                "sequence_id": sequence_id,
                "command": command,
                "result": result,
            }),
        }
    }

    /// Whether a newer message of the same name supersedes this one: telemetry and heartbeats.
    pub fn is_periodic(&self) -> bool {
        self.kind == Kind::Telemetry || self.name == HEARTBEAT
    }

    /// Serialized payload with the publication time added.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = self.payload.clone();
        if let Value::Object(fields) = &mut payload {
            fields.insert("timestamp".into(), jiff::Timestamp::now().to_string().into());
        }
        serde_json::to_vec(&payload).unwrap_or_default()
    }
}

/// Publishes messages, suppressing events whose content has not changed since the last write.
pub struct Outbox {
    sender: UnboundedSender<Message>,
    last: HashMap<&'static str, Value>,
}

impl Outbox {
    pub fn new(sender: UnboundedSender<Message>) -> Self {
        Self { sender, last: HashMap::new() }
    }

    pub fn sender(&self) -> UnboundedSender<Message> {
        self.sender.clone()
    }

    /// Returns whether the event was published.
    pub fn set_write(&mut self, name: &'static str, payload: Value) -> bool {
        if self.last.get(name) == Some(&payload) {
            return false;
        }
        self.write_event(name, payload);
        true
    }

    pub fn write_event(&mut self, name: &'static str, payload: Value) {
        self.last.insert(name, payload.clone());
        self.send(Message::event(name, payload));
    }

    pub fn write_telemetry(&self, name: &'static str, payload: Value) {
        self.send(Message::telemetry(name, payload));
    }

    pub fn ack(&self, sequence_id: i64, command: &str, status: CommandStatus, result: &str) {
        self.send(Message::ack(sequence_id, command, status, result));
    }

    fn send(&self, message: Message) {
        if self.sender.send(message).is_err() {
            tracing::debug!("message dropped, nobody is publishing anymore");
        }
    }
}

pub(crate) async fn heartbeat(sender: UnboundedSender<Message>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if sender.send(Message::event(HEARTBEAT, json!({}))).is_err() {
            return;
        }
    }
}
