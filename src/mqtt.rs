//! Bridges the component to an MQTT broker.
//!
//! Events are published retained under `<root>/evt/<name>`, telemetry under `<root>/tel/<name>`
//! and command acknowledgements under `<root>/ackcmd`. Commands arrive on `<root>/cmd/<name>`,
//! where `<root>` is `<prefix>/MTAirCompressor/<index>`.

use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::csc::{Command, CommandRequest, CommandStatus, Kind, Message, ParseError};

/// How long to keep delivering queued publications after the component has stopped.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between broker connection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Host name of the MQTT broker.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic prefix under which the component publishes and listens for commands.
    #[arg(long, default_value = "lsst/sal")]
    mqtt_prefix: String,

    #[arg(long, default_value = "5s")]
    mqtt_keep_alive: humantime::Duration,
}

#[derive(Clone, Debug)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(prefix: &str, index: u16) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self { root: format!("{prefix}/MTAirCompressor/{index}") }
    }

    pub fn commands(&self) -> String {
        format!("{}/cmd/+", self.root)
    }

    pub fn for_message(&self, message: &Message) -> String {
        match message.kind {
            Kind::Event => format!("{}/evt/{}", self.root, message.name),
            Kind::Telemetry => format!("{}/tel/{}", self.root, message.name),
            Kind::Ack => format!("{}/{}", self.root, message.name),
        }
    }

    pub fn command_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(self.root.as_str())?.strip_prefix("/cmd/")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("command topic is not valid UTF-8")]
    TopicEncoding(#[source] std::str::Utf8Error),
    #[error("`{0}` is not a command topic")]
    NotACommand(String),
    #[error("command payload is not valid JSON")]
    Payload(#[source] serde_json::Error),
    #[error("command payload is not a JSON object")]
    PayloadNotObject,
    #[error("invalid command")]
    Command(#[source] ParseError),
    #[error("component is busy, try again later")]
    Busy,
}

/// A command that could not be turned into a [`CommandRequest`].
#[derive(Debug)]
pub struct Rejected {
    pub command: String,
    /// Present when the payload could be read far enough to find it.
    pub sequence_id: Option<i64>,
    pub error: Error,
}

pub fn parse_command(
    topics: &Topics,
    topic: &[u8],
    payload: &[u8],
) -> Result<CommandRequest, Rejected> {
    let reject = |command: &str, sequence_id, error| Rejected {
        command: command.to_string(),
        sequence_id,
        error,
    };
    let topic =
        std::str::from_utf8(topic).map_err(|e| reject("", None, Error::TopicEncoding(e)))?;
    let Some(name) = topics.command_name(topic) else {
        return Err(reject("", None, Error::NotACommand(topic.to_string())));
    };
    let parameters = if payload.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(payload).map_err(|e| reject(name, None, Error::Payload(e)))?
    };
    if !parameters.is_object() {
        return Err(reject(name, None, Error::PayloadNotObject));
    }
    let sequence_id =
        parameters.get("sequence_id").and_then(serde_json::Value::as_i64).unwrap_or(-1);
    let command = Command::parse(name, &parameters)
        .map_err(|e| reject(name, Some(sequence_id), Error::Command(e)))?;
    Ok(CommandRequest { sequence_id, command })
}

/// Whether to hand `message` to the client. Telemetry and heartbeats are not queued while the
/// broker is unreachable.
fn should_forward(connected: bool, message: &Message) -> bool {
    connected || !message.is_periodic()
}

/// Relay `outbound` messages to the broker and incoming commands to `commands` until `outbound`
/// closes.
pub async fn run(
    args: Args,
    index: u16,
    commands: mpsc::Sender<CommandRequest>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let topics = Topics::new(&args.mqtt_prefix, index);
    let client_id = format!("MTAirCompressor-{index}-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, args.mqtt_host.clone(), args.mqtt_port);
    options.set_keep_alive(*args.mqtt_keep_alive);
    let (client, mut client_loop) = AsyncClient::new(options, 256);
    info!(message = "connecting to the MQTT broker", host = %args.mqtt_host, port = args.mqtt_port);

    let mut connected = false;
    let mut backing_off = false;
    let mut retry = std::pin::pin!(tokio::time::sleep(Duration::ZERO));
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if should_forward(connected, &message) {
                    publish(&client, &topics, &message);
                } else {
                    trace!(message = "broker unreachable, dropping", name = message.name);
                }
            }
            () = &mut retry, if backing_off => backing_off = false,
            event = client_loop.poll(), if !backing_off => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    info!(message = "connected to the MQTT broker", commands = %topics.commands());
                    if let Err(e) = client.try_subscribe(topics.commands(), QoS::AtLeastOnce) {
                        let error = &e as &dyn std::error::Error;
                        warn!(message = "could not subscribe to commands", error);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&client, &topics, &commands, publish);
                }
                Ok(event) => trace!(message = "mqtt event", ?event),
                Err(e) => {
                    connected = false;
                    let error = &e as &dyn std::error::Error;
                    warn!(message = "MQTT connection error, will retry", error);
                    retry.as_mut().reset(tokio::time::Instant::now() + RETRY_DELAY);
                    backing_off = true;
                }
            }
        }
    }

    debug!("component stopped, flushing MQTT publications");
    if let Err(e) = client.try_disconnect() {
        debug!(message = "could not queue MQTT disconnect", error = (&e as &dyn std::error::Error));
    }
    let flush = async {
        while client_loop.poll().await.is_ok() {}
    };
    if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
        debug!("MQTT flush did not complete in time");
    }
}

fn publish(client: &AsyncClient, topics: &Topics, message: &Message) {
    let topic = topics.for_message(message);
    let retain = message.kind == Kind::Event;
    trace!(message = "publishing", %topic);
    let payload = message.to_payload();
    if let Err(e) = client.try_publish(topic.clone(), QoS::AtLeastOnce, retain, payload) {
        let error = &e as &dyn std::error::Error;
        warn!(message = "could not queue an MQTT publication", %topic, error);
    }
}

fn handle_publish(
    client: &AsyncClient,
    topics: &Topics,
    commands: &mpsc::Sender<CommandRequest>,
    publish: Publish,
) {
    let rejection = match parse_command(topics, &publish.topic, &publish.payload) {
        Ok(request) => match commands.try_send(request) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(request)) => Rejected {
                command: request.command.name().to_string(),
                sequence_id: Some(request.sequence_id),
                error: Error::Busy,
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("component no longer accepts commands");
                return;
            }
        },
        Err(rejected) => rejected,
    };
    warn!(
        message = "rejecting a command",
        command = %rejection.command,
        error = (&rejection.error as &dyn std::error::Error)
    );
    if let Some(sequence_id) = rejection.sequence_id {
        let reason = crate::csc::error_chain(&rejection.error);
        let ack = Message::ack(sequence_id, &rejection.command, CommandStatus::Fail, &reason);
        self::publish(client, topics, &ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_layout() {
        let topics = Topics::new("lsst/sal/", 2);
        assert_eq!(topics.commands(), "lsst/sal/MTAirCompressor/2/cmd/+");
        assert_eq!(
            topics.for_message(&Message::event("status", json!({}))),
            "lsst/sal/MTAirCompressor/2/evt/status"
        );
        assert_eq!(
            topics.for_message(&Message::telemetry("analogData", json!({}))),
            "lsst/sal/MTAirCompressor/2/tel/analogData"
        );
        assert_eq!(
            topics.for_message(&Message::ack(1, "start", CommandStatus::Ack, "")),
            "lsst/sal/MTAirCompressor/2/ackcmd"
        );
        assert_eq!(topics.command_name("lsst/sal/MTAirCompressor/2/cmd/powerOn"), Some("powerOn"));
        assert_eq!(topics.command_name("lsst/sal/MTAirCompressor/1/cmd/powerOn"), None);
    }

    #[test]
    fn parses_commands() {
        let topics = Topics::new("lsst/sal", 1);
        let request = parse_command(
            &topics,
            b"lsst/sal/MTAirCompressor/1/cmd/start",
            br#"{"sequence_id": 42, "configurationOverride": "lab.yaml"}"#,
        )
        .unwrap();
        assert_eq!(request.sequence_id, 42);
        assert_eq!(request.command, Command::Start { configuration_override: "lab.yaml".into() });

        let request = parse_command(&topics, b"lsst/sal/MTAirCompressor/1/cmd/reset", b"").unwrap();
        assert_eq!(request, CommandRequest { sequence_id: -1, command: Command::Reset });
    }

    #[test]
    fn rejects_bad_commands() {
        let topics = Topics::new("lsst/sal", 1);
        let rejected =
            parse_command(&topics, b"lsst/sal/MTAirCompressor/1/cmd/fly", br#"{"sequence_id": 7}"#)
                .unwrap_err();
        assert_eq!(rejected.command, "fly");
        assert_eq!(rejected.sequence_id, Some(7));
        assert!(matches!(rejected.error, Error::Command(ParseError::UnknownCommand(_))));

        let rejected =
            parse_command(&topics, b"lsst/sal/MTAirCompressor/1/cmd/enable", b"[1]").unwrap_err();
        assert_eq!(rejected.sequence_id, None);
        assert!(matches!(rejected.error, Error::PayloadNotObject));

        let rejected = parse_command(&topics, b"other/topic", b"{}").unwrap_err();
        assert!(matches!(rejected.error, Error::NotACommand(_)));
    }

    #[test]
    fn offline_drops_only_periodic_messages() {
        let analog = Message::telemetry("analogData", json!({"waterLevel": 2}));
        let heartbeat = Message::event(crate::csc::HEARTBEAT, json!({}));
        let status = Message::event("summaryState", json!({"summaryState": 5}));
        let ack = Message::ack(3, "start", CommandStatus::Success, "Done");
        assert!(!should_forward(false, &analog));
        assert!(!should_forward(false, &heartbeat));
        assert!(should_forward(false, &status));
        assert!(should_forward(false, &ack));
        assert!(should_forward(true, &analog));
        assert!(should_forward(true, &heartbeat));
    }
}
