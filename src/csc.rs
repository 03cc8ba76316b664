//! The MTAirCompressor component: summary state machine, command handling and the poll loop
//! that turns compressor registers into events and telemetry.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::model::{self, AirCompressorModel};
use crate::registers;
use crate::simulator::Simulator;

mod config;
mod outbox;
mod state;

pub use config::{ConfigFile, Error as ConfigError, Instance, Overrides, Target, default_host};
pub use outbox::{HEARTBEAT, Kind, Message, Outbox};
pub use state::{
    Command, CommandRequest, CommandStatus, ErrorCode, InitialState, ParseError, SummaryState,
};

/// Delays of the poll loop.
#[derive(Clone, Debug)]
pub struct Timing {
    pub poll_period: Duration,
    /// Wait after a failed reconnection attempt.
    pub reconnect_delay: Duration,
    /// Wait after a tolerated telemetry failure.
    pub exception_delay: Duration,
    pub heartbeat_period: Duration,
    /// Timers are read on the first telemetry cycle and then on every this many cycles.
    pub timer_update_cycles: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            exception_delay: Duration::from_secs(2),
            heartbeat_period: Duration::from_secs(1),
            timer_update_cycles: 60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub index: u16,
    pub simulation_mode: bool,
    pub config_dir: PathBuf,
    pub overrides: Overrides,
    pub modbus_timeout: Duration,
    pub timing: Timing,
}

pub struct Csc {
    settings: Settings,
    state: SummaryState,
    outbox: Outbox,
    target: Option<Target>,
    model: Option<AirCompressorModel>,
    simulator: Option<Simulator>,
    /// Time of the first failure of the current outage.
    failed_since: Option<Instant>,
    polling: bool,
    next_poll: Instant,
    timers: Countdown,
}

/// Counts telemetry cycles down to the next read of a slowly changing register block.
#[derive(Clone, Copy, Debug, Default)]
struct Countdown {
    remaining: u32,
}

impl Countdown {
    fn is_due(&self) -> bool {
        self.remaining == 0
    }

    /// Make the next read due `cycles` cycles after the current one.
    fn restart(&mut self, cycles: u32) {
        self.remaining = cycles.saturating_sub(1);
    }

    fn tick(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }
}

pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        text.push_str(": ");
        text.push_str(&e.to_string());
        source = e.source();
    }
    text
}

impl Csc {
    pub fn new(settings: Settings, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            settings,
            state: SummaryState::Standby,
            outbox: Outbox::new(outbound),
            target: None,
            model: None,
            simulator: None,
            failed_since: None,
            polling: false,
            next_poll: Instant::now(),
            timers: Countdown::default(),
        }
    }

    /// Run until `exitControl` succeeds, `shutdown` is cancelled or the command channel closes.
    pub async fn run(
        mut self,
        initial_state: InitialState,
        configuration_override: &str,
        mut commands: mpsc::Receiver<CommandRequest>,
        shutdown: CancellationToken,
    ) {
        let _heartbeat = AbortOnDropHandle::new(tokio::task::spawn(outbox::heartbeat(
            self.outbox.sender(),
            self.settings.timing.heartbeat_period,
        )));
        self.outbox.set_write(
            "softwareVersions",
            json!({
                "cscVersion": env!("CARGO_PKG_VERSION"),
                "xmlVersion": "",
                "salVersion": "",
                "openSpliceVersion": "",
                "subsystemVersions": "",
            }),
        );
        let mode = u8::from(self.settings.simulation_mode);
        self.outbox.set_write("simulationMode", json!({ "mode": mode }));
        self.publish_summary_state();
        self.enter_initial_state(initial_state, configuration_override).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutting down");
                    break;
                }
                request = commands.recv() => {
                    let Some(request) = request else {
                        debug!("command channel closed");
                        break;
                    };
                    self.handle_request(request).await;
                    if self.state == SummaryState::Offline {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(self.next_poll), if self.polling => {
                    let delay = self.poll().await;
                    self.next_poll = Instant::now() + delay;
                }
            }
        }
        self.close_own_tasks();
    }

    async fn enter_initial_state(
        &mut self,
        initial_state: InitialState,
        configuration_override: &str,
    ) {
        let target = SummaryState::from(initial_state);
        if target == SummaryState::Standby {
            return;
        }
        if let Err(reason) = self.start(configuration_override).await {
            error!(message = "could not reach the initial state", %target, %reason);
            return;
        }
        if target == SummaryState::Enabled && self.state == SummaryState::Disabled {
            self.set_state(SummaryState::Enabled);
        }
    }

    async fn handle_request(&mut self, request: CommandRequest) {
        let CommandRequest { sequence_id, command } = request;
        let name = command.name();
        debug!(message = "received command", command = name, sequence_id);
        self.outbox.ack(sequence_id, name, CommandStatus::Ack, "");
        match self.execute(command).await {
            Ok(()) => self.outbox.ack(sequence_id, name, CommandStatus::Success, "Done"),
            Err(reason) => {
                warn!(message = "command failed", command = name, sequence_id, %reason);
                self.outbox.ack(sequence_id, name, CommandStatus::Fail, &reason);
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<(), String> {
        if !command.allowed_states().contains(&self.state) {
            return Err(format!("{} not allowed in state {}", command.name(), self.state));
        }
        match command {
            Command::Start { configuration_override } => self.start(&configuration_override).await,
            Command::Enable => {
                self.set_state(SummaryState::Enabled);
                Ok(())
            }
            Command::Disable => {
                self.set_state(SummaryState::Disabled);
                Ok(())
            }
            Command::Standby => {
                self.close_own_tasks();
                self.failed_since = None;
                self.set_state(SummaryState::Standby);
                Ok(())
            }
            Command::ExitControl => {
                self.set_state(SummaryState::Offline);
                Ok(())
            }
            Command::PowerOn => {
                let fail = |e: model::Error| expected_error("Cannot power on compressor", &e);
                self.model().map_err(fail)?.power_on().await.map_err(fail)?;
                info!("Compressor powered on.");
                Ok(())
            }
            Command::PowerOff => {
                let fail = |e: model::Error| expected_error("Cannot power off compressor", &e);
                self.model().map_err(fail)?.power_off().await.map_err(fail)?;
                info!("Compressor powered off.");
                Ok(())
            }
            Command::Reset => {
                let fail = |e: model::Error| expected_error("Cannot reset compressor", &e);
                self.model().map_err(fail)?.reset().await.map_err(fail)?;
                info!("Compressor reset.");
                Ok(())
            }
        }
    }

    fn set_state(&mut self, state: SummaryState) {
        if self.state != state {
            info!(message = "summary state changed", from = %self.state, to = %state);
        }
        self.state = state;
        self.publish_summary_state();
    }

    fn publish_summary_state(&mut self) {
        let name: &'static str = self.state.into();
        let payload = json!({"summaryState": self.state as u8, "name": name});
        self.outbox.set_write("summaryState", payload);
    }

    fn fault(&mut self, code: ErrorCode, report: String) {
        if self.state == SummaryState::Fault {
            warn!(message = "already in fault", ?code, %report);
            return;
        }
        error!(message = "going to fault", ?code, %report);
        self.outbox.write_event(
            "errorCode",
            json!({"errorCode": code as i32, "errorReport": report, "traceback": ""}),
        );
        self.set_state(SummaryState::Fault);
        self.polling = false;
        self.disconnect();
    }

    async fn start(&mut self, configuration_override: &str) -> Result<(), String> {
        let config = ConfigFile::load(&self.settings.config_dir, configuration_override)
            .await
            .map_err(|e| format!("Failed to apply configuration: {}", error_chain(&e)))?;
        let target = config
            .resolve(self.settings.index, &self.settings.overrides)
            .map_err(|e| format!("Failed to apply configuration: {}", error_chain(&e)))?;
        self.set_state(SummaryState::Disabled);
        self.end_start(target).await;
        Ok(())
    }

    async fn end_start(&mut self, mut target: Target) {
        if self.settings.simulation_mode {
            match Simulator::start().await {
                Ok(simulator) => {
                    target = Target::simulator(simulator.local_addr(), target.grace_period);
                    self.simulator = Some(simulator);
                }
                Err(e) => {
                    self.fault(
                        ErrorCode::CouldNotConnect,
                        format!("Cannot start the simulator: {}", error_chain(&e)),
                    );
                    return;
                }
            }
        }
        info!(
            message = "compressor target",
            host = %target.host,
            port = target.port,
            unit = target.unit,
            grace_period = %humantime::format_duration(target.grace_period),
        );
        self.target = Some(target);
        self.failed_since = None;
        match self.connect().await {
            Ok(()) => {
                self.polling = true;
                self.timers = Countdown::default();
                self.next_poll = Instant::now();
            }
            Err(e) => self.handle_modbus_error(e, "Starting up: ", false),
        }
    }

    fn model(&self) -> Result<&AirCompressorModel, model::Error> {
        self.model.as_ref().ok_or(model::Error::NotConnected)
    }

    async fn connect(&mut self) -> Result<(), model::Error> {
        if self.model.is_none() {
            let Some(target) = &self.target else {
                return Err(model::Error::NotConnected);
            };
            let model = AirCompressorModel::connect(
                &target.host,
                target.port,
                target.unit,
                self.settings.modbus_timeout,
            )
            .await?;
            info!(message = "Connected", peer = model.peer());
            self.model = Some(model);
        }
        self.outbox.set_write("connectionStatus", json!({"connected": true}));
        self.update_compressor_info().await
    }

    fn disconnect(&mut self) {
        if let Some(model) = self.model.take() {
            debug!(message = "disconnecting", peer = model.peer());
        }
        self.outbox.set_write("connectionStatus", json!({"connected": false}));
    }

    fn close_own_tasks(&mut self) {
        self.polling = false;
        self.disconnect();
        if self.simulator.take().is_some() {
            info!("simulator stopped");
        }
    }

    /// Log a failure, tolerating it for the grace period when `tolerate` is set; otherwise or
    /// once the grace period has elapsed, go to fault.
    fn handle_modbus_error(&mut self, error: model::Error, context: &str, tolerate: bool) {
        let connection_lost = error.is_connection_lost();
        if connection_lost {
            self.disconnect();
        }
        let grace_period = self.target.as_ref().map(|t| t.grace_period).unwrap_or_default();
        if tolerate && self.state != SummaryState::Fault {
            let within_grace = match self.failed_since {
                None => true,
                Some(since) => since.elapsed() < grace_period,
            };
            if within_grace {
                if error.is_timeout() {
                    error!(message = "TimeoutError", context);
                } else {
                    error!(
                        message = "compressor communication failed",
                        context,
                        error = (&error as &dyn std::error::Error)
                    );
                }
                if self.failed_since.is_none() {
                    warn!(
                        "Lost compressor connection, will try to reconnect for {} seconds",
                        grace_period.as_secs()
                    );
                    self.failed_since = Some(Instant::now());
                }
                return;
            }
        }
        let code = match error {
            model::Error::NotConnected => ErrorCode::NotConnected,
            _ if connection_lost => ErrorCode::CouldNotConnect,
            _ => ErrorCode::ModbusError,
        };
        self.fault(code, format!("{context}{}", error_chain(&error)));
        self.failed_since = None;
    }

    /// One iteration of the poll loop. Returns the delay until the next one.
    async fn poll(&mut self) -> Duration {
        let timing = self.settings.timing.clone();
        let delay = if let Some(failed_since) = self.failed_since {
            match self.reconnect(failed_since).await {
                Ok(()) => timing.poll_period,
                Err(e) => {
                    self.handle_modbus_error(e, "While reconnecting: ", true);
                    self.disconnect();
                    timing.reconnect_delay
                }
            }
        } else if self.state.disabled_or_enabled() {
            match self.update_telemetry().await {
                Ok(()) => timing.poll_period,
                Err(e) => {
                    self.handle_modbus_error(e, "", true);
                    timing.exception_delay
                }
            }
        } else {
            timing.poll_period
        };
        if self.state == SummaryState::Fault {
            self.polling = false;
            self.disconnect();
        }
        delay
    }

    async fn reconnect(&mut self, failed_since: Instant) -> Result<(), model::Error> {
        if self.model.is_none() {
            self.connect().await?;
        } else {
            self.update_compressor_info().await?;
        }
        info!(
            "Compressor connection is back after {:.1} seconds",
            failed_since.elapsed().as_secs_f64()
        );
        self.failed_since = None;
        Ok(())
    }

    async fn update_telemetry(&mut self) -> Result<(), model::Error> {
        self.update_status().await?;
        self.update_errors_warnings().await?;
        self.update_analog_data().await?;
        if self.timers.is_due() {
            self.update_timers().await?;
            self.timers.restart(self.settings.timing.timer_update_cycles);
        } else {
            self.timers.tick();
        }
        Ok(())
    }

    async fn update_status(&mut self) -> Result<(), model::Error> {
        let status = self.model()?.get_status().await?;
        let flags = registers::decode_flags(&registers::STATUS_FLAGS, &status)
            .ok_or(model::Error::UnexpectedResponse("cannot read status"))?;
        self.outbox.set_write("status", flags_payload(flags));
        Ok(())
    }

    async fn update_errors_warnings(&mut self) -> Result<(), model::Error> {
        let values = self.model()?.get_error_registers().await?;
        let unexpected = || model::Error::UnexpectedResponse("cannot read errors and warnings");
        let errors =
            registers::decode_flags(&registers::ERROR_FLAGS, &values).ok_or_else(unexpected)?;
        let warnings =
            registers::decode_flags(&registers::WARNING_FLAGS, &values).ok_or_else(unexpected)?;
        self.outbox.set_write("errors", flags_payload(errors));
        self.outbox.set_write("warnings", flags_payload(warnings));
        Ok(())
    }

    async fn update_compressor_info(&mut self) -> Result<(), model::Error> {
        let info = self.model()?.get_compressor_info().await?;
        let (version, serial) = info.split_at(registers::SOFTWARE_VERSION_LENGTH.min(info.len()));
        self.outbox.set_write(
            "compressorInfo",
            json!({
                "softwareVersion": registers::decode_ascii(version),
                "serialNumber": registers::decode_ascii(serial),
            }),
        );
        Ok(())
    }

    async fn update_analog_data(&mut self) -> Result<(), model::Error> {
        let analog = self.model()?.get_analog_data().await?;
        let fields = registers::decode_fields(&registers::ANALOG_FIELDS, &analog)
            .ok_or(model::Error::UnexpectedResponse("cannot read analog data"))?;
        self.outbox.write_telemetry("analogData", fields_payload(fields));
        Ok(())
    }

    async fn update_timers(&mut self) -> Result<(), model::Error> {
        let timers = self.model()?.get_timers().await?;
        let fields = registers::decode_fields(&registers::TIMER_FIELDS, &timers)
            .ok_or(model::Error::UnexpectedResponse("cannot read timers"))?;
        self.outbox.set_write("timerInfo", fields_payload(fields));
        Ok(())
    }
}

fn expected_error(what: &str, reason: &model::Error) -> String {
    let message = format!("{what}: {}", error_chain(reason));
    error!("{message}");
    message
}

fn flags_payload(flags: Vec<(&'static str, bool)>) -> Value {
    Value::Object(flags.into_iter().map(|(name, set)| (name.into(), Value::Bool(set))).collect())
}

fn fields_payload(fields: Vec<(&'static str, registers::Value)>) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(name, value)| (name.into(), serde_json::to_value(value).unwrap_or(Value::Null)))
            .collect(),
    )
}
