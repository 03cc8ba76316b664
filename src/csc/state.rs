/// Summary state of the component. Numeric values match the observatory-wide enumeration.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::FromRepr,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum SummaryState {
    Disabled = 1,
    Enabled = 2,
    Fault = 3,
    Offline = 4,
    Standby = 5,
}

impl SummaryState {
    pub fn disabled_or_enabled(self) -> bool {
        matches!(self, SummaryState::Disabled | SummaryState::Enabled)
    }
}

/// States the component may be asked to reach right after startup.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialState {
    Standby,
    Disabled,
    Enabled,
}

impl From<InitialState> for SummaryState {
    fn from(value: InitialState) -> Self {
        match value {
            InitialState::Standby => SummaryState::Standby,
            InitialState::Disabled => SummaryState::Disabled,
            InitialState::Enabled => SummaryState::Enabled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    CouldNotConnect = 1,
    NotConnected = 2,
    ModbusError = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum CommandStatus {
    /// The command was received and is being executed.
    Ack,
    Success,
    Fail,
    NoAck,
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("parameter `{0}` of command `{1}` must be a string")]
    ParameterType(&'static str, &'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start { configuration_override: String },
    Enable,
    Disable,
    Standby,
    ExitControl,
    PowerOn,
    PowerOff,
    Reset,
}

impl Command {
    /// Build a command from its name and JSON parameters.
    pub fn parse(name: &str, parameters: &serde_json::Value) -> Result<Command, ParseError> {
        Ok(match name {
            "start" => {
                let configuration_override = match parameters.get("configurationOverride") {
                    None | Some(serde_json::Value::Null) => String::new(),
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(ParseError::ParameterType("configurationOverride", "start"));
                    }
                };
                Command::Start { configuration_override }
            }
            "enable" => Command::Enable,
            "disable" => Command::Disable,
            "standby" => Command::Standby,
            "exitControl" => Command::ExitControl,
            "powerOn" => Command::PowerOn,
            "powerOff" => Command::PowerOff,
            "reset" => Command::Reset,
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Enable => "enable",
            Command::Disable => "disable",
            Command::Standby => "standby",
            Command::ExitControl => "exitControl",
            Command::PowerOn => "powerOn",
            Command::PowerOff => "powerOff",
            Command::Reset => "reset",
        }
    }

    pub fn allowed_states(&self) -> &'static [SummaryState] {
        match self {
            Command::Start { .. } | Command::ExitControl => &[SummaryState::Standby],
            Command::Enable => &[SummaryState::Disabled],
            Command::Disable | Command::PowerOn | Command::PowerOff | Command::Reset => {
                &[SummaryState::Enabled]
            }
            Command::Standby => &[SummaryState::Disabled, SummaryState::Fault],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    /// Echoed in every acknowledgement; -1 when the sender did not provide one.
    pub sequence_id: i64,
    pub command: Command,
}
