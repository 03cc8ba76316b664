//! Typed access to the compressor controller.

use std::time::Duration;

use crate::connection::{self, Connection};
use crate::modbus::{self, Operation, ResponseKind};
use crate::registers::{self, Register};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not connect to the compressor at `{1}`")]
    Connect(#[source] connection::Error, String),
    #[error("{1}")]
    Request(#[source] connection::Error, &'static str),
    #[error("{status}: {name} (modbus exception code {code})")]
    Exception { code: u8, name: &'static str, status: &'static str },
    #[error("{0}: unexpected response from the compressor")]
    UnexpectedResponse(&'static str),
    #[error("not connected to the compressor")]
    NotConnected,
}

impl Error {
    fn exception(code: u8, status: &'static str) -> Self {
        Error::Exception { code, name: modbus::exception_name(code), status }
    }

    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connect(..) | Error::NotConnected => true,
            Error::Request(e, _) => e.is_connection_lost(),
            Error::Exception { .. } | Error::UnexpectedResponse(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Request(connection::Error::Timeout(_), _))
    }
}

pub struct AirCompressorModel {
    connection: Connection,
    unit: u8,
}

impl AirCompressorModel {
    pub fn new(connection: Connection, unit: u8) -> Self {
        Self { connection, unit }
    }

    pub async fn connect(
        host: &str,
        port: u16,
        unit: u8,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let address = format!("{host}:{port}");
        let connection = Connection::connect(&address, timeout)
            .await
            .map_err(|e| Error::Connect(e, address.clone()))?;
        Ok(Self::new(connection, unit))
    }

    pub fn peer(&self) -> &str {
        self.connection.peer()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Write a single register with the "write multiple registers" function.
    pub async fn set_register(
        &self,
        address: u16,
        value: u16,
        error_status: &'static str,
    ) -> Result<(), Error> {
        let operation = Operation::SetHoldings { address, values: vec![value] };
        let response = self
            .connection
            .send(self.unit, operation)
            .await
            .map_err(|e| Error::Request(e, error_status))?;
        match response.kind {
            ResponseKind::SetHoldings { address: a, count: 1 } if a == address => Ok(()),
            ResponseKind::Exception { code, .. } => Err(Error::exception(code, error_status)),
            _ => Err(Error::UnexpectedResponse(error_status)),
        }
    }

    /// Read `count` holding registers. The returned vector always has exactly `count` entries.
    pub async fn get_registers(
        &self,
        address: u16,
        count: u16,
        error_status: &'static str,
    ) -> Result<Vec<u16>, Error> {
        let operation = Operation::GetHoldings { address, count };
        let response = self
            .connection
            .send(self.unit, operation)
            .await
            .map_err(|e| Error::Request(e, error_status))?;
        match response.kind {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => {
                Ok(values)
            }
            ResponseKind::Exception { code, .. } => Err(Error::exception(code, error_status)),
            _ => Err(Error::UnexpectedResponse(error_status)),
        }
    }

    pub async fn reset(&self) -> Result<(), Error> {
        let address = Register::Reset.address();
        self.set_register(address, registers::RESET_ERRORS, "cannot reset compressor").await
    }

    pub async fn power_on(&self) -> Result<(), Error> {
        self.set_register(
            Register::RemoteCommand.address(),
            registers::POWER_ON,
            "cannot power on compressor",
        )
        .await
    }

    pub async fn power_off(&self) -> Result<(), Error> {
        self.set_register(
            Register::RemoteCommand.address(),
            registers::POWER_OFF,
            "cannot power off compressor",
        )
        .await
    }

    pub async fn get_status(&self) -> Result<Vec<u16>, Error> {
        let address = Register::Status.address();
        self.get_registers(address, registers::STATUS_COUNT, "cannot read status").await
    }

    pub async fn get_error_registers(&self) -> Result<Vec<u16>, Error> {
        self.get_registers(
            Register::ErrorE400.address(),
            registers::ERROR_COUNT,
            "cannot read errors and warnings",
        )
        .await
    }

    /// Software version followed by the serial number, one ASCII character per register.
    pub async fn get_compressor_info(&self) -> Result<Vec<u16>, Error> {
        self.get_registers(
            Register::SoftwareVersion.address(),
            registers::INFO_COUNT,
            "cannot read compressor info",
        )
        .await
    }

    /// The water level followed by the registers from target speed to stage 1 output
    /// temperature.
    pub async fn get_analog_data(&self) -> Result<Vec<u16>, Error> {
        let mut analog = self
            .get_registers(Register::WaterLevel.address(), 1, "cannot read water level")
            .await?;
        analog.extend(
            self.get_registers(
                Register::TargetSpeed.address(),
                registers::ANALOG_COUNT,
                "cannot read analog data",
            )
            .await?,
        );
        Ok(analog)
    }

    pub async fn get_timers(&self) -> Result<Vec<u16>, Error> {
        let address = Register::RunningHours.address();
        self.get_registers(address, registers::TIMERS_COUNT, "cannot read timers").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;

    async fn simulated() -> (Simulator, AirCompressorModel) {
        let simulator = Simulator::start().await.unwrap();
        let address = simulator.local_addr();
        let model = AirCompressorModel::connect(
            &address.ip().to_string(),
            address.port(),
            1,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (simulator, model)
    }

    #[tokio::test]
    async fn status() {
        let (_simulator, model) = simulated().await;
        assert_eq!(model.get_status().await.unwrap(), [1, 0, 1]);
    }

    #[tokio::test]
    async fn analog_data() {
        let (_simulator, model) = simulated().await;
        let analog = model.get_analog_data().await.unwrap();
        assert_eq!(analog.len(), 15);
        assert_eq!(analog[..10], [2, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn compressor_info() {
        let (_simulator, model) = simulated().await;
        let info = model.get_compressor_info().await.unwrap();
        assert_eq!(info.len(), 23);
        let (version, serial) = info.split_at(registers::SOFTWARE_VERSION_LENGTH);
        assert!(!registers::decode_ascii(version).is_empty());
        assert!(!registers::decode_ascii(serial).is_empty());
    }

    #[tokio::test]
    async fn power_on_and_off() {
        let (simulator, model) = simulated().await;
        model.power_on().await.unwrap();
        assert_eq!(model.get_status().await.unwrap(), [2, 0, 0]);
        let command = simulator.register(Register::RemoteCommand.address());
        assert_eq!(command, Some(registers::POWER_ON));
        model.power_off().await.unwrap();
        assert_eq!(model.get_status().await.unwrap(), [1, 0, 1]);
    }

    #[tokio::test]
    async fn reset_clears_errors() {
        let (simulator, model) = simulated().await;
        simulator.set_register(Register::ErrorE400.address(), 0x0003);
        assert_eq!(model.get_error_registers().await.unwrap()[0], 3);
        model.reset().await.unwrap();
        assert!(model.get_error_registers().await.unwrap().iter().all(|r| *r == 0));
    }

    #[tokio::test]
    async fn illegal_address() {
        let (_simulator, model) = simulated().await;
        let error = model.get_registers(0x200, 1, "cannot read").await.unwrap_err();
        assert!(matches!(error, Error::Exception { code: 2, .. }), "{error:?}");
        assert!(!error.is_connection_lost());
        assert_eq!(
            error.to_string(),
            "cannot read: illegal data address (modbus exception code 2)"
        );
    }

    #[tokio::test]
    async fn simulator_shutdown_is_connection_loss() {
        let (simulator, model) = simulated().await;
        drop(simulator);
        let error = loop {
            match model.get_status().await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => break e,
            }
        };
        assert!(error.is_connection_lost(), "{error:?}");
        assert!(!model.is_connected());
    }
}
