//! A Modbus TCP server imitating the compressor controller.
//!
//! The register values are arbitrary but stable, which makes the simulator usable both for
//! `--simulate` runs and as a test fixture. Consult the Delcos XL register map in
//! [`crate::registers`] for the meaning of individual registers.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::modbus::{self, Incoming, ModbusServerCodec, Operation, Response, ResponseKind};
use crate::registers::{self, Register};

/// Number of holding registers served, starting at address 0.
pub const BLOCK_SIZE: usize = 340;

const SOFTWARE_VERSION: &str = "SIM 1.0";
const SERIAL_NUMBER: &str = "SIM000001";

pub struct RegisterBlock {
    values: Vec<u16>,
    /// When set, every request is answered with this exception code.
    failure: Option<u8>,
}

impl Default for RegisterBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBlock {
    pub fn new() -> Self {
        let mut values = vec![0; BLOCK_SIZE];
        let analog =
            usize::from(Register::WaterLevel.address())..usize::from(Register::Status.address());
        for (slot, value) in values[analog].iter_mut().zip(2..) {
            *slot = value;
        }
        let status = usize::from(Register::Status.address());
        values[status..status + 3].copy_from_slice(&[0x01, 0x00, 0x01]);
        let timers = usize::from(Register::RunningHours.address());
        values[timers..timers + 6]
            .copy_from_slice(&[0x0001, 0x1170, 0x0000, 0x04D2, 0xFFFB, 0x0000]);
        write_ascii(&mut values, Register::SoftwareVersion, SOFTWARE_VERSION);
        write_ascii(&mut values, Register::SerialNumber, SERIAL_NUMBER);
        Self { values, failure: None }
    }

    fn range(&self, address: u16, count: usize) -> Result<Range<usize>, u8> {
        let start = usize::from(address);
        let end = start + count;
        if count == 0 || end > self.values.len() {
            return Err(modbus::ILLEGAL_DATA_ADDRESS);
        }
        Ok(start..end)
    }

    pub fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, u8> {
        if count > modbus::MAX_READ_COUNT {
            return Err(modbus::ILLEGAL_DATA_VALUE);
        }
        let range = self.range(address, usize::from(count))?;
        Ok(self.values[range].to_vec())
    }

    pub fn write(&mut self, address: u16, values: &[u16]) -> Result<(), u8> {
        let range = self.range(address, values.len())?;
        self.values[range.clone()].copy_from_slice(values);
        let written = |register: Register| {
            let address = usize::from(register.address());
            range.contains(&address).then(|| values[address - range.start])
        };
        if let Some(command) = written(Register::RemoteCommand) {
            let (status, inhibit) =
                if command == registers::POWER_ON { (0x02, 0x00) } else { (0x01, 0x01) };
            self.values[usize::from(Register::Status.address())] = status;
            self.values[usize::from(Register::Inhibit.address())] = inhibit;
        }
        if written(Register::Reset) == Some(registers::RESET_ERRORS) {
            let errors = usize::from(Register::ErrorE400.address());
            self.values[errors..errors + usize::from(registers::ERROR_COUNT)].fill(0);
        }
        Ok(())
    }

    fn answer(&mut self, incoming: Incoming) -> Response {
        let kind = match (self.failure, incoming.operation) {
            (Some(code), _) => Err(code),
            (None, Some(Operation::GetHoldings { address, count })) => {
                self.read(address, count).map(|values| ResponseKind::GetHoldings { values })
            }
            (None, Some(Operation::SetHolding { address, value })) => {
                self.write(address, &[value]).map(|()| ResponseKind::SetHolding { address, value })
            }
            (None, Some(Operation::SetHoldings { address, values })) => {
                let count = values.len() as u16;
                self.write(address, &values).map(|()| ResponseKind::SetHoldings { address, count })
            }
            (None, None) => Err(modbus::ILLEGAL_FUNCTION),
        };
        let kind = kind.unwrap_or_else(|code| {
            let function = incoming.function_code;
            debug!(message = "simulator answers with an exception", code, function);
            ResponseKind::Exception { function_code: incoming.function_code, code }
        });
        Response { device_id: incoming.device_id, transaction_id: incoming.transaction_id, kind }
    }
}

fn write_ascii(values: &mut [u16], register: Register, text: &str) {
    let start = usize::from(register.address());
    for (slot, byte) in values[start..].iter_mut().zip(text.bytes()) {
        *slot = u16::from(byte);
    }
}

/// A running simulator. Dropping it stops the server and closes all client connections.
pub struct Simulator {
    address: SocketAddr,
    registers: Arc<Mutex<RegisterBlock>>,
    #[allow(unused)] // exists for its drop handler
    server: AbortOnDropHandle<()>,
}

impl Simulator {
    /// Start a simulator on an ephemeral loopback port.
    pub async fn start() -> Result<Self, std::io::Error> {
        Self::bind("127.0.0.1:0").await
    }

    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let registers = Arc::new(Mutex::new(RegisterBlock::new()));
        let server = tokio::task::spawn(serve(listener, Arc::clone(&registers)));
        info!(message = "simulator listening", %address);
        Ok(Self { address, registers, server: AbortOnDropHandle::new(server) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Overwrite a register without triggering any side effects. Out of range addresses are
    /// ignored.
    pub fn set_register(&self, address: u16, value: u16) {
        let mut guard = self.registers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = guard.values.get_mut(usize::from(address)) {
            *slot = value;
        }
    }

    /// Answer every following request with exception `code`, or serve normally again with `None`.
    pub fn set_failure(&self, code: Option<u8>) {
        let mut guard = self.registers.lock().unwrap_or_else(|e| e.into_inner());
        guard.failure = code;
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        let guard = self.registers.lock().unwrap_or_else(|e| e.into_inner());
        guard.values.get(usize::from(address)).copied()
    }
}

async fn serve(listener: TcpListener, registers: Arc<Mutex<RegisterBlock>>) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(message = "simulator client connected", %peer);
                    clients.spawn(handle_client(socket, Arc::clone(&registers)));
                }
                Err(e) => {
                    {
                        let error = &e as &dyn std::error::Error;
                        warn!(message = "simulator could not accept", error);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = clients.join_next() => {}
        }
    }
}

async fn handle_client(socket: TcpStream, registers: Arc<Mutex<RegisterBlock>>) {
    let mut io = Framed::new(socket, ModbusServerCodec {});
    while let Some(incoming) = io.next().await {
        let incoming = match incoming {
            Ok(incoming) => incoming,
            Err(e) => {
                let error = &e as &dyn std::error::Error;
                debug!(message = "dropping simulator client", error);
                return;
            }
        };
        let response = {
            let mut guard = registers.lock().unwrap_or_else(|e| e.into_inner());
            guard.answer(incoming)
        };
        if let Err(e) = io.send(response).await {
            let error = &e as &dyn std::error::Error;
            debug!(message = "dropping simulator client", error);
            return;
        }
    }
    debug!("simulator client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_block() {
        let block = RegisterBlock::new();
        assert_eq!(block.read(0x1E, 1).unwrap(), [2]);
        assert_eq!(block.read(0x22, 3).unwrap(), [6, 7, 8]);
        assert_eq!(block.read(0x2F, 1).unwrap(), [19]);
        assert_eq!(block.read(0x30, 3).unwrap(), [1, 0, 1]);
        let info = block.read(0xC7, 23).unwrap();
        assert_eq!(registers::decode_ascii(&info[..14]), SOFTWARE_VERSION);
        assert_eq!(registers::decode_ascii(&info[14..]), SERIAL_NUMBER);
    }

    #[test]
    fn remote_command_drives_status() {
        let mut block = RegisterBlock::new();
        block.write(0x12B, &[registers::POWER_ON]).unwrap();
        assert_eq!(block.read(0x30, 3).unwrap(), [2, 0, 0]);
        block.write(0x12B, &[registers::POWER_OFF]).unwrap();
        assert_eq!(block.read(0x30, 3).unwrap(), [1, 0, 1]);
    }

    #[test]
    fn reset_clears_error_block() {
        let mut block = RegisterBlock::new();
        block.write(0x63, &[1, 2, 3]).unwrap();
        block.write(0x12D, &[0x1234]).unwrap();
        assert_eq!(block.read(0x63, 3).unwrap(), [1, 2, 3]);
        block.write(0x12D, &[registers::RESET_ERRORS]).unwrap();
        assert_eq!(block.read(0x63, 16).unwrap(), [0; 16]);
    }

    #[test]
    fn out_of_range() {
        let mut block = RegisterBlock::new();
        assert_eq!(block.read(339, 1).unwrap().len(), 1);
        assert_eq!(block.read(339, 2), Err(modbus::ILLEGAL_DATA_ADDRESS));
        assert_eq!(block.read(0, 0), Err(modbus::ILLEGAL_DATA_ADDRESS));
        assert_eq!(block.write(340, &[1]), Err(modbus::ILLEGAL_DATA_ADDRESS));
        assert_eq!(block.read(0, modbus::MAX_READ_COUNT).unwrap().len(), 125);
        assert_eq!(block.read(0, modbus::MAX_READ_COUNT + 1), Err(modbus::ILLEGAL_DATA_VALUE));
    }

    #[test]
    fn unsupported_function() {
        let mut block = RegisterBlock::new();
        let response = block.answer(Incoming {
            device_id: 1,
            transaction_id: 3,
            function_code: 0x04,
            operation: None,
        });
        assert_eq!(response.transaction_id, 3);
        assert_eq!(
            response.kind,
            ResponseKind::Exception { function_code: 0x04, code: modbus::ILLEGAL_FUNCTION }
        );
    }

    #[test]
    fn forced_failure() {
        let mut block = RegisterBlock::new();
        block.failure = Some(modbus::SERVER_FAILURE);
        let response = block.answer(Incoming {
            device_id: 1,
            transaction_id: 4,
            function_code: modbus::READ_HOLDINGS,
            operation: Some(Operation::GetHoldings { address: 0x30, count: 3 }),
        });
        assert_eq!(response.exception_code(), Some(modbus::SERVER_FAILURE));
        block.failure = None;
        assert_eq!(block.read(0x30, 3).unwrap(), [1, 0, 1]);
    }
}
