//! Modbus TCP framing.
//!
//! Only the holding register functions the compressor controller understands are implemented.
//! Both sides of the protocol live here: [`ModbusTCPCodec`] is used by the compressor connection
//! while [`ModbusServerCodec`] backs the built-in simulator.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest register count a "read holding registers" request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

pub const READ_HOLDINGS: u8 = 0x03;
pub const WRITE_HOLDING: u8 = 0x06;
pub const WRITE_HOLDINGS: u8 = 0x10;

pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const SERVER_FAILURE: u8 = 0x04;
pub const SERVER_BUSY: u8 = 0x06;

/// MBAP header bytes preceding the length-counted part of a frame.
const HEADER_LENGTH: usize = 6;
/// Largest accepted value of the MBAP length field: the unit id plus a 253 byte PDU.
const MAX_FRAME_LENGTH: u16 = 254;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => READ_HOLDINGS,
            Operation::SetHolding { .. } => WRITE_HOLDING,
            Operation::SetHoldings { .. } => WRITE_HOLDINGS,
        }
    }

    fn encode_pdu(&self, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.put_u8(self.function_code());
        match self {
            Operation::GetHoldings { address, count } => {
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
            Operation::SetHolding { address, value } => {
                dst.put_u16(*address);
                dst.put_u16(*value);
            }
            Operation::SetHoldings { address, values } => {
                let count = u16::try_from(values.len()).map_err(|_| too_long())?;
                let byte_count = u8::try_from(values.len() * 2).map_err(|_| too_long())?;
                dst.put_u16(*address);
                dst.put_u16(count);
                dst.put_u8(byte_count);
                for value in values {
                    dst.put_u16(*value);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception { code, .. } => Some(*code),
            ResponseKind::GetHoldings { .. }
            | ResponseKind::SetHolding { .. }
            | ResponseKind::SetHoldings { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// The server refused the request. `function_code` has the error bit cleared.
    Exception { function_code: u8, code: u8 },
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, count: u16 },
}

/// A request as seen by the server side.
///
/// `operation` is `None` for function codes this implementation does not serve; those are
/// answered with [`ILLEGAL_FUNCTION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub device_id: u8,
    pub transaction_id: u16,
    pub function_code: u8,
    pub operation: Option<Operation>,
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        ILLEGAL_FUNCTION => "illegal function",
        ILLEGAL_DATA_ADDRESS => "illegal data address",
        ILLEGAL_DATA_VALUE => "illegal data value",
        SERVER_FAILURE => "server device failure",
        0x05 => "acknowledge",
        SERVER_BUSY => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "too many registers for a single request")
}

fn need(pdu: &BytesMut, bytes: usize) -> Result<(), io::Error> {
    if pdu.len() < bytes {
        return Err(invalid_data(format!(
            "truncated PDU: needed {bytes} more bytes, have {}",
            pdu.len()
        )));
    }
    Ok(())
}

struct Frame {
    transaction_id: u16,
    device_id: u8,
    pdu: BytesMut,
}

/// Split a complete MBAP frame off the front of `src`.
fn take_frame(src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
    loop {
        trace!(message = "attempt at decoding", buffer = ?src);
        let Some(header) = src.first_chunk::<7>() else {
            return Ok(None);
        };
        let header = *header;
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol = u16::from_be_bytes([header[2], header[3]]);
        if protocol != 0 {
            src.advance(1);
            continue;
        }
        let length = u16::from_be_bytes([header[4], header[5]]);
        if !(2..=MAX_FRAME_LENGTH).contains(&length) {
            return Err(invalid_data(format!("invalid MBAP length {length}")));
        }
        let frame_length = HEADER_LENGTH + usize::from(length);
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }
        let mut pdu = src.split_to(frame_length);
        pdu.advance(HEADER_LENGTH + 1);
        return Ok(Some(Frame { transaction_id, device_id: header[6], pdu }));
    }
}

fn put_frame(dst: &mut BytesMut, transaction_id: u16, device_id: u8, pdu: &[u8]) {
    // The PDU of a single frame is bounded well below `u16::MAX` by the encoders above.
    let length = (pdu.len() + 1) as u16;
    dst.reserve(HEADER_LENGTH + usize::from(length));
    dst.put_u16(transaction_id);
    dst.put_u16(0);
    dst.put_u16(length);
    dst.put_u8(device_id);
    dst.extend_from_slice(pdu);
}

fn read_words(pdu: &BytesMut) -> Vec<u16> {
    pdu.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect()
}

/// Client side codec: encodes [`Request`]s and decodes [`Response`]s.
pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut pdu = BytesMut::with_capacity(8);
        req.operation.encode_pdu(&mut pdu)?;
        if pdu.len() >= usize::from(MAX_FRAME_LENGTH) {
            return Err(too_long());
        }
        put_frame(dst, req.transaction_id, req.device_id, &pdu);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(Frame { transaction_id, device_id, mut pdu }) = take_frame(src)? else {
            return Ok(None);
        };
        let function_code = pdu.get_u8();
        let kind = if function_code & 0x80 != 0 {
            need(&pdu, 1)?;
            ResponseKind::Exception { function_code: function_code & 0x7F, code: pdu.get_u8() }
        } else {
            match function_code {
                READ_HOLDINGS => {
                    need(&pdu, 1)?;
                    let byte_count = usize::from(pdu.get_u8());
                    if byte_count != pdu.len() || byte_count % 2 != 0 {
                        return Err(invalid_data(format!(
                            "read response announces {byte_count} bytes, carries {}",
                            pdu.len()
                        )));
                    }
                    ResponseKind::GetHoldings { values: read_words(&pdu) }
                }
                WRITE_HOLDING => {
                    need(&pdu, 4)?;
                    let address = pdu.get_u16();
                    let value = pdu.get_u16();
                    ResponseKind::SetHolding { address, value }
                }
                WRITE_HOLDINGS => {
                    need(&pdu, 4)?;
                    let address = pdu.get_u16();
                    let count = pdu.get_u16();
                    ResponseKind::SetHoldings { address, count }
                }
                other => {
                    return Err(invalid_data(format!("unexpected function code {other:#04x}")));
                }
            }
        };
        Ok(Some(Response { device_id, transaction_id, kind }))
    }
}

/// Server side codec: decodes [`Incoming`] requests and encodes [`Response`]s.
pub struct ModbusServerCodec {}

impl Decoder for ModbusServerCodec {
    type Item = Incoming;
    type Error = io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(Frame { transaction_id, device_id, mut pdu }) = take_frame(src)? else {
            return Ok(None);
        };
        let function_code = pdu.get_u8();
        let operation = match function_code {
            READ_HOLDINGS => {
                need(&pdu, 4)?;
                let address = pdu.get_u16();
                let count = pdu.get_u16();
                Some(Operation::GetHoldings { address, count })
            }
            WRITE_HOLDING => {
                need(&pdu, 4)?;
                let address = pdu.get_u16();
                let value = pdu.get_u16();
                Some(Operation::SetHolding { address, value })
            }
            WRITE_HOLDINGS => {
                need(&pdu, 5)?;
                let address = pdu.get_u16();
                let count = pdu.get_u16();
                let byte_count = usize::from(pdu.get_u8());
                if byte_count != usize::from(count) * 2 || byte_count != pdu.len() {
                    return Err(invalid_data(format!(
                        "write of {count} registers carries {} bytes",
                        pdu.len()
                    )));
                }
                Some(Operation::SetHoldings { address, values: read_words(&pdu) })
            }
            _ => None,
        };
        Ok(Some(Incoming { device_id, transaction_id, function_code, operation }))
    }
}

impl Encoder<Response> for ModbusServerCodec {
    type Error = io::Error;
    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut pdu = BytesMut::with_capacity(8);
        match &response.kind {
            ResponseKind::Exception { function_code, code } => {
                pdu.put_u8(function_code | 0x80);
                pdu.put_u8(*code);
            }
            ResponseKind::GetHoldings { values } => {
                let byte_count = u8::try_from(values.len() * 2).map_err(|_| too_long())?;
                pdu.put_u8(READ_HOLDINGS);
                pdu.put_u8(byte_count);
                for value in values {
                    pdu.put_u16(*value);
                }
            }
            ResponseKind::SetHolding { address, value } => {
                pdu.put_u8(WRITE_HOLDING);
                pdu.put_u16(*address);
                pdu.put_u16(*value);
            }
            ResponseKind::SetHoldings { address, count } => {
                pdu.put_u8(WRITE_HOLDINGS);
                pdu.put_u16(*address);
                pdu.put_u16(*count);
            }
        }
        put_frame(dst, response.transaction_id, response.device_id, &pdu);
        Ok(())
    }
}
