//! Demo command encoding spoken between the virtual fleet and its agents
//!
//! One opcode byte followed by opaque arguments. The dispatch core never
//! looks at these bytes; only the simulated agents decode them.

use bytes::{BufMut, Bytes, BytesMut};
use fleetlink_shared::{CommandPayload, CorrelationKey, ExchangeClass};

/// Commands understood by a virtual agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    StatusRequest = 1,
    Arm = 2,
    Takeoff = 3,
    Land = 4,
    ReturnToHome = 5,
    ParamSet = 6,
    FileChunk = 7,
    Sleep = 8,
    Wake = 9,
    /// Light effect; no reply expected
    Led = 10,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Opcode::StatusRequest,
            2 => Opcode::Arm,
            3 => Opcode::Takeoff,
            4 => Opcode::Land,
            5 => Opcode::ReturnToHome,
            6 => Opcode::ParamSet,
            7 => Opcode::FileChunk,
            8 => Opcode::Sleep,
            9 => Opcode::Wake,
            10 => Opcode::Led,
            _ => return None,
        })
    }

    /// Exchange class the core uses for timeout estimation
    pub fn class(self) -> ExchangeClass {
        match self {
            Opcode::ParamSet => ExchangeClass::Parameter,
            Opcode::FileChunk => ExchangeClass::FileTransfer,
            _ => ExchangeClass::Command,
        }
    }

    pub fn expects_reply(self) -> bool {
        !matches!(self, Opcode::Led)
    }
}

/// Encode an opcode and its arguments
pub fn encode(opcode: Opcode, args: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + args.len());
    buf.put_u8(opcode as u8);
    buf.put_slice(args);
    buf.freeze()
}

/// Split a frame body into opcode and arguments
pub fn decode(body: &Bytes) -> Option<(Opcode, Bytes)> {
    let opcode = Opcode::from_byte(*body.first()?)?;
    Some((opcode, body.slice(1..)))
}

/// Build a command payload; the key is ignored for opcodes without replies
pub fn command(opcode: Opcode, key: CorrelationKey, args: &[u8]) -> CommandPayload {
    let body = encode(opcode, args);
    let payload = if opcode.expects_reply() {
        CommandPayload::expecting_reply(body, key)
    } else {
        CommandPayload::fire_and_forget(body)
    };
    payload.with_class(opcode.class())
}
