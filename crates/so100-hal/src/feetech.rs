//! Feetech (STS/SCS protocol 0) servo bus codec.
//!
//! Instruction packet:
//!
//! ```text
//! 0xFF 0xFF  id  len  instr  params…  checksum
//! ```
//!
//! `len = params.len() + 2`; `checksum = !(id + len + instr + Σparams)`
//! truncated to one byte. Status packets have the same framing with the
//! servo's error byte in place of `instr`.

use thiserror::Error;

use crate::transport::{Transport, TransportError};

pub const HEADER: [u8; 2] = [0xFF, 0xFF];
pub const BROADCAST_ID: u8 = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_SYNC_WRITE: u8 = 0x83;

pub const REG_TORQUE_ENABLE: u8 = 40;
pub const REG_GOAL_POSITION: u8 = 42;
pub const REG_PRESENT_POSITION: u8 = 56;

/// Encoder steps per revolution on the STS3215.
pub const STEPS_PER_REV: u16 = 4096;
const CENTER_STEP: f64 = 2048.0;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bad status header {0:02X?}")]
    BadHeader([u8; 2]),

    #[error("status from servo {got}, expected {expected}")]
    IdMismatch { expected: u8, got: u8 },

    #[error("checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    Checksum { expected: u8, got: u8 },

    #[error("status length {0} too short")]
    BadLength(u8),

    #[error("servo {id} reported error flags {flags:#04x}")]
    ServoStatus { id: u8, flags: u8 },
}

fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode one instruction packet.
pub fn encode(id: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    let len = (params.len() + 2) as u8;
    let mut packet = Vec::with_capacity(params.len() + 6);
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(len);
    packet.push(instruction);
    packet.extend_from_slice(params);
    let sum = checksum(&packet[2..]);
    packet.push(sum);
    packet
}

/// Encoder steps → degrees from centre.
pub fn steps_to_degrees(raw: u16) -> f64 {
    (raw as f64 - CENTER_STEP) * 360.0 / STEPS_PER_REV as f64
}

/// Degrees from centre → encoder steps, clamped to the valid range.
pub fn degrees_to_steps(degrees: f64) -> u16 {
    let raw = (degrees * STEPS_PER_REV as f64 / 360.0 + CENTER_STEP).round();
    raw.clamp(0.0, (STEPS_PER_REV - 1) as f64) as u16
}

/// Request/response access to the servos on one bus.
pub struct ServoBus<T: Transport> {
    transport: T,
}

impl<T: Transport> ServoBus<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn ping(&mut self, id: u8) -> Result<(), PacketError> {
        self.request(id, INST_PING, &[]).map(|_| ())
    }

    pub fn read_position(&mut self, id: u8) -> Result<u16, PacketError> {
        let params = self.request(id, INST_READ, &[REG_PRESENT_POSITION, 2])?;
        match params.as_slice() {
            [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(PacketError::BadLength(params.len() as u8 + 2)),
        }
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<(), PacketError> {
        self.request(id, INST_WRITE, &[REG_TORQUE_ENABLE, u8::from(enabled)])
            .map(|_| ())
    }

    /// Write goal positions to several servos in one broadcast packet. No
    /// status packet is returned.
    pub fn sync_write_positions(&mut self, goals: &[(u8, u16)]) -> Result<(), PacketError> {
        if goals.is_empty() {
            return Ok(());
        }
        let mut params = vec![REG_GOAL_POSITION, 2];
        for (id, steps) in goals {
            params.push(*id);
            params.extend_from_slice(&steps.to_le_bytes());
        }
        self.transport
            .write_all(&encode(BROADCAST_ID, INST_SYNC_WRITE, &params))?;
        Ok(())
    }

    fn request(&mut self, id: u8, instruction: u8, params: &[u8]) -> Result<Vec<u8>, PacketError> {
        self.transport.clear_input()?;
        self.transport.write_all(&encode(id, instruction, params))?;
        self.read_status(id)
    }

    fn read_status(&mut self, expected: u8) -> Result<Vec<u8>, PacketError> {
        let mut head = [0u8; 4];
        self.transport.read_exact(&mut head)?;
        if head[..2] != HEADER {
            return Err(PacketError::BadHeader([head[0], head[1]]));
        }
        let (id, len) = (head[2], head[3]);
        if id != expected {
            return Err(PacketError::IdMismatch { expected, got: id });
        }
        if len < 2 {
            return Err(PacketError::BadLength(len));
        }

        let mut rest = vec![0u8; len as usize];
        self.transport.read_exact(&mut rest)?;
        let got = rest[rest.len() - 1];
        let mut body = vec![id, len];
        body.extend_from_slice(&rest[..rest.len() - 1]);
        let expected_sum = checksum(&body);
        if got != expected_sum {
            return Err(PacketError::Checksum {
                expected: expected_sum,
                got,
            });
        }

        let flags = rest[0];
        if flags != 0 {
            return Err(PacketError::ServoStatus { id, flags });
        }
        Ok(rest[1..rest.len() - 1].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Records every write and serves reads from a scripted byte queue.
    #[derive(Default)]
    struct ScriptedTransport {
        written: Vec<Vec<u8>>,
        replies: VecDeque<u8>,
    }

    impl ScriptedTransport {
        fn replying(bytes: &[u8]) -> Self {
            Self {
                written: Vec::new(),
                replies: bytes.iter().copied().collect(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.push(data.to_vec());
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
            let total = buf.len();
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = self
                    .replies
                    .pop_front()
                    .ok_or(TransportError::ShortRead(i, total))?;
            }
            Ok(())
        }
    }

    fn status(id: u8, flags: u8, params: &[u8]) -> Vec<u8> {
        // A status packet is framed exactly like an instruction packet.
        encode(id, flags, params)
    }

    #[test]
    fn ping_packet_matches_known_bytes() {
        assert_eq!(encode(1, INST_PING, &[]), vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn read_position_decodes_little_endian() {
        let reply = status(3, 0, &[0x00, 0x08]);
        let mut bus = ServoBus::new(ScriptedTransport::replying(&reply));
        assert_eq!(bus.read_position(3).unwrap(), 2048);
        assert_eq!(
            bus.transport.written[0],
            encode(3, INST_READ, &[REG_PRESENT_POSITION, 2])
        );
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut reply = status(1, 0, &[]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let mut bus = ServoBus::new(ScriptedTransport::replying(&reply));
        assert!(matches!(bus.ping(1), Err(PacketError::Checksum { .. })));
    }

    #[test]
    fn reply_from_wrong_servo_is_rejected() {
        let reply = status(2, 0, &[]);
        let mut bus = ServoBus::new(ScriptedTransport::replying(&reply));
        assert!(matches!(
            bus.ping(1),
            Err(PacketError::IdMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn servo_error_flags_surface() {
        let reply = status(1, 0x20, &[]);
        let mut bus = ServoBus::new(ScriptedTransport::replying(&reply));
        assert!(matches!(
            bus.set_torque(1, true),
            Err(PacketError::ServoStatus { id: 1, flags: 0x20 })
        ));
    }

    #[test]
    fn silent_servo_is_a_short_read() {
        let mut bus = ServoBus::new(ScriptedTransport::default());
        assert!(matches!(
            bus.ping(4),
            Err(PacketError::Transport(TransportError::ShortRead(0, 4)))
        ));
    }

    #[test]
    fn sync_write_packs_every_goal_without_reading() {
        let mut bus = ServoBus::new(ScriptedTransport::default());
        bus.sync_write_positions(&[(1, 0x0100), (2, 0x0FFF)]).unwrap();
        let packet = &bus.transport.written[0];
        assert_eq!(packet[2], BROADCAST_ID);
        assert_eq!(packet[4], INST_SYNC_WRITE);
        assert_eq!(&packet[5..packet.len() - 1], &[REG_GOAL_POSITION, 2, 1, 0x00, 0x01, 2, 0xFF, 0x0F]);
    }

    #[test]
    fn degree_conversion_is_centred_and_clamped() {
        assert_eq!(steps_to_degrees(2048), 0.0);
        assert_eq!(degrees_to_steps(0.0), 2048);
        assert_eq!(degrees_to_steps(90.0), 3072);
        assert_eq!(degrees_to_steps(720.0), 4095);
        assert_eq!(degrees_to_steps(-720.0), 0);
    }
}
