// Feetech STS3215 serial protocol, position mode
//
// Dynamixel 1.0 style framing: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status replies carry an error byte in place of the instruction.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// One revolution is 4096 steps; goal positions live in 0..=4095
pub const STEPS_PER_REV: u16 = 4096;
pub const MAX_POSITION: u16 = STEPS_PER_REV - 1;

const HEADER: [u8; 2] = [0xFF, 0xFF];
const BROADCAST_ID: u8 = 0xFE;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncWrite = 0x83,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    OperatingMode = 33,   // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step
    TorqueEnable = 40,    // 1 byte: 0=off, 1=on
    GoalPosition = 42,    // 2 bytes, 0..=4095
    Lock = 55,            // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56, // 2 bytes, read-only
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    Step = 3,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Feetech servo bus, one serial port shared by all six leg servos
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

/// Checksum over everything after the header
fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| u16::from(b)).sum();
    (!sum & 0xFF) as u8
}

fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    // Length counts instruction + params + checksum
    let length = (params.len() + 2) as u8;
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.extend_from_slice(&[id, length, instruction as u8]);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// Validate a status packet body (`error, params..., checksum`) and return its params
fn parse_status(expected_id: u8, id: u8, body: &[u8]) -> Result<Vec<u8>> {
    if id != expected_id {
        return Err(FeetechError::InvalidResponse {
            id: expected_id,
            reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
        });
    }
    let Some((&received, rest)) = body.split_last() else {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: "Empty status packet".to_string(),
        });
    };
    let Some((&status, params)) = rest.split_first() else {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: "Status packet without error byte".to_string(),
        });
    };

    let mut covered = vec![id, body.len() as u8];
    covered.extend_from_slice(rest);
    if checksum(&covered) != received {
        return Err(FeetechError::ChecksumMismatch { id });
    }
    if status != 0 {
        return Err(FeetechError::MotorError { id, status });
    }
    Ok(params.to_vec())
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, id: u8, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id }
            } else {
                FeetechError::Io(e)
            }
        })
    }

    fn read_status(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; 4];
        self.read_exact(expected_id, &mut head)?;
        if head[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &head[..2]),
            });
        }
        let mut body = vec![0u8; usize::from(head[3])];
        self.read_exact(expected_id, &mut body)?;
        parse_status(expected_id, head[2], &body)
    }

    /// Send one addressed instruction and wait for its status packet
    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        self.send_packet(&build_packet(id, instruction, params))?;
        self.read_status(id)
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, id: u8, register: Register, data: &[u8]) -> Result<()> {
        debug!("Write to servo {}: reg={:?}, data={:?}", id, register, data);
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(register as u8);
        params.extend_from_slice(data);
        self.transact(id, Instruction::Write, &params).map(drop)
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        self.write(id, register, &[value])
    }

    /// Little-endian
    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        self.write(id, register, &value.to_le_bytes())
    }

    fn read(&mut self, id: u8, register: Register, len: u8) -> Result<Vec<u8>> {
        let response = self.transact(id, Instruction::Read, &[register as u8, len])?;
        if response.len() < usize::from(len) {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", len, response.len()),
            });
        }
        Ok(response)
    }

    pub fn read_u8(&mut self, id: u8, register: Register) -> Result<u8> {
        Ok(self.read(id, register, 1)?[0])
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let bytes = self.read(id, register, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Same 2-byte register on many servos in one broadcast packet; no status reply
    pub fn sync_write_u16(&mut self, register: Register, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        // [start_addr, bytes_per_servo, id1, lo1, hi1, id2, lo2, hi2, ...]
        let mut params = vec![register as u8, 2];
        for &(id, value) in data {
            params.push(id);
            params.extend_from_slice(&value.to_le_bytes());
        }
        debug!("Sync write to {} servos: reg={:?}", data.len(), register);
        self.send_packet(&build_packet(BROADCAST_ID, Instruction::SyncWrite, &params))
    }

    /// Torque and the EEPROM lock move together
    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Torque must be off
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    /// Present position in raw steps
    pub fn get_position(&mut self, id: u8) -> Result<u16> {
        self.read_u16(id, Register::PresentPosition)
    }
}
