//! Somfy RTS frames as understood by culfw's `Ys` command.
//!
//! Payload layout (hex digits): `A K C X RRRR SSSSSS`
//!
//! * `A`      - fixed high nibble of the key byte
//! * `K`      - encryption key counter (4 bit)
//! * `C`      - command nibble
//! * `X`      - checksum nibble
//! * `RRRR`   - rolling code
//! * `SSSSSS` - address (remote channel), sent exactly as stored

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::FrameError;

/// Command prefix culfw uses for Somfy RTS.
pub const SOMFY_TAG: &str = "Ys";

const PAYLOAD_LEN: usize = 14;
const CHECKSUM_POS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SomfyCommand {
    My,
    Up,
    MyUp,
    Down,
    MyDown,
    UpDown,
    MyUpDown,
    Prog,
    EnableSun,
    DisableSun,
}

impl SomfyCommand {
    pub fn opcode(self) -> u8 {
        match self {
            SomfyCommand::My => 0x1,
            SomfyCommand::Up => 0x2,
            SomfyCommand::MyUp => 0x3,
            SomfyCommand::Down => 0x4,
            SomfyCommand::MyDown => 0x5,
            SomfyCommand::UpDown => 0x6,
            SomfyCommand::MyUpDown => 0x7,
            SomfyCommand::Prog => 0x8,
            SomfyCommand::EnableSun => 0x9,
            SomfyCommand::DisableSun => 0xA,
        }
    }

    pub fn from_opcode(op: u8) -> Option<Self> {
        Some(match op {
            0x1 => SomfyCommand::My,
            0x2 => SomfyCommand::Up,
            0x3 => SomfyCommand::MyUp,
            0x4 => SomfyCommand::Down,
            0x5 => SomfyCommand::MyDown,
            0x6 => SomfyCommand::UpDown,
            0x7 => SomfyCommand::MyUpDown,
            0x8 => SomfyCommand::Prog,
            0x9 => SomfyCommand::EnableSun,
            0xA => SomfyCommand::DisableSun,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            SomfyCommand::My => "my",
            SomfyCommand::Up => "up",
            SomfyCommand::MyUp => "my-up",
            SomfyCommand::Down => "down",
            SomfyCommand::MyDown => "my-down",
            SomfyCommand::UpDown => "up-down",
            SomfyCommand::MyUpDown => "my-up-down",
            SomfyCommand::Prog => "prog",
            SomfyCommand::EnableSun => "enable-sun",
            SomfyCommand::DisableSun => "disable-sun",
        }
    }

    /// `up`/`down` start a motor run; everything else is a stop, pairing or sensor toggle.
    pub fn is_motion(self) -> bool {
        matches!(self, SomfyCommand::Up | SomfyCommand::Down)
    }
}

impl fmt::Display for SomfyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SomfyCommand {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "my" | "stop" => SomfyCommand::My,
            "up" => SomfyCommand::Up,
            "my-up" | "up+my" => SomfyCommand::MyUp,
            "down" => SomfyCommand::Down,
            "my-down" | "down+my" => SomfyCommand::MyDown,
            "up-down" | "up+down" => SomfyCommand::UpDown,
            "my-up-down" => SomfyCommand::MyUpDown,
            "prog" => SomfyCommand::Prog,
            "enable-sun" | "wind-sun" => SomfyCommand::EnableSun,
            "disable-sun" | "wind-only" => SomfyCommand::DisableSun,
            other => return Err(FrameError::UnsupportedCommand(other.to_string())),
        })
    }
}

/// How the stored address is laid out on the wire.
///
/// Records paired with existing receivers were created with the address in the
/// order it was typed, not the byte-swapped order of the RTS spec. Switching to
/// `Swapped` changes the channel the receiver sees and requires re-pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressOrder {
    #[default]
    AsConfigured,
    Swapped,
}

/// Validates a 3-byte address given as 6 hex characters.
pub fn validate_address(address: &str) -> Result<(), FrameError> {
    if address.len() != 6 || hex::decode(address).is_err() {
        return Err(FrameError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn wire_address(address: &str, order: AddressOrder) -> String {
    match order {
        AddressOrder::AsConfigured => address.to_string(),
        AddressOrder::Swapped => {
            let (a, rest) = address.split_at(2);
            let (b, c) = rest.split_at(2);
            format!("{c}{b}{a}")
        }
    }
}

/// XOR of every byte with its own high nibble, folded to 4 bits.
///
/// Run over the payload characters with the checksum digit set to `0`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc ^ b ^ (b >> 4)) & 0x0F
}

/// Builds the `Ys...` line for one transmission. Does not touch any counter.
pub fn encode(
    command: SomfyCommand,
    enc_key: u8,
    rolling_code: u16,
    address: &str,
    order: AddressOrder,
) -> Result<Bytes, FrameError> {
    validate_address(address)?;
    let mut payload = format!(
        "A{:01X}{:01X}0{:04X}{}",
        enc_key & 0x0F,
        command.opcode(),
        rolling_code,
        wire_address(address, order),
    )
    .into_bytes();
    debug_assert_eq!(payload.len(), PAYLOAD_LEN);

    let cks = checksum(&payload);
    payload[CHECKSUM_POS] = hex_digit(cks);

    let mut line = Vec::with_capacity(SOMFY_TAG.len() + PAYLOAD_LEN + 1);
    line.extend_from_slice(SOMFY_TAG.as_bytes());
    line.extend_from_slice(&payload);
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn hex_digit(n: u8) -> u8 {
    b"0123456789ABCDEF"[(n & 0x0F) as usize]
}

/// Header fields of a received (or echoed) Somfy line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfFrame {
    pub enc_key: u8,
    pub opcode: u8,
    pub command: Option<SomfyCommand>,
    pub checksum: u8,
    pub checksum_ok: bool,
    pub rolling_code: u16,
    pub address: String,
}

/// Parses `YsA...` lines; anything after the 14 payload characters (RSSI etc.) is ignored.
pub fn parse(line: &str) -> Result<RfFrame, FrameError> {
    let malformed = |reason| FrameError::Malformed { line: line.to_string(), reason };

    let body = line.trim().strip_prefix(SOMFY_TAG).ok_or_else(|| malformed("missing Ys tag"))?;
    let payload = body.get(..PAYLOAD_LEN).ok_or_else(|| malformed("short payload"))?;
    if !payload.starts_with('A') {
        return Err(malformed("key byte does not start with A"));
    }
    if !payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed("non-hex payload"));
    }

    let nibble = |i: usize| u8::from_str_radix(&payload[i..i + 1], 16).map_err(|_| malformed("bad nibble"));
    let enc_key = nibble(1)?;
    let opcode = nibble(2)?;
    let cks = nibble(CHECKSUM_POS)?;
    let rolling_code = u16::from_str_radix(&payload[4..8], 16).map_err(|_| malformed("bad rolling code"))?;
    let address = payload[8..14].to_string();

    let mut zeroed = payload.as_bytes().to_vec();
    zeroed[CHECKSUM_POS] = b'0';

    Ok(RfFrame {
        enc_key,
        opcode,
        command: SomfyCommand::from_opcode(opcode),
        checksum: cks,
        checksum_ok: checksum(&zeroed) == cks,
        rolling_code,
        address,
    })
}
