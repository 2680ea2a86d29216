//! Wire format for the FTP frame carried inside the outer carrier message's
//! opaque payload (spec §3, §6).

use anyhow::{Result, anyhow};

/// Maximum inline data bytes per frame.
pub const MAX_DATA_LENGTH: usize = 239;

/// Header bytes preceding `data` (`seq_number`..`offset` inclusive).
const HEADER_LEN: usize = 12;

/// Total wire size of an FTP frame: header + the full data region.
pub const FRAME_LEN: usize = HEADER_LEN + MAX_DATA_LENGTH;

/// Request/response opcodes, bit-exact with the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    None = 0,
    TerminateSession = 1,
    ResetSessions = 2,
    ListDirectory = 3,
    OpenFileRo = 4,
    ReadFile = 5,
    CreateFile = 6,
    WriteFile = 7,
    RemoveFile = 8,
    CreateDirectory = 9,
    RemoveDirectory = 10,
    OpenFileWo = 11,
    TruncateFile = 12,
    Rename = 13,
    CalcFileCrc32 = 14,
    BurstReadFile = 15,
    RspAck = 128,
    RspNak = 129,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0 => None,
            1 => TerminateSession,
            2 => ResetSessions,
            3 => ListDirectory,
            4 => OpenFileRo,
            5 => ReadFile,
            6 => CreateFile,
            7 => WriteFile,
            8 => RemoveFile,
            9 => CreateDirectory,
            10 => RemoveDirectory,
            11 => OpenFileWo,
            12 => TruncateFile,
            13 => Rename,
            14 => CalcFileCrc32,
            15 => BurstReadFile,
            128 => RspAck,
            129 => RspNak,
            _ => return Option::None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Server-side result codes, found in `data[0]` of a NAK frame (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerResultCode {
    Success = 0,
    Fail = 1,
    FailErrno = 2,
    InvalidDataSize = 3,
    InvalidSession = 4,
    NoSessionsAvailable = 5,
    Eof = 6,
    UnknownCommand = 7,
    FileExists = 8,
    FileProtected = 9,
    FileDoesNotExist = 10,
    Timeout = 200,
    FileIoError = 201,
}

impl ServerResultCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ServerResultCode::*;
        Some(match v {
            0 => Success,
            1 => Fail,
            2 => FailErrno,
            3 => InvalidDataSize,
            4 => InvalidSession,
            5 => NoSessionsAvailable,
            6 => Eof,
            7 => UnknownCommand,
            8 => FileExists,
            9 => FileProtected,
            10 => FileDoesNotExist,
            200 => Timeout,
            201 => FileIoError,
            _ => return None,
        })
    }
}

/// `ENOENT`, used to special-case `FailErrno` NAKs (spec §4.6.8).
pub const ENOENT: u8 = 2;

/// The fixed-layout FTP payload header plus its inline data (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub seq_number: u16,
    pub session: u8,
    pub opcode: u8,
    pub size: u8,
    pub req_opcode: u8,
    pub burst_complete: u8,
    pub padding: u8,
    pub offset: u32,
    pub data: [u8; MAX_DATA_LENGTH],
}

impl Default for PayloadHeader {
    fn default() -> Self {
        PayloadHeader {
            seq_number: 0,
            session: 0,
            opcode: 0,
            size: 0,
            req_opcode: 0,
            burst_complete: 0,
            padding: 0,
            offset: 0,
            data: [0u8; MAX_DATA_LENGTH],
        }
    }
}

impl PayloadHeader {
    /// The meaningful prefix of `data`, per `size`.
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Write `bytes` into `data`, set `size`, and return `self` for chaining.
    pub fn with_data(mut self, bytes: &[u8]) -> Self {
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len() as u8;
        self
    }

    /// Serialize into a fresh `FRAME_LEN`-byte buffer for handoff to the
    /// carrier message's opaque payload field.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..2].copy_from_slice(&self.seq_number.to_le_bytes());
        buf[2] = self.session;
        buf[3] = self.opcode;
        buf[4] = self.size;
        buf[5] = self.req_opcode;
        buf[6] = self.burst_complete;
        buf[7] = self.padding;
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..].copy_from_slice(&self.data);
        buf
    }

    /// Decode a frame. Rejects (with an error, logged by the caller as a
    /// warning) any frame whose `size` exceeds `MAX_DATA_LENGTH` (spec §4.1).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(anyhow!("frame too short: {} bytes", buf.len()));
        }
        let seq_number = u16::from_le_bytes([buf[0], buf[1]]);
        let session = buf[2];
        let opcode = buf[3];
        let size = buf[4];
        let req_opcode = buf[5];
        let burst_complete = buf[6];
        let padding = buf[7];
        let offset = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if size as usize > MAX_DATA_LENGTH {
            return Err(anyhow!(
                "frame data size {size} exceeds MAX_DATA_LENGTH ({MAX_DATA_LENGTH})"
            ));
        }

        let mut data = [0u8; MAX_DATA_LENGTH];
        let available = &buf[HEADER_LEN..];
        let take = available.len().min(MAX_DATA_LENGTH);
        data[..take].copy_from_slice(&available[..take]);

        Ok(PayloadHeader {
            seq_number,
            session,
            opcode,
            size,
            req_opcode,
            burst_complete,
            padding,
            offset,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header() {
        let hdr = PayloadHeader {
            seq_number: 42,
            session: 3,
            opcode: Opcode::ReadFile.as_u8(),
            req_opcode: 0,
            offset: 1024,
            ..Default::default()
        }
        .with_data(b"hello");

        let bytes = hdr.to_bytes();
        let parsed = PayloadHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.data_slice(), b"hello");
    }

    #[test]
    fn rejects_oversize_frame() {
        let mut buf = [0u8; FRAME_LEN];
        buf[4] = (MAX_DATA_LENGTH + 1) as u8;
        assert!(PayloadHeader::from_bytes(&buf).is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(PayloadHeader::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn opcode_round_trip() {
        for raw in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 128, 129] {
            let op = Opcode::from_u8(raw).expect("known opcode");
            assert_eq!(op.as_u8(), raw);
        }
        assert!(Opcode::from_u8(99).is_none());
    }
}
