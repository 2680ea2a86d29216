//! Client-visible result kinds and server-NAK translation (spec §3, §4.6.8).

use crate::protocol::{ENOENT, PayloadHeader, ServerResultCode};

/// Outcome delivered to a terminal callback, or `Next` for in-progress
/// streaming callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResult {
    Success,
    Next,
    Timeout,
    Busy,
    FileIoError,
    FileExists,
    FileDoesNotExist,
    FileProtected,
    InvalidParameter,
    Unsupported,
    ProtocolError,
    NoSystem,
    Unknown,
}

/// Translate a server result code into a client result kind (spec §4.6.8).
pub fn translate(code: ServerResultCode) -> ClientResult {
    use ClientResult as C;
    use ServerResultCode as S;
    match code {
        S::Success => C::Success,
        S::Timeout => C::Timeout,
        S::FileIoError => C::FileIoError,
        S::FileExists => C::FileExists,
        S::FileProtected => C::FileProtected,
        S::UnknownCommand => C::Unsupported,
        S::FileDoesNotExist => C::FileDoesNotExist,
        S::Fail
        | S::FailErrno
        | S::InvalidDataSize
        | S::InvalidSession
        | S::NoSessionsAvailable
        | S::Eof => C::ProtocolError,
    }
}

/// Decode the NAK result code from a response frame, applying the
/// `FAIL_ERRNO`/`ENOENT` special case (spec §4.6.8): a failure carrying
/// `errno == ENOENT` is reported as a missing file rather than a generic
/// failure.
pub fn decode_nak(frame: &PayloadHeader) -> ClientResult {
    let data = frame.data_slice();
    let Some(raw_code) = data.first().copied() else {
        return ClientResult::ProtocolError;
    };
    let Some(code) = ServerResultCode::from_u8(raw_code) else {
        return ClientResult::ProtocolError;
    };

    if code == ServerResultCode::FailErrno
        && data.get(1).copied() == Some(ENOENT)
    {
        return ClientResult::FileDoesNotExist;
    }

    translate(code)
}

/// `true` if the NAK's result code is `EOF` — the list-directory success
/// terminator (spec §4.6.6).
pub fn is_eof(frame: &PayloadHeader) -> bool {
    frame.data_slice().first().copied() == Some(ServerResultCode::Eof as u8)
}
