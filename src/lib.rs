//! Client-side state machine for the MAVLink FTP file-transfer protocol.
//!
//! This crate owns the request/response engine: framing FTP payloads,
//! tracking one in-flight work item at a time, retransmitting on timeout,
//! and translating server results into a small outcome enum. It does not
//! open sockets or speak MAVLink itself — see [`FtpTransport`] for the
//! seam callers implement to plug in their own messaging runtime.

mod client;
mod config;
mod io;
mod protocol;
mod result;
mod timer;
mod transport;
mod work;

pub use client::FtpClient;
pub use config::{ClientConfig, debugging_enabled};
pub use protocol::{ENOENT, FRAME_LEN, MAX_DATA_LENGTH, Opcode, PayloadHeader, ServerResultCode};
pub use result::ClientResult;
pub use transport::{FtpTransport, InboundFrame, OutboundFrame, TargetRouting};
pub use work::ProgressData;
