//! Work item model: one tagged variant per user-initiated operation, plus
//! the envelope the request engine actually drives (spec §3, §4.4).

use std::fs::File;
use std::path::PathBuf;

use crate::config::RETRIES;
use crate::protocol::PayloadHeader;
use crate::result::ClientResult;

/// Progress snapshot delivered with `Next` callbacks during a streaming
/// transfer (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressData {
    pub bytes_transferred: u32,
    pub total_bytes: u32,
}

pub type ProgressCallback = Box<dyn FnMut(ClientResult, ProgressData) + Send>;
pub type SimpleCallback = Box<dyn FnMut(ClientResult) + Send>;
pub type CompareCallback = Box<dyn FnMut(ClientResult, bool) + Send>;
pub type ListCallback = Box<dyn FnMut(ClientResult, Vec<String>) + Send>;

pub struct DownloadState {
    pub remote_path: String,
    pub local_folder: PathBuf,
    pub local_path: PathBuf,
    pub stream: Option<File>,
    pub file_size: u32,
    pub bytes_transferred: u32,
    pub last_progress_percentage: u8,
    pub callback: ProgressCallback,
}

pub struct UploadState {
    pub local_path: PathBuf,
    pub remote_folder: String,
    pub remote_path: String,
    pub stream: Option<File>,
    pub file_size: u32,
    pub bytes_transferred: u32,
    pub callback: ProgressCallback,
}

pub struct RemoveState {
    pub path: String,
    pub callback: SimpleCallback,
}

pub struct RenameState {
    pub from_path: String,
    pub to_path: String,
    pub callback: SimpleCallback,
}

pub struct CreateDirState {
    pub path: String,
    pub callback: SimpleCallback,
}

pub struct RemoveDirState {
    pub path: String,
    pub callback: SimpleCallback,
}

pub struct CompareFilesState {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub local_crc: Option<u32>,
    pub callback: CompareCallback,
}

pub struct ListDirState {
    pub path: String,
    pub offset: u32,
    pub entries: Vec<String>,
    pub callback: ListCallback,
}

/// One variant per user-initiated operation (spec §3 "Work item").
pub enum WorkItem {
    Download(DownloadState),
    Upload(UploadState),
    Remove(RemoveState),
    Rename(RenameState),
    CreateDir(CreateDirState),
    RemoveDir(RemoveDirState),
    CompareFiles(CompareFilesState),
    ListDir(ListDirState),
}

impl WorkItem {
    /// Deliver the variant's terminal callback exactly once, with streaming
    /// variants reporting `ProgressData` built from their running totals
    /// (spec invariant 4).
    pub fn deliver_terminal(&mut self, result: ClientResult) {
        match self {
            WorkItem::Download(s) => {
                let progress = ProgressData {
                    bytes_transferred: s.bytes_transferred,
                    total_bytes: s.file_size,
                };
                (s.callback)(result, progress);
            }
            WorkItem::Upload(s) => {
                let progress = ProgressData {
                    bytes_transferred: s.bytes_transferred,
                    total_bytes: s.file_size,
                };
                (s.callback)(result, progress);
            }
            WorkItem::Remove(s) => (s.callback)(result),
            WorkItem::Rename(s) => (s.callback)(result),
            WorkItem::CreateDir(s) => (s.callback)(result),
            WorkItem::RemoveDir(s) => (s.callback)(result),
            WorkItem::CompareFiles(s) => (s.callback)(result, false),
            WorkItem::ListDir(s) => (s.callback)(result, Vec::new()),
        }
    }

    /// Close any locally-owned stream before a terminal callback fires
    /// (spec invariant 5).
    pub fn close_stream(&mut self) {
        match self {
            WorkItem::Download(s) => {
                s.stream.take();
            }
            WorkItem::Upload(s) => {
                s.stream.take();
            }
            _ => {}
        }
    }

    /// Name used in log lines; never shown to the protocol itself.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::Download(_) => "download",
            WorkItem::Upload(_) => "upload",
            WorkItem::Remove(_) => "remove",
            WorkItem::Rename(_) => "rename",
            WorkItem::CreateDir(_) => "create_dir",
            WorkItem::RemoveDir(_) => "remove_dir",
            WorkItem::CompareFiles(_) => "compare_files",
            WorkItem::ListDir(_) => "list_dir",
        }
    }
}

/// Wraps a [`WorkItem`] with the mutable bookkeeping the request engine
/// needs to drive it through its state machine and retransmit on timeout
/// (spec §3 "Work envelope").
pub struct WorkEnvelope {
    pub item: WorkItem,
    pub started: bool,
    pub last_opcode: u8,
    pub last_sent_seq_number: u16,
    pub last_received_seq_number: u16,
    pub retries: u8,
    pub payload: PayloadHeader,
    /// The server-assigned session handle, `0` until the first ACK of
    /// `OPEN_FILE_RO`/`CREATE_FILE`/`OPEN_FILE_WO` adopts one (spec
    /// invariant 3). Sessionless operations never set this.
    pub session: u8,
}

impl WorkEnvelope {
    pub fn new(item: WorkItem) -> Self {
        WorkEnvelope {
            item,
            started: false,
            last_opcode: 0,
            last_sent_seq_number: 0,
            last_received_seq_number: 0,
            retries: RETRIES,
            payload: PayloadHeader::default(),
            session: 0,
        }
    }
}
