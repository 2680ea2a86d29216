//! The request engine (C6): work queue (C5), per-variant state machines,
//! response dispatch, timeout handling, and the public submission API (C7).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::debugging_enabled;
use crate::io;
use crate::protocol::{MAX_DATA_LENGTH, Opcode, PayloadHeader};
use crate::result::{ClientResult, decode_nak, is_eof};
use crate::timer::Timer;
use crate::transport::{FtpTransport, InboundFrame, TargetRouting};
use crate::work::*;

/// Drives a submitted [`WorkItem`] to completion: start, continuation on
/// ACK, retransmission on timeout, terminal pop.
struct Inner {
    transport: Arc<dyn FtpTransport>,
    routing: Mutex<TargetRouting>,
    queue: Mutex<VecDeque<WorkEnvelope>>,
    timer: Timer,
    next_seq: AtomicU16,
    timeout: Duration,
}

/// The MAVLink FTP client request engine (spec §1–§9).
///
/// Owns a single in-flight work queue; see the module docs for the
/// concurrency model. Cheaply `Clone`-able — clones share the same queue.
#[derive(Clone)]
pub struct FtpClient {
    inner: Arc<Inner>,
}

/// Outcome of processing one inbound response against the head of the
/// queue.
enum Dispatch {
    /// The work item is still in flight; re-arm the timer.
    Continue,
    /// The work item is done; deliver `result` through the variant's
    /// generic terminal path and pop.
    Terminal(ClientResult),
    /// The work item is done and its terminal callback has already been
    /// invoked with variant-specific payload data (list entries, CRC
    /// match); just pop.
    TerminalHandled,
}

impl FtpClient {
    /// Construct a client around a transport. Own/target ids, the
    /// autopilot component id, and the per-request timeout are all pulled
    /// from `transport` (spec §6, §4.8).
    pub fn new(transport: Arc<dyn FtpTransport>) -> Self {
        if debugging_enabled() {
            trace!("MAVSDK_FTP_DEBUGGING enabled, raising verbosity");
        }
        let routing = TargetRouting::new(
            transport.own_system_id(),
            transport.own_component_id(),
            transport.target_system_id(),
            transport.autopilot_component_id(),
        );
        let timeout = transport.timeout();
        FtpClient {
            inner: Arc::new(Inner {
                transport,
                routing: Mutex::new(routing),
                queue: Mutex::new(VecDeque::new()),
                timer: Timer::new(),
                next_seq: AtomicU16::new(0),
                timeout,
            }),
        }
    }

    /// Set an explicit target component override (spec §4.8); sticks for
    /// the client's lifetime.
    pub fn set_target_component_override(&self, component_id: u8) {
        self.inner
            .routing
            .lock()
            .unwrap()
            .set_target_component_override(component_id);
    }

    /// Drive the head of the queue one step (spec §4.5). Call on a steady
    /// cadence from an external dispatcher.
    pub fn do_work(&self) {
        do_work(&self.inner);
    }

    /// Feed a decoded inbound carrier message to the engine (spec §4.6.1).
    pub fn handle_inbound(&self, frame: InboundFrame) {
        handle_inbound(&self.inner, frame);
    }

    /// Decode raw frame bytes addressed to `(target_system,
    /// target_component)` and feed them to the engine. Frames whose
    /// decoded `size` exceeds `MAX_DATA_LENGTH` are rejected (spec §4.1).
    pub fn handle_raw_message(&self, target_system: u8, target_component: u8, raw: &[u8]) {
        match PayloadHeader::from_bytes(raw) {
            Ok(payload) => handle_inbound(
                &self.inner,
                InboundFrame {
                    target_system,
                    target_component,
                    payload,
                },
            ),
            Err(e) => warn!("dropping undecodable FTP frame: {e}"),
        }
    }

    /// Spawn a background task calling `do_work` on `interval` (spec §5's
    /// "external dispatcher thread"), wired onto the ambient tokio runtime.
    pub fn spawn_dispatcher(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                do_work(&inner);
            }
        })
    }

    /// Flush every pending work item with `Unknown`, closing any open
    /// local streams first (spec §5 "Shutdown policy").
    pub fn shutdown(&self) {
        self.inner.timer.stop();
        let mut guard = self.inner.queue.lock().unwrap();
        while let Some(mut env) = guard.pop_front() {
            env.item.close_stream();
            env.item.deliver_terminal(ClientResult::Unknown);
        }
    }

    // -- submission: async/callback form (spec §4.7 "Async") --------------

    pub fn download(
        &self,
        remote_path: impl Into<String>,
        local_folder: impl Into<PathBuf>,
        callback: impl FnMut(ClientResult, ProgressData) + Send + 'static,
    ) {
        let item = WorkItem::Download(DownloadState {
            remote_path: remote_path.into(),
            local_folder: local_folder.into(),
            local_path: PathBuf::new(),
            stream: None,
            file_size: 0,
            bytes_transferred: 0,
            last_progress_percentage: 0,
            callback: Box::new(callback),
        });
        submit(&self.inner, item);
    }

    pub fn upload(
        &self,
        local_path: impl Into<PathBuf>,
        remote_folder: impl Into<String>,
        callback: impl FnMut(ClientResult, ProgressData) + Send + 'static,
    ) {
        let item = WorkItem::Upload(UploadState {
            local_path: local_path.into(),
            remote_folder: remote_folder.into(),
            remote_path: String::new(),
            stream: None,
            file_size: 0,
            bytes_transferred: 0,
            callback: Box::new(callback),
        });
        submit(&self.inner, item);
    }

    pub fn remove(
        &self,
        path: impl Into<String>,
        callback: impl FnMut(ClientResult) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::Remove(RemoveState {
                path: path.into(),
                callback: Box::new(callback),
            }),
        );
    }

    pub fn rename(
        &self,
        from_path: impl Into<String>,
        to_path: impl Into<String>,
        callback: impl FnMut(ClientResult) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::Rename(RenameState {
                from_path: from_path.into(),
                to_path: to_path.into(),
                callback: Box::new(callback),
            }),
        );
    }

    pub fn create_directory(
        &self,
        path: impl Into<String>,
        callback: impl FnMut(ClientResult) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::CreateDir(CreateDirState {
                path: path.into(),
                callback: Box::new(callback),
            }),
        );
    }

    pub fn remove_directory(
        &self,
        path: impl Into<String>,
        callback: impl FnMut(ClientResult) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::RemoveDir(RemoveDirState {
                path: path.into(),
                callback: Box::new(callback),
            }),
        );
    }

    pub fn compare_files(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        callback: impl FnMut(ClientResult, bool) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::CompareFiles(CompareFilesState {
                local_path: local_path.into(),
                remote_path: remote_path.into(),
                local_crc: None,
                callback: Box::new(callback),
            }),
        );
    }

    pub fn list_directory(
        &self,
        path: impl Into<String>,
        callback: impl FnMut(ClientResult, Vec<String>) + Send + 'static,
    ) {
        submit(
            &self.inner,
            WorkItem::ListDir(ListDirState {
                path: path.into(),
                offset: 0,
                entries: Vec::new(),
                callback: Box::new(callback),
            }),
        );
    }

    // -- submission: blocking form (spec §4.7 "Blocking") ------------------
    //
    // Each waits on the completion of its async counterpart via a oneshot
    // channel, discarding `Next` progress callbacks along the way.

    pub async fn download_blocking(
        &self,
        remote_path: impl Into<String>,
        local_folder: impl Into<PathBuf>,
    ) -> (ClientResult, ProgressData) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.download(remote_path, local_folder, move |result, progress| {
            if result == ClientResult::Next {
                return;
            }
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((result, progress));
            }
        });
        rx.await.unwrap_or((
            ClientResult::Unknown,
            ProgressData {
                bytes_transferred: 0,
                total_bytes: 0,
            },
        ))
    }

    pub async fn upload_blocking(
        &self,
        local_path: impl Into<PathBuf>,
        remote_folder: impl Into<String>,
    ) -> (ClientResult, ProgressData) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.upload(local_path, remote_folder, move |result, progress| {
            if result == ClientResult::Next {
                return;
            }
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((result, progress));
            }
        });
        rx.await.unwrap_or((
            ClientResult::Unknown,
            ProgressData {
                bytes_transferred: 0,
                total_bytes: 0,
            },
        ))
    }

    pub async fn remove_blocking(&self, path: impl Into<String>) -> ClientResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.remove(path, move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        });
        rx.await.unwrap_or(ClientResult::Unknown)
    }

    pub async fn rename_blocking(
        &self,
        from_path: impl Into<String>,
        to_path: impl Into<String>,
    ) -> ClientResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.rename(from_path, to_path, move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        });
        rx.await.unwrap_or(ClientResult::Unknown)
    }

    pub async fn create_directory_blocking(&self, path: impl Into<String>) -> ClientResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.create_directory(path, move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        });
        rx.await.unwrap_or(ClientResult::Unknown)
    }

    pub async fn remove_directory_blocking(&self, path: impl Into<String>) -> ClientResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.remove_directory(path, move |result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result);
            }
        });
        rx.await.unwrap_or(ClientResult::Unknown)
    }

    pub async fn compare_files_blocking(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> (ClientResult, bool) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.compare_files(local_path, remote_path, move |result, matches| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((result, matches));
            }
        });
        rx.await.unwrap_or((ClientResult::Unknown, false))
    }

    pub async fn list_directory_blocking(
        &self,
        path: impl Into<String>,
    ) -> (ClientResult, Vec<String>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.list_directory(path, move |result, entries| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((result, entries));
            }
        });
        rx.await.unwrap_or((ClientResult::Unknown, Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// C5 — work queue + dispatcher
// ---------------------------------------------------------------------------

fn submit(inner: &Arc<Inner>, item: WorkItem) {
    debug!(kind = item.kind_name(), "enqueue work item");
    inner.queue.lock().unwrap().push_back(WorkEnvelope::new(item));
    do_work(inner);
}

/// Start the head of the queue if it hasn't been started yet. A work item
/// that fails pre-flight (bad path, missing local file) is popped right
/// away; the item behind it is picked up by the next `do_work` call, which
/// `submit` triggers on every enqueue and `spawn_dispatcher` triggers on a
/// steady cadence.
fn do_work(inner: &Arc<Inner>) {
    let mut guard = inner.queue.lock().unwrap();
    let Some(env) = guard.front_mut() else {
        return;
    };
    if env.started {
        return;
    }
    env.started = true;

    let routing = inner.routing.lock().unwrap().clone();
    let keep = start_head(inner, &routing, env);
    if !keep {
        let mut popped = guard.pop_front().expect("head present");
        drop(guard);
        popped.item.close_stream();
    }
}

// ---------------------------------------------------------------------------
// Outbound frame construction
// ---------------------------------------------------------------------------

fn build_payload(session: u8, opcode: Opcode, offset: u32, size: u8, data: &[u8]) -> PayloadHeader {
    let mut payload = PayloadHeader {
        session,
        opcode: opcode.as_u8(),
        offset,
        size,
        ..Default::default()
    };
    payload.data[..data.len()].copy_from_slice(data);
    payload
}

/// Send a request, caching it on the envelope for retransmission and
/// arming the timeout (spec §4.6.1 "every successful dispatch... re-arms
/// the timer").
fn send_request(
    inner: &Arc<Inner>,
    routing: &TargetRouting,
    env: &mut WorkEnvelope,
    opcode: Opcode,
    session: u8,
    offset: u32,
    size: u8,
    data: &[u8],
) {
    let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
    let mut payload = build_payload(session, opcode, offset, size, data);
    payload.seq_number = seq;

    env.last_opcode = opcode.as_u8();
    env.last_sent_seq_number = seq;
    env.payload = payload.clone();

    trace!(?opcode, seq, "sending request");
    inner.transport.send_message(routing.wrap_outbound(payload));
    arm_timer(inner);
}

fn arm_timer(inner: &Arc<Inner>) {
    let inner2 = Arc::clone(inner);
    inner.timer.start(inner.timeout, move || on_timeout(&inner2));
}

/// Null-terminated path, or `None` if the encoded path plus its null
/// terminator does not leave room for at least one more byte in `data`
/// (spec §4.6.4: "combined path length(s) + null terminator(s) <
/// MAX_DATA_LENGTH"). Note this is a strict `<`, not `<=`: an encoded
/// length exactly equal to `MAX_DATA_LENGTH` is already rejected.
fn encode_path(path: &str) -> Option<Vec<u8>> {
    let mut data = path.as_bytes().to_vec();
    data.push(0);
    if data.len() >= MAX_DATA_LENGTH {
        return None;
    }
    Some(data)
}

fn encode_two_paths(a: &str, b: &str) -> Option<Vec<u8>> {
    let mut data = Vec::with_capacity(a.len() + b.len() + 2);
    data.extend_from_slice(a.as_bytes());
    data.push(0);
    data.extend_from_slice(b.as_bytes());
    data.push(0);
    if data.len() >= MAX_DATA_LENGTH {
        return None;
    }
    Some(data)
}

/// Null-terminated path for upload's remote path, or `None` if it would not
/// fit in `MAX_DATA_LENGTH`. Spec §4.6.3 phrases upload's check on the path
/// length alone ("if its length ≥ MAX_DATA_LENGTH"), which maps to the
/// encoded length (path + null terminator) exceeding `MAX_DATA_LENGTH`, not
/// merely reaching it. That's looser than [`encode_path`]'s `§4.6.4`
/// callers, so upload keeps its own boundary check.
fn encode_upload_path(path: &str) -> Option<Vec<u8>> {
    let mut data = path.as_bytes().to_vec();
    data.push(0);
    if data.len() > MAX_DATA_LENGTH {
        return None;
    }
    Some(data)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(path)
        .to_string()
}

// ---------------------------------------------------------------------------
// C6 — start handlers (spec §4.5 step 4, §4.6.2–§4.6.6)
// ---------------------------------------------------------------------------

/// Run the head work item's `*_start` path. Returns `false` if the item
/// failed pre-flight and was delivered a local terminal result already.
fn start_head(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    match &mut env.item {
        WorkItem::Download(_) => start_download(inner, routing, env),
        WorkItem::Upload(_) => start_upload(inner, routing, env),
        WorkItem::Remove(_) => start_remove(inner, routing, env),
        WorkItem::Rename(_) => start_rename(inner, routing, env),
        WorkItem::CreateDir(_) => start_create_dir(inner, routing, env),
        WorkItem::RemoveDir(_) => start_remove_dir(inner, routing, env),
        WorkItem::CompareFiles(_) => start_compare_files(inner, routing, env),
        WorkItem::ListDir(_) => start_list_dir(inner, routing, env),
    }
}

fn fail_start(env: &mut WorkEnvelope, result: ClientResult) -> bool {
    env.item.deliver_terminal(result);
    false
}

fn start_download(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::Download(state) = &mut env.item else {
        unreachable!()
    };
    let Some(data) = encode_path(&state.remote_path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };

    let local_path = state.local_folder.join(basename(&state.remote_path));
    match io::open_for_write(&local_path) {
        Ok(file) => {
            state.stream = Some(file);
            state.local_path = local_path;
        }
        Err(_) => return fail_start(env, ClientResult::FileIoError),
    }

    send_request(
        inner,
        routing,
        env,
        Opcode::OpenFileRo,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_upload(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::Upload(state) = &mut env.item else {
        unreachable!()
    };

    let file = match io::open_for_read(&state.local_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fail_start(env, ClientResult::FileDoesNotExist);
        }
        Err(_) => return fail_start(env, ClientResult::FileIoError),
    };

    let size = match io::file_size(&state.local_path) {
        Ok(s) => s,
        // spec §9 open question 4: the source swallows the callback here;
        // this crate fixes it and delivers a terminal FileIoError instead.
        Err(_) => return fail_start(env, ClientResult::FileIoError),
    };

    let local_name = basename(&state.local_path.to_string_lossy());
    let remote_folder = state.remote_folder.trim_end_matches('/');
    let remote_path = format!("{remote_folder}/{local_name}");
    let Some(data) = encode_upload_path(&remote_path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };

    state.stream = Some(file);
    state.file_size = size.min(u32::MAX as u64) as u32;
    state.remote_path = remote_path;

    send_request(
        inner,
        routing,
        env,
        Opcode::CreateFile,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_remove(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::Remove(state) = &env.item else {
        unreachable!()
    };
    let Some(data) = encode_path(&state.path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::RemoveFile,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_rename(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::Rename(state) = &env.item else {
        unreachable!()
    };
    let Some(data) = encode_two_paths(&state.from_path, &state.to_path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::Rename,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_create_dir(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::CreateDir(state) = &env.item else {
        unreachable!()
    };
    let Some(data) = encode_path(&state.path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::CreateDirectory,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_remove_dir(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::RemoveDir(state) = &env.item else {
        unreachable!()
    };
    let Some(data) = encode_path(&state.path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::RemoveDirectory,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_compare_files(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::CompareFiles(state) = &mut env.item else {
        unreachable!()
    };
    let crc = match io::crc32_file(&state.local_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fail_start(env, ClientResult::FileDoesNotExist);
        }
        Err(_) => return fail_start(env, ClientResult::FileIoError),
    };
    let Some(data) = encode_path(&state.remote_path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    state.local_crc = Some(crc);

    send_request(
        inner,
        routing,
        env,
        Opcode::CalcFileCrc32,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

fn start_list_dir(inner: &Arc<Inner>, routing: &TargetRouting, env: &mut WorkEnvelope) -> bool {
    let WorkItem::ListDir(state) = &env.item else {
        unreachable!()
    };
    let Some(data) = encode_path(&state.path) else {
        return fail_start(env, ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::ListDirectory,
        0,
        0,
        data.len() as u8,
        &data,
    );
    true
}

// ---------------------------------------------------------------------------
// C6 — response dispatch (spec §4.6.1)
// ---------------------------------------------------------------------------

fn handle_inbound(inner: &Arc<Inner>, frame: InboundFrame) {
    let routing = inner.routing.lock().unwrap().clone();
    if !routing.accepts(&frame) {
        warn!(
            target_system = frame.target_system,
            target_component = frame.target_component,
            "dropping frame not addressed to us"
        );
        return;
    }

    let mut guard = inner.queue.lock().unwrap();
    let Some(env) = guard.front_mut() else {
        trace!("dropping response, no work in flight");
        return;
    };

    if frame.payload.req_opcode != env.last_opcode {
        warn!(
            expected = env.last_opcode,
            got = frame.payload.req_opcode,
            "dropping stale response"
        );
        return;
    }

    if env.last_received_seq_number != 0 && frame.payload.seq_number == env.last_received_seq_number
    {
        trace!(seq = frame.payload.seq_number, "dropping duplicate response");
        return;
    }

    let dispatch = handle_response(inner, &routing, env, &frame.payload);

    match dispatch {
        Dispatch::Continue => {
            env.last_received_seq_number = frame.payload.seq_number;
            arm_timer(inner);
        }
        Dispatch::Terminal(result) => {
            let mut popped = guard.pop_front().expect("head present");
            drop(guard);
            inner.timer.stop();
            popped.item.close_stream();
            popped.item.deliver_terminal(result);
        }
        Dispatch::TerminalHandled => {
            guard.pop_front();
            drop(guard);
            inner.timer.stop();
        }
    }
}

fn handle_response(
    inner: &Arc<Inner>,
    routing: &TargetRouting,
    env: &mut WorkEnvelope,
    frame: &PayloadHeader,
) -> Dispatch {
    let is_nak = frame.opcode == Opcode::RspNak.as_u8();

    match &mut env.item {
        WorkItem::Download(_) => dispatch_download(inner, routing, env, frame, is_nak),
        WorkItem::Upload(_) => dispatch_upload(inner, routing, env, frame, is_nak),
        WorkItem::Remove(_)
        | WorkItem::Rename(_)
        | WorkItem::CreateDir(_)
        | WorkItem::RemoveDir(_) => {
            if is_nak {
                Dispatch::Terminal(decode_nak(frame))
            } else {
                Dispatch::Terminal(ClientResult::Success)
            }
        }
        WorkItem::CompareFiles(_) => dispatch_compare_files(env, frame, is_nak),
        WorkItem::ListDir(_) => dispatch_list_dir(inner, routing, env, frame, is_nak),
    }
}

fn dispatch_download(
    inner: &Arc<Inner>,
    routing: &TargetRouting,
    env: &mut WorkEnvelope,
    frame: &PayloadHeader,
    is_nak: bool,
) -> Dispatch {
    if is_nak {
        return Dispatch::Terminal(decode_nak(frame));
    }

    let last_opcode = Opcode::from_u8(env.last_opcode);
    match last_opcode {
        Some(Opcode::OpenFileRo) => {
            let data = frame.data_slice();
            let file_size = if data.len() >= 4 {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            } else {
                0
            };
            env.session = frame.session;
            env.retries = crate::config::RETRIES;

            let WorkItem::Download(state) = &mut env.item else {
                unreachable!()
            };
            state.file_size = file_size;

            if state.file_size == 0 || state.bytes_transferred >= state.file_size {
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::TerminateSession,
                    frame.session,
                    0,
                    0,
                    &[],
                );
            } else {
                let size = state.file_size.min(MAX_DATA_LENGTH as u32) as u8;
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::ReadFile,
                    frame.session,
                    0,
                    size,
                    &[],
                );
            }
            Dispatch::Continue
        }
        Some(Opcode::ReadFile) => {
            let WorkItem::Download(state) = &mut env.item else {
                unreachable!()
            };
            let available = frame.data_slice();
            let remaining = state.file_size.saturating_sub(state.bytes_transferred) as usize;
            let to_write = available.len().min(remaining);

            if let Some(stream) = state.stream.as_mut()
                && stream.write_all(&available[..to_write]).is_err()
            {
                return Dispatch::Terminal(ClientResult::FileIoError);
            }
            state.bytes_transferred += to_write as u32;
            (state.callback)(
                ClientResult::Next,
                ProgressData {
                    bytes_transferred: state.bytes_transferred,
                    total_bytes: state.file_size,
                },
            );

            let session = env.session;
            if state.bytes_transferred >= state.file_size {
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::TerminateSession,
                    session,
                    0,
                    0,
                    &[],
                );
            } else {
                let WorkItem::Download(state) = &mut env.item else {
                    unreachable!()
                };
                let offset = state.bytes_transferred;
                let size = state.file_size.saturating_sub(offset).min(MAX_DATA_LENGTH as u32) as u8;
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::ReadFile,
                    session,
                    offset,
                    size,
                    &[],
                );
            }
            Dispatch::Continue
        }
        Some(Opcode::TerminateSession) => Dispatch::Terminal(ClientResult::Success),
        _ => {
            warn!("download ACK with unexpected prior opcode");
            Dispatch::Continue
        }
    }
}

/// Read the next chunk to write (spec §4.6.3): up to `MAX_DATA_LENGTH`
/// bytes, `offset` set to `bytes_transferred` before the read count is
/// added in. Returns `None` on a short, non-EOF read (`FileIoError`).
fn next_upload_chunk(state: &mut UploadState) -> Option<(u32, Vec<u8>)> {
    let want = state
        .file_size
        .saturating_sub(state.bytes_transferred)
        .min(MAX_DATA_LENGTH as u32) as usize;
    let offset = state.bytes_transferred;
    let mut buf = vec![0u8; want];
    let mut filled = 0usize;
    if let Some(stream) = state.stream.as_mut() {
        while filled < want {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return None,
            }
        }
    }
    if filled != want {
        return None;
    }
    buf.truncate(filled);
    state.bytes_transferred += filled as u32;
    Some((offset, buf))
}

fn dispatch_upload(
    inner: &Arc<Inner>,
    routing: &TargetRouting,
    env: &mut WorkEnvelope,
    frame: &PayloadHeader,
    is_nak: bool,
) -> Dispatch {
    if is_nak {
        return Dispatch::Terminal(decode_nak(frame));
    }

    let last_opcode = Opcode::from_u8(env.last_opcode);
    match last_opcode {
        Some(Opcode::CreateFile) => {
            env.session = frame.session;
            env.retries = crate::config::RETRIES;

            let WorkItem::Upload(state) = &mut env.item else {
                unreachable!()
            };
            if state.file_size == 0 {
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::TerminateSession,
                    frame.session,
                    0,
                    0,
                    &[],
                );
                return Dispatch::Continue;
            }

            let session = frame.session;
            let Some((offset, data)) = next_upload_chunk(state) else {
                return Dispatch::Terminal(ClientResult::FileIoError);
            };
            let progress = ProgressData {
                bytes_transferred: state.bytes_transferred,
                total_bytes: state.file_size,
            };
            send_request(
                inner,
                routing,
                env,
                Opcode::WriteFile,
                session,
                offset,
                data.len() as u8,
                &data,
            );
            let WorkItem::Upload(state) = &mut env.item else {
                unreachable!()
            };
            (state.callback)(ClientResult::Next, progress);
            Dispatch::Continue
        }
        Some(Opcode::WriteFile) => {
            let session = env.session;
            let WorkItem::Upload(state) = &mut env.item else {
                unreachable!()
            };
            if state.bytes_transferred >= state.file_size {
                send_request(
                    inner,
                    routing,
                    env,
                    Opcode::TerminateSession,
                    session,
                    0,
                    0,
                    &[],
                );
                return Dispatch::Continue;
            }
            let Some((offset, data)) = next_upload_chunk(state) else {
                return Dispatch::Terminal(ClientResult::FileIoError);
            };
            let progress = ProgressData {
                bytes_transferred: state.bytes_transferred,
                total_bytes: state.file_size,
            };
            send_request(
                inner,
                routing,
                env,
                Opcode::WriteFile,
                session,
                offset,
                data.len() as u8,
                &data,
            );
            let WorkItem::Upload(state) = &mut env.item else {
                unreachable!()
            };
            (state.callback)(ClientResult::Next, progress);
            Dispatch::Continue
        }
        Some(Opcode::TerminateSession) => Dispatch::Terminal(ClientResult::Success),
        _ => {
            warn!("upload ACK with unexpected prior opcode");
            Dispatch::Continue
        }
    }
}

fn dispatch_compare_files(env: &mut WorkEnvelope, frame: &PayloadHeader, is_nak: bool) -> Dispatch {
    let WorkItem::CompareFiles(state) = &mut env.item else {
        unreachable!()
    };
    if is_nak {
        (state.callback)(decode_nak(frame), false);
        return Dispatch::TerminalHandled;
    }
    let data = frame.data_slice();
    let remote_crc = if data.len() >= 4 {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    } else {
        0
    };
    let matches = Some(remote_crc) == state.local_crc;
    (state.callback)(ClientResult::Success, matches);
    Dispatch::TerminalHandled
}

fn dispatch_list_dir(
    inner: &Arc<Inner>,
    routing: &TargetRouting,
    env: &mut WorkEnvelope,
    frame: &PayloadHeader,
    is_nak: bool,
) -> Dispatch {
    if is_nak {
        let WorkItem::ListDir(state) = &mut env.item else {
            unreachable!()
        };
        if is_eof(frame) {
            let mut entries = std::mem::take(&mut state.entries);
            entries.sort();
            (state.callback)(ClientResult::Success, entries);
        } else {
            (state.callback)(decode_nak(frame), Vec::new());
        }
        return Dispatch::TerminalHandled;
    }

    let mut buf = frame.data_slice().to_vec();
    if let Some(last) = buf.last_mut() {
        *last = 0;
    }

    let WorkItem::ListDir(state) = &mut env.item else {
        unreachable!()
    };
    for piece in buf.split(|&b| b == 0).filter(|p| !p.is_empty()) {
        state.offset += 1;
        if piece.first() == Some(&b'S') {
            continue;
        }
        state.entries.push(String::from_utf8_lossy(piece).into_owned());
    }

    let path = state.path.clone();
    let offset = state.offset;
    let Some(data) = encode_path(&path) else {
        return Dispatch::Terminal(ClientResult::InvalidParameter);
    };
    send_request(
        inner,
        routing,
        env,
        Opcode::ListDirectory,
        0,
        offset,
        data.len() as u8,
        &data,
    );
    Dispatch::Continue
}

// ---------------------------------------------------------------------------
// C6 — timeout handling (spec §4.6.7)
// ---------------------------------------------------------------------------

fn on_timeout(inner: &Arc<Inner>) {
    let mut guard = inner.queue.lock().unwrap();
    let Some(env) = guard.front_mut() else {
        return;
    };

    env.retries = env.retries.saturating_sub(1);
    if env.retries == 0 {
        let mut popped = guard.pop_front().expect("head present");
        drop(guard);
        popped.item.close_stream();
        popped.item.deliver_terminal(ClientResult::Timeout);
        return;
    }

    let routing = inner.routing.lock().unwrap().clone();
    let payload = env.payload.clone();
    debug!(seq = payload.seq_number, retries_left = env.retries, "retransmitting");
    inner.transport.send_message(routing.wrap_outbound(payload));
    drop(guard);
    arm_timer(inner);
}
