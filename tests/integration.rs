//! End-to-end scenarios against an in-process fake transport: no socket, no
//! MAVLink framing, just the engine driven directly through its trait seam.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavftp_client::{
    ClientResult, FtpClient, FtpTransport, InboundFrame, OutboundFrame, Opcode, PayloadHeader,
    ProgressData,
};

const MAX_DATA_LENGTH: usize = 239;

/// A transport that records every outbound frame instead of sending it
/// anywhere. Tests drive the engine by feeding back hand-built responses.
struct FakeTransport {
    sent: Mutex<Vec<OutboundFrame>>,
    timeout: Duration,
}

impl FakeTransport {
    fn new() -> Self {
        FakeTransport {
            sent: Mutex::new(Vec::new()),
            timeout: Duration::from_millis(30),
        }
    }

    fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap().clone()
    }

    fn last(&self) -> OutboundFrame {
        self.sent.lock().unwrap().last().cloned().expect("no frame sent yet")
    }
}

impl FtpTransport for FakeTransport {
    fn send_message(&self, frame: OutboundFrame) {
        self.sent.lock().unwrap().push(frame);
    }

    fn own_system_id(&self) -> u8 {
        245
    }

    fn own_component_id(&self) -> u8 {
        190
    }

    fn target_system_id(&self) -> u8 {
        1
    }

    fn autopilot_component_id(&self) -> u8 {
        1
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn ack(req_opcode: Opcode, session: u8, offset: u32, data: &[u8]) -> InboundFrame {
    let payload = PayloadHeader {
        opcode: Opcode::RspAck.as_u8(),
        req_opcode: req_opcode.as_u8(),
        session,
        offset,
        ..Default::default()
    }
    .with_data(data);
    InboundFrame {
        target_system: 0,
        target_component: 0,
        payload,
    }
}

fn nak(req_opcode: Opcode, session: u8, data: &[u8]) -> InboundFrame {
    let payload = PayloadHeader {
        opcode: Opcode::RspNak.as_u8(),
        req_opcode: req_opcode.as_u8(),
        session,
        ..Default::default()
    }
    .with_data(data);
    InboundFrame {
        target_system: 0,
        target_component: 0,
        payload,
    }
}

#[tokio::test]
async fn download_2000_byte_file() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());
    let dir = tempfile::tempdir().unwrap();

    let file_size: u32 = 2000;
    let mut expected = Vec::with_capacity(file_size as usize);
    for i in 0..file_size {
        expected.push((i % 256) as u8);
    }

    let callbacks: Arc<Mutex<Vec<(ClientResult, ProgressData)>>> = Arc::new(Mutex::new(Vec::new()));
    let callbacks2 = Arc::clone(&callbacks);
    client.download("remote/big.bin", dir.path().to_path_buf(), move |r, p| {
        callbacks2.lock().unwrap().push((r, p));
    });

    assert_eq!(transport.last().payload.opcode, Opcode::OpenFileRo.as_u8());
    client.handle_inbound(ack(Opcode::OpenFileRo, 7, 0, &file_size.to_le_bytes()));

    let mut sent = 0u32;
    let mut read_file_requests = 0;
    while sent < file_size {
        let req = transport.last();
        assert_eq!(req.payload.opcode, Opcode::ReadFile.as_u8());
        read_file_requests += 1;
        let offset = req.payload.offset;
        let chunk_len = (file_size - offset).min(MAX_DATA_LENGTH as u32) as usize;
        let chunk = &expected[offset as usize..offset as usize + chunk_len];
        client.handle_inbound(ack(Opcode::ReadFile, 7, offset, chunk));
        sent += chunk_len as u32;
    }
    assert_eq!(read_file_requests, 9);

    assert_eq!(transport.last().payload.opcode, Opcode::TerminateSession.as_u8());
    client.handle_inbound(ack(Opcode::TerminateSession, 7, 0, &[]));

    let written = std::fs::read(dir.path().join("big.bin")).unwrap();
    assert_eq!(written, expected);

    let calls = callbacks.lock().unwrap();
    assert_eq!(calls.len(), 10);
    for (result, _) in calls.iter().take(9) {
        assert_eq!(*result, ClientResult::Next);
    }
    assert_eq!(calls[9].0, ClientResult::Success);
    assert_eq!(calls[9].1.bytes_transferred, file_size);
}

#[tokio::test]
async fn upload_zero_byte_file() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("empty.bin");
    std::fs::write(&local, []).unwrap();

    let callbacks: Arc<Mutex<Vec<(ClientResult, ProgressData)>>> = Arc::new(Mutex::new(Vec::new()));
    let callbacks2 = Arc::clone(&callbacks);
    client.upload(local, "remote/folder", move |r, p| {
        callbacks2.lock().unwrap().push((r, p));
    });

    assert_eq!(transport.last().payload.opcode, Opcode::CreateFile.as_u8());
    client.handle_inbound(ack(Opcode::CreateFile, 9, 0, &[]));

    assert_eq!(transport.last().payload.opcode, Opcode::TerminateSession.as_u8());
    client.handle_inbound(ack(Opcode::TerminateSession, 9, 0, &[]));

    let calls = callbacks.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, ClientResult::Success);
    assert_eq!(calls[0].1, ProgressData { bytes_transferred: 0, total_bytes: 0 });
}

#[tokio::test]
async fn remove_nonempty_directory_is_protocol_error() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());

    let result: Arc<Mutex<Option<ClientResult>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.remove_directory("remote/full", move |r| {
        *result2.lock().unwrap() = Some(r);
    });

    assert_eq!(transport.last().payload.opcode, Opcode::RemoveDirectory.as_u8());
    client.handle_inbound(nak(Opcode::RemoveDirectory, 0, &[1])); // FAIL

    assert_eq!(result.lock().unwrap().unwrap(), ClientResult::ProtocolError);
}

#[tokio::test]
async fn remove_rejects_path_at_the_max_data_length_boundary() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());

    // Encoded length = 238 path bytes + 1 null terminator = MAX_DATA_LENGTH
    // (239), which must be rejected: spec §4.6.4 requires the combined
    // length plus terminator to be strictly less than MAX_DATA_LENGTH.
    let path = "x".repeat(MAX_DATA_LENGTH - 1);

    let result: Arc<Mutex<Option<ClientResult>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.remove(path, move |r| {
        *result2.lock().unwrap() = Some(r);
    });

    assert_eq!(result.lock().unwrap().unwrap(), ClientResult::InvalidParameter);
    assert!(transport.sent_frames().is_empty());
}

#[tokio::test]
async fn list_directory_filters_s_entries_across_two_responses() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());

    let result: Arc<Mutex<Option<(ClientResult, Vec<String>)>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.list_directory("remote/dir", move |r, entries| {
        *result2.lock().unwrap() = Some((r, entries));
    });

    assert_eq!(transport.last().payload.opcode, Opcode::ListDirectory.as_u8());
    assert_eq!(transport.last().payload.offset, 0);

    let mut page1 = Vec::new();
    for entry in ["D.", "Falpha", "Fbeta", "Sskipme"] {
        page1.extend_from_slice(entry.as_bytes());
        page1.push(0);
    }
    client.handle_inbound(ack(Opcode::ListDirectory, 0, 0, &page1));

    assert_eq!(transport.last().payload.opcode, Opcode::ListDirectory.as_u8());
    assert_eq!(transport.last().payload.offset, 4);

    client.handle_inbound(nak(Opcode::ListDirectory, 0, &[6])); // EOF

    let (result, entries) = result.lock().unwrap().clone().unwrap();
    assert_eq!(result, ClientResult::Success);
    assert_eq!(entries, vec!["D.".to_string(), "Falpha".to_string(), "Fbeta".to_string()]);
}

#[tokio::test]
async fn compare_files_reports_crc_match_and_mismatch() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("compare.bin");
    std::fs::write(&local, b"matching content").unwrap();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(b"matching content");
    let local_crc = hasher.finalize();

    let result: Arc<Mutex<Option<(ClientResult, bool)>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.compare_files(local.clone(), "remote/compare.bin", move |r, matches| {
        *result2.lock().unwrap() = Some((r, matches));
    });
    assert_eq!(transport.last().payload.opcode, Opcode::CalcFileCrc32.as_u8());
    client.handle_inbound(ack(Opcode::CalcFileCrc32, 0, 0, &local_crc.to_le_bytes()));
    assert_eq!(result.lock().unwrap().take().unwrap(), (ClientResult::Success, true));

    let result3 = Arc::clone(&result);
    client.compare_files(local, "remote/compare.bin", move |r, matches| {
        *result3.lock().unwrap() = Some((r, matches));
    });
    let mismatched = local_crc ^ 0xFFFF_FFFF;
    client.handle_inbound(ack(Opcode::CalcFileCrc32, 0, 0, &mismatched.to_le_bytes()));
    assert_eq!(result.lock().unwrap().take().unwrap(), (ClientResult::Success, false));
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_after_retries() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());

    let result: Arc<Mutex<Option<ClientResult>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.remove("remote/gone.bin", move |r| {
        *result2.lock().unwrap() = Some(r);
    });

    tokio::time::sleep(Duration::from_millis(30) * 6).await;

    assert_eq!(result.lock().unwrap().unwrap(), ClientResult::Timeout);

    // RETRIES=4: the counter is decremented on each timer fire and give-up
    // happens on the fire that drives it to zero, without a further
    // retransmission on that fire. That's 3 retransmissions following the
    // initial send, 4 frames on the wire total.
    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 4);
    for frame in &frames[1..] {
        assert_eq!(frame.payload, frames[0].payload);
    }
}

#[tokio::test]
async fn download_missing_remote_file_reports_file_does_not_exist() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());
    let dir = tempfile::tempdir().unwrap();

    let result: Arc<Mutex<Option<ClientResult>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.download("remote/missing.bin", dir.path().to_path_buf(), move |r, _| {
        *result2.lock().unwrap() = Some(r);
    });

    client.handle_inbound(nak(Opcode::OpenFileRo, 0, &[2, 2])); // FAIL_ERRNO + ENOENT

    assert_eq!(result.lock().unwrap().unwrap(), ClientResult::FileDoesNotExist);
}

#[tokio::test]
async fn stale_response_opcode_is_dropped() {
    let transport = Arc::new(FakeTransport::new());
    let client = FtpClient::new(transport.clone());

    let result: Arc<Mutex<Option<ClientResult>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client.remove("remote/gone.bin", move |r| {
        *result2.lock().unwrap() = Some(r);
    });

    // A response answering a different request than the one in flight must
    // be dropped rather than completing the work item.
    client.handle_inbound(ack(Opcode::Rename, 0, 0, &[]));
    assert!(result.lock().unwrap().is_none());

    client.handle_inbound(ack(Opcode::RemoveFile, 0, 0, &[]));
    assert_eq!(result.lock().unwrap().unwrap(), ClientResult::Success);
}
