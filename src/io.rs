//! Local file I/O: open-for-read/write, size stat, and CRC-32 (spec §4.3).
//!
//! These are plain synchronous `std::fs` calls. The request engine calls
//! them from inside its single queue mutex's critical section (spec §5
//! "internally, the engine never blocks" refers to the network/timer path,
//! not these quick local syscalls — the same assumption the original
//! implementation makes with synchronous POSIX file calls).

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk size used when streaming a file through the CRC-32 accumulator.
const CRC_CHUNK: usize = 4096;

/// Open a local file for writing, truncating any existing content.
pub fn open_for_write(path: &Path) -> std::io::Result<File> {
    File::create(path)
}

/// Open a local file for reading. The caller is expected to distinguish
/// "does not exist" (`ErrorKind::NotFound`) from other I/O failures per
/// spec §4.3, since those map to different `ClientResult` variants.
pub fn open_for_read(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

/// Stat a local file's size in bytes.
pub fn file_size(path: &Path) -> std::io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Compute the IEEE 802.3 CRC-32 (polynomial `0xEDB88320`, init
/// `0xFFFFFFFF`, final XOR `0xFFFFFFFF`) of a file, reading it in
/// `CRC_CHUNK`-byte chunks until EOF.
pub fn crc32_file(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CRC_CHUNK];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn crc32_matches_ieee_reference_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.bin");
        std::fs::write(&path, b"123456789").unwrap();
        assert_eq!(crc32_file(&path).unwrap(), 0xCBF4_3926);
    }

    #[test]
    fn crc32_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();
        let first = crc32_file(&path).unwrap();
        let second = crc32_file(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn open_for_read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_for_read(&dir.path().join("missing.bin")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn write_then_stat_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut f = open_for_write(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        f.flush().unwrap();
        drop(f);
        assert_eq!(file_size(&path).unwrap(), 10);
    }
}
