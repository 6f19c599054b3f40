//! Crash-recovery journal for monitor state.
//!
//! A restarted monitor recovers its last published view of the cluster
//! without a fresh network round-trip. The file is a framed binary blob:
//!
//! ```text
//! [4 bytes  payload length, little endian]
//! [1 byte   schema version = 2]
//! [value records ...]
//! [4 bytes  CRC32 over schema version .. last record]
//! ```
//!
//! The length field counts everything after itself, trailing CRC included.
//! A record is a type byte, a NUL-terminated server name and, for SERVER
//! records, an 8-byte little-endian status word. A corrupt journal is never
//! an error to the caller; the monitor simply starts cold.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{error, warn};

pub const JOURNAL_NAME: &str = "monitor.dat";

const SCHEMA_VERSION: u8 = 2;
const LEN_BYTES: usize = 4;
const LEN_SCHEMA_VERSION: usize = 1;
const LEN_CRC32: usize = 4;
const LEN_VALUE_TYPE: usize = 1;
const LEN_SERVER_STATUS: usize = 8;

/// Hard cap on the accepted payload length.
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

const SVT_SERVER: u8 = 1;
const SVT_MASTER: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("Unknown journal schema version: {0}")]
    BadSchema(u8),
    #[error("CRC32 mismatch in journal file")]
    CrcMismatch,
    #[error("Possible corrupted journal file (no null terminator found)")]
    MissingTerminator,
    #[error("Possible corrupted journal file (unknown stored value {0})")]
    UnknownType(u8),
    #[error("Journal file is truncated")]
    Truncated,
    #[error("Journal length {0} exceeds the maximum of {MAX_PAYLOAD}")]
    Oversize(u32),
}

/// Decoded journal contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalSnapshot {
    /// Per-server effective status at the time of the last write.
    pub servers: Vec<(String, u64)>,
    /// Name of the previously elected root master, if any.
    pub master: Option<String>,
}

/// Serialize the journal payload.
pub fn encode(servers: &[(&str, u64)], master: Option<&str>) -> Vec<u8> {
    let mut size = LEN_SCHEMA_VERSION + LEN_CRC32;
    for (name, _) in servers {
        size += LEN_VALUE_TYPE + name.len() + 1 + LEN_SERVER_STATUS;
    }
    if let Some(name) = master {
        size += LEN_VALUE_TYPE + name.len() + 1;
    }

    let mut buf = Vec::with_capacity(LEN_BYTES + size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.push(SCHEMA_VERSION);

    for (name, status) in servers {
        buf.push(SVT_SERVER);
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&status.to_le_bytes());
    }

    if let Some(name) = master {
        buf.push(SVT_MASTER);
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }

    let crc = crc32fast::hash(&buf[LEN_BYTES..buf.len()]);
    buf.extend_from_slice(&crc.to_le_bytes());

    debug_assert_eq!(buf.len(), LEN_BYTES + size);
    buf
}

/// Decode a journal file image produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<JournalSnapshot, JournalError> {
    if data.len() < LEN_BYTES {
        return Err(JournalError::Truncated);
    }

    let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if size > MAX_PAYLOAD {
        return Err(JournalError::Oversize(size));
    }
    let size = size as usize;
    if size < LEN_SCHEMA_VERSION + LEN_CRC32 || data.len() < LEN_BYTES + size {
        return Err(JournalError::Truncated);
    }

    let payload = &data[LEN_BYTES..LEN_BYTES + size];
    if payload[0] != SCHEMA_VERSION {
        return Err(JournalError::BadSchema(payload[0]));
    }

    let crc_offset = size - LEN_CRC32;
    let stored_crc = u32::from_le_bytes([
        payload[crc_offset],
        payload[crc_offset + 1],
        payload[crc_offset + 2],
        payload[crc_offset + 3],
    ]);
    if crc32fast::hash(&payload[..crc_offset]) != stored_crc {
        return Err(JournalError::CrcMismatch);
    }

    let mut snapshot = JournalSnapshot::default();
    let records = &payload[LEN_SCHEMA_VERSION..crc_offset];
    let mut pos = 0;

    while pos < records.len() {
        let value_type = records[pos];
        pos += LEN_VALUE_TYPE;

        let name_end = records[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(JournalError::MissingTerminator)?;
        let name = String::from_utf8_lossy(&records[pos..pos + name_end]).to_string();
        pos += name_end + 1;

        match value_type {
            SVT_SERVER => {
                if records.len() < pos + LEN_SERVER_STATUS {
                    return Err(JournalError::Truncated);
                }
                let mut status_bytes = [0u8; LEN_SERVER_STATUS];
                status_bytes.copy_from_slice(&records[pos..pos + LEN_SERVER_STATUS]);
                pos += LEN_SERVER_STATUS;
                snapshot.servers.push((name, u64::from_le_bytes(status_bytes)));
            }
            SVT_MASTER => snapshot.master = Some(name),
            other => return Err(JournalError::UnknownType(other)),
        }
    }

    Ok(snapshot)
}

/// SHA-1 over the serialized journal image, used to suppress redundant writes.
pub fn digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `<datadir>/<monitor>/monitor.dat`
pub fn journal_path(datadir: &Path, monitor: &str) -> PathBuf {
    datadir.join(monitor).join(JOURNAL_NAME)
}

/// Atomically replace the journal: unique temp file in the same directory,
/// flush, rename. The temp file is removed if the rename fails.
pub fn write_journal(datadir: &Path, monitor: &str, data: &[u8]) -> std::io::Result<()> {
    let dir = datadir.join(monitor);
    fs::create_dir_all(&dir)?;

    let (temp_path, mut file) = open_temp_file(&dir)?;

    let write_result = file.write_all(data).and_then(|_| file.sync_all());
    drop(file);

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, dir.join(JOURNAL_NAME)) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    Ok(())
}

/// mkstemp-style unique file next to the final journal.
fn open_temp_file(dir: &Path) -> std::io::Result<(PathBuf, fs::File)> {
    for _ in 0..16 {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let path = dir.join(format!("{JOURNAL_NAME}{suffix}"));

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "could not create a unique journal temp file",
    ))
}

/// Whether the journal on disk is older than `max_age` seconds.
/// A missing journal is not stale; it simply does not exist.
pub fn is_stale(datadir: &Path, monitor: &str, max_age: u64) -> bool {
    let path = journal_path(datadir, monitor);

    let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %path.display(), error = %e, "Failed to inspect journal file");
            }
            return false;
        }
    };

    match SystemTime::now().duration_since(mtime) {
        Ok(age) if age.as_secs() >= max_age => {
            warn!(
                journal_age_secs = age.as_secs(),
                max_age_secs = max_age,
                "Journal file is older than the maximum journal age"
            );
            true
        }
        _ => false,
    }
}

pub fn remove_journal(datadir: &Path, monitor: &str) {
    let path = journal_path(datadir, monitor);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(path = %path.display(), error = %e, "Failed to remove journal file");
        }
    }
}

/// Read and decode the journal, downgrading every failure to a log line.
pub fn load_journal(datadir: &Path, monitor: &str) -> Option<JournalSnapshot> {
    let path = journal_path(datadir, monitor);

    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %path.display(), error = %e, "Failed to read journal file");
            }
            return None;
        }
    };

    match decode(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Ignoring journal file");
            None
        }
    }
}
