//! Binary codec for log and snapshot files (§3 "Data model", §4.1).
//!
//! Log files (`.crdtlog`) are a 4-byte magic, a version byte, then a
//! sequence of framed records: `varint length | i64 timestamp_ms (BE) |
//! varint sequence | payload`. Snapshot files (`.snapshot`) are a 4-byte
//! magic, a version byte, a status byte, an encoded vector clock, and an
//! encoded document state region.
//!
//! Varints are unsigned LEB128. No crate in the dependency stack already
//! provides this, so it's hand-rolled here the same way `body_doc.rs`
//! frames yrs update payloads with explicit length prefixes.

use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::{NoteCoveError, Result};

/// Magic bytes identifying a log file.
pub const LOG_MAGIC: [u8; 4] = *b"NCLG";
/// Magic bytes identifying a snapshot file.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"NCSS";

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Snapshot status byte: the write is still in progress.
pub const SNAPSHOT_INCOMPLETE: u8 = 0;
/// Snapshot status byte: the write finished and is safe to load.
pub const SNAPSHOT_COMPLETE: u8 = 1;

/// Write an unsigned LEB128 varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint from `cursor`, advancing its position.
/// Returns `None` if the cursor runs out of bytes before the varint ends
/// (a truncation, not a format error — callers surface this as
/// `NoteCoveError::Truncated`).
pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        if cursor.read_exact(&mut byte).is_err() {
            return None;
        }
        let byte = byte[0];
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Write a file header: 4-byte magic followed by a version byte.
pub fn write_header(out: &mut Vec<u8>, magic: [u8; 4]) {
    out.extend_from_slice(&magic);
    out.push(FORMAT_VERSION);
}

/// Parse a file header, validating magic and version.
pub fn parse_header(path: &Path, bytes: &[u8], expected_magic: [u8; 4]) -> Result<usize> {
    if bytes.len() < 5 {
        return Err(NoteCoveError::Truncated {
            path: path.to_path_buf(),
            at_offset: 0,
        });
    }
    let mut got = [0u8; 4];
    got.copy_from_slice(&bytes[0..4]);
    if got != expected_magic {
        return Err(NoteCoveError::MagicMismatch {
            path: path.to_path_buf(),
            expected: expected_magic,
            got,
        });
    }
    let version = bytes[4];
    if version != FORMAT_VERSION {
        return Err(NoteCoveError::UnknownVersion {
            path: path.to_path_buf(),
            version,
        });
    }
    Ok(5)
}

/// One decoded record from a `.crdtlog` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Wall-clock time the record was written, milliseconds since epoch.
    pub timestamp_ms: i64,
    /// Monotonic per-instance sequence number (1-based, contiguous).
    pub sequence: u64,
    /// The yrs update payload.
    pub payload: Vec<u8>,
}

/// Encode one framed log record: `varint len | i64 timestamp (BE) |
/// varint sequence | payload`, where `len` covers everything after itself.
pub fn encode_log_record(out: &mut Vec<u8>, timestamp_ms: i64, sequence: u64, payload: &[u8]) {
    let mut body = Vec::with_capacity(8 + 10 + payload.len());
    body.extend_from_slice(&timestamp_ms.to_be_bytes());
    write_varint(&mut body, sequence);
    body.extend_from_slice(payload);

    write_varint(out, body.len() as u64);
    out.extend_from_slice(&body);
}

/// Iterate framed records in a `.crdtlog` file body (the bytes after the
/// header). Stops and returns `Truncated { at_offset }` as soon as a
/// partial record is seen — this is the normal "writer caught mid-append"
/// case (§5 "Crash safety"), not necessarily corruption.
pub fn iterate_log_records(path: &Path, header_len: usize, body: &[u8]) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut cursor = Cursor::new(body);

    loop {
        let record_start = cursor.position();
        if record_start as usize == body.len() {
            break;
        }

        let Some(len) = read_varint(&mut cursor) else {
            return Err(NoteCoveError::Truncated {
                path: path.to_path_buf(),
                at_offset: header_len as u64 + record_start,
            });
        };

        let mut frame = vec![0u8; len as usize];
        if cursor.read_exact(&mut frame).is_err() {
            return Err(NoteCoveError::Truncated {
                path: path.to_path_buf(),
                at_offset: header_len as u64 + record_start,
            });
        }

        if frame.len() < 8 {
            return Err(NoteCoveError::Truncated {
                path: path.to_path_buf(),
                at_offset: header_len as u64 + record_start,
            });
        }
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&frame[0..8]);
        let timestamp_ms = i64::from_be_bytes(ts_bytes);

        let mut seq_cursor = Cursor::new(&frame[8..]);
        let Some(sequence) = read_varint(&mut seq_cursor) else {
            return Err(NoteCoveError::Truncated {
                path: path.to_path_buf(),
                at_offset: header_len as u64 + record_start,
            });
        };
        let payload_start = 8 + seq_cursor.position() as usize;
        let payload = frame[payload_start..].to_vec();

        records.push(LogRecord {
            timestamp_ms,
            sequence,
            payload,
        });
    }

    Ok(records)
}

/// Like [`iterate_log_records`], but a truncated tail is not an error:
/// return whatever complete records precede it, plus the byte offset the
/// truncation starts at. Used by the loader, which treats a truncated
/// tail as "not synced yet" rather than a failure (§4.5, §7).
pub fn iterate_log_records_lenient(
    path: &Path,
    header_len: usize,
    body: &[u8],
) -> (Vec<LogRecord>, Option<u64>) {
    match iterate_log_records(path, header_len, body) {
        Ok(records) => (records, None),
        Err(NoteCoveError::Truncated { at_offset, .. }) => {
            let valid_len = (at_offset - header_len as u64) as usize;
            let records = iterate_log_records(path, header_len, &body[..valid_len])
                .expect("re-parsing a known-valid prefix cannot fail");
            (records, Some(at_offset))
        }
        Err(_) => (Vec::new(), Some(header_len as u64)),
    }
}

/// One entry in an encoded vector clock: an instance's sync position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClockEntryBytes {
    /// Instance the entry describes.
    pub instance_id: String,
    /// Highest contiguous sequence applied from that instance.
    pub sequence: u64,
    /// Byte offset in `filename` right after that record.
    pub offset: u64,
    /// Log filename the record was read from.
    pub filename: String,
}

/// Encode a vector clock entry for the snapshot header: `varint
/// instance_id_len | bytes | varint sequence | varint offset | varint
/// filename_len | bytes`.
pub fn encode_vector_clock_entry(out: &mut Vec<u8>, entry: &VectorClockEntryBytes) {
    let id_bytes = entry.instance_id.as_bytes();
    write_varint(out, id_bytes.len() as u64);
    out.extend_from_slice(id_bytes);
    write_varint(out, entry.sequence);
    write_varint(out, entry.offset);
    let name_bytes = entry.filename.as_bytes();
    write_varint(out, name_bytes.len() as u64);
    out.extend_from_slice(name_bytes);
}

/// Decode one vector clock entry, advancing the cursor.
pub fn decode_vector_clock_entry(cursor: &mut Cursor<&[u8]>) -> Option<VectorClockEntryBytes> {
    let len = read_varint(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).ok()?;
    let instance_id = String::from_utf8(buf).ok()?;
    let sequence = read_varint(cursor)?;
    let offset = read_varint(cursor)?;
    let filename_len = read_varint(cursor)? as usize;
    let mut filename_buf = vec![0u8; filename_len];
    cursor.read_exact(&mut filename_buf).ok()?;
    let filename = String::from_utf8(filename_buf).ok()?;
    Some(VectorClockEntryBytes {
        instance_id,
        sequence,
        offset,
        filename,
    })
}

/// Encode a full vector clock: `varint count` followed by `count`
/// entries.
pub fn encode_vector_clock(out: &mut Vec<u8>, entries: &[VectorClockEntryBytes]) {
    write_varint(out, entries.len() as u64);
    for entry in entries {
        encode_vector_clock_entry(out, entry);
    }
}

/// Decode a full vector clock, advancing the cursor.
pub fn decode_vector_clock(cursor: &mut Cursor<&[u8]>) -> Option<Vec<VectorClockEntryBytes>> {
    let count = read_varint(cursor)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(decode_vector_clock_entry(cursor)?);
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_across_range() {
        for value in [0u64, 1, 127, 128, 300, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut cursor = Cursor::new(buf.as_slice());
            assert_eq!(read_varint(&mut cursor), Some(value));
        }
    }

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf, LOG_MAGIC);
        let path = Path::new("x.crdtlog");
        let header_len = parse_header(path, &buf, LOG_MAGIC).unwrap();
        assert_eq!(header_len, 5);
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, LOG_MAGIC);
        let path = Path::new("x.snapshot");
        let err = parse_header(path, &buf, SNAPSHOT_MAGIC).unwrap_err();
        assert!(matches!(err, NoteCoveError::MagicMismatch { .. }));
    }

    #[test]
    fn log_records_round_trip() {
        let mut body = Vec::new();
        encode_log_record(&mut body, 1000, 1, b"aaa");
        encode_log_record(&mut body, 1001, 2, b"bb");

        let records = iterate_log_records(Path::new("x.crdtlog"), 5, &body).unwrap();
        assert_eq!(
            records,
            vec![
                LogRecord {
                    timestamp_ms: 1000,
                    sequence: 1,
                    payload: b"aaa".to_vec(),
                },
                LogRecord {
                    timestamp_ms: 1001,
                    sequence: 2,
                    payload: b"bb".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn truncated_tail_is_reported_with_offset() {
        let mut body = Vec::new();
        encode_log_record(&mut body, 1000, 1, b"aaa");
        let full_len = body.len();
        // Cut off mid-second-record to simulate a crash during append.
        encode_log_record(&mut body, 1001, 2, b"bb");
        body.truncate(full_len + 3);

        let err = iterate_log_records(Path::new("x.crdtlog"), 5, &body).unwrap_err();
        match err {
            NoteCoveError::Truncated { at_offset, .. } => {
                assert_eq!(at_offset, 5 + full_len as u64);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn vector_clock_round_trips() {
        let entries = vec![
            VectorClockEntryBytes {
                instance_id: "instance-a".to_string(),
                sequence: 42,
                offset: 1000,
                filename: "1000_instance-a.crdtlog".to_string(),
            },
            VectorClockEntryBytes {
                instance_id: "b".to_string(),
                sequence: 7,
                offset: 50,
                filename: "900_b.crdtlog".to_string(),
            },
        ];
        let mut buf = Vec::new();
        encode_vector_clock(&mut buf, &entries);

        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(decode_vector_clock(&mut cursor), Some(entries));
    }

    #[test]
    fn never_splits_a_record_across_rotation_boundary() {
        // A record framed whole must report its own total byte length so
        // log_writer can decide whether it fits before the rotation
        // threshold without ever emitting a partial record.
        let mut body = Vec::new();
        encode_log_record(&mut body, 1, 1, b"payload");
        let mut len_cursor = Cursor::new(body.as_slice());
        let framed_len = read_varint(&mut len_cursor).unwrap();
        assert_eq!(body.len() as u64, len_cursor.position() + framed_len);
    }
}
