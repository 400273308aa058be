use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::model::BookingRecord;

use super::{check_range, read_if_exists, write_atomic, RecordStore, StoreError};

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &BookingRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Decode frames until the input runs out or a frame fails its length or CRC check.
/// Returns the good records and the number of trailing bytes that were discarded.
fn decode_records(bytes: &[u8]) -> (Vec<BookingRecord>, usize) {
    let mut reader = Cursor::new(bytes);
    let mut records = Vec::new();
    let mut good_end = 0usize;

    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > bytes.len() {
            break; // garbage length
        }

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            break; // truncated
        }

        let mut crc_buf = [0u8; 4];
        if reader.read_exact(&mut crc_buf).is_err() {
            break; // truncated
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<BookingRecord>(&payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        good_end = reader.position() as usize;
    }

    (records, bytes.len() - good_end)
}

/// Binary snapshot file: one `[u32: len][bincode: BookingRecord][u32: crc32]` frame per record.
///
/// The whole file is rewritten on every save. A damaged tail (torn disk write, bit rot)
/// is dropped on load and everything before it is kept.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for SnapshotStore {
    async fn load(&self) -> Result<Vec<BookingRecord>, StoreError> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(Vec::new());
        };
        let (records, discarded) = decode_records(&bytes);
        if discarded > 0 {
            warn!(
                "{}: dropped {discarded} unreadable trailing bytes after {} records",
                self.path.display(),
                records.len()
            );
        }
        for (i, record) in records.iter().enumerate() {
            check_range(record, i + 1)?;
        }
        Ok(records)
    }

    async fn save(&self, records: &[BookingRecord]) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(records.len() * 96);
        for record in records {
            encode_record(&mut buf, record)?;
        }
        write_atomic(&self.path, &buf).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("snapshot:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;
    use std::collections::HashSet;
    use std::fs;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rentledger_test_snapshot");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn record(item: &str, start: i64, status: BookingStatus) -> BookingRecord {
        BookingRecord {
            id: Ulid::new(),
            item_id: item.into(),
            requester: "alice".into(),
            start,
            end: start + 1000,
            status,
            note: Some("ring the bell".into()),
        }
    }

    #[tokio::test]
    async fn out_of_range_rows_rejected() {
        let path = tmp_path("out_of_range.snap");
        let store = SnapshotStore::new(&path);
        let mut wild = record("tent", 0, BookingStatus::Confirmed);
        wild.start = i64::MIN;
        wild.end = i64::MAX;
        store.save(&[record("tent", 0, BookingStatus::Confirmed), wild]).await.unwrap();
        assert!(matches!(store.load().await, Err(StoreError::Format { row: Some(2), .. })));
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = SnapshotStore::new(tmp_path("save_and_load.snap"));
        let records = vec![
            record("tent", 0, BookingStatus::Confirmed),
            record("kayak", 500, BookingStatus::Cancelled),
            record("tent", 2000, BookingStatus::Confirmed),
        ];
        store.save(&records).await.unwrap();

        let loaded = store.load().await.unwrap();
        let expected: HashSet<_> = records.iter().map(|r| r.id).collect();
        let got: HashSet<_> = loaded.iter().map(|r| r.id).collect();
        assert_eq!(expected, got);
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let store = SnapshotStore::new(tmp_path("missing.snap"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_table() {
        let store = SnapshotStore::new(tmp_path("replace.snap"));
        store
            .save(&[record("tent", 0, BookingStatus::Confirmed), record("tent", 5000, BookingStatus::Confirmed)])
            .await
            .unwrap();
        let only = record("kayak", 0, BookingStatus::Confirmed);
        store.save(std::slice::from_ref(&only)).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![only]);
        assert!(!store.path().with_extension("snap.tmp").exists());
    }

    #[tokio::test]
    async fn load_drops_truncated_tail() {
        let path = tmp_path("truncated.snap");
        let store = SnapshotStore::new(&path);
        let first = record("tent", 0, BookingStatus::Confirmed);
        store.save(std::slice::from_ref(&first)).await.unwrap();

        // Append garbage to simulate a torn second frame
        {
            let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(store.load().await.unwrap(), vec![first]);
    }

    #[test]
    fn decode_stops_at_bad_crc() {
        let good = record("tent", 0, BookingStatus::Confirmed);
        let mut buf = Vec::new();
        encode_record(&mut buf, &good).unwrap();
        let good_len = buf.len();

        let payload = bincode::serialize(&record("tent", 10, BookingStatus::Confirmed)).unwrap();
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let (records, discarded) = decode_records(&buf);
        assert_eq!(records, vec![good]);
        assert_eq!(discarded, buf.len() - good_len);
    }

    #[test]
    fn decode_empty() {
        let (records, discarded) = decode_records(&[]);
        assert!(records.is_empty());
        assert_eq!(discarded, 0);
    }
}
