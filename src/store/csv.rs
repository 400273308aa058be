use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv_async::{AsyncReaderBuilder, AsyncWriter, StringRecord, Trim};
use futures::StreamExt;
use ulid::Ulid;

use crate::model::{BookingRecord, BookingStatus, Ms};

use super::{check_range, read_if_exists, write_atomic, RecordStore, StoreError};

/// Header written on save. On load columns are found by name, so a spreadsheet with
/// reordered or extra columns still reads.
pub const COLUMNS: [&str; 7] = ["bookingId", "itemId", "requester", "start", "end", "status", "note"];

const REQUIRED: [&str; 6] = ["bookingId", "itemId", "requester", "start", "end", "status"];

/// Header name → position, matched case-insensitively and ignoring spaces/underscores.
pub(crate) struct Columns {
    index: HashMap<String, usize>,
}

fn normalize(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

impl Columns {
    pub(crate) fn from_headers(headers: &StringRecord, required: &[&str]) -> Result<Self, StoreError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (normalize(h), i))
            .collect();
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !index.contains_key(&normalize(name)))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::format(None, format!("missing columns: {}", missing.join(", "))));
        }
        Ok(Self { index })
    }

    /// Cell for `name`, or `None` if the column is absent or the row is short.
    pub(crate) fn get<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.index.get(&normalize(name)).and_then(|&i| record.get(i))
    }

    pub(crate) fn require<'r>(&self, record: &'r StringRecord, name: &str, row: usize) -> Result<&'r str, StoreError> {
        match self.get(record, name) {
            Some(cell) if !cell.is_empty() => Ok(cell),
            _ => Err(StoreError::format(Some(row), format!("{name} is empty"))),
        }
    }
}

pub(crate) fn csv_error(row: Option<usize>) -> impl Fn(csv_async::Error) -> StoreError {
    move |e| StoreError::format(row, e.to_string())
}

/// Read every data row of a CSV byte buffer with header-resolved columns. Each row comes
/// with the file line it starts on, for error messages.
pub(crate) async fn read_rows(
    bytes: &[u8],
    required: &[&str],
) -> Result<(Columns, Vec<(usize, StringRecord)>), StoreError> {
    let mut reader = AsyncReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .create_reader(bytes);
    let headers = reader.headers().await.map_err(csv_error(None))?.clone();
    let columns = Columns::from_headers(&headers, required)?;

    let mut rows = Vec::new();
    let mut records = reader.records();
    let mut line = 1usize;
    while let Some(record) = records.next().await {
        let record = record.map_err(csv_error(Some(line + 1)))?;
        // The reader skips empty lines and quoted cells can span several, so ask it.
        line = record.position().map_or(line + 1, |p| p.line() as usize);
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        rows.push((line, record));
    }
    Ok((columns, rows))
}

fn parse_ms(cell: &str, name: &str, row: usize) -> Result<Ms, StoreError> {
    cell.parse()
        .map_err(|_| StoreError::format(Some(row), format!("{name} is not a millisecond timestamp: {cell}")))
}

fn parse_record(columns: &Columns, record: &StringRecord, row: usize) -> Result<BookingRecord, StoreError> {
    let id_cell = columns.require(record, "bookingId", row)?;
    let id = Ulid::from_string(id_cell)
        .map_err(|e| StoreError::format(Some(row), format!("bad bookingId {id_cell}: {e}")))?;
    let start = parse_ms(columns.require(record, "start", row)?, "start", row)?;
    let end = parse_ms(columns.require(record, "end", row)?, "end", row)?;
    // A blank status cell is a request nobody has acted on yet.
    let status = match columns.get(record, "status").unwrap_or("") {
        "" => BookingStatus::Pending,
        cell => BookingStatus::parse(cell)
            .ok_or_else(|| StoreError::format(Some(row), format!("unknown status {cell}")))?,
    };
    let note = columns
        .get(record, "note")
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    let record = BookingRecord {
        id,
        item_id: columns.require(record, "itemId", row)?.to_string(),
        requester: columns.require(record, "requester", row)?.to_string(),
        start,
        end,
        status,
        note,
    };
    check_range(&record, row)?;
    Ok(record)
}

/// The spreadsheet datastore: a flat CSV table, one row per booking.
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for CsvStore {
    async fn load(&self) -> Result<Vec<BookingRecord>, StoreError> {
        let Some(bytes) = read_if_exists(&self.path).await? else {
            return Ok(Vec::new());
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        let (columns, rows) = read_rows(&bytes, &REQUIRED).await?;
        rows.iter()
            .map(|(line, record)| parse_record(&columns, record, *line))
            .collect()
    }

    async fn save(&self, records: &[BookingRecord]) -> Result<(), StoreError> {
        let mut buf: Vec<u8> = Vec::with_capacity(64 + records.len() * 96);
        {
            let mut writer = AsyncWriter::from_writer(&mut buf);
            writer.write_record(&COLUMNS).await.map_err(csv_error(None))?;
            for (i, r) in records.iter().enumerate() {
                let row = [
                    r.id.to_string(),
                    r.item_id.clone(),
                    r.requester.clone(),
                    r.start.to_string(),
                    r.end.to_string(),
                    r.status.to_string(),
                    r.note.clone().unwrap_or_default(),
                ];
                writer.write_record(&row).await.map_err(csv_error(Some(i + 2)))?;
            }
            writer.flush().await?;
        }
        write_atomic(&self.path, &buf).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn shared(&self) -> bool {
        true
    }
}
