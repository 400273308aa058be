//! Item catalog: the table of rentable things, loaded once at startup.
//!
//! Columns `itemId,description,units`, resolved by header name. `description` is optional.

use std::path::Path;

use crate::model::RentalItem;
use crate::store::StoreError;
use crate::store::csv::{read_rows, Columns};

const REQUIRED: [&str; 2] = ["itemId", "units"];

/// Parse the catalog at `path`. A missing file yields an empty catalog.
pub async fn load_catalog(path: &Path) -> Result<Vec<RentalItem>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_catalog(&bytes).await
}

pub async fn parse_catalog(bytes: &[u8]) -> Result<Vec<RentalItem>, StoreError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    let (columns, rows) = read_rows(bytes, &REQUIRED).await?;
    let mut items = Vec::with_capacity(rows.len());
    for (line, record) in &rows {
        items.push(parse_item(&columns, record, *line)?);
    }
    Ok(items)
}

fn parse_item(columns: &Columns, record: &csv_async::StringRecord, row: usize) -> Result<RentalItem, StoreError> {
    let id = columns.require(record, "itemId", row)?;
    let units_cell = columns.require(record, "units", row)?;
    let units: u32 = units_cell
        .parse()
        .map_err(|_| StoreError::format(Some(row), format!("units must be a non-negative integer: {units_cell}")))?;
    let mut item = RentalItem::new(id, units);
    if let Some(description) = columns.get(record, "description").filter(|d| !d.is_empty()) {
        item = item.with_description(description);
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_items() {
        let items = parse_catalog(b"itemId,description,units\nTent-A,Two-person tent,1\nKayak,,3\n")
            .await
            .unwrap();
        assert_eq!(
            items,
            vec![
                RentalItem::new("Tent-A", 1).with_description("Two-person tent"),
                RentalItem::new("Kayak", 3),
            ]
        );
    }

    #[tokio::test]
    async fn description_column_is_optional() {
        let items = parse_catalog(b"units,item_id\n0,Broken-Bike\n").await.unwrap();
        assert_eq!(items, vec![RentalItem::new("Broken-Bike", 0)]);
    }

    #[tokio::test]
    async fn negative_units_rejected() {
        let err = parse_catalog(b"itemId,units\nTent-A,-1\n").await.unwrap_err();
        assert!(matches!(err, StoreError::Format { row: Some(2), .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let path = std::env::temp_dir().join("rentledger_test_catalog_missing.csv");
        let _ = std::fs::remove_file(&path);
        assert!(load_catalog(&path).await.unwrap().is_empty());
    }
}
