use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerError};
use crate::limits::*;
use crate::model::*;
use crate::observability;

/// A structured booking intent. One JSON object per line on the socket, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Book {
        item: ItemId,
        requester: String,
        start: Ms,
        end: Ms,
        #[serde(default)]
        note: Option<String>,
    },
    Cancel {
        #[serde(rename = "bookingId")]
        booking_id: BookingId,
        requester: String,
    },
    Query {
        item: ItemId,
        start: Ms,
        end: Ms,
    },
    /// Bookings filtered by requester and/or item. With neither filter, the item catalog.
    List {
        #[serde(default)]
        requester: Option<String>,
        #[serde(default)]
        item: Option<ItemId>,
    },
}

fn check_item_id(item: &str) -> Result<(), String> {
    if item.trim().is_empty() {
        return Err("item must not be empty".into());
    }
    if item.len() > MAX_ITEM_ID_LEN {
        return Err(format!("item longer than {MAX_ITEM_ID_LEN} bytes"));
    }
    Ok(())
}

fn check_requester(requester: &str) -> Result<(), String> {
    if requester.trim().is_empty() {
        return Err("requester must not be empty".into());
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(format!("requester longer than {MAX_REQUESTER_LEN} bytes"));
    }
    Ok(())
}

impl Command {
    pub fn from_json(line: &str) -> Result<Command, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Shape checks that need no ledger state. Ranges are left to the ledger.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Command::Book { item, requester, note, .. } => {
                check_item_id(item)?;
                check_requester(requester)?;
                if let Some(note) = note
                    && note.len() > MAX_NOTE_LEN
                {
                    return Err(format!("note longer than {MAX_NOTE_LEN} bytes"));
                }
                Ok(())
            }
            Command::Cancel { requester, .. } => check_requester(requester),
            Command::Query { item, .. } => check_item_id(item),
            Command::List { requester, item } => {
                if let Some(requester) = requester {
                    check_requester(requester)?;
                }
                if let Some(item) = item {
                    check_item_id(item)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidRange,
    Conflict,
    NotFound,
    NotOwner,
    InvalidRequest,
    LimitExceeded,
    Timeout,
    Unauthorized,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRange => "InvalidRange",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::NotOwner => "NotOwner",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::LimitExceeded => "LimitExceeded",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Unauthorized => "Unauthorized",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to one command line. Absent fields are omitted from the JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows: Option<Vec<Span>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookings: Option<Vec<BookingRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(code),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Serialize as a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"InvalidRequest","message":"{e}"}}"#))
    }

    fn status_label(&self) -> &'static str {
        match self.error {
            Some(code) => code.as_str(),
            None => "ok",
        }
    }
}

impl From<LedgerError> for Response {
    fn from(e: LedgerError) -> Self {
        let code = match &e {
            LedgerError::InvalidRange { .. } => ErrorCode::InvalidRange,
            LedgerError::Conflict { .. } | LedgerError::StatusMoved { .. } => ErrorCode::Conflict,
            LedgerError::UnknownItem(_) | LedgerError::NotFound(_) => ErrorCode::NotFound,
            LedgerError::NotOwner(_) => ErrorCode::NotOwner,
            LedgerError::AlreadyExists(_) => ErrorCode::InvalidRequest,
            LedgerError::LimitExceeded(_) => ErrorCode::LimitExceeded,
        };
        Response::error(code, e.to_string())
    }
}

fn truncate(mut records: Vec<BookingRecord>) -> (Vec<BookingRecord>, Option<String>) {
    if records.len() > MAX_LIST_RESULTS {
        let total = records.len();
        records.truncate(MAX_LIST_RESULTS);
        (records, Some(format!("showing first {MAX_LIST_RESULTS} of {total} bookings")))
    } else {
        (records, None)
    }
}

/// Turns commands into ledger calls and ledger results into responses.
/// Holds no state of its own besides the admin list; never touches the store.
pub struct Dispatcher {
    ledger: Arc<Ledger>,
    admins: HashSet<String>,
    command_timeout: Duration,
}

impl Dispatcher {
    pub fn new(ledger: Arc<Ledger>, admins: impl IntoIterator<Item = String>, command_timeout: Duration) -> Self {
        Self {
            ledger,
            admins: admins.into_iter().collect(),
            command_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn is_admin(&self, requester: &str) -> bool {
        self.admins.contains(requester)
    }

    /// Validate, run under the command timeout, and record metrics.
    ///
    /// A command that times out has not committed: the ledger applies a mutation only
    /// after it holds the item lock, with no await between the capacity check and apply.
    pub async fn dispatch(&self, cmd: Command) -> Response {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        debug!("dispatch {cmd:?}");

        let response = match cmd.validate() {
            Err(reason) => Response::error(ErrorCode::InvalidRequest, reason),
            Ok(()) => match tokio::time::timeout(self.command_timeout, self.execute(cmd)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => e.into(),
                Err(_) => Response::error(
                    ErrorCode::Timeout,
                    format!("{label} did not finish within {}ms", self.command_timeout.as_millis()),
                ),
            },
        };

        metrics::counter!(
            observability::COMMANDS_TOTAL,
            "command" => label,
            "status" => response.status_label()
        )
        .increment(1);
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        response
    }

    async fn execute(&self, cmd: Command) -> Result<Response, LedgerError> {
        match cmd {
            Command::Book {
                item,
                requester,
                start,
                end,
                note,
            } => {
                let record = self.ledger.create_booking(&item, &requester, start, end, note).await?;
                info!("{requester} booked {item} [{start}, {end}) as {}", record.id);
                Ok(Response {
                    booking_id: Some(record.id),
                    ..Response::ok()
                }
                .with_message(format!("booked {item} for {requester}")))
            }
            Command::Cancel { booking_id, requester } => {
                let override_owner = self.is_admin(&requester);
                let record = self
                    .ledger
                    .cancel_booking(booking_id, &requester, override_owner)
                    .await?;
                info!("{requester} cancelled {booking_id} on {}", record.item_id);
                Ok(Response {
                    booking_id: Some(record.id),
                    ..Response::ok()
                }
                .with_message(format!("cancelled booking on {}", record.item_id)))
            }
            Command::Query { item, start, end } => {
                let (available, windows) = self.ledger.availability(&item, start, end).await?;
                Ok(Response {
                    available: Some(available),
                    windows: Some(windows),
                    ..Response::ok()
                })
            }
            Command::List { requester, item } => {
                let records = match (requester, item) {
                    (None, None) => {
                        return Ok(Response {
                            items: Some(self.ledger.list_items().await),
                            ..Response::ok()
                        });
                    }
                    (Some(requester), None) => self.ledger.bookings_for(&requester).await,
                    (None, Some(item)) => self.ledger.bookings_on(&item).await?,
                    (Some(requester), Some(item)) => {
                        let mut records = self.ledger.bookings_on(&item).await?;
                        records.retain(|r| r.requester == requester);
                        records
                    }
                };
                let (records, note) = truncate(records);
                let mut response = Response {
                    bookings: Some(records),
                    ..Response::ok()
                };
                response.message = note;
                Ok(response)
            }
        }
    }
}
