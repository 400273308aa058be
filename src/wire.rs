use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::auth::TokenAuth;
use crate::dispatch::{Command, Dispatcher, ErrorCode, Response};
use crate::limits::MAX_LINE_LEN;
use crate::model::{ItemId, LedgerEvent};
use crate::notify::NotifyHub;
use crate::observability;

/// Events queued for one connection before forwarders start waiting.
const EVENT_BUFFER: usize = 256;

/// Frames that act on the session rather than the ledger.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SessionFrame {
    Auth { token: String },
    Watch { item: ItemId },
    Unwatch { item: ItemId },
}

fn is_session_action(action: &str) -> bool {
    matches!(action, "auth" | "watch" | "unwatch")
}

fn codec_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(io::ErrorKind::InvalidData, "line too long"),
    }
}

/// Pump events from an item's broadcast channel into the connection's queue until the
/// session drops `stop`, then release the channel if nobody else listens on it.
fn spawn_forwarder(
    hub: Arc<NotifyHub>,
    mut rx: broadcast::Receiver<LedgerEvent>,
    tx: mpsc::Sender<LedgerEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("watcher fell behind, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        drop(rx);
        hub.prune();
    });
}

struct Session {
    dispatcher: Arc<Dispatcher>,
    auth: TokenAuth,
    authenticated: bool,
    /// Dropping an item's sender stops its forwarder.
    watches: HashMap<ItemId, oneshot::Sender<()>>,
    events: mpsc::Sender<LedgerEvent>,
}

impl Session {
    /// `None` for blank lines, which get no reply.
    async fn handle_line(&mut self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return Some(Response::error(ErrorCode::InvalidRequest, format!("malformed JSON: {e}"))),
        };
        let action = value.get("action").and_then(|a| a.as_str()).unwrap_or_default();

        if is_session_action(action) {
            return Some(match SessionFrame::deserialize(&value) {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => Response::error(ErrorCode::InvalidRequest, e.to_string()),
            });
        }

        if !self.authenticated {
            return Some(Response::error(ErrorCode::Unauthorized, "authenticate first"));
        }

        Some(match Command::deserialize(&value) {
            Ok(cmd) => self.dispatcher.dispatch(cmd).await,
            Err(e) => Response::error(ErrorCode::InvalidRequest, e.to_string()),
        })
    }

    fn handle_frame(&mut self, frame: SessionFrame) -> Response {
        match frame {
            SessionFrame::Auth { token } => {
                if self.auth.verify(&token) {
                    self.authenticated = true;
                    Response::ok().with_message("authenticated")
                } else {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    warn!("rejected session token");
                    Response::error(ErrorCode::Unauthorized, "bad token")
                }
            }
            _ if !self.authenticated => Response::error(ErrorCode::Unauthorized, "authenticate first"),
            SessionFrame::Watch { item } => {
                if self.dispatcher.ledger().get_item(&item).is_none() {
                    return Response::error(ErrorCode::NotFound, format!("unknown item: {item}"));
                }
                if !self.watches.contains_key(&item) {
                    let hub = self.dispatcher.ledger().notify.clone();
                    let rx = hub.subscribe(&item);
                    let (stop_tx, stop_rx) = oneshot::channel();
                    spawn_forwarder(hub, rx, self.events.clone(), stop_rx);
                    self.watches.insert(item.clone(), stop_tx);
                }
                Response::ok().with_message(format!("watching {item}"))
            }
            SessionFrame::Unwatch { item } => match self.watches.remove(&item) {
                Some(_) => Response::ok().with_message(format!("stopped watching {item}")),
                None => Response::error(ErrorCode::NotFound, format!("not watching {item}")),
            },
        }
    }
}

/// Serve one connection: newline-delimited JSON commands in, one JSON response line out
/// per command. Watched items' events are interleaved as they commit. A line longer than
/// `MAX_LINE_LEN` gets an error reply and ends the session.
pub async fn process_connection<S>(socket: S, dispatcher: Arc<Dispatcher>, auth: TokenAuth) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut session = Session {
        dispatcher,
        authenticated: !auth.required(),
        auth,
        watches: HashMap::new(),
        events: events_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let response = Response::error(
                            ErrorCode::InvalidRequest,
                            format!("line longer than {MAX_LINE_LEN} bytes"),
                        );
                        framed.send(response.to_line()).await.map_err(codec_io)?;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                if let Some(response) = session.handle_line(&line).await {
                    framed.send(response.to_line()).await.map_err(codec_io)?;
                }
            }
            Some(event) = events_rx.recv() => {
                match serde_json::to_string(&event) {
                    Ok(line) => framed.send(line).await.map_err(codec_io)?,
                    Err(e) => warn!("failed to encode event: {e}"),
                }
            }
        }
    }

    debug!("connection closed with {} watches", session.watches.len());
    Ok(())
}
