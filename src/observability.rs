use std::net::SocketAddr;

use crate::dispatch::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands dispatched. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "rentledger_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "rentledger_command_duration_seconds";

/// Counter: bookings confirmed.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "rentledger_bookings_confirmed_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "rentledger_bookings_cancelled_total";

/// Counter: other status moves (issued, delivered, back to pending).
pub const STATUS_CHANGES_TOTAL: &str = "rentledger_status_changes_total";

/// Counter: status edits picked up from the shared table.
pub const TABLE_EDITS_TOTAL: &str = "rentledger_table_edits_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentledger_connections_rejected_total";

/// Counter: failed session auth attempts.
pub const AUTH_FAILURES_TOTAL: &str = "rentledger_auth_failures_total";

/// Histogram: flush duration in seconds (snapshot + save, retries included).
pub const FLUSH_DURATION_SECONDS: &str = "rentledger_flush_duration_seconds";

/// Histogram: records written per flush.
pub const FLUSH_RECORDS: &str = "rentledger_flush_records";

/// Counter: individual save attempts that failed.
pub const FLUSH_FAILURES_TOTAL: &str = "rentledger_flush_failures_total";

/// Gauge: 1 while the store is unreachable and the ledger runs from memory only.
pub const STORE_DEGRADED: &str = "rentledger_store_degraded";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Book { .. } => "book",
        Command::Cancel { .. } => "cancel",
        Command::Query { .. } => "query",
        Command::List { .. } => "list",
    }
}
