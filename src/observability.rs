use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: console commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "carewindow_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "carewindow_command_duration_seconds";

/// Counter: continuity checks for a booking. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "carewindow_reservations_total";

/// Counter: delta plans computed for reschedules. Labels: outcome.
pub const PLANS_TOTAL: &str = "carewindow_plans_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carewindow_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carewindow_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: outcome.
pub const WAL_COMPACTIONS_TOTAL: &str = "carewindow_wal_compactions_total";

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

/// `ok` or the error's kind.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlots { .. } => "insert_slots",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::DeleteWorker { .. } => "delete_worker",
        Command::InsertEvent { .. } => "insert_event",
        Command::Reschedule { .. } => "reschedule",
        Command::DeleteEvent { .. } => "delete_event",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReserve { .. } => "select_reserve",
        Command::SelectSchedule { .. } => "select_schedule",
    }
}
