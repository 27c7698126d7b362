//! Line-oriented command surface: one SQL-shaped statement in, one JSON
//! reply out.

use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::{EngineError, Scheduler};
use crate::model::{Event, Slot, format_hhmm};
use crate::observability::{self, command_label};
use crate::sql::{Command, SqlError, parse_sql};
use crate::store::{CatalogStore, ScheduleStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: &'static str,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Reply {
    fn ok(data: Value) -> Self {
        Self {
            status: "ok",
            code: 200,
            message: None,
            data: Some(data),
        }
    }

    fn bad_request(e: &SqlError) -> Self {
        Self {
            status: "bad_request",
            code: 400,
            message: Some(e.to_string()),
            data: None,
        }
    }

    fn from_error(e: &EngineError) -> Self {
        let code = match e {
            EngineError::NotAcceptable(_) => 406,
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyExists(_) => 409,
            EngineError::LimitExceeded(_) => 413,
            EngineError::Repository(_) => 500,
        };
        Self {
            status: e.kind(),
            code,
            message: Some(e.to_string()),
            data: None,
        }
    }
}

fn slot_json(slot: &Slot) -> Value {
    json!({
        "id": slot.id,
        "worker_id": slot.worker_id,
        "day": slot.day.to_string(),
        "on_date": slot.date,
        "from": format_hhmm(slot.span.start),
        "to": format_hhmm(slot.span.end),
    })
}

fn event_json(event: &Event) -> Value {
    json!({
        "id": event.id,
        "worker_id": event.worker_id,
        "patient_id": event.patient_id,
        "on_date": event.date,
        "from": format_hhmm(event.span.start),
        "to": format_hhmm(event.span.end),
        "title": event.title,
        "location": event.location,
    })
}

pub struct Console<S> {
    scheduler: Scheduler<S>,
}

impl<S: ScheduleStore + CatalogStore> Console<S> {
    pub fn new(scheduler: Scheduler<S>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    /// Parse and run one command.
    pub async fn execute(&self, line: &str) -> Reply {
        let cmd = match parse_sql(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::debug!("rejected command {line:?}: {e}");
                metrics::counter!(observability::COMMANDS_TOTAL, "command" => "unparsed", "status" => "bad_request")
                    .increment(1);
                return Reply::bad_request(&e);
            }
        };

        let label = command_label(&cmd);
        let started = Instant::now();
        let reply = match self.dispatch(cmd).await {
            Ok(data) => Reply::ok(data),
            Err(e) => Reply::from_error(&e),
        };
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => reply.status)
            .increment(1);
        reply
    }

    async fn dispatch(&self, cmd: Command) -> Result<Value, EngineError> {
        let scheduler = &self.scheduler;
        match cmd {
            Command::InsertSlots { slots } => {
                // Rows apply in order; the first failure stops the rest.
                let mut added = Vec::with_capacity(slots.len());
                for (worker_id, anchor, from) in slots {
                    added.push(slot_json(&scheduler.add_slot(worker_id, anchor, from).await?));
                }
                Ok(json!({ "slots": added }))
            }
            Command::DeleteSlot { id } => {
                let slot = scheduler.remove_slot(id).await?;
                Ok(json!({ "slot": slot_json(&slot) }))
            }
            Command::DeleteWorker { id } => {
                let slots_removed = scheduler.remove_worker(id).await?;
                Ok(json!({ "worker_id": id, "slots_removed": slots_removed }))
            }
            Command::InsertEvent { draft } => {
                let event = scheduler.create_event(draft).await?;
                Ok(json!({ "event": event_json(&event) }))
            }
            Command::Reschedule { event_id, update } => {
                let (event, plan) = scheduler.update_event(event_id, &update).await?;
                Ok(json!({ "event": event_json(&event), "plan": plan }))
            }
            Command::DeleteEvent { id } => {
                let event = scheduler.delete_event(id).await?;
                Ok(json!({ "event": event_json(&event) }))
            }
            Command::SelectAvailability {
                worker_id,
                date,
                from,
                to,
            } => {
                let open = scheduler.open_slots(worker_id, date, from, to).await?;
                let slots: Vec<Value> = open.iter().map(slot_json).collect();
                Ok(json!({ "slots": slots }))
            }
            Command::SelectReserve {
                worker_id,
                date,
                from,
                to,
            } => {
                let slot_ids = scheduler.check_and_reserve(worker_id, date, from, to).await?;
                Ok(json!({ "slot_ids": slot_ids }))
            }
            Command::SelectSchedule { event_id } => {
                let (event, held) = scheduler.event_slots(event_id).await?;
                let slots: Vec<Value> = held.iter().map(slot_json).collect();
                Ok(json!({ "event": event_json(&event), "slots": slots }))
            }
        }
    }

    /// Run every command line from `input`, writing one JSON reply per line.
    /// Blank lines and `--` comments are skipped. Returns the number of
    /// commands run.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with("--") {
                continue;
            }
            let reply = self.execute(line).await;
            let mut encoded = serde_json::to_vec(&reply)?;
            encoded.push(b'\n');
            output.write_all(&encoded).await?;
            output.flush().await?;
            count += 1;
        }
        Ok(count)
    }
}
