//! JSON-lines progress events on stdout.
//!
//! Off by default. The worker binary turns it on with `--json` so a CI runner
//! can follow a shard without scraping log lines.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use shardrun_core::{ItemStatus, ShardId, ShardReport, WorkItem};

static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_json_mode() {
    ENABLED.store(true, Ordering::SeqCst);
}

pub fn is_json_mode() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    ShardStarted,
    ItemSucceeded,
    ItemRetryable,
    ItemFailed,
    ShardCompleted,
    ShardCancelled,
    Error,
}

/// One line of output. `shard_id` is absent only for errors raised before a
/// shard was loaded.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<ShardId>,
    pub data: Value,
}

impl JsonEvent {
    fn now(event: JsonEventType, shard_id: Option<ShardId>, data: Value) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            shard_id,
            data,
        }
    }

    /// Write the event to `out` as a single line.
    pub fn write_to(&self, mut out: impl Write) -> io::Result<()> {
        serde_json::to_writer(&mut out, self)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

fn emit(event: JsonEventType, shard_id: Option<ShardId>, data: Value) {
    if !is_json_mode() {
        return;
    }
    // stdout going away must not take the shard down with it
    let _ = JsonEvent::now(event, shard_id, data).write_to(io::stdout().lock());
}

pub fn emit_shard_started(shard_id: ShardId, item_count: usize) {
    emit(
        JsonEventType::ShardStarted,
        Some(shard_id),
        json!({ "item_count": item_count }),
    );
}

/// Emit the terminal event for one item. Pending items emit nothing.
pub fn emit_item_finished(shard_id: ShardId, item: &WorkItem) {
    let event = match item.status() {
        ItemStatus::Success => JsonEventType::ItemSucceeded,
        ItemStatus::Retryable => JsonEventType::ItemRetryable,
        ItemStatus::Failed => JsonEventType::ItemFailed,
        ItemStatus::Pending => return,
    };
    emit(
        event,
        Some(shard_id),
        json!({
            "item_id": item.id,
            "error": item.error(),
            "artifact": item.artifact(),
        }),
    );
}

pub fn emit_shard_finished(report: &ShardReport) {
    let event = if report.cancelled {
        JsonEventType::ShardCancelled
    } else {
        JsonEventType::ShardCompleted
    };
    emit(
        event,
        Some(report.shard_id),
        json!({
            "expected_items": report.expected_items,
            "reported_items": report.items.len(),
            "counts": report.counts,
        }),
    );
}

pub fn emit_error(message: &str) {
    emit(JsonEventType::Error, None, json!({ "message": message }));
}
