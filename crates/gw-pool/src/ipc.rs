//! Wire protocol between a `WorkerHandle` (in the gateway's main process)
//! and the worker it owns, which runs as a separate OS process reachable
//! over that child's stdin/stdout. One line of JSON per message; stdin
//! carries `WireCommand`s downstream, stdout carries `WireEvent`s back
//! upstream, in the same order the commands that produced them were
//! sent — the worker is single-job-at-a-time, so replies never interleave.

use std::io::Write;

use gw_types::{CompletionStatus, GenerationRequest, ModelDescriptor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireCommand {
    Generate {
        request_id: Uuid,
        request: GenerationRequest,
        descriptor: ModelDescriptor,
    },
    Embed {
        descriptor: ModelDescriptor,
        text: String,
    },
    /// Best-effort: interrupts the generation in flight, if `request_id`
    /// still matches it. Arrives concurrently with an in-progress
    /// `Generate`, so the worker reads its stdin on a thread dedicated to
    /// that purpose rather than the one driving the backend.
    Cancel {
        request_id: Uuid,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireEvent {
    Token(String),
    Done(CompletionStatus),
    Error(String),
    EmbedOk(Vec<f32>),
    EmbedErr(String),
}

pub fn write_line<W: Write, T: Serialize>(mut w: W, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut w, value)?;
    w.write_all(b"\n")?;
    w.flush()
}
