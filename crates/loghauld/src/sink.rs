//! Stdout sink: one JSON object per line.

use std::io::Write;

use anyhow::{Context, Result};

use loghaul_core::message::DecodedMessage;
use loghaul_services::ProcessedMessageSink;

#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl ProcessedMessageSink for JsonLinesSink {
    fn write(&self, message: &DecodedMessage) -> Result<()> {
        let line = serde_json::to_string(message).context("failed to serialize message")?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}").context("failed to write message to stdout")
    }
}
