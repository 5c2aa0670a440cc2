//! `cub hook <event-name>`: read a hook envelope from stdin and append
//! the classified forensic event, if any (spec §4.10).

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};

use cub_core::forensics::{ForensicsWriter, HookEnvelope};

pub fn run(ledger_root: PathBuf, event_name: &str) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).context("reading hook envelope from stdin")?;

    let envelope: HookEnvelope = serde_json::from_str(&raw).context("parsing hook envelope")?;
    if envelope.hook_event_name != event_name {
        tracing::warn!(arg = event_name, envelope = %envelope.hook_event_name, "hook event name mismatch");
    }

    ForensicsWriter::new(ledger_root).handle_hook(&envelope).context("recording hook event")?;
    Ok(())
}
