use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use converse_sdk::Event;
use schemars::{Schema, schema_for};
use tracing::info;

use crate::{
    config::RuntimeConfig,
    dialog::{DialogSession, Flow},
    distributed::BroadcastMessage,
    events::StoredEvent,
};

/// The entry point invoked by `main.rs` for `Commands::Schema`. Returns the
/// files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let schemas: [(&str, Schema); 6] = [
        ("flow", schema_for!(Flow)),
        ("event", schema_for!(Event)),
        ("stored-event", schema_for!(StoredEvent)),
        ("dialog-session", schema_for!(DialogSession)),
        ("broadcast", schema_for!(BroadcastMessage)),
        ("runtime-config", schema_for!(RuntimeConfig)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, schema) in schemas {
        let path = out_dir.join(format!("{name}.schema.json"));
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "schema written");
        written.push(path);
    }
    Ok(written)
}
