//! Structured build-event log: JSON records, one per line, written when a
//! log file is active.  Consumers are tools that want to know *why* nodes
//! rebuilt (newNode, inputSignatureChanged, nodeRetryBuild,
//! nodeOutputsMissing).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

static LOG: Mutex<Option<BufWriter<File>>> = Mutex::new(None);

pub fn open(path: &str) -> std::io::Result<()> {
    let f = File::create(path)?;
    *LOG.lock().unwrap() = Some(BufWriter::new(f));
    Ok(())
}

/// Cheap check so callers can skip building records nobody will read.
pub fn is_active() -> bool {
    LOG.lock().unwrap().is_some()
}

pub fn write(record: &serde_json::Value) {
    let mut log = LOG.lock().unwrap();
    if let Some(w) = log.as_mut() {
        // A failed write only loses diagnostics, never the build.
        let _ = serde_json::to_writer(&mut *w, record);
        let _ = w.write_all(b"\n");
    }
}

pub fn close() {
    let mut log = LOG.lock().unwrap();
    if let Some(mut w) = log.take() {
        let _ = w.flush();
    }
}
