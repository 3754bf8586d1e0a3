//! Tracing subscriber init, adapted from `ando-server::main`'s
//! `tracing_subscriber::fmt()` setup, generalized to also write to the
//! config's optional `log_file` (§6), since this process has no separate
//! admin surface to view logs through.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

/// A `Write` implementation shared between the subscriber's internal
/// buffering and repeated `MakeWriter` calls, wrapping one open file handle.
#[derive(Clone)]
struct SharedFile(Arc<Mutex<std::fs::File>>);

impl io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// Initialize the global tracing subscriber. `severity` is an `EnvFilter`
/// directive (`"info"`, `"debug"`, …) used unless `RUST_LOG` is set;
/// `log_file`, if present, additionally mirrors output to that file.
pub fn init_tracing(severity: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(severity.to_string()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let shared = SharedFile(Arc::new(Mutex::new(file)));
            builder.with_writer(move || shared.clone()).init();
        }
        None => builder.init(),
    }
    Ok(())
}
