//! Log initialization.
//!
//! The numeric level follows the wire config: 1 = error, 2 = warn,
//! 3 = info, 4 = debug, 5+ = trace, 0 = silent. Exactly one sink is active:
//! a log file when configured, else stderr when requested, else the kernel
//! log, so a daemon that owns no terminal still leaves mount diagnostics
//! somewhere visible.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::LogSettings;

const KMSG: &str = "/dev/kmsg";

#[derive(Clone)]
struct SharedFile(Arc<File>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

fn level_filter(level: i32) -> LevelFilter {
    match level {
        i if i <= 0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

pub fn init(log: &LogSettings) -> anyhow::Result<()> {
    let writer = if !log.file.is_empty() {
        let file = File::options().create(true).append(true).open(&log.file)?;
        let shared = SharedFile(Arc::new(file));
        BoxMakeWriter::new(move || shared.clone())
    } else if log.stderr {
        BoxMakeWriter::new(io::stderr)
    } else {
        match File::options().write(true).open(KMSG) {
            Ok(file) => {
                let shared = SharedFile(Arc::new(file));
                BoxMakeWriter::new(move || shared.clone())
            }
            // No kernel log here (container, tests): fall back to stderr
            // rather than silently dropping diagnostics.
            Err(_) => BoxMakeWriter::new(io::stderr),
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(level_filter(log.level))
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(())
}
