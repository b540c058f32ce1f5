use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Sends formatted lines to stderr and, while a run is attached, to its
/// `run.log` as well.
#[derive(Clone, Default)]
pub struct TeeMakeWriter {
    session_log: Arc<Mutex<Option<File>>>,
}

impl TeeMakeWriter {
    pub fn attach(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut slot) = self.session_log.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.session_log.lock() {
            *slot = None;
        }
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            session_log: self.session_log.clone(),
        }
    }
}

pub struct TeeWriter {
    session_log: Arc<Mutex<Option<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        if let Ok(mut slot) = self.session_log.lock()
            && let Some(file) = slot.as_mut()
        {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        if let Ok(mut slot) = self.session_log.lock()
            && let Some(file) = slot.as_mut()
        {
            file.flush()?;
        }
        Ok(())
    }
}

/// Installs the global subscriber. `RUST_LOG` picks the level unless
/// `verbose` forces debug.
pub fn init(verbose: bool) -> TeeMakeWriter {
    let writer = TeeMakeWriter::default();
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer.clone())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    writer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_log_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let tee = TeeMakeWriter::default();

        tee.make_writer().write_all(b"before attach\n").unwrap();
        tee.attach(&path).unwrap();
        tee.make_writer().write_all(b"during run\n").unwrap();
        tee.detach();
        tee.make_writer().write_all(b"after detach\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "during run\n");
    }
}
