use cmdrun_core::{CmdrunError, Result};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Destination for supervisor debug lines
pub trait DebugSink: Send + Sync {
    fn write_line(&self, line: &str);
}

impl<F> DebugSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn write_line(&self, line: &str) {
        self(line)
    }
}

struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> DebugSink for WriterSink<W> {
    fn write_line(&self, line: &str) {
        let Ok(mut writer) = self.writer.lock() else {
            debug!("Debug log writer lock poisoned, line dropped");
            return;
        };
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            debug!(error = %e, "Failed to write debug log line");
        }
    }
}

struct TracingSink;

impl DebugSink for TracingSink {
    fn write_line(&self, line: &str) {
        debug!(target: "cmdrun::debug_log", "{}", line);
    }
}

/// Optional debug line sink. Cloning shares the underlying sink.
#[derive(Clone, Default)]
pub struct DebugLog {
    sink: Option<Arc<dyn DebugSink>>,
}

impl DebugLog {
    /// A log that drops every line
    pub fn none() -> Self {
        Self { sink: None }
    }

    pub fn new(sink: impl DebugSink + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Write each line, newline terminated, to `writer`
    pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self::new(WriterSink {
            writer: Mutex::new(writer),
        })
    }

    /// Forward lines to `tracing` at debug level
    pub fn tracing() -> Self {
        Self::new(TracingSink)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn line(&self, line: impl AsRef<str>) {
        if let Some(sink) = &self.sink {
            sink.write_line(line.as_ref());
        }
    }
}

impl fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugLog")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

static DEFAULT_DEBUG_LOG: RwLock<Option<DebugLog>> = RwLock::new(None);

/// Keeps the process-wide default debug log installed. Dropping it
/// uninstalls the default again.
#[must_use = "the default debug log is removed when the guard is dropped"]
pub struct DefaultDebugLogGuard {
    _private: (),
}

impl Drop for DefaultDebugLogGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = DEFAULT_DEBUG_LOG.write() {
            *slot = None;
        }
    }
}

/// Install the debug log used by runs that were not given one explicitly.
///
/// Only one default can be installed at a time.
pub fn install_default_debug_log(log: DebugLog) -> Result<DefaultDebugLogGuard> {
    let mut slot = DEFAULT_DEBUG_LOG.write().map_err(|_| {
        CmdrunError::InvalidConfiguration("Default debug log lock poisoned".to_string())
    })?;

    if slot.is_some() {
        return Err(CmdrunError::InvalidConfiguration(
            "A default debug log is already installed".to_string(),
        ));
    }

    *slot = Some(log);
    Ok(DefaultDebugLogGuard { _private: () })
}

/// The installed default, or a log that drops everything
pub fn default_debug_log() -> DebugLog {
    DEFAULT_DEBUG_LOG
        .read()
        .ok()
        .and_then(|slot| slot.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_none_drops_lines() {
        let log = DebugLog::none();
        assert!(!log.is_enabled());
        log.line("ignored");
    }

    #[test]
    fn test_closure_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let log = DebugLog::new(move |line: &str| captured.lock().unwrap().push(line.to_string()));

        log.line("one");
        log.clone().line("two");

        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_writer_sink_terminates_lines() {
        let buffer = SharedBuffer::default();
        let log = DebugLog::writer(buffer.clone());

        log.line("cmdrun exit: PID: 1, code: 0");

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "cmdrun exit: PID: 1, code: 0\n");
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_sink_failure_does_not_panic() {
        let log = DebugLog::writer(BrokenWriter);
        assert!(log.is_enabled());
        log.line("cmdrun exit: PID: 1, code: 0");
        log.line("cmdrun exit: PID: 2, code: 0");
    }

    #[test]
    fn test_default_install_once_and_teardown() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let guard = install_default_debug_log(DebugLog::new(move |line: &str| {
            captured.lock().unwrap().push(line.to_string())
        }))
        .unwrap();

        assert!(install_default_debug_log(DebugLog::none()).is_err());

        default_debug_log().line("via default");
        assert!(lines.lock().unwrap().iter().any(|l| l == "via default"));

        drop(guard);
        assert!(!default_debug_log().is_enabled());
    }
}
