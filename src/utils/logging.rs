// src/utils/logging.rs: log channel drain and the stderr/file tee used by env_logger
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use log::Level;
use tokio::task::JoinHandle;

use crate::utils::channel::Channel;

#[derive(Debug, Clone, PartialEq)]
pub enum LogMessage {
    Event(Level, String),
    Shutdown,
}

/// Producer side of the log channel.
#[derive(Clone, Debug)]
pub struct LogHandle {
    channel: Channel<LogMessage>,
}

impl LogHandle {
    pub fn new(channel: Channel<LogMessage>) -> Self {
        LogHandle { channel }
    }

    pub fn log(&self, level: Level, msg: impl Into<String>) {
        self.channel.put(LogMessage::Event(level, msg.into()));
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.log(Level::Debug, msg);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.log(Level::Info, msg);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.log(Level::Warn, msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.log(Level::Error, msg);
    }

    pub fn shutdown(&self) {
        self.channel.put(LogMessage::Shutdown);
    }
}

/// Forwards log channel events to the `log` facade until `Shutdown`.
///
/// # Returns
/// Join handle yielding the number of events forwarded.
pub fn spawn_log_drain(channel: Channel<LogMessage>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut n = 0;
        while let Ok(msg) = channel.get(None).await {
            match msg {
                LogMessage::Event(level, text) => {
                    log::log!(level, "{}", text);
                    n += 1;
                }
                LogMessage::Shutdown => break,
            }
        }
        n
    })
}

/// Writes every log line to stderr and to the run log file.
pub struct TeeWriter {
    file: File,
}

impl TeeWriter {
    pub fn create(path: &Path) -> io::Result<TeeWriter> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TeeWriter { file })
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_stops_on_shutdown() -> anyhow::Result<()> {
        let channel = Channel::new("log");
        let handle = LogHandle::new(channel.clone());
        let drain = spawn_log_drain(channel);
        handle.info("sample wt_0 reached FASTQ");
        handle.warn("spike-in alignment failed");
        handle.shutdown();
        assert_eq!(drain.await?, 2);
        Ok(())
    }

    #[test]
    fn test_tee_writes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.log");
        let mut tee = TeeWriter::create(&path)?;
        writeln!(tee, "[2024-01-01 00:00:00] INFO: hello")?;
        tee.flush()?;
        assert_eq!(std::fs::read_to_string(&path)?, "[2024-01-01 00:00:00] INFO: hello\n");
        Ok(())
    }
}
