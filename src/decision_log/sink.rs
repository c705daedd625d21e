use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::record::LogRecord;

/// A batch could not be made durable.
#[derive(Error, Debug)]
pub enum LogDeliveryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink rejected batch: {0}")]
    Rejected(String),
}

/// Durable destination for decision record batches.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver one batch; either the whole batch is durable or an error
    /// is returned.
    async fn deliver(&self, batch: &[LogRecord]) -> Result<(), LogDeliveryError>;
}

/// Read side of the durable log, one JSON document per line.
pub trait LogSource: Send + Sync {
    /// Stream every non-empty line to `f` in log order.
    fn for_each_line(&self, f: &mut dyn FnMut(&str)) -> io::Result<()>;
}

/// Collect a source into memory.
#[cfg(test)]
pub(crate) fn collect_lines(source: &dyn LogSource) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    source.for_each_line(&mut |line| lines.push(line.to_string()))?;
    Ok(lines)
}

/// Gzip-compress a batch as newline-delimited JSON.
pub fn compress_batch(batch: &[LogRecord]) -> Result<Vec<u8>, LogDeliveryError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for record in batch {
        serde_json::to_writer(&mut encoder, record)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

/// Reader for a log file made of concatenated gzip members.
#[derive(Debug, Clone)]
pub struct LogFileReader {
    path: PathBuf,
}

impl LogFileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LogFileReader { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSource for LogFileReader {
    /// Decompress every member in order.
    ///
    /// A missing file is an empty log. A truncated trailing member ends the
    /// read: lines decoded before the damage have already been streamed.
    fn for_each_line(&self, f: &mut dyn FnMut(&str)) -> io::Result<()> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut reader = BufReader::new(MultiGzDecoder::new(BufReader::new(file)));
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                // Every record is newline-terminated; anything else is a torn write.
                Ok(_) if buf.last() != Some(&b'\n') => {
                    warn!(path = %self.path.display(), "Decision log ends in a partial record");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        f(line);
                    }
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Decision log ends in a damaged member");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Append-only file sink: one gzip member per batch.
pub struct FileSink {
    file: Arc<Mutex<File>>,
    reader: LogFileReader,
    batches_written: AtomicU64,
}

impl FileSink {
    /// Open or create the log file for appending.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(FileSink {
            file: Arc::new(Mutex::new(file)),
            reader: LogFileReader::new(path),
            batches_written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn deliver(&self, batch: &[LogRecord]) -> Result<(), LogDeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let member = compress_batch(batch)?;
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = file.lock();
            file.write_all(&member)?;
            file.sync_data()
        })
        .await
        .map_err(|e| LogDeliveryError::Rejected(format!("writer task failed: {}", e)))??;

        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl LogSource for FileSink {
    fn for_each_line(&self, f: &mut dyn FnMut(&str)) -> io::Result<()> {
        self.reader.for_each_line(f)
    }
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<LogRecord>>>,
    failures_remaining: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delivered batches (for assertions).
    pub fn batches(&self) -> Vec<Vec<LogRecord>> {
        self.batches.lock().clone()
    }

    /// All delivered records in delivery order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn deliver(&self, batch: &[LogRecord]) -> Result<(), LogDeliveryError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LogDeliveryError::Rejected("injected failure".to_string()));
        }

        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}

impl LogSource for MemorySink {
    fn for_each_line(&self, f: &mut dyn FnMut(&str)) -> io::Result<()> {
        let batches = self.batches.lock();
        for record in batches.iter().flatten() {
            f(&record.to_line().map_err(io::Error::from)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;
    use tempfile::TempDir;

    fn record(timestamp: i64, action: Action, label: &str) -> LogRecord {
        LogRecord {
            timestamp,
            action,
            matched_rule_id: action.is_block().then(|| label.to_string()),
            label: label.to_string(),
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends_gzip_members() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/decisions.log.gz");
        let sink = FileSink::open(&path).unwrap();

        sink.deliver(&[record(1, Action::Allow, "default_action"), record(2, Action::Block, "sqli")])
            .await
            .unwrap();
        sink.deliver(&[record(3, Action::Block, "xss")]).await.unwrap();
        sink.deliver(&[]).await.unwrap();

        assert_eq!(sink.batches_written(), 2);

        let lines = collect_lines(&LogFileReader::new(&path)).unwrap();
        assert_eq!(lines.len(), 3);
        let parsed: Vec<_> = lines.iter().map(|l| LogRecord::parse_line(l).unwrap()).collect();
        assert_eq!(parsed[2].label, "xss");
    }

    #[tokio::test]
    async fn test_truncated_member_keeps_earlier_batches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("decisions.log.gz");
        let sink = FileSink::open(&path).unwrap();
        sink.deliver(&[record(1, Action::Block, "sqli")]).await.unwrap();

        // Half of a second member, as after a crash mid-write.
        let member = compress_batch(&[record(2, Action::Block, "xss")]).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&member[..member.len() / 2]).unwrap();

        let lines = collect_lines(&sink).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn test_lines_stream_in_log_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("decisions.log.gz");
        let sink = FileSink::open(&path).unwrap();
        for ts in 1..=3 {
            sink.deliver(&[record(ts, Action::Block, "sqli")]).await.unwrap();
        }

        let mut timestamps = Vec::new();
        sink.for_each_line(&mut |line| {
            timestamps.push(LogRecord::parse_line(line).unwrap().timestamp);
        })
        .unwrap();

        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_file_is_empty_log() {
        let dir = TempDir::new().unwrap();
        let reader = LogFileReader::new(dir.path().join("absent.log.gz"));
        assert!(collect_lines(&reader).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_sink_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(2);

        let batch = [record(1, Action::Block, "sqli")];
        assert!(sink.deliver(&batch).await.is_err());
        assert!(sink.deliver(&batch).await.is_err());
        assert!(sink.deliver(&batch).await.is_ok());

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(collect_lines(&sink).unwrap().len(), 1);
    }
}
