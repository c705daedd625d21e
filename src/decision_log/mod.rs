//! Asynchronous decision logging.

pub mod logger;
pub mod record;
pub mod sink;

pub use logger::{Backpressure, DecisionLogger, LoggerConfig, LoggerStats};
pub use record::LogRecord;
pub use sink::{FileSink, LogDeliveryError, LogFileReader, LogSink, LogSource, MemorySink};
