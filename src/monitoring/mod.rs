/*!
 * Monitoring
 * Tracing setup and the structured log sink
 */

mod sink;
mod tracer;

pub use sink::{LogEvent, LogFields, LogLevel, LogSink, MemorySink, SharedSink, TracingSink};
pub use tracer::{init_tracing, CommandSpan};
