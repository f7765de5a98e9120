pub mod batcher;
pub mod receiver;
pub mod syslog;

pub use batcher::{IngestCounters, Ingestor};
pub use receiver::{run_tcp_receiver, run_udp_receiver};
pub use syslog::{parse_payload, SourceType};
