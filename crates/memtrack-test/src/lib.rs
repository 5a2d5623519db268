//! Test harness for the memtrack coherency layer.
//!
//! Provides recording buffers, scripted address translators and a tracker
//! fixture driving an in-process sync timeline.

pub mod harness;
pub mod translator;

pub use harness::{entries, FlushLog, FlushRecord, RecordingBuffer, TrackerFixture};
pub use translator::{OffsetTranslator, PagedTranslator};

use std::sync::Once;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error("address {address:#x} is not aligned to page size {page_size:#x}")]
    Misaligned { address: u64, page_size: u64 },
    #[error("page size {0:#x} is not a power of two")]
    PageSize(u64),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Route `tracing` output of the code under test to the test writer.
///
/// Honors `RUST_LOG`, defaults to warnings. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
