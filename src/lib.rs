//! Tangle transaction observation pipeline.
//!
//! Decodes fixed-width tryte-encoded ledger transactions, filters them
//! through a configurable conjunctive predicate chain, and drives either
//! a live pub/sub subscription or a parallel archive-dump decoder over
//! the same decoding and filtering core.

pub mod batch;
pub mod config;
pub mod decoder;
pub mod filter;
pub mod subscriber;

// Re-export commonly used types
pub use batch::{BatchDecoder, BatchError, FileOutcome};
pub use config::{build_filters, Config, ConfigError};
pub use decoder::{DecodeError, Field, Transaction};
pub use filter::{
    FilterChain, FilterConfigError, Predicate, RangeFilter, Record, RelationalMode, SetFilter,
    TimeFilter,
};
pub use subscriber::{FrameSource, RedisFrameSource, SubscribeError, Subscriber, TangleMessage};
