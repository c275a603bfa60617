//! Building blocks for [`clap`]-driven configuration options.
pub mod batcher;
pub mod runtime;
