//! Building blocks for [`clap`]-driven configs of the tablet sink.
//!
//! They can easily be re-used using `#[clap(flatten)]`.
pub mod sink;
