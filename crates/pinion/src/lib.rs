//! Pinion.
//!
//! Runs a pinner as a standalone process. The replicated log engine is not part of this crate, so
//! the process is started from a small `main` that provides one:
//!
//! ```ignore
//! fn main() {
//!     pinion::cli::main(|config| Ok(Arc::new(MyEngine::new(config)?)))
//! }
//! ```

#![warn(missing_debug_implementations, clippy::all)]

pub mod cli;
