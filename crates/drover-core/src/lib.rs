pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod emulator;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod pending;
pub mod perception;
pub mod quota;
pub mod slots;
pub mod task;
pub mod tasks;

mod process;

#[cfg(test)]
mod testing;

pub use error::{DroverError, Result};
