#![no_std]

#[cfg(any(test, feature = "testing"))]
extern crate std;

pub mod board;
pub mod buffers;
pub mod config;
pub mod drive;
pub mod emulator;
pub mod error;
pub mod fat16;
pub mod nibble;
pub mod sd;
pub mod timing;

#[cfg(any(test, feature = "testing"))]
pub mod sim;

pub use emulator::Emulator;
pub use error::{DiskError, Result};
