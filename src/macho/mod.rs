//! Fat Mach-O container handling.
//!
//! This module provides the on-disk structures of the fat header and the
//! parser that turns them into a slice table.

mod constants;
mod fat;
mod structs;

pub use constants::*;
pub use fat::*;
pub use structs::*;
