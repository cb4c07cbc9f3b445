//! Patch sites and the engines that apply them.
//!
//! This module provides:
//! - The closed table of known patch names and injection sites
//! - Concrete site types with their length invariants
//! - Byte patch application, verification and classification
//! - Code injection placement and payload extraction

mod engine;
mod inject;
mod known;
mod site;

pub use engine::*;
pub use inject::*;
pub use known::*;
pub use site::*;
