//! Test utilities shared by the wim-rs crates.

pub mod binrw;
