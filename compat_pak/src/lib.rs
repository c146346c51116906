//! Container formats for loose replacement archives.
#![forbid(unsafe_code)]

pub mod pak;
