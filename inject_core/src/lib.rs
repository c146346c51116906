//! Runtime texture substitution: fingerprint index, background load
//! pipeline and the size-bounded resource cache that backs it.
#![forbid(unsafe_code)]

pub mod archive;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod index;
pub mod job;
pub mod observability;
pub mod pipeline;
pub mod resource;
pub mod splitter;
pub mod worker;

pub use engine::TextureEngine;
pub use fingerprint::Fingerprint;

pub const MIB: u64 = 1024 * 1024;
