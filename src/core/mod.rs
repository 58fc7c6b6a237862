//! Container format, crypto, streaming, resolution and composition

pub mod actor;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod glamour;
pub mod header;
pub mod io;
pub mod keys;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod token;
