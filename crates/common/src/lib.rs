// ctxsync-common: shared types and pure text utilities for the ctxsync workspace

pub mod diff;
pub mod redact;
pub mod token;
pub mod types;
