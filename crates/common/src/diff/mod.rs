// Line-level diff application for workspace file buffers.

pub mod patch;
