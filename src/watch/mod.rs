//! The watch side: its file protocol, file formats and the sync tasks run
//! once a session is ready.

pub mod almanac;
pub mod files;
pub mod parser;
pub mod protocol;
pub mod tasks;
