mod chunker;
mod collector;
mod config;
mod engine;
mod file_id;
mod history;
mod meta_db;
mod reader;
mod staging;

pub use chunker::*;
pub use collector::*;
pub use config::*;
pub use engine::*;
pub use file_id::*;
pub use history::*;
pub use meta_db::*;
pub use reader::*;
pub use staging::*;

#[macro_use]
extern crate log;

#[cfg(test)]
mod test_engine;
