//! A set of built-in tools that models can use.

mod memory;
mod time;

pub use memory::{DeleteMemoryTool, MemoryFile, ReadMemoryTool, WriteMemoryTool};
pub use time::CurrentTimeTool;
