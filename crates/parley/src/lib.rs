//! An out-of-the-box assistant that assembles the built-in tools and a model
//! provider.
//!
//! The crate includes a CLI tool for chatting in the terminal. And you can
//! also use it as a library to put the assistant behind your own chat
//! surface, one [`ThreadKey`](core::conversation::ThreadKey) per thread.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod bot;
pub mod tools;

pub use bot::{ChatBot, ChatBotBuilder, DEFAULT_MEMORY_FILE, DEFAULT_SYSTEM_PROMPT};

/// Re-exports of [`parley_core`] crate.
pub mod core {
    pub use parley_core::*;
}
