//! Provider-neutral vocabulary spoken between the conversation core and
//! remote language models.
//!
//! A provider turns a [`ModelRequest`] (transcript plus tool schemas and
//! the target model) into a stream of [`ModelResponseEvent`]s. The types
//! here carry no behavior of their own; they are the contract that every
//! provider implementation and the core's model gateway agree on.
//!
//! Wire formats of specific vendors belong in their own crates.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
