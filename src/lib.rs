// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! Client library for the TinyMQ classroom pub/sub broker.
//!
//! Provides the wire codec, a connection engine with request/response
//! correlation, a publish/subscribe surface, a serial sensor acquisition
//! service, and a topic delegation subsystem, wired together by
//! [`context::ClientContext`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod codec;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod das;
pub mod delegation;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pubsub;
pub mod store;

pub use codec::{Frame, PacketType};
pub use connection::{Connection, ConnectionState};
pub use context::{ClientConfig, ClientConfigBuilder, ClientContext};
pub use error::{Result, TinyMqError, TinyMqErrorKind};
pub use store::{LocalStore, SqliteStore};
