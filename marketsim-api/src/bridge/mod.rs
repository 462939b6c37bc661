//! Glue between the shared handler and the wire front-ends
//!
//! Handlers write to a [`ServerStream`]; each front-end supplies a
//! [`StreamSink`] for its own transport and runs both halves with
//! [`spawn_bridged`].

mod stream;

pub use stream::{channel, spawn_bridged, ServerStream, StreamSink};
