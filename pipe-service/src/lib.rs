// Full-duplex, message-oriented RPC over a named pipe.
//
// One client and one server share a line-based wire protocol carrying
// fire-and-forget commands, request/response queries, and events raised in
// either direction, where a synchronous event blocks the raising side
// until the peer's processed result comes back.

pub mod client;
pub mod error;
pub mod events;
pub mod logging;
pub mod server;
pub mod sync;
pub mod transport;
pub mod wire;

pub use client::PipeClient;
pub use error::PipeError;
pub use events::Subscription;
pub use server::{HandlerFuture, PipeServer, Reply};
