//! HTTP/3 server connection core.
//!
//! Drover drives one accepted QUIC connection as a single-owner actor:
//! one task, one inbox, all state owned by value and mutated between
//! receives. The transport pushes events in; stream handlers get
//! callbacks on the connection task and answer with commands; everything
//! the peer sees is written through the [`transport::Transport`] trait.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use drover::{builder, Command, Commands, Fin, Request, StreamHandler, StreamId};
//!
//! struct Hello;
//!
//! impl StreamHandler for Hello {
//!     type State = ();
//!
//!     fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
//!         let response = Command::Response(
//!             http::StatusCode::OK,
//!             http::HeaderMap::new(),
//!             Bytes::from_static(b"hello").into(),
//!         );
//!         (vec![response], ())
//!     }
//!
//!     fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
//!         Vec::new()
//!     }
//! }
//!
//! # async fn serve<T: drover::Transport>(transport: T) -> Result<(), drover::Error> {
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! // Hand `tx` to the transport driver, then:
//! builder().serve(transport, Hello, rx, tx).await
//! # }
//! ```

pub mod children;
pub mod connection;
pub mod error;
pub mod handler;
pub mod opts;
pub mod transport;

mod streams;

pub use children::{ChildExit, ChildId, Shutdown};
pub use connection::{Connection, Event, EventReceiver, EventSender};
pub use error::{Error, Reason};
pub use handler::{
    Body, ChildSpec, Command, Commands, InfoMsg, LogEntry, PushSpec, Request, StreamHandler,
    StreamOptions, StreamSender, TransportKind,
};
pub use opts::{builder, Builder};
pub use transport::{SendFlag, ShutdownFlag, StreamDir, Transport, TransportEvent, WriteBuf};

pub use drover_codec::error::Code;
pub use drover_codec::stream::{Fin, StreamId};

#[cfg(test)]
mod tests;
