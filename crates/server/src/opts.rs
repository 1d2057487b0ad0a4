//! Connection settings.

use drover_codec::varint::VarInt;
use drover_machine::Config;

use crate::connection::{Connection, EventReceiver, EventSender};
use crate::error::Error;
use crate::handler::StreamHandler;
use crate::transport::Transport;

/// Create a builder of server connections.
///
/// The builder carries settings shared between connections; one builder
/// typically lives next to the listener and serves every accepted
/// connection.
pub fn builder() -> Builder {
    Builder::new()
}

/// Settings for server connections.
#[derive(Debug, Clone)]
pub struct Builder {
    pub(crate) max_field_section_size: u64,
    pub(crate) send_grease: bool,
    pub(crate) peer_bidi_limit: u64,
}

impl Builder {
    pub(crate) fn new() -> Self {
        Self {
            max_field_section_size: VarInt::MAX.into_inner(),
            send_grease: true,
            peer_bidi_limit: 100,
        }
    }

    /// The largest header section this server accepts, advertised to the
    /// peer in SETTINGS.
    pub fn max_field_section_size(&mut self, value: u64) -> &mut Self {
        self.max_field_section_size = value;
        self
    }

    /// Whether to add GREASE identifiers to SETTINGS.
    pub fn send_grease(&mut self, value: bool) -> &mut Self {
        self.send_grease = value;
        self
    }

    /// How many concurrent request streams the listener should allow the
    /// peer. At least 100 request streams should be permitted at a time
    /// (RFC 9114, section 6.1); the listener reads this when configuring
    /// the transport.
    pub fn peer_bidi_limit(&mut self, value: u64) -> &mut Self {
        self.peer_bidi_limit = value;
        self
    }

    /// The configured peer request stream limit.
    pub fn get_peer_bidi_limit(&self) -> u64 {
        self.peer_bidi_limit
    }

    pub(crate) fn machine_config(&self) -> Config {
        Config {
            max_field_section_size: self.max_field_section_size,
            send_grease: self.send_grease,
        }
    }

    /// Drive one accepted connection to completion.
    pub async fn serve<T, H>(
        &self,
        transport: T,
        handler: H,
        events: EventReceiver,
        tx: EventSender,
    ) -> Result<(), Error>
    where
        T: Transport,
        H: StreamHandler,
    {
        Connection::init(transport, handler, self, events, tx)?.run().await
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
