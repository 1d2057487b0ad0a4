//! The SETTINGS frame payload.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::frame::FrameType;
use crate::varint::{read_varint, write_varint, VarInt};

/// A settings parameter identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct SettingId(pub u64);

impl SettingId {
    const NONE: Self = Self(0);

    /// A reserved identifier of the 0x1f * N + 0x21 format (RFC 9114,
    /// section 7.2.4.1), for any N keeping the value inside the varint
    /// range.
    pub fn grease() -> Self {
        let max_n = (VarInt::MAX.into_inner() - 0x21) / 0x1f;
        Self(fastrand::u64(..=max_n) * 0x1f + 0x21)
    }

    fn is_supported(self) -> bool {
        matches!(
            self,
            Self::MAX_HEADER_LIST_SIZE | Self::QPACK_MAX_TABLE_CAPACITY | Self::QPACK_MAX_BLOCKED_STREAMS,
        )
    }

    /// Identifiers defined in HTTP/2 with no HTTP/3 counterpart; receipt is
    /// a connection error of type H3_SETTINGS_ERROR (RFC 9114, section
    /// 7.2.4.1).
    fn is_forbidden(self) -> bool {
        matches!(self, Self(0x00) | Self(0x02) | Self(0x03) | Self(0x04) | Self(0x05))
    }
}

macro_rules! setting_identifiers {
    {$($name:ident = $val:expr,)*} => {
        impl SettingId {
            $(pub const $name: SettingId = SettingId($val);)*
        }
    }
}

setting_identifiers! {
    QPACK_MAX_TABLE_CAPACITY = 0x1,
    MAX_HEADER_LIST_SIZE = 0x6,
    QPACK_MAX_BLOCKED_STREAMS = 0x7,
}

const SETTINGS_LEN: usize = 4;

/// The decoded payload of a SETTINGS frame. Unknown identifiers are
/// dropped on decode; forbidden ones fail it.
#[derive(Debug, PartialEq, Clone)]
pub struct Settings {
    entries: [(SettingId, u64); SETTINGS_LEN],
    len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            entries: [(SettingId::NONE, 0); SETTINGS_LEN],
            len: 0,
        }
    }
}

impl Settings {
    pub const MAX_ENCODED_SIZE: usize = 2 + SETTINGS_LEN * 2 * VarInt::MAX_SIZE;

    pub fn insert(&mut self, id: SettingId, value: u64) -> Result<(), SettingsError> {
        if self.len >= self.entries.len() {
            return Err(SettingsError::Exceeded);
        }
        // The same identifier must not occur more than once (RFC 9114,
        // section 7.2.4).
        if self.entries[..self.len].iter().any(|(i, _)| *i == id) {
            return Err(SettingsError::Repeated(id));
        }
        self.entries[self.len] = (id, value);
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, id: SettingId) -> Option<u64> {
        self.entries[..self.len]
            .iter()
            .find(|(entry_id, _)| id == *entry_id)
            .map(|(_, value)| *value)
    }

    fn payload_len(&self) -> usize {
        self.entries[..self.len].iter().fold(0, |len, (id, val)| {
            len + VarInt(id.0).size() + VarInt(*val).size()
        })
    }

    /// Encode the full frame, header included.
    pub fn encode<T: BufMut>(&self, buf: &mut T) {
        FrameType::SETTINGS.encode(buf);
        write_varint(buf, self.payload_len() as u64);
        for (id, val) in self.entries[..self.len].iter() {
            write_varint(buf, id.0);
            write_varint(buf, *val);
        }
    }

    pub(crate) fn decode<T: Buf>(buf: &mut T) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        while buf.has_remaining() {
            if buf.remaining() < 2 {
                // Less than two minimum-size varints left.
                return Err(SettingsError::Malformed);
            }
            let identifier = SettingId(read_varint(buf).map_err(|_| SettingsError::Malformed)?);
            let value = read_varint(buf).map_err(|_| SettingsError::Malformed)?;

            if identifier.is_forbidden() {
                return Err(SettingsError::InvalidSettingId(identifier.0));
            }
            if identifier.is_supported() {
                settings.insert(identifier, value)?;
            }
        }
        Ok(settings)
    }
}

#[derive(Debug, PartialEq)]
pub enum SettingsError {
    Exceeded,
    Malformed,
    Repeated(SettingId),
    InvalidSettingId(u64),
}

impl std::error::Error for SettingsError {}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exceeded => write!(f, "max settings number exceeded, check for duplicate entries"),
            Self::Malformed => write!(f, "malformed settings frame"),
            Self::Repeated(id) => write!(f, "got setting 0x{:x} twice", id.0),
            Self::InvalidSettingId(id) => write!(f, "setting id 0x{id:x} is invalid"),
        }
    }
}
