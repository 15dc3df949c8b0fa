//! Protocol versions and the capabilities each one adds.

use std::fmt;
use std::str::FromStr;

use crate::error::HotRodError;

/// A Hot Rod protocol version, carried on the wire as `major * 10 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    /// Protocol 2.0.
    pub const V2_0: Self = Self(20);
    /// Protocol 2.1: include-current-state and raw listener data.
    pub const V2_1: Self = Self(21);
    /// Protocol 2.2: expiration time units.
    pub const V2_2: Self = Self(22);
    /// Protocol 2.3: segment-aware iteration.
    pub const V2_3: Self = Self(23);
    /// Protocol 2.4: iteration metadata.
    pub const V2_4: Self = Self(24);
    /// Protocol 2.5.
    pub const V2_5: Self = Self(25);
    /// Protocol 2.6.
    pub const V2_6: Self = Self(26);
    /// Protocol 2.7.
    pub const V2_7: Self = Self(27);
    /// Protocol 2.8: media types and object storage status hints.
    pub const V2_8: Self = Self(28);
    /// Protocol 3.0: listener interest flags.
    pub const V3_0: Self = Self(30);
    /// Protocol 3.1: bloom-filter near-cache listeners.
    pub const V3_1: Self = Self(31);

    /// The newest version this client speaks.
    pub const LATEST: Self = Self::V3_1;

    /// Every version this client speaks, oldest first.
    pub const ALL: [Self; 11] = [
        Self::V2_0,
        Self::V2_1,
        Self::V2_2,
        Self::V2_3,
        Self::V2_4,
        Self::V2_5,
        Self::V2_6,
        Self::V2_7,
        Self::V2_8,
        Self::V3_0,
        Self::V3_1,
    ];

    /// Parses the version byte sent on the wire.
    pub fn from_wire(byte: u8) -> Result<Self, HotRodError> {
        let candidate = Self(byte);
        if Self::ALL.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(HotRodError::Configuration(format!(
                "unsupported protocol version byte {}",
                byte
            )))
        }
    }

    /// Returns the byte written in every request header.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns the major version number.
    pub fn major(self) -> u8 {
        self.0 / 10
    }

    /// Returns the minor version number.
    pub fn minor(self) -> u8 {
        self.0 % 10
    }

    /// Listener registration carries include-current-state and raw-data bytes,
    /// and events carry custom/retried markers.
    pub fn supports_listener_include_state(self) -> bool {
        self >= Self::V2_1
    }

    /// Expiration is sent with an explicit time unit byte.
    pub fn supports_time_units(self) -> bool {
        self >= Self::V2_2
    }

    /// Iteration can be limited to a segment set and reports finished segments.
    pub fn supports_iteration_segments(self) -> bool {
        self >= Self::V2_3
    }

    /// Iteration can return entry metadata.
    pub fn supports_iteration_metadata(self) -> bool {
        self >= Self::V2_4
    }

    /// Request headers carry key and value media types.
    pub fn supports_media_types(self) -> bool {
        self >= Self::V2_8
    }

    /// The server may answer with the object-storage success statuses.
    pub fn supports_object_storage_hint(self) -> bool {
        self >= Self::V2_8
    }

    /// Listener registration carries an interest bitmask.
    pub fn supports_listener_interests(self) -> bool {
        self >= Self::V3_0
    }

    /// Near-cache listeners can be gated by a client bloom filter.
    pub fn supports_bloom_filter(self) -> bool {
        self >= Self::V3_1
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

impl FromStr for ProtocolVersion {
    type Err = HotRodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HotRodError::Configuration(format!("invalid protocol version '{}'", s));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let major: u8 = major.trim().parse().map_err(|_| invalid())?;
        let minor: u8 = minor.trim().parse().map_err(|_| invalid())?;
        if minor > 9 {
            return Err(invalid());
        }
        Self::from_wire(major.checked_mul(10).ok_or_else(invalid)? + minor)
    }
}

/// How much of the cluster layout the client asks the server to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientIntelligence {
    /// No topology information; requests go to bootstrap servers only.
    Basic,
    /// Server list only; requests are balanced but not key-routed.
    TopologyAware,
    /// Server list plus segment ownership; requests go to key owners.
    #[default]
    HashDistributionAware,
}

impl ClientIntelligence {
    /// Returns the byte written in every request header.
    pub fn as_byte(self) -> u8 {
        match self {
            ClientIntelligence::Basic => 0x01,
            ClientIntelligence::TopologyAware => 0x02,
            ClientIntelligence::HashDistributionAware => 0x03,
        }
    }

    /// Parses the intelligence byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ClientIntelligence::Basic),
            0x02 => Some(ClientIntelligence::TopologyAware),
            0x03 => Some(ClientIntelligence::HashDistributionAware),
            _ => None,
        }
    }
}
