//! # AMT Core
//!
//! Wire protocol for the Automatic Multicast Tunneling (AMT) gateway.
//!
//! This crate provides:
//! - Encoding and decoding of the AMT relay messages (RFC 7450 framing)
//! - The encapsulated IGMPv3 General Query and Membership Report
//! - The RFC 1071 internet checksum used by the synthesized IP/IGMP headers
//! - Relay nonce generation
//!
//! Everything here is stateless and performs no I/O.
//!
//! ## Message flow
//!
//! ```text
//!  gateway                                   relay
//!     │ ── Relay Discovery (nonce) ──────────▶ │  anycast / configured address
//!     │ ◀───────── Relay Advertisement ─────── │  (nonce, relay address)
//!     │ ── Request (nonce) ──────────────────▶ │  unicast relay address
//!     │ ◀───────── Membership Query ────────── │  (MAC, nonce, IGMPv3 query)
//!     │ ── Membership Update (MAC, nonce) ───▶ │  periodic, IGMPv3 report
//!     │ ◀───────── Multicast Data ──────────── │  (IP + UDP datagram)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod error;
pub mod igmp;
pub mod message;
pub mod nonce;

pub use checksum::internet_checksum;
pub use error::CodecError;
pub use igmp::{GroupRecord, IgmpQuery, RecordType, Subscription, decode_interval_code};
pub use message::{
    MembershipQuery, MembershipUpdate, MessageType, MulticastData, RelayAdvertisement,
    RelayDiscovery, RelayRequest, ResponseMac,
};
pub use nonce::{FixedNonce, NonceGenerator, TimeSeededNonce};

/// UDP port AMT relays listen on
pub const AMT_PORT: u16 = 2268;

/// Length of the AMT header preceding encapsulated data (type + reserved)
pub const AMT_HEADER_LEN: usize = 2;

/// Length of an IPv4 header without options
pub const IP_HEADER_LEN: usize = 20;

/// Length of the IPv4 header carrying a Router Alert option
pub const IP_ALERT_HEADER_LEN: usize = 24;

/// Length of a UDP header
pub const UDP_HEADER_LEN: usize = 8;

/// Offset of the UDP payload inside a Multicast Data message with a plain IP header
pub const MULTICAST_DATA_OFFSET: usize = AMT_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN;

/// Length of the relay response MAC
pub const MAC_LEN: usize = 6;

/// Default payload MTU: Ethernet MTU minus IPv4 and UDP headers
pub const DEFAULT_MTU: usize = 1500 - (IP_HEADER_LEN + UDP_HEADER_LEN);

/// Query interval assumed when the relay encodes a QQIC of zero (seconds)
pub const DEFAULT_QUERY_INTERVAL: u32 = 125;
