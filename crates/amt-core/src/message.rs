//! AMT relay message encoding and decoding.
//!
//! All multi-byte fields are big-endian (network byte order). Gateways
//! encode Discovery, Request and Membership Update and decode the rest;
//! the opposite direction is provided as well so relays can be simulated.

use crate::checksum::fill_checksum;
use crate::error::CodecError;
use crate::igmp::{
    self, ALL_SYSTEMS, GroupRecord, IGMPV3_REPORT_DEST, IgmpQuery, encode_report,
    encode_router_alert_header, ip_header_len,
};
use crate::{AMT_HEADER_LEN, IP_HEADER_LEN, MAC_LEN, UDP_HEADER_LEN};
use std::fmt;
use std::net::Ipv4Addr;

/// AMT message types (RFC 7450 section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Gateway looks for a relay
    RelayDiscovery = 1,
    /// Relay answers a discovery with its unicast address
    RelayAdvertisement = 2,
    /// Gateway asks for a membership query
    Request = 3,
    /// Relay hands out its MAC and an IGMPv3 general query
    MembershipQuery = 4,
    /// Gateway reports group membership
    MembershipUpdate = 5,
    /// Encapsulated multicast datagram
    MulticastData = 6,
    /// Gateway tears the tunnel down
    Teardown = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RelayDiscovery),
            2 => Ok(Self::RelayAdvertisement),
            3 => Ok(Self::Request),
            4 => Ok(Self::MembershipQuery),
            5 => Ok(Self::MembershipUpdate),
            6 => Ok(Self::MulticastData),
            7 => Ok(Self::Teardown),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl MessageType {
    /// Read the message type of a datagram without decoding the rest
    pub fn peek(data: &[u8]) -> Result<Self, CodecError> {
        CodecError::check_len(data, 1)?;
        // Version lives in the high nibble and is always zero
        Self::try_from(data[0])
    }

    fn expect(self, data: &[u8]) -> Result<(), CodecError> {
        let actual = Self::peek(data)?;
        if actual != self {
            return Err(CodecError::UnexpectedType {
                expected: self as u8,
                actual: actual as u8,
            });
        }
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_ipv4(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(read_u32(data, offset))
}

fn check_nonce(expected: u32, actual: u32) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::NonceMismatch { expected, actual });
    }
    Ok(())
}

/// Opaque response MAC issued by the relay in a Membership Query.
///
/// Must be echoed verbatim in every Membership Update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResponseMac(pub [u8; MAC_LEN]);

impl ResponseMac {
    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }
}

impl fmt::Display for ResponseMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Relay Discovery: `type=1, reserved[3], nonce`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDiscovery {
    /// Discovery nonce
    pub nonce: u32,
}

impl RelayDiscovery {
    /// Encoded length
    pub const LEN: usize = 8;

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = MessageType::RelayDiscovery as u8;
        buf[4..8].copy_from_slice(&self.nonce.to_be_bytes());
        buf
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        MessageType::RelayDiscovery.expect(data)?;
        CodecError::check_len(data, Self::LEN)?;
        Ok(Self {
            nonce: read_u32(data, 4),
        })
    }
}

/// Relay Advertisement: `type=2, reserved[3], nonce, relay address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAdvertisement {
    /// Discovery nonce being answered
    pub nonce: u32,
    /// Unicast address of the relay to use from now on
    pub relay: Ipv4Addr,
}

impl RelayAdvertisement {
    /// Encoded length for an IPv4 relay
    pub const LEN: usize = 12;

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = MessageType::RelayAdvertisement as u8;
        buf[4..8].copy_from_slice(&self.nonce.to_be_bytes());
        buf[8..12].copy_from_slice(&self.relay.octets());
        buf
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        MessageType::RelayAdvertisement.expect(data)?;
        CodecError::check_len(data, Self::LEN)?;
        Ok(Self {
            nonce: read_u32(data, 4),
            relay: read_ipv4(data, 8),
        })
    }

    /// Decode and require the nonce of the discovery that was sent
    pub fn decode_matching(data: &[u8], nonce: u32) -> Result<Self, CodecError> {
        let adv = Self::decode(data)?;
        check_nonce(nonce, adv.nonce)?;
        Ok(adv)
    }
}

/// Request: `type=3, reserved|P, reserved[2], nonce`, padded to 9 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    /// Request nonce (same as the discovery nonce)
    pub nonce: u32,
    /// P flag: ask for an MLDv2 query instead of IGMPv3
    pub mld: bool,
}

impl RelayRequest {
    /// Encoded length
    pub const LEN: usize = 9;

    /// IGMPv3 request carrying `nonce`
    #[must_use]
    pub fn igmpv3(nonce: u32) -> Self {
        Self { nonce, mld: false }
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = MessageType::Request as u8;
        buf[1] = u8::from(self.mld);
        buf[4..8].copy_from_slice(&self.nonce.to_be_bytes());
        buf
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        MessageType::Request.expect(data)?;
        CodecError::check_len(data, 8)?;
        Ok(Self {
            nonce: read_u32(data, 4),
            mld: data[1] & 0x01 != 0,
        })
    }
}

/// Membership Query: `type=4, flags, MAC[6], nonce`, then an IP packet
/// carrying an IGMPv3 General Query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    /// Response MAC to echo in updates
    pub mac: ResponseMac,
    /// Request nonce being answered
    pub nonce: u32,
    /// Encapsulated general query
    pub query: IgmpQuery,
}

impl MembershipQuery {
    /// Length of the fixed AMT part (type, flags, MAC, nonce)
    pub const HEADER_LEN: usize = AMT_HEADER_LEN + MAC_LEN + 4;

    /// Typical total length: 24-byte IP header and a query without sources
    pub const LEN: usize = Self::HEADER_LEN + crate::IP_ALERT_HEADER_LEN + igmp::IGMP_QUERY_LEN;

    /// Query interval announced by the relay, in seconds
    #[must_use]
    pub fn query_interval_secs(&self) -> u32 {
        self.query.query_interval_secs()
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        MessageType::MembershipQuery.expect(data)?;
        CodecError::check_len(data, Self::HEADER_LEN + IP_HEADER_LEN)?;

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&data[2..8]);
        let nonce = read_u32(data, 8);

        let ip = &data[Self::HEADER_LEN..];
        let ihl = ip_header_len(ip)?;
        CodecError::check_len(ip, ihl + igmp::IGMP_QUERY_LEN)?;

        // The IP total length bounds the query; a trailing gateway address may follow
        let total = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
        let end = total.clamp(ihl + igmp::IGMP_QUERY_LEN, ip.len());
        let query = IgmpQuery::decode(&ip[ihl..end])?;

        Ok(Self {
            mac: ResponseMac(mac),
            nonce,
            query,
        })
    }

    /// Decode and require the nonce of the request that was sent
    pub fn decode_matching(data: &[u8], nonce: u32) -> Result<Self, CodecError> {
        let query = Self::decode(data)?;
        check_nonce(nonce, query.nonce)?;
        Ok(query)
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let igmp = self.query.encode();
        let mut buf =
            Vec::with_capacity(Self::HEADER_LEN + crate::IP_ALERT_HEADER_LEN + igmp.len());
        buf.push(MessageType::MembershipQuery as u8);
        buf.push(0);
        buf.extend_from_slice(self.mac.as_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&encode_router_alert_header(igmp.len(), ALL_SYSTEMS));
        buf.extend_from_slice(&igmp);
        buf
    }
}

/// Membership Update: `type=5, reserved, MAC[6], nonce`, then a Router
/// Alert IP header and an IGMPv3 report with one group record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    /// MAC from the last Membership Query
    pub mac: ResponseMac,
    /// Request nonce
    pub nonce: u32,
    /// Group record stating join or leave intent
    pub record: GroupRecord,
}

impl MembershipUpdate {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let report = encode_report(std::slice::from_ref(&self.record));
        let mut buf = Vec::with_capacity(
            MembershipQuery::HEADER_LEN + crate::IP_ALERT_HEADER_LEN + report.len(),
        );
        buf.push(MessageType::MembershipUpdate as u8);
        buf.push(0);
        buf.extend_from_slice(self.mac.as_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&encode_router_alert_header(report.len(), IGMPV3_REPORT_DEST));
        buf.extend_from_slice(&report);
        buf
    }

    /// Decode from wire bytes (first group record only)
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        MessageType::MembershipUpdate.expect(data)?;
        CodecError::check_len(data, MembershipQuery::HEADER_LEN + IP_HEADER_LEN)?;

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&data[2..8]);
        let nonce = read_u32(data, 8);

        let ip = &data[MembershipQuery::HEADER_LEN..];
        let ihl = ip_header_len(ip)?;
        CodecError::check_len(ip, ihl)?;
        let mut records = igmp::decode_report(&ip[ihl..])?;
        if records.is_empty() {
            return Err(CodecError::TooShort {
                expected: MembershipQuery::HEADER_LEN + ihl + 16,
                actual: data.len(),
            });
        }

        Ok(Self {
            mac: ResponseMac(mac),
            nonce,
            record: records.swap_remove(0),
        })
    }

    /// Whether this update announces leaving the group
    #[must_use]
    pub fn is_leave(&self) -> bool {
        use crate::igmp::RecordType;
        matches!(
            self.record.record_type,
            RecordType::BlockOldSources | RecordType::ChangeToInclude
        )
    }
}

/// Multicast Data: `type=6, reserved`, then the full IP + UDP datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastData;

impl MulticastData {
    /// UDP payload carried by a Multicast Data message.
    ///
    /// Skips the AMT header, the encapsulated IP header (length from its IHL)
    /// and the UDP header.
    pub fn payload(data: &[u8]) -> Result<&[u8], CodecError> {
        MessageType::MulticastData.expect(data)?;
        let ip = data.get(AMT_HEADER_LEN..).unwrap_or_default();
        let ihl = ip_header_len(ip)?;
        let offset = AMT_HEADER_LEN + ihl + UDP_HEADER_LEN;
        CodecError::check_len(data, offset)?;
        Ok(&data[offset..])
    }

    /// Wrap `payload` as a UDP datagram from `source:port` to `group:port`
    #[must_use]
    pub fn encode(source: Ipv4Addr, group: Ipv4Addr, port: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
        let total_len = (IP_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16;

        let mut buf = Vec::with_capacity(AMT_HEADER_LEN + usize::from(total_len));
        buf.push(MessageType::MulticastData as u8);
        buf.push(0);

        let mut ip = [0u8; IP_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64; // TTL
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&source.octets());
        ip[16..20].copy_from_slice(&group.octets());
        fill_checksum(&mut ip, 10);
        buf.extend_from_slice(&ip);

        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(&udp_len.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // UDP checksum optional over IPv4
        buf.extend_from_slice(payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MULTICAST_DATA_OFFSET;
    use crate::checksum::internet_checksum;
    use crate::igmp::{RecordType, Subscription};

    const MAC: ResponseMac = ResponseMac([0x01, 0x02, 0x03, 0x04, 0x05, 0xAB]);

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::RelayDiscovery);
        assert_eq!(MessageType::try_from(6).unwrap(), MessageType::MulticastData);
        assert_eq!(MessageType::try_from(8), Err(CodecError::UnknownType(8)));
        assert_eq!(MessageType::peek(&[]), Err(CodecError::TooShort { expected: 1, actual: 0 }));
    }

    #[test]
    fn test_discovery_layout() {
        let bytes = RelayDiscovery { nonce: 0xAABB_CCDD }.encode();
        assert_eq!(bytes, [1, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_request_layout() {
        let bytes = RelayRequest::igmpv3(0xAABB_CCDD).encode();
        assert_eq!(bytes, [3, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 0]);
        assert_eq!(RelayRequest::decode(&bytes).unwrap(), RelayRequest::igmpv3(0xAABB_CCDD));
    }

    #[test]
    fn test_advertisement_decode() {
        let bytes = [2, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 192, 0, 2, 5];
        let adv = RelayAdvertisement::decode_matching(&bytes, 0xAABB_CCDD).unwrap();
        assert_eq!(adv.relay, Ipv4Addr::new(192, 0, 2, 5));
    }

    #[test]
    fn test_advertisement_rejects_wrong_nonce() {
        let bytes = RelayAdvertisement {
            nonce: 1,
            relay: Ipv4Addr::LOCALHOST,
        }
        .encode();
        assert_eq!(
            RelayAdvertisement::decode_matching(&bytes, 2),
            Err(CodecError::NonceMismatch {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_advertisement_rejects_wrong_type() {
        let bytes = RelayDiscovery { nonce: 7 }.encode();
        assert_eq!(
            RelayAdvertisement::decode_matching(&bytes, 7),
            Err(CodecError::UnexpectedType {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_advertisement_too_short() {
        assert!(matches!(
            RelayAdvertisement::decode(&[2, 0, 0, 0, 1, 2, 3, 4]),
            Err(CodecError::TooShort { expected: 12, actual: 8 })
        ));
    }

    #[test]
    fn test_membership_query_is_48_bytes() {
        let query = MembershipQuery {
            mac: MAC,
            nonce: 0xAABB_CCDD,
            query: IgmpQuery::general(0),
        };
        let bytes = query.encode();
        assert_eq!(bytes.len(), MembershipQuery::LEN);
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[2..8], MAC.as_bytes());
        assert_eq!(bytes[45], 0); // raw QQIC

        let decoded = MembershipQuery::decode_matching(&bytes, 0xAABB_CCDD).unwrap();
        assert_eq!(decoded.mac, MAC);
        assert_eq!(decoded.query_interval_secs(), 125);
    }

    #[test]
    fn test_membership_query_with_plain_ip_header() {
        // Relay that omits the Router Alert option
        let mut bytes = vec![4, 0, 9, 8, 7, 6, 5, 4, 0, 0, 0, 42];
        let mut ip = [0u8; IP_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&32u16.to_be_bytes());
        bytes.extend_from_slice(&ip);
        bytes.extend_from_slice(&IgmpQuery::general(60).encode());

        let decoded = MembershipQuery::decode(&bytes).unwrap();
        assert_eq!(decoded.nonce, 42);
        assert_eq!(decoded.query_interval_secs(), 60);
    }

    #[test]
    fn test_membership_query_ignores_trailing_gateway_address() {
        let query = MembershipQuery {
            mac: MAC,
            nonce: 5,
            query: IgmpQuery::general(30),
        };
        let mut bytes = query.encode();
        bytes[1] = 0x01; // G flag
        bytes.extend_from_slice(&[0x13, 0x88, 10, 0, 0, 1]);

        let decoded = MembershipQuery::decode(&bytes).unwrap();
        assert!(decoded.query.sources.is_empty());
    }

    #[test]
    fn test_membership_query_rejects_nonce() {
        let bytes = MembershipQuery {
            mac: MAC,
            nonce: 5,
            query: IgmpQuery::general(0),
        }
        .encode();
        assert!(matches!(
            MembershipQuery::decode_matching(&bytes, 6),
            Err(CodecError::NonceMismatch { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_membership_update_asm_join() {
        let sub = Subscription::any_source(Ipv4Addr::new(239, 1, 1, 1));
        let update = MembershipUpdate {
            mac: MAC,
            nonce: 0xAABB_CCDD,
            record: sub.group_record(false),
        };
        let bytes = update.encode();

        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[2..8], MAC.as_bytes());
        assert_eq!(&bytes[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
        // IP header checksum and IGMP checksum both verify
        assert_eq!(internet_checksum(&bytes[12..36]), 0);
        assert_eq!(internet_checksum(&bytes[36..]), 0);
        assert_eq!(bytes[36 + 8], RecordType::ChangeToExclude as u8);
        assert_eq!(bytes.len(), 12 + 24 + 16);

        let decoded = MembershipUpdate::decode(&bytes).unwrap();
        assert_eq!(decoded, update);
        assert!(!decoded.is_leave());
    }

    #[test]
    fn test_membership_update_ssm_leave() {
        let sub = Subscription::new(Ipv4Addr::new(232, 0, 0, 1), Some(Ipv4Addr::new(10, 1, 1, 1)));
        let update = MembershipUpdate {
            mac: MAC,
            nonce: 9,
            record: sub.group_record(true),
        };
        let bytes = update.encode();
        assert_eq!(bytes.len(), 12 + 24 + 20);
        assert_eq!(u16::from_be_bytes([bytes[14], bytes[15]]), 44);

        let decoded = MembershipUpdate::decode(&bytes).unwrap();
        assert_eq!(decoded.record.record_type, RecordType::BlockOldSources);
        assert!(decoded.is_leave());
    }

    #[test]
    fn test_multicast_data_payload_offset() {
        let payload = [0x47u8; 188];
        let bytes = MulticastData::encode(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(232, 1, 1, 1),
            5000,
            &payload,
        );
        assert_eq!(bytes.len(), MULTICAST_DATA_OFFSET + payload.len());
        assert_eq!(MulticastData::payload(&bytes).unwrap(), &payload[..]);
        assert_eq!(internet_checksum(&bytes[2..22]), 0);
    }

    #[test]
    fn test_multicast_data_rejects_other_types() {
        let bytes = RelayDiscovery { nonce: 1 }.encode();
        assert!(matches!(
            MulticastData::payload(&bytes),
            Err(CodecError::UnexpectedType { expected: 6, actual: 1 })
        ));
    }

    #[test]
    fn test_multicast_data_short_datagram() {
        let mut bytes = MulticastData::encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, &[]);
        assert_eq!(MulticastData::payload(&bytes).unwrap(), &[] as &[u8]);

        bytes.truncate(25);
        assert!(matches!(
            MulticastData::payload(&bytes),
            Err(CodecError::TooShort { expected: 30, actual: 25 })
        ));

        assert!(matches!(
            MulticastData::payload(&[6]),
            Err(CodecError::TooShort { expected: 1, actual: 0 })
        ));
    }

    proptest::proptest! {
        #[test]
        fn test_decoders_never_panic(
            data in proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..128)
        ) {
            let _ = MessageType::peek(&data);
            let _ = RelayDiscovery::decode(&data);
            let _ = RelayAdvertisement::decode(&data);
            let _ = RelayRequest::decode(&data);
            let _ = MembershipQuery::decode(&data);
            let _ = MembershipUpdate::decode(&data);
            let _ = MulticastData::payload(&data);
        }
    }
}
