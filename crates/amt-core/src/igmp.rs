//! Encapsulated IGMPv3 structures.
//!
//! IGMP is never spoken on the wire here; the relay expects an IGMPv3
//! General Query inside each Membership Query and an IGMPv3 Membership
//! Report (behind a Router Alert IP header) inside each Membership Update.

use crate::checksum::fill_checksum;
use crate::error::CodecError;
use crate::{DEFAULT_QUERY_INTERVAL, IP_ALERT_HEADER_LEN};
use std::net::Ipv4Addr;
use std::time::Duration;

/// IGMP Membership Query type
pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;

/// IGMPv3 Membership Report type
pub const IGMPV3_MEMBERSHIP_REPORT: u8 = 0x22;

/// Destination of IGMPv3 reports (all IGMPv3-capable routers)
pub const IGMPV3_REPORT_DEST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// Destination of general queries (all systems)
pub const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Fixed part of an IGMPv3 General Query (no sources)
pub const IGMP_QUERY_LEN: usize = 12;

/// Decode an IGMPv3 exponential code (QQIC or Max Resp Code).
///
/// Values below 128 are used as-is; above, the low nibble is the mantissa
/// and bits 4-6 the exponent: `(mant | 0x10) << (exp + 3)`. A raw zero
/// decodes to the default query interval of 125.
#[must_use]
pub fn decode_interval_code(code: u8) -> u32 {
    match code {
        0 => DEFAULT_QUERY_INTERVAL,
        1..=127 => u32::from(code),
        _ => {
            let mantissa = u32::from(code & 0x0F);
            let exponent = u32::from((code >> 4) & 0x07);
            (mantissa | 0x10) << (exponent + 3)
        }
    }
}

/// The multicast flow a session subscribes to.
///
/// A source makes it source-specific (SSM); no source is any-source (ASM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Multicast group address
    pub group: Ipv4Addr,
    /// Source address for SSM, `None` for ASM
    pub source: Option<Ipv4Addr>,
}

impl Subscription {
    /// Any-source subscription to `group`
    #[must_use]
    pub fn any_source(group: Ipv4Addr) -> Self {
        Self {
            group,
            source: None,
        }
    }

    /// Subscription with an optional source.
    ///
    /// `0.0.0.0` is treated the same as no source.
    #[must_use]
    pub fn new(group: Ipv4Addr, source: Option<Ipv4Addr>) -> Self {
        Self {
            group,
            source: source.filter(|s| !s.is_unspecified()),
        }
    }

    /// Whether this is a source-specific subscription
    #[must_use]
    pub fn is_ssm(&self) -> bool {
        self.source.is_some()
    }

    /// Group record announcing a join (`leave == false`) or a leave
    #[must_use]
    pub fn group_record(&self, leave: bool) -> GroupRecord {
        let record_type = match (self.source.is_some(), leave) {
            (true, false) => RecordType::ModeIsInclude,
            (true, true) => RecordType::BlockOldSources,
            (false, false) => RecordType::ChangeToExclude,
            (false, true) => RecordType::ChangeToInclude,
        };

        GroupRecord {
            record_type,
            group: self.group,
            sources: self.source.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source {
            Some(source) => write!(f, "({source}, {})", self.group),
            None => write!(f, "(*, {})", self.group),
        }
    }
}

/// IGMPv3 group record types (RFC 3376 section 4.2.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// MODE_IS_INCLUDE
    ModeIsInclude = 1,
    /// MODE_IS_EXCLUDE
    ModeIsExclude = 2,
    /// CHANGE_TO_INCLUDE_MODE
    ChangeToInclude = 3,
    /// CHANGE_TO_EXCLUDE_MODE
    ChangeToExclude = 4,
    /// ALLOW_NEW_SOURCES
    AllowNewSources = 5,
    /// BLOCK_OLD_SOURCES
    BlockOldSources = 6,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ModeIsInclude),
            2 => Ok(Self::ModeIsExclude),
            3 => Ok(Self::ChangeToInclude),
            4 => Ok(Self::ChangeToExclude),
            5 => Ok(Self::AllowNewSources),
            6 => Ok(Self::BlockOldSources),
            other => Err(other),
        }
    }
}

/// One IGMPv3 group record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    /// Record type
    pub record_type: RecordType,
    /// Multicast group
    pub group: Ipv4Addr,
    /// Source list
    pub sources: Vec<Ipv4Addr>,
}

impl GroupRecord {
    /// Encoded length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        8 + 4 * self.sources.len()
    }

    /// A record is never empty on the wire; kept for clippy's `len` convention
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.record_type as u8);
        out.push(0); // aux data len
        out.extend_from_slice(&(self.sources.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.group.octets());
        for source in &self.sources {
            out.extend_from_slice(&source.octets());
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize), CodecError> {
        CodecError::check_len(data, 8)?;
        let record_type = RecordType::try_from(data[0]).map_err(CodecError::UnknownRecordType)?;
        let aux_words = usize::from(data[1]);
        let n_src = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let group = Ipv4Addr::new(data[4], data[5], data[6], data[7]);

        let total = 8 + 4 * n_src + 4 * aux_words;
        CodecError::check_len(data, total)?;

        let sources = data[8..8 + 4 * n_src]
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect();

        Ok((
            Self {
                record_type,
                group,
                sources,
            },
            total,
        ))
    }
}

/// Encode an IGMPv3 Membership Report carrying `records`, checksum filled in.
#[must_use]
pub fn encode_report(records: &[GroupRecord]) -> Vec<u8> {
    let body: usize = records.iter().map(GroupRecord::len).sum();
    let mut report = Vec::with_capacity(8 + body);

    report.push(IGMPV3_MEMBERSHIP_REPORT);
    report.push(0); // reserved
    report.extend_from_slice(&[0, 0]); // checksum placeholder
    report.extend_from_slice(&[0, 0]); // reserved
    report.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        record.encode_into(&mut report);
    }

    fill_checksum(&mut report, 2);
    report
}

/// Decode an IGMPv3 Membership Report into its group records.
pub fn decode_report(data: &[u8]) -> Result<Vec<GroupRecord>, CodecError> {
    CodecError::check_len(data, 8)?;
    if data[0] != IGMPV3_MEMBERSHIP_REPORT {
        return Err(CodecError::UnexpectedType {
            expected: IGMPV3_MEMBERSHIP_REPORT,
            actual: data[0],
        });
    }

    let count = usize::from(u16::from_be_bytes([data[6], data[7]]));
    let mut records = Vec::with_capacity(count);
    let mut offset = 8;
    for _ in 0..count {
        let (record, used) = GroupRecord::decode(&data[offset..])?;
        records.push(record);
        offset += used;
    }
    Ok(records)
}

/// Encode the 24-byte IPv4 header (with Router Alert) that carries an IGMP
/// message of `payload_len` bytes to `dest`.
#[must_use]
pub fn encode_router_alert_header(payload_len: usize, dest: Ipv4Addr) -> [u8; IP_ALERT_HEADER_LEN] {
    let mut header = [0u8; IP_ALERT_HEADER_LEN];
    let total_len = (IP_ALERT_HEADER_LEN + payload_len) as u16;

    header[0] = 0x46; // IPv4, IHL = 6 words
    header[1] = 0xC0; // internetwork control
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    // id, flags/fragment offset stay zero
    header[8] = 1; // TTL
    header[9] = 2; // IGMP
    // source 0.0.0.0
    header[16..20].copy_from_slice(&dest.octets());
    header[20..24].copy_from_slice(&[0x94, 0x04, 0x00, 0x00]); // Router Alert

    fill_checksum(&mut header, 10);
    header
}

/// Length in bytes of the IPv4 header starting at `data`, from its IHL.
pub fn ip_header_len(data: &[u8]) -> Result<usize, CodecError> {
    CodecError::check_len(data, 1)?;
    let ver_ihl = data[0];
    let ihl = usize::from(ver_ihl & 0x0F) * 4;
    if ver_ihl >> 4 != 4 || ihl < crate::IP_HEADER_LEN {
        return Err(CodecError::InvalidIpHeader(ver_ihl));
    }
    Ok(ihl)
}

/// IGMPv3 General Query as relayed inside a Membership Query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgmpQuery {
    /// Raw Max Resp Code
    pub max_resp_code: u8,
    /// Group address (0.0.0.0 for a general query)
    pub group: Ipv4Addr,
    /// Suppress router-side processing flag
    pub suppress: bool,
    /// Querier's robustness variable
    pub robustness: u8,
    /// Raw Querier's Query Interval Code
    pub qqic: u8,
    /// Source list
    pub sources: Vec<Ipv4Addr>,
}

impl IgmpQuery {
    /// General query with the given interval code and no sources
    #[must_use]
    pub fn general(qqic: u8) -> Self {
        Self {
            max_resp_code: 100,
            group: Ipv4Addr::UNSPECIFIED,
            suppress: false,
            robustness: 2,
            qqic,
            sources: Vec::new(),
        }
    }

    /// Query interval in seconds decoded from QQIC
    #[must_use]
    pub fn query_interval_secs(&self) -> u32 {
        decode_interval_code(self.qqic)
    }

    /// Maximum response time (Max Resp Code is in units of 100 ms)
    #[must_use]
    pub fn max_response_time(&self) -> Duration {
        let tenths = match self.max_resp_code {
            0 => 0,
            code => decode_interval_code(code),
        };
        Duration::from_millis(u64::from(tenths) * 100)
    }

    /// Decode a query from the IGMP bytes following the encapsulated IP header
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        CodecError::check_len(data, IGMP_QUERY_LEN)?;
        if data[0] != IGMP_MEMBERSHIP_QUERY {
            return Err(CodecError::NotGeneralQuery(data[0]));
        }

        let n_src = usize::from(u16::from_be_bytes([data[10], data[11]]));
        // Relays may announce sources beyond what fits the datagram; keep what arrived
        let sources = data[IGMP_QUERY_LEN..]
            .chunks_exact(4)
            .take(n_src)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect();

        Ok(Self {
            max_resp_code: data[1],
            group: Ipv4Addr::new(data[4], data[5], data[6], data[7]),
            suppress: data[8] & 0x08 != 0,
            robustness: data[8] & 0x07,
            qqic: data[9],
            sources,
        })
    }

    /// Encode with checksum (relay side; used by test relays and probes)
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IGMP_QUERY_LEN + 4 * self.sources.len());
        out.push(IGMP_MEMBERSHIP_QUERY);
        out.push(self.max_resp_code);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.group.octets());
        out.push((u8::from(self.suppress) << 3) | (self.robustness & 0x07));
        out.push(self.qqic);
        out.extend_from_slice(&(self.sources.len() as u16).to_be_bytes());
        for source in &self.sources {
            out.extend_from_slice(&source.octets());
        }
        fill_checksum(&mut out, 2);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::internet_checksum;

    #[test]
    fn test_qqic_zero_is_default() {
        assert_eq!(decode_interval_code(0), 125);
    }

    #[test]
    fn test_qqic_linear_range() {
        assert_eq!(decode_interval_code(1), 1);
        assert_eq!(decode_interval_code(100), 100);
        assert_eq!(decode_interval_code(127), 127);
    }

    #[test]
    fn test_qqic_exponential() {
        // mantissa 0101, exponent 011
        assert_eq!(decode_interval_code(0b1_011_0101), 1344);
        // smallest and largest exponential values
        assert_eq!(decode_interval_code(0x80), 128);
        assert_eq!(decode_interval_code(0xFF), 31744);
    }

    #[test]
    fn test_group_record_types() {
        let group = Ipv4Addr::new(232, 1, 1, 1);
        let source = Ipv4Addr::new(192, 0, 2, 10);

        let ssm = Subscription::new(group, Some(source));
        assert_eq!(ssm.group_record(false).record_type, RecordType::ModeIsInclude);
        assert_eq!(ssm.group_record(true).record_type, RecordType::BlockOldSources);
        assert_eq!(ssm.group_record(false).sources, vec![source]);

        let asm = Subscription::any_source(group);
        assert_eq!(asm.group_record(false).record_type, RecordType::ChangeToExclude);
        assert_eq!(asm.group_record(true).record_type, RecordType::ChangeToInclude);
        assert!(asm.group_record(false).sources.is_empty());
    }

    #[test]
    fn test_unspecified_source_is_asm() {
        let sub = Subscription::new(Ipv4Addr::new(239, 1, 2, 3), Some(Ipv4Addr::UNSPECIFIED));
        assert!(!sub.is_ssm());
        assert_eq!(sub.to_string(), "(*, 239.1.2.3)");
    }

    #[test]
    fn test_report_layout_ssm() {
        let sub = Subscription::new(Ipv4Addr::new(232, 1, 1, 1), Some(Ipv4Addr::new(10, 0, 0, 1)));
        let report = encode_report(&[sub.group_record(false)]);

        assert_eq!(report.len(), 20);
        assert_eq!(report[0], IGMPV3_MEMBERSHIP_REPORT);
        assert_eq!(&report[6..8], &[0, 1]); // one record
        assert_eq!(report[8], RecordType::ModeIsInclude as u8);
        assert_eq!(&report[10..12], &[0, 1]); // one source
        assert_eq!(&report[12..16], &[232, 1, 1, 1]);
        assert_eq!(&report[16..20], &[10, 0, 0, 1]);
        assert_eq!(internet_checksum(&report), 0);
    }

    #[test]
    fn test_report_layout_asm() {
        let sub = Subscription::any_source(Ipv4Addr::new(239, 255, 0, 1));
        let report = encode_report(&[sub.group_record(true)]);

        assert_eq!(report.len(), 16);
        assert_eq!(report[8], RecordType::ChangeToInclude as u8);
        assert_eq!(&report[10..12], &[0, 0]);
        assert_eq!(internet_checksum(&report), 0);

        let records = decode_report(&report).unwrap();
        assert_eq!(records, vec![sub.group_record(true)]);
    }

    #[test]
    fn test_router_alert_header() {
        let header = encode_router_alert_header(20, IGMPV3_REPORT_DEST);
        assert_eq!(header[0], 0x46);
        assert_eq!(header[1], 0xC0);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 44);
        assert_eq!(header[8], 1);
        assert_eq!(header[9], 2);
        assert_eq!(&header[12..16], &[0, 0, 0, 0]);
        assert_eq!(&header[16..20], &[224, 0, 0, 22]);
        assert_eq!(&header[20..24], &[0x94, 0x04, 0x00, 0x00]);
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn test_ip_header_len() {
        assert_eq!(ip_header_len(&[0x45]).unwrap(), 20);
        assert_eq!(ip_header_len(&[0x46]).unwrap(), 24);
        assert!(matches!(
            ip_header_len(&[0x44]),
            Err(CodecError::InvalidIpHeader(0x44))
        ));
        assert!(matches!(
            ip_header_len(&[0x65]),
            Err(CodecError::InvalidIpHeader(0x65))
        ));
    }

    #[test]
    fn test_query_decode() {
        let mut query = IgmpQuery::general(0b1_011_0101);
        query.sources = vec![Ipv4Addr::new(198, 51, 100, 7)];
        let bytes = query.encode();

        let decoded = IgmpQuery::decode(&bytes).unwrap();
        assert_eq!(decoded, query);
        assert_eq!(decoded.query_interval_secs(), 1344);
        assert_eq!(decoded.max_response_time(), Duration::from_secs(10));
        assert_eq!(internet_checksum(&bytes), 0);
    }

    #[test]
    fn test_query_decode_rejects_report() {
        let report = encode_report(&[Subscription::any_source(Ipv4Addr::new(239, 0, 0, 1))
            .group_record(false)]);
        assert!(matches!(
            IgmpQuery::decode(&report[..12]),
            Err(CodecError::NotGeneralQuery(0x22))
        ));
    }

    #[test]
    fn test_query_truncated_source_list() {
        let mut bytes = IgmpQuery::general(0).encode();
        bytes[11] = 3; // claims three sources, carries none
        let decoded = IgmpQuery::decode(&bytes).unwrap();
        assert!(decoded.sources.is_empty());
        assert_eq!(decoded.query_interval_secs(), 125);
    }
}
