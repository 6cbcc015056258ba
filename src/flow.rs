use serde_derive::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

use crate::enrichment::RangeRecord;
use crate::netflow::v9::{DataSet, FieldType, FieldValue};

/// The fields of a decoded data record that the collector cares about.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Flow {
    pub exporter: u32,  // Address of the device which exported the flow
    pub input_int: u32, // SNMP index of input interface
    pub src_addr: u32,  // Source IP address
    pub dst_addr: u32,  // Destination IP address
    pub src_mask: u8,   // Source address prefix mask bits
    pub dst_mask: u8,   // Destination address prefix mask bits
    pub src_port: u16,  // TCP/UDP source port number or equivalent
    pub dst_port: u16,  // TCP/UDP destination port number or equivalent
    pub protocol: u8,   // IP protocol type (for example, TCP = 6; UDP = 17)
    pub octets: u64,    // Incoming counter for the number of bytes associated with an IP flow
    pub packets: u64,   // Incoming counter for the number of packets associated with an IP flow
}

impl Flow {
    /// Returns `None` when the record has no IPv4 source address, since such a
    /// flow can neither be aggregated by prefix nor enriched. An address field
    /// which is not 4 bytes long also discards the record.
    pub fn from_dataset(exporter: u32, msg: &DataSet) -> Option<Self> {
        let src_addr = ipv4(msg.get(FieldType::Ipv4SrcAddr)?)?;
        let dst_addr = match msg.get(FieldType::Ipv4DstAddr) {
            Some(value) => ipv4(value)?,
            None => 0,
        };

        let u64_of = |typ| msg.get(typ).and_then(FieldValue::as_u64).unwrap_or(0);
        let mask_of = |typ| msg.get(typ).and_then(FieldValue::as_u8).unwrap_or(0).min(32);

        Some(Flow {
            exporter,
            input_int: msg.get(FieldType::InputSnmp).and_then(FieldValue::as_u32).unwrap_or(0),
            src_addr,
            dst_addr,
            src_mask: mask_of(FieldType::SrcMask),
            dst_mask: mask_of(FieldType::DstMask),
            src_port: msg.get(FieldType::L4SrcPort).and_then(FieldValue::as_u16).unwrap_or(0),
            dst_port: msg.get(FieldType::L4DstPort).and_then(FieldValue::as_u16).unwrap_or(0),
            protocol: msg.get(FieldType::Protocol).and_then(FieldValue::as_u8).unwrap_or(0),
            octets: u64_of(FieldType::InBytes),
            packets: u64_of(FieldType::InPkts),
        })
    }

    #[inline]
    pub fn src_prefix(&self) -> u32 {
        prefix(self.src_addr, self.src_mask)
    }

    #[inline]
    pub fn dst_prefix(&self) -> u32 {
        prefix(self.dst_addr, self.dst_mask)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "from: {}/{}:{}, to: {}/{}:{}, octets: {}, packets: {}, protocol: {}, exporter: {}",
            Ipv4Addr::from(self.src_addr),
            self.src_mask,
            self.src_port,
            Ipv4Addr::from(self.dst_addr),
            self.dst_mask,
            self.dst_port,
            self.octets,
            self.packets,
            self.protocol,
            Ipv4Addr::from(self.exporter)
        )
    }
}

fn ipv4(value: &FieldValue) -> Option<u32> {
    match value {
        FieldValue::U32(addr) => Some(*addr),
        _ => None,
    }
}

/// Truncates `addr` to its first `mask` bits. A mask of 0 covers the whole
/// address space.
pub fn prefix(addr: u32, mask: u8) -> u32 {
    addr & !u32::MAX.checked_shr(mask as u32).unwrap_or(0)
}

/// One enriched flow, serialized as one JSON line. The ownership fields are
/// `null` for an endpoint which is not covered by the range table.
#[derive(Debug, Serialize, PartialEq)]
pub struct FlowRecord {
    #[serde(rename = "Agent")]
    pub exporter: Ipv4Addr,
    #[serde(rename = "AgentIf")]
    pub input_int: u32,
    #[serde(rename = "SrcNet")]
    pub src_net: String,
    #[serde(rename = "DstNet")]
    pub dst_net: String,
    #[serde(rename = "Src")]
    pub src: Ipv4Addr,
    #[serde(rename = "Dst")]
    pub dst: Ipv4Addr,
    #[serde(rename = "SrcPort")]
    pub src_port: u16,
    #[serde(rename = "DstPort")]
    pub dst_port: u16,
    #[serde(rename = "Bytes")]
    pub octets: u64,
    #[serde(rename = "Pkts")]
    pub packets: u64,
    #[serde(rename = "Protocol")]
    pub protocol: u8,
    #[serde(rename = "SrcAS")]
    pub src_as: Option<u32>,
    #[serde(rename = "DstAS")]
    pub dst_as: Option<u32>,
    #[serde(rename = "SrcCountry")]
    pub src_country: Option<String>,
    #[serde(rename = "DstCountry")]
    pub dst_country: Option<String>,
    #[serde(rename = "SrcOrg")]
    pub src_org: Option<String>,
    #[serde(rename = "DstOrg")]
    pub dst_org: Option<String>,
}

impl FlowRecord {
    pub fn new(flow: &Flow, src: Option<&RangeRecord>, dst: Option<&RangeRecord>) -> Self {
        FlowRecord {
            exporter: Ipv4Addr::from(flow.exporter),
            input_int: flow.input_int,
            src_net: format!("{}/{}", Ipv4Addr::from(flow.src_prefix()), flow.src_mask),
            dst_net: format!("{}/{}", Ipv4Addr::from(flow.dst_prefix()), flow.dst_mask),
            src: Ipv4Addr::from(flow.src_addr),
            dst: Ipv4Addr::from(flow.dst_addr),
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            octets: flow.octets,
            packets: flow.packets,
            protocol: flow.protocol,
            src_as: src.map(|r| r.asn),
            dst_as: dst.map(|r| r.asn),
            src_country: src.map(|r| r.country.clone()),
            dst_country: dst.map(|r| r.country.clone()),
            src_org: src.map(|r| r.org.clone()),
            dst_org: dst.map(|r| r.org.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dataset(fields: Vec<(FieldType, FieldValue)>) -> DataSet {
        DataSet { fields: fields.into_iter().map(|(t, v)| (t as u16, v)).collect() }
    }

    #[test]
    fn prefix_truncates_to_mask() {
        let addr = u32::from(Ipv4Addr::new(10, 1, 2, 3));

        assert_eq!(Ipv4Addr::from(prefix(addr, 24)), Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(Ipv4Addr::from(prefix(addr, 8)), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(Ipv4Addr::from(prefix(addr, 0)), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(Ipv4Addr::from(prefix(addr, 32)), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(Ipv4Addr::from(prefix(addr, 33)), Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn extract_flow() {
        let msg = dataset(vec![
            (FieldType::Ipv4SrcAddr, FieldValue::U32(u32::from(Ipv4Addr::new(10, 0, 0, 1)))),
            (FieldType::Ipv4DstAddr, FieldValue::U32(u32::from(Ipv4Addr::new(192, 168, 1, 10)))),
            (FieldType::SrcMask, FieldValue::U8(24)),
            (FieldType::DstMask, FieldValue::U8(16)),
            (FieldType::InBytes, FieldValue::U64(1 << 33)),
            (FieldType::InPkts, FieldValue::U32(12)),
            (FieldType::InputSnmp, FieldValue::U16(3)),
            (FieldType::Protocol, FieldValue::U8(17)),
            (FieldType::L4SrcPort, FieldValue::U16(53)),
            (FieldType::L4DstPort, FieldValue::U16(40000)),
        ]);

        let flow = Flow::from_dataset(7, &msg).unwrap();

        assert_eq!(flow.exporter, 7);
        assert_eq!(flow.input_int, 3);
        assert_eq!(flow.octets, 1 << 33);
        assert_eq!(flow.packets, 12);
        assert_eq!(flow.protocol, 17);
        assert_eq!((flow.src_port, flow.dst_port), (53, 40000));
        assert_eq!(Ipv4Addr::from(flow.src_prefix()), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(Ipv4Addr::from(flow.dst_prefix()), Ipv4Addr::new(192, 168, 0, 0));
    }

    #[test]
    fn missing_mask_covers_everything() {
        let msg = dataset(vec![(FieldType::Ipv4SrcAddr, FieldValue::U32(0x0a00_0001))]);
        let flow = Flow::from_dataset(1, &msg).unwrap();

        assert_eq!(flow.src_mask, 0);
        assert_eq!(flow.src_prefix(), 0);
        assert_eq!(flow.dst_addr, 0);
    }

    #[test]
    fn missing_source_is_discarded() {
        let msg = dataset(vec![
            (FieldType::Ipv4DstAddr, FieldValue::U32(0x0a00_0001)),
            (FieldType::InBytes, FieldValue::U32(10)),
        ]);

        assert_eq!(Flow::from_dataset(1, &msg), None);
    }

    #[test]
    fn short_address_fields_are_discarded() {
        let msg = dataset(vec![(FieldType::Ipv4SrcAddr, FieldValue::U16(0x0a01))]);
        assert_eq!(Flow::from_dataset(1, &msg), None);

        let msg = dataset(vec![
            (FieldType::Ipv4SrcAddr, FieldValue::U32(0x0a00_0001)),
            (FieldType::Ipv4DstAddr, FieldValue::U8(10)),
        ]);
        assert_eq!(Flow::from_dataset(1, &msg), None);
    }

    #[test]
    fn odd_width_counters() {
        let msg = dataset(vec![
            (FieldType::Ipv4SrcAddr, FieldValue::U32(0x0a00_0001)),
            (FieldType::InBytes, FieldValue::Dyn(vec![0, 0, 0, 0, 0x05, 0xdc])),
            (FieldType::InPkts, FieldValue::Dyn(vec![0, 0, 3])),
        ]);
        let flow = Flow::from_dataset(1, &msg).unwrap();

        assert_eq!(flow.octets, 1500);
        assert_eq!(flow.packets, 3);
    }

    #[test]
    fn serialize_record() {
        let flow = Flow {
            exporter: u32::from(Ipv4Addr::new(192, 0, 2, 1)),
            input_int: 2,
            src_addr: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: u32::from(Ipv4Addr::new(10, 0, 1, 1)),
            src_mask: 24,
            dst_mask: 32,
            src_port: 1234,
            dst_port: 80,
            protocol: 6,
            octets: 100,
            packets: 1,
        };
        let owner = RangeRecord { start: 0, end: u32::MAX, asn: 64500, country: "NL".to_string(), org: "EXAMPLE".to_string() };

        let json = serde_json::to_string(&FlowRecord::new(&flow, Some(&owner), None)).unwrap();

        assert_eq!(
            json,
            "{\"Agent\":\"192.0.2.1\",\"AgentIf\":2,\"SrcNet\":\"10.0.0.0/24\",\"DstNet\":\"10.0.1.1/32\",\
             \"Src\":\"10.0.0.1\",\"Dst\":\"10.0.1.1\",\"SrcPort\":1234,\"DstPort\":80,\"Bytes\":100,\"Pkts\":1,\
             \"Protocol\":6,\"SrcAS\":64500,\"DstAS\":null,\"SrcCountry\":\"NL\",\"DstCountry\":null,\
             \"SrcOrg\":\"EXAMPLE\",\"DstOrg\":null}"
        );
    }
}
