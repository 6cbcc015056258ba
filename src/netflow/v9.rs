use bincode::Options;
use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::netflow::template::{Template, TemplateCache};

pub const VERSION: u16 = 9;

// a data flowset may end with up to 3 zero bytes of alignment padding
const MAX_PADDING: usize = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not enough space in datagram to read the NETFLOW V9 Header, required {required} but received {received}")]
    TruncatedPacket { required: usize, received: usize },

    #[error("Invalid netflow version, expected 9, read {0}")]
    UnsupportedVersion(u16),

    #[error("Not enough space in datagram to read a FlowSet header, required {required} but received {received}")]
    TruncatedHeader { required: usize, received: usize },

    #[error("FlowSet {id} declares a length of {declared} bytes but {remaining} bytes remain in the datagram")]
    LengthMismatch { id: u16, declared: u16, remaining: usize },

    #[error("Not enough space in FlowSet to read template {id}, required {required} but received {received}")]
    TruncatedTemplate { id: u16, required: usize, received: usize },

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

// every fixed size structure of the protocol is a sequence of big endian integers
fn read_be<'a, T: serde::Deserialize<'a>>(buf: &'a [u8]) -> Result<T, Error> {
    Ok(bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_big_endian()
        .deserialize(buf)?)
}

/******************************** PACKET HEADER ********************************/

/// from https://www.ietf.org/rfc/rfc3954.txt
/// ```
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Version Number          |            Count              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           sysUpTime                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           UNIX Secs                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Sequence Number                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Source ID                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Deserialize)]
pub struct Header {
    pub version: u16,    // Version of Flow Record format exported in this packet
    pub count: u16,      // Total number of records in the Export Packet, template and data records together
    pub sys_uptime: u32, // Time in milliseconds since this device was first booted
    pub unix_secs: u32,  // Time in seconds since 0000 UTC 1970, at which the Export Packet leaves the Exporter
    pub seq_number: u32, // Incremental sequence counter of all Export Packets sent from the current Observation Domain
    pub source_id: u32,  // Identifies the Exporter Observation Domain
}

impl Header {
    pub const SIZE: usize = 20;

    pub fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::TruncatedPacket { required: Self::SIZE, received: buf.len() });
        }

        read_be(buf)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "version: {}, count: {}, uptime: {}ms, unix_secs: {}s, seq_number: {}, source_id: {}",
            self.version, self.count, self.sys_uptime, self.unix_secs, self.seq_number, self.source_id
        )
    }
}

/******************************** FLOWSET HEADER ********************************/

/// ```
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       FlowSet ID              |          Length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Deserialize)]
pub struct FlowSetHeader {
    pub id: u16,     // 0 for a Template FlowSet, 1 for an Options Template FlowSet, > 255 for a Data FlowSet
    pub length: u16, // Total length of the FlowSet, including this header and the padding
}

impl FlowSetHeader {
    pub const SIZE: usize = 4;
    pub const TEMPLATE_ID: u16 = 0;
    pub const OPTION_TEMPLATE_ID: u16 = 1;
    pub const MIN_DATA_ID: u16 = 256;

    pub fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::TruncatedHeader { required: Self::SIZE, received: buf.len() });
        }

        read_be(buf)
    }
}

/******************************** TEMPLATE HEADER ********************************/

/// ```
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Template ID (> 255)      |         Field Count           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Deserialize)]
pub struct TemplateHeader {
    pub id: u16,          // Template ID, unique per exporter and in the range 256 to 65535
    pub field_count: u16, // Number of fields in this Template Record
}

impl TemplateHeader {
    pub const SIZE: usize = 4;

    pub fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::TruncatedTemplate { id: 0, required: Self::SIZE, received: buf.len() });
        }

        read_be(buf)
    }
}

/******************************** TEMPLATE FIELD ********************************/

/// ```
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Field Type             |         Field Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct TemplateField {
    pub typ: u16,    // Numeric field type, unknown types are kept as is
    pub length: u16, // Length of the corresponding value in a data record, in octets
}

impl TemplateField {
    pub const SIZE: usize = 4;

    pub fn new(typ: FieldType, length: u16) -> Self {
        TemplateField { typ: typ as u16, length }
    }

    pub fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::TruncatedTemplate { id: 0, required: Self::SIZE, received: buf.len() });
        }

        read_be(buf)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u16(self.typ)
    }
}

impl fmt::Display for TemplateField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.field_type() {
            Some(typ) => write!(f, "{:?} ({}) length: {}", typ, self.typ, self.length),
            None => write!(f, "Unknown ({}) length: {}", self.typ, self.length),
        }
    }
}

/******************************** DATA RECORD ********************************/

/// One data record laid out per its template, keyed by numeric field type.
#[derive(Debug, Default, PartialEq)]
pub struct DataSet {
    pub fields: HashMap<u16, FieldValue>,
}

impl DataSet {
    // `buf` holds at least `template.length` bytes, checked by `read_records`
    fn read(buf: &[u8], template: &Template) -> Self {
        let mut fields = HashMap::with_capacity(template.fields.len());
        let mut offset = 0;

        for field in &template.fields {
            let end = offset + field.length as usize;
            fields.insert(field.typ, FieldValue::read(&buf[offset..end]));
            offset = end;
        }

        DataSet { fields }
    }

    #[inline]
    pub fn get(&self, typ: FieldType) -> Option<&FieldValue> {
        self.fields.get(&(typ as u16))
    }
}

impl fmt::Display for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (typ, value) in self.fields.iter() {
            match (FieldType::from_u16(*typ), value) {
                (Some(t @ FieldType::Ipv4SrcAddr), FieldValue::U32(v)) | (Some(t @ FieldType::Ipv4DstAddr), FieldValue::U32(v)) => {
                    write!(f, "{:?}: {}, ", t, Ipv4Addr::from(*v))?
                }
                (Some(t), _) => write!(f, "{:?}: {}, ", t, value)?,
                (None, _) => write!(f, "{}: {}, ", typ, value)?,
            }
        }

        Ok(())
    }
}

/******************************** FLOWSET ********************************/

/// The outcome of decoding one flowset of a datagram.
#[derive(Debug, PartialEq)]
pub enum FlowSet {
    /// Template flowset, holding the ids of the templates it installed.
    Template(Vec<u16>),
    Data { template_id: u16, records: Vec<DataSet> },
    /// Data flowset whose template has not been announced by the exporter yet.
    UnknownTemplate(u16),
    /// Options template or reserved flowset id.
    Ignored(u16),
}

/******************************** PACKET ********************************/

#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    pub flowsets: Vec<FlowSet>,
}

impl Packet {
    pub fn read(exporter: u32, buf: &[u8], cache: &mut TemplateCache) -> Result<Self, Error> {
        let header = Header::read(buf)?;
        if header.version != VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }

        let flowsets = decode_flowsets(exporter, &buf[Header::SIZE..], cache)?;

        Ok(Packet { header, flowsets })
    }

    pub fn records(&self) -> impl Iterator<Item = &DataSet> {
        self.flowsets.iter().flat_map(|flowset| {
            let records: &[DataSet] = match flowset {
                FlowSet::Data { records, .. } => records,
                _ => &[],
            };
            records.iter()
        })
    }
}

/// Decodes every flowset that follows the packet header. Template flowsets are
/// installed into `cache` as they are met, so a data flowset may refer to a
/// template announced earlier in the same datagram.
pub fn decode_flowsets(exporter: u32, buf: &[u8], cache: &mut TemplateCache) -> Result<Vec<FlowSet>, Error> {
    let mut flowsets = vec![];
    let mut offset = 0;

    while offset < buf.len() {
        let header = FlowSetHeader::read(&buf[offset..])?;
        let remaining = buf.len() - offset;
        let length = header.length as usize;

        if length < FlowSetHeader::SIZE || length > remaining {
            return Err(Error::LengthMismatch { id: header.id, declared: header.length, remaining });
        }

        let content = &buf[offset + FlowSetHeader::SIZE..offset + length];
        offset += length;

        let flowset = match header.id {
            FlowSetHeader::TEMPLATE_ID => FlowSet::Template(install_templates(exporter, content, cache)?),
            id if id < FlowSetHeader::MIN_DATA_ID => FlowSet::Ignored(id),
            id => match cache.lookup(exporter, id) {
                Some(template) => FlowSet::Data { template_id: id, records: read_records(content, template)? },
                None => {
                    debug!("No template found for exporter {} with id {}", Ipv4Addr::from(exporter), id);
                    FlowSet::UnknownTemplate(id)
                }
            },
        };

        flowsets.push(flowset);
    }

    Ok(flowsets)
}

fn install_templates(exporter: u32, buf: &[u8], cache: &mut TemplateCache) -> Result<Vec<u16>, Error> {
    let mut installed = vec![];
    let mut offset = 0;

    while buf.len() - offset >= TemplateHeader::SIZE {
        let header = TemplateHeader::read(&buf[offset..])?;
        if header.id < FlowSetHeader::MIN_DATA_ID {
            // only padding can hold such an id
            break;
        }
        offset += TemplateHeader::SIZE;

        let required = header.field_count as usize * TemplateField::SIZE;
        if buf.len() - offset < required {
            return Err(Error::TruncatedTemplate { id: header.id, required, received: buf.len() - offset });
        }

        let mut fields = Vec::with_capacity(header.field_count as usize);
        for _ in 0..header.field_count {
            fields.push(TemplateField::read(&buf[offset..])?);
            offset += TemplateField::SIZE;
        }

        cache.install(exporter, header.id, fields);
        installed.push(header.id);
    }

    Ok(installed)
}

fn read_records(buf: &[u8], template: &Template) -> Result<Vec<DataSet>, Error> {
    let mut records = vec![];
    if template.length == 0 {
        return Ok(records);
    }

    let mut offset = 0;
    while buf.len() - offset > MAX_PADDING && buf.len() - offset >= template.length {
        records.push(DataSet::read(&buf[offset..], template));
        offset += template.length;
    }

    if buf.len() - offset > MAX_PADDING {
        debug!("Ignoring {} trailing bytes in data flowset of template {}", buf.len() - offset, template.id);
    }

    Ok(records)
}

/******************************** FIELD VALUE ********************************/

/// A raw field value, interpreted by its length.
#[derive(Debug, PartialEq, Clone)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    Dyn(Vec<u8>),
}

impl FieldValue {
    pub fn read(buf: &[u8]) -> Self {
        match buf.len() {
            1 => FieldValue::U8(buf[0]),
            2 => FieldValue::U16(u16::from_be_bytes([buf[0], buf[1]])),
            4 => FieldValue::U32(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
            8 => {
                let mut bytes = [0; 8];
                bytes.copy_from_slice(buf);
                FieldValue::U64(u64::from_be_bytes(bytes))
            }
            16 => {
                let mut bytes = [0; 16];
                bytes.copy_from_slice(buf);
                FieldValue::U128(u128::from_be_bytes(bytes))
            }
            _ => FieldValue::Dyn(buf.to_vec()),
        }
    }

    /// Counters may be exported on any width up to 8 bytes, odd widths are
    /// folded as big endian integers.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(*v as u64),
            FieldValue::U16(v) => Some(*v as u64),
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            FieldValue::Dyn(bytes) if !bytes.is_empty() && bytes.len() <= 8 => {
                Some(bytes.iter().fold(0, |acc, b| acc << 8 | *b as u64))
            }
            FieldValue::U128(_) | FieldValue::Dyn(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.as_u64().and_then(|v| u8::try_from(v).ok())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::U8(v) => fmt::Display::fmt(v, f),
            FieldValue::U16(v) => fmt::Display::fmt(v, f),
            FieldValue::U32(v) => fmt::Display::fmt(v, f),
            FieldValue::U64(v) => fmt::Display::fmt(v, f),
            FieldValue::U128(v) => fmt::Display::fmt(v, f),
            FieldValue::Dyn(v) => write!(f, "{:02x?}", v),
        }
    }
}

/******************************** NETFLOW V9 FIELD TYPE ********************************/

/// from https://www.ietf.org/rfc/rfc3954.txt section 8
#[derive(FromPrimitive, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Copy, Clone)]
#[repr(u16)]
pub enum FieldType {
    InBytes = 1,
    InPkts = 2,
    Flows = 3,
    Protocol = 4,
    SrcTos = 5,
    TcpFlags = 6,
    L4SrcPort = 7,
    Ipv4SrcAddr = 8,
    SrcMask = 9,
    InputSnmp = 10,
    L4DstPort = 11,
    Ipv4DstAddr = 12,
    DstMask = 13,
    OutputSnmp = 14,
    Ipv4NextHop = 15,
    SrcAs = 16,
    DstAs = 17,
    BgpIpv4NextHop = 18,
    MulDstPkts = 19,
    MulDstBytes = 20,
    LastSwitched = 21,
    FirstSwitched = 22,
    OutBytes = 23,
    OutPkts = 24,
    MinPktLength = 25,
    MaxPktLength = 26,
    Ipv6SrcAddr = 27,
    Ipv6DstAddr = 28,
    Ipv6SrcMask = 29,
    Ipv6DstMask = 30,
    Ipv6FlowLabel = 31,
    IcmpType = 32,
    MulIgmpType = 33,
    SamplingInterval = 34,
    SamplingAlgorithm = 35,
    FlowActiveTimeout = 36,
    FlowInactiveTimeout = 37,
    EngineType = 38,
    EngineId = 39,
    TotalBytesExp = 40,
    TotalPktsExp = 41,
    TotalFlowsExp = 42,
    // 43	vendor proprietary
    Ipv4SrcPrefix = 44,
    Ipv4DstPrefix = 45,
    MplsTopLabelType = 46,
    MplsTopLabelIpAddr = 47,
    FlowSamplerId = 48,
    FlowSamplerMode = 49,
    FlowSamplerRandomInterval = 50,
    // 51	vendor proprietary
    MinTtl = 52,
    MaxTtl = 53,
    Ipv4Ident = 54,
    DstTos = 55,
    InSrcMac = 56,
    OutDstMac = 57,
    SrcVlan = 58,
    DstVlan = 59,
    IpProtocolVersion = 60,
    Direction = 61,
    Ipv6NextHop = 62,
    BgpIpv6NextHop = 63,
    Ipv6OptionHeaders = 64,
    // 65-69	vendor proprietary
    MplsLabel1 = 70,
    MplsLabel2 = 71,
    MplsLabel3 = 72,
    MplsLabel4 = 73,
    MplsLabel5 = 74,
    MplsLabel6 = 75,
    MplsLabel7 = 76,
    MplsLabel8 = 77,
    MplsLabel9 = 78,
    MplsLabel10 = 79,
    InDstMac = 80,
    OutSrcMac = 81,
    IfName = 82,
    IfDesc = 83,
    SamplerName = 84,
    InPermanentBytes = 85,
    InPermanentPkts = 86,
    // 87	vendor proprietary
    FragmentOffset = 88,
    ForwardingStatus = 89,
    MplsPalRd = 90,
    MplsPrefixLen = 91,
    SrcTrafficIndex = 92,
    DstTrafficIndex = 93,
    ApplicationDescription = 94,
    ApplicationTag = 95,
    ApplicationName = 96,
    // 97	vendor proprietary
    PostIpDiffServCodePoint = 98,
    ReplicationFactor = 99,
    // 100-101	vendor proprietary
    Layer2PacketSectionOffset = 102,
    Layer2PacketSectionSize = 103,
    Layer2PacketSectionData = 104,
    // 105-127	reserved
    DstAsPeer = 128,
    SrcAsPeer = 129,
    ExporterIpv4Addr = 130,
    IngressVrfId = 234,
    EgressVrfId = 235,
}
