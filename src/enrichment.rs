use flate2::read::GzDecoder;
use log::{info, warn};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::flow::{Flow, FlowRecord};

pub const DEFAULT_URL: &str = "https://iptoasn.com/data/ip2asn-v4-u32.tsv.gz";

/// An IPv4 range and its owner, as published by iptoasn.com.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRecord {
    pub start: u32,
    pub end: u32,
    pub asn: u32,
    pub country: String,
    pub org: String,
}

enum Row {
    Owned(RangeRecord),
    NoOwner,
    Malformed,
}

impl RangeRecord {
    // columns: range_start range_end AS_number country_code AS_description
    fn parse(row: &csv::StringRecord) -> Row {
        if row.len() < 5 {
            return Row::Malformed;
        }

        // "0" or garbage marks a range which is not routed by anybody
        let asn = match row[2].trim().parse::<i64>() {
            Ok(asn) if asn > 0 && asn <= u32::MAX as i64 => asn as u32,
            _ => return Row::NoOwner,
        };

        match (row[0].trim().parse::<u32>(), row[1].trim().parse::<u32>()) {
            (Ok(start), Ok(end)) => Row::Owned(RangeRecord { start, end, asn, country: row[3].to_string(), org: row[4].to_string() }),
            _ => Row::Malformed,
        }
    }
}

/// What to do with a flow when one of its endpoints is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    Drop,
    EmitPartial,
}

impl MissPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissPolicy::Drop => "drop",
            MissPolicy::EmitPartial => "emit-partial",
        }
    }
}

impl Default for MissPolicy {
    fn default() -> Self {
        MissPolicy::Drop
    }
}

impl FromStr for MissPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(MissPolicy::Drop),
            "emit-partial" => Ok(MissPolicy::EmitPartial),
            _ => Err(format!("Invalid miss policy {}, expected drop or emit-partial", s)),
        }
    }
}

/// Ownership ranges sorted by ascending end address, without overlap. The
/// source file guarantees the order, it is not checked again here.
#[derive(Debug, Default)]
pub struct RangeTable {
    ranges: Vec<RangeRecord>,
}

impl RangeTable {
    pub fn new(ranges: Vec<RangeRecord>) -> Self {
        RangeTable { ranges }
    }

    /// Loads a gzip compressed, tab separated range file.
    pub fn read(path: &Path) -> Result<Self> {
        info!("Reading the range file {}", path.display());
        let file = File::open(path)?;

        Self::from_reader(GzDecoder::new(BufReader::new(file)))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(reader);

        let mut ranges = vec![];
        let (mut no_owner, mut malformed) = (0, 0);

        for row in reader.records() {
            match RangeRecord::parse(&row?) {
                Row::Owned(range) => ranges.push(range),
                Row::NoOwner => no_owner += 1,
                Row::Malformed => malformed += 1,
            }
        }

        if malformed > 0 {
            warn!("Skipped {} malformed rows in the range file", malformed);
        }
        info!("Loaded {} ranges, skipped {} ranges without owner", ranges.len(), no_owner);

        Ok(RangeTable { ranges })
    }

    /// Finds the first range whose end is not below `ip`. Ranges without owner
    /// are not loaded, so an address falling in such a hole is a miss rather
    /// than being credited to the next range.
    pub fn lookup(&self, ip: u32) -> Option<&RangeRecord> {
        let idx = self.ranges.partition_point(|r| r.end < ip);

        self.ranges.get(idx).filter(|r| r.start <= ip)
    }

    /// Returns `None` when the flow has to be dropped under `policy`.
    pub fn enrich(&self, flow: &Flow, policy: MissPolicy) -> Option<FlowRecord> {
        let src = self.lookup(flow.src_addr);
        let dst = self.lookup(flow.dst_addr);

        if policy == MissPolicy::Drop && (src.is_none() || dst.is_none()) {
            return None;
        }

        Some(FlowRecord::new(flow, src, dst))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Fetches the range file into `path`. The previous copy is only replaced once
/// the download is complete.
pub fn download(url: &str, path: &Path) -> Result<u64> {
    info!("Downloading {} to {}", url, path.display());

    let fetch_error = |source| Error::UpstreamFetch { url: url.to_string(), source };

    let mut response = reqwest::blocking::get(url).map_err(fetch_error)?;
    if !response.status().is_success() {
        return Err(Error::UpstreamStatus { url: url.to_string(), status: response.status() });
    }

    let partial = path.with_extension("part");
    let mut out = File::create(&partial)?;
    let size = response.copy_to(&mut out).map_err(fetch_error)?;
    fs::rename(&partial, path)?;

    info!("Range file has been downloaded, {} bytes", size);
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn range(start: u32, end: u32, asn: u32) -> RangeRecord {
        RangeRecord { start, end, asn, country: format!("C{}", asn), org: format!("ORG-{}", asn) }
    }

    fn gzip(content: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn lookup_upper_bound() {
        let table = RangeTable::new(vec![range(0, 99, 1), range(100, 199, 2)]);

        assert_eq!(table.lookup(50).map(|r| r.asn), Some(1));
        assert_eq!(table.lookup(99).map(|r| r.asn), Some(1));
        assert_eq!(table.lookup(100).map(|r| r.asn), Some(2));
        assert_eq!(table.lookup(150).map(|r| r.asn), Some(2));
        assert_eq!(table.lookup(200), None);
    }

    #[test]
    fn lookup_in_a_hole_misses() {
        let table = RangeTable::new(vec![range(0, 99, 1), range(200, 299, 2)]);

        assert_eq!(table.lookup(150), None);
        assert_eq!(table.lookup(250).map(|r| r.asn), Some(2));
    }

    #[test]
    fn lookup_in_empty_table() {
        assert_eq!(RangeTable::default().lookup(0), None);
    }

    #[test]
    fn load_gzip_tsv() {
        let content = "16777216\t16777471\t13335\tUS\tCLOUDFLARENET\n\
                       16777472\t16778239\t0\tNone\tNot routed\n\
                       16778240\t16779263\t38803\tAU\tWPL-AS-AP Wirefreebroadband \"Pty\" Ltd\n\
                       garbage\n\
                       x\t16779264\t1\tUS\tBROKEN\n";
        let table = RangeTable::from_reader(GzDecoder::new(&gzip(content)[..])).unwrap();

        assert_eq!(table.len(), 2);
        let cloudflare = table.lookup(16777300).unwrap();
        assert_eq!(cloudflare.asn, 13335);
        assert_eq!(cloudflare.country, "US");
        assert_eq!(cloudflare.org, "CLOUDFLARENET");
        assert_eq!(table.lookup(16778300).unwrap().org, "WPL-AS-AP Wirefreebroadband \"Pty\" Ltd");
        assert_eq!(table.lookup(16777500), None);
    }

    #[test]
    fn parse_miss_policy() {
        assert_eq!("drop".parse::<MissPolicy>(), Ok(MissPolicy::Drop));
        assert_eq!("emit-partial".parse::<MissPolicy>(), Ok(MissPolicy::EmitPartial));
        assert!("keep".parse::<MissPolicy>().is_err());
        assert_eq!(MissPolicy::EmitPartial.as_str().parse::<MissPolicy>(), Ok(MissPolicy::EmitPartial));
    }

    #[test]
    fn drop_policy_discards_partial_flows() {
        let table = RangeTable::new(vec![range(0, 99, 1), range(100, 199, 2)]);
        let flow = Flow { src_addr: 50, dst_addr: 500, ..Default::default() };

        assert_eq!(table.enrich(&flow, MissPolicy::Drop), None);

        let flow = Flow { src_addr: 50, dst_addr: 150, ..Default::default() };
        let record = table.enrich(&flow, MissPolicy::Drop).unwrap();
        assert_eq!((record.src_as, record.dst_as), (Some(1), Some(2)));
    }

    #[test]
    fn emit_partial_policy_keeps_flows() {
        let table = RangeTable::new(vec![range(0, 99, 1)]);
        let flow = Flow { src_addr: 500, dst_addr: 50, ..Default::default() };

        let record = table.enrich(&flow, MissPolicy::EmitPartial).unwrap();
        assert_eq!(record.src_as, None);
        assert_eq!(record.src_org, None);
        assert_eq!(record.dst_as, Some(1));
        assert_eq!(record.dst_country, Some("C1".to_string()));
    }
}
