use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use crate::enrichment::{MissPolicy, RangeTable};
use crate::entity::udp_message::Datagram;
use crate::flow::{Flow, FlowRecord};
use crate::netflow::template::{CachePolicy, TemplateCache};
use crate::netflow::v9::{FlowSet, Packet};
use crate::stats::Stats;

/// Everything the exporter workers share.
#[derive(Clone)]
pub struct Pipeline {
    pub table: Arc<RangeTable>,
    pub miss_policy: MissPolicy,
    pub cache_policy: CachePolicy,
    pub output: SyncSender<FlowRecord>,
    pub stats: Arc<Stats>,
}

/// Decodes the datagrams of a single exporter, one at a time. The worker owns
/// the templates of its exporter.
pub struct Worker {
    exporter: Ipv4Addr,
    cache: TemplateCache,
    pipeline: Pipeline,
}

impl Worker {
    pub fn new(exporter: Ipv4Addr, pipeline: Pipeline) -> Self {
        Worker { exporter, cache: TemplateCache::with_policy(pipeline.cache_policy), pipeline }
    }

    /// Runs until the registry drops the sending side of the queue.
    pub fn run(mut self, receiver: Receiver<Datagram>) {
        info!("Parsing datagrams from {}", self.exporter);

        for msg in receiver.iter() {
            debug!("Parsing {}", msg);

            for record in self.process(&msg.buf) {
                if self.pipeline.output.send(record).is_err() {
                    warn!("Output is closed, stopping the worker of {}", self.exporter);
                    return;
                }
                Stats::incr(&self.pipeline.stats.flows_emitted, 1);
            }
        }

        info!("Worker of {} stopped", self.exporter);
    }

    /// Decodes one datagram and returns the flows to emit. A datagram which
    /// fails to decode is logged and yields nothing.
    pub fn process(&mut self, buf: &[u8]) -> Vec<FlowRecord> {
        let exporter = u32::from(self.exporter);
        let stats = &self.pipeline.stats;

        let packet = match Packet::read(exporter, buf, &mut self.cache) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Error while parsing netflow datagram from {}: {}", self.exporter, e);
                Stats::incr(&stats.decode_errors, 1);
                return vec![];
            }
        };
        debug!("Packet from {} : {}", self.exporter, packet.header);

        let mut records = vec![];
        for flowset in &packet.flowsets {
            match flowset {
                FlowSet::Template(ids) => Stats::incr(&stats.templates_installed, ids.len() as u64),
                FlowSet::UnknownTemplate(_) => Stats::incr(&stats.unknown_template_flowsets, 1),
                FlowSet::Ignored(id) => debug!("Skipping flowset {} from {}", id, self.exporter),
                FlowSet::Data { records: sets, .. } => {
                    Stats::incr(&stats.flows_decoded, sets.len() as u64);

                    for msg in sets {
                        let flow = match Flow::from_dataset(exporter, msg) {
                            Some(flow) => flow,
                            None => {
                                debug!("No source address in record from {}, skipping it: {}", self.exporter, msg);
                                Stats::incr(&stats.flows_without_source, 1);
                                continue;
                            }
                        };

                        match self.pipeline.table.enrich(&flow, self.pipeline.miss_policy) {
                            Some(record) => records.push(record),
                            None => {
                                debug!("No owner for {}, dropping it", flow);
                                Stats::incr(&stats.flows_enrichment_miss, 1);
                            }
                        }
                    }
                }
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::RangeRecord;
    use crate::threads::output;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    const EXPORTER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    const HEADER: [u8; 20] = hex!("00 09 00 01 00 00 04 b2 60 80 b8 9c 00 00 00 07 00 00 00 01");

    // template 256: SRC_ADDR, DST_ADDR, SRC_MASK, DST_MASK, IN_BYTES, IN_PKTS, PROTOCOL, L4_SRC_PORT, L4_DST_PORT
    const TEMPLATE_FLOWSET: [u8; 44] = hex!(
        "00 00 00 2c 01 00 00 09 00 08 00 04 00 0c 00 04
         00 09 00 01 00 0d 00 01 00 01 00 04 00 02 00 04
         00 04 00 01 00 07 00 02 00 0b 00 02"
    );

    // 10.0.0.1/24:443 -> 192.168.1.10/16:51000, 1500 bytes, 3 packets, tcp
    const DATA_FLOWSET: [u8; 28] = hex!(
        "01 00 00 1c 0a 00 00 01 c0 a8 01 0a 18 10 00 00
         05 dc 00 00 00 03 06 01 bb c7 38 00"
    );

    fn packet(flowsets: &[&[u8]]) -> Vec<u8> {
        let mut buf = HEADER.to_vec();
        for flowset in flowsets {
            buf.extend_from_slice(flowset);
        }
        buf
    }

    fn table() -> RangeTable {
        RangeTable::new(vec![
            RangeRecord {
                start: u32::from(Ipv4Addr::new(10, 0, 0, 0)),
                end: u32::from(Ipv4Addr::new(10, 255, 255, 255)),
                asn: 64500,
                country: "NL".to_string(),
                org: "SOURCE-NET".to_string(),
            },
            RangeRecord {
                start: u32::from(Ipv4Addr::new(192, 168, 0, 0)),
                end: u32::from(Ipv4Addr::new(192, 168, 255, 255)),
                asn: 64501,
                country: "DE".to_string(),
                org: "DEST-NET".to_string(),
            },
        ])
    }

    fn worker(table: RangeTable, miss_policy: MissPolicy) -> (Worker, mpsc::Receiver<FlowRecord>) {
        let (output, receiver) = mpsc::sync_channel(16);
        let pipeline = Pipeline {
            table: Arc::new(table),
            miss_policy,
            cache_policy: CachePolicy::default(),
            output,
            stats: Arc::new(Stats::default()),
        };
        (Worker::new(EXPORTER, pipeline), receiver)
    }

    #[test]
    fn template_then_data_in_order() {
        let (mut worker, _) = worker(table(), MissPolicy::Drop);

        assert_eq!(worker.process(&packet(&[&TEMPLATE_FLOWSET])), vec![]);
        assert_eq!(worker.process(&packet(&[&DATA_FLOWSET])).len(), 1);
    }

    #[test]
    fn data_before_template_is_lost() {
        let (mut worker, _) = worker(table(), MissPolicy::Drop);

        assert_eq!(worker.process(&packet(&[&DATA_FLOWSET])), vec![]);
        assert_eq!(worker.process(&packet(&[&TEMPLATE_FLOWSET])), vec![]);
        assert_eq!(worker.pipeline.stats.unknown_template_flowsets.load(Ordering::Relaxed), 1);
        assert_eq!(worker.pipeline.stats.templates_installed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn decode_error_does_not_stop_the_worker() {
        let (mut worker, _) = worker(table(), MissPolicy::Drop);
        let mut broken = DATA_FLOWSET;
        broken[3] = 0xff;

        assert_eq!(worker.process(&HEADER[..10]), vec![]);
        assert_eq!(worker.process(&packet(&[&TEMPLATE_FLOWSET, &broken])), vec![]);
        assert_eq!(worker.pipeline.stats.decode_errors.load(Ordering::Relaxed), 2);

        // the template preceding the broken flowset stays known
        assert_eq!(worker.process(&packet(&[&DATA_FLOWSET])).len(), 1);
    }

    #[test]
    fn enrichment_miss_follows_policy() {
        let source_only = || RangeTable::new(vec![table().lookup(0x0a00_0001).cloned().unwrap()]);

        let (mut dropping, _) = worker(source_only(), MissPolicy::Drop);
        assert_eq!(dropping.process(&packet(&[&TEMPLATE_FLOWSET, &DATA_FLOWSET])), vec![]);
        assert_eq!(dropping.pipeline.stats.flows_enrichment_miss.load(Ordering::Relaxed), 1);

        let (mut emitting, _) = worker(source_only(), MissPolicy::EmitPartial);
        let records = emitting.process(&packet(&[&TEMPLATE_FLOWSET, &DATA_FLOWSET]));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].src_as, Some(64500));
        assert_eq!(records[0].dst_as, None);
    }

    #[test]
    fn records_without_source_are_discarded() {
        let (mut worker, _) = worker(table(), MissPolicy::EmitPartial);
        // template 300 only carries DST_ADDR
        let template = hex!("00 00 00 0c 01 2c 00 01 00 0c 00 04");
        let data = hex!("01 2c 00 08 c0 a8 01 0a");

        assert_eq!(worker.process(&packet(&[&template, &data])), vec![]);
        assert_eq!(worker.pipeline.stats.flows_without_source.load(Ordering::Relaxed), 1);

        // template 301 announces a 2 byte SRC_ADDR
        let template = hex!("00 00 00 0c 01 2d 00 01 00 08 00 02");
        let data = hex!("01 2d 00 08 0a 01 00 00");

        assert_eq!(worker.process(&packet(&[&template, &data])), vec![]);
        assert_eq!(worker.pipeline.stats.flows_without_source.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn end_to_end_json_line() {
        let (worker, receiver) = worker(table(), MissPolicy::Drop);
        let (queue, datagrams) = mpsc::sync_channel(4);

        queue.send(Datagram { exporter: EXPORTER, buf: packet(&[&TEMPLATE_FLOWSET, &DATA_FLOWSET]) }).unwrap();
        drop(queue);
        worker.run(datagrams);

        let mut out = Vec::new();
        output::export(receiver, &mut out).unwrap();
        let line = String::from_utf8(out).unwrap();

        assert_eq!(
            line,
            "{\"Agent\":\"192.0.2.1\",\"AgentIf\":0,\"SrcNet\":\"10.0.0.0/24\",\"DstNet\":\"192.168.0.0/16\",\
             \"Src\":\"10.0.0.1\",\"Dst\":\"192.168.1.10\",\"SrcPort\":443,\"DstPort\":51000,\"Bytes\":1500,\"Pkts\":3,\
             \"Protocol\":6,\"SrcAS\":64500,\"DstAS\":64501,\"SrcCountry\":\"NL\",\"DstCountry\":\"DE\",\
             \"SrcOrg\":\"SOURCE-NET\",\"DstOrg\":\"DEST-NET\"}\n"
        );
    }
}
