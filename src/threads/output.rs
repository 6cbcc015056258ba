use log::info;
use std::io::{self, Write};
use std::sync::mpsc::Receiver;

use crate::flow::FlowRecord;

/// Writes every flow received as one JSON line until all the workers are gone.
pub fn export<W: Write>(receiver: Receiver<FlowRecord>, mut writer: W) -> io::Result<()> {
    info!("Writing flows as JSON lines");

    for record in receiver.iter() {
        write_record(&mut writer, &record)?;
    }

    info!("Every worker is gone, output is closed");
    Ok(())
}

pub fn write_record<W: Write>(writer: &mut W, record: &FlowRecord) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    fn record(src_addr: u32) -> FlowRecord {
        FlowRecord::new(&Flow { src_addr, src_mask: 8, octets: 10, packets: 1, ..Default::default() }, None, None)
    }

    #[test]
    fn one_line_per_flow() {
        let (sender, receiver) = mpsc::sync_channel(4);
        sender.send(record(0x0a00_0001)).unwrap();
        sender.send(record(0x0b00_0001)).unwrap();
        drop(sender);

        let mut out = Vec::new();
        export(receiver, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("{\"Agent\":\"0.0.0.0\",\"AgentIf\":0,\"SrcNet\":\"10.0.0.0/8\""));
        assert!(lines[1].contains("\"Src\":\"11.0.0.1\""));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn record_is_valid_json() {
        let mut out = Vec::new();
        write_record(&mut out, &record(0x0a00_0001)).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["Bytes"], 10);
        assert_eq!(value["SrcAS"], serde_json::Value::Null);
    }
}
