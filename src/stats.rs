use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident => $help:expr),* $(,)?) => {
        /// Process wide counters of what happened to datagrams and flows.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(pub $name: AtomicU64,)*
        }

        impl Stats {
            /// Renders every counter in the prometheus text exposition format.
            pub fn render(&self) -> String {
                let mut out = String::new();
                $(
                    let _ = writeln!(out, "# HELP nf9collect_{} {}", stringify!($name), $help);
                    let _ = writeln!(out, "# TYPE nf9collect_{} counter", stringify!($name));
                    let _ = writeln!(out, "nf9collect_{} {}", stringify!($name), self.$name.load(Ordering::Relaxed));
                )*
                out
            }
        }
    };
}

counters! {
    datagrams_received => "Datagrams read from the socket",
    datagrams_queue_full => "Datagrams dropped because the exporter queue was full",
    datagrams_exporter_limit => "Datagrams dropped because too many exporters are tracked",
    datagrams_not_ipv4 => "Datagrams dropped because the exporter is not an IPv4 host",
    socket_errors => "Failed reads on the collector socket",
    decode_errors => "Datagrams abandoned on a decoding error",
    templates_installed => "Templates installed or refreshed",
    unknown_template_flowsets => "Data flowsets skipped because their template is unknown",
    flows_decoded => "Data records decoded",
    flows_without_source => "Data records discarded for a missing source or a malformed address",
    flows_emitted => "Flows handed to the output",
    flows_enrichment_miss => "Flows dropped because an endpoint has no owner",
    exporters_started => "Exporter workers started",
    exporters_reaped => "Exporter workers reaped after being idle",
}

impl Stats {
    #[inline]
    pub fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
