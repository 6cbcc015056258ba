use log::{debug, error, info, warn};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::entity::udp_message::Datagram;
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::threads::dispatch::{Dispatch, Registry, Spawner};
use crate::threads::parser::{Pipeline, Worker};

const MAX_DATAGRAM_SIZE: usize = 65535;
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Binds the collector socket. The read timeout bounds how long the listener
/// waits before it looks for idle exporters.
pub fn bind(addr: &str, read_timeout: Duration) -> Result<UdpSocket> {
    let bind_error = |source| Error::Bind { addr: addr.to_string(), source };

    let socket = UdpSocket::bind(addr).map_err(bind_error)?;
    socket.set_read_timeout(Some(read_timeout.max(Duration::from_millis(1)))).map_err(bind_error)?;

    info!("Listening on {}", socket.local_addr().map_err(bind_error)?);
    Ok(socket)
}

/// Starts one named worker thread per exporter.
pub struct WorkerSpawner {
    pub queue_depth: usize,
    pub pipeline: Pipeline,
}

impl Spawner for WorkerSpawner {
    fn spawn(&mut self, exporter: Ipv4Addr) -> io::Result<SyncSender<Datagram>> {
        let (sender, receiver) = mpsc::sync_channel(self.queue_depth);
        let worker = Worker::new(exporter, self.pipeline.clone());

        thread::Builder::new().name(format!("worker-{}", exporter)).spawn(move || worker.run(receiver))?;
        Stats::incr(&self.pipeline.stats.exporters_started, 1);

        Ok(sender)
    }
}

/// Reads datagrams forever and hands them to the worker of their exporter.
pub fn listen<S: Spawner>(socket: UdpSocket, mut registry: Registry<S>, stats: Arc<Stats>) {
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];
    let mut last_reap = Instant::now();

    loop {
        match socket.recv_from(&mut buf) {
            Ok((received_bytes, from)) => {
                debug!("Received {} bytes from {}", received_bytes, from);
                Stats::incr(&stats.datagrams_received, 1);

                let exporter = match from.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(ip) => {
                        debug!("Dropping datagram from {}, only IPv4 exporters are supported", ip);
                        Stats::incr(&stats.datagrams_not_ipv4, 1);
                        continue;
                    }
                };

                let msg = Datagram { exporter, buf: buf[..received_bytes].to_vec() };
                match registry.dispatch(msg, Instant::now()) {
                    Dispatch::Queued | Dispatch::Started => {}
                    Dispatch::QueueFull => {
                        warn!("Queue of exporter {} is full, dropping datagram", exporter);
                        Stats::incr(&stats.datagrams_queue_full, 1);
                    }
                    Dispatch::ExporterLimit => {
                        warn!("Too many exporters, dropping datagram from {}", exporter);
                        Stats::incr(&stats.datagrams_exporter_limit, 1);
                    }
                    Dispatch::WorkerGone | Dispatch::SpawnFailed => {}
                }
            }
            Err(e) => recv_failed(&e, &stats, socket.read_timeout().ok().flatten().unwrap_or(ERROR_PAUSE)),
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_reap) >= REAP_INTERVAL {
            let reaped = registry.reap(now);
            if reaped > 0 {
                info!("Reaped {} idle exporters, {} left", reaped, registry.len());
                Stats::incr(&stats.exporters_reaped, reaped as u64);
            }
            last_reap = now;
        }
    }
}

/// A read timeout only means the socket was quiet. Any other error is counted
/// and followed by a pause, so a failing socket does not spin the listener.
fn recv_failed(e: &io::Error, stats: &Stats, pause: Duration) {
    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut {
        return;
    }

    error!("Failed to read from the socket, pausing {:?}: {}", pause, e);
    Stats::incr(&stats.socket_errors, 1);
    thread::sleep(pause);
}
