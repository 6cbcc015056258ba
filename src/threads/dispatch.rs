use log::{debug, error, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::{Duration, Instant};

use crate::entity::udp_message::Datagram;

/// Starts the sequential consumer of one exporter and hands back its queue.
pub trait Spawner {
    fn spawn(&mut self, exporter: Ipv4Addr) -> io::Result<SyncSender<Datagram>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterState {
    Active,
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_exporters: usize,
    /// Silence after which an exporter turns idle, and twice that before it is reaped.
    pub idle_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits { max_exporters: usize::MAX, idle_timeout: None }
    }
}

/// What happened to a datagram handed to the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Queued to a worker started for this datagram.
    Started,
    QueueFull,
    ExporterLimit,
    /// The worker had stopped, its slot is released.
    WorkerGone,
    SpawnFailed,
}

struct Slot {
    sender: SyncSender<Datagram>,
    last_seen: Instant,
    state: ExporterState,
}

/// Tracks one queue per exporter. Datagrams of an exporter always go through
/// the same queue, so its worker sees them in arrival order.
pub struct Registry<S: Spawner> {
    exporters: HashMap<u32, Slot>,
    spawner: S,
    limits: Limits,
}

impl<S: Spawner> Registry<S> {
    pub fn new(spawner: S, limits: Limits) -> Self {
        Registry { exporters: HashMap::new(), spawner, limits }
    }

    pub fn dispatch(&mut self, msg: Datagram, now: Instant) -> Dispatch {
        let id = msg.exporter_id();
        let full = self.exporters.len() >= self.limits.max_exporters;
        let mut started = false;

        let slot = match self.exporters.entry(id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(_) if full => return Dispatch::ExporterLimit,
            Entry::Vacant(slot) => match self.spawner.spawn(msg.exporter) {
                Ok(sender) => {
                    info!("Running new worker for exporter {}", msg.exporter);
                    started = true;
                    slot.insert(Slot { sender, last_seen: now, state: ExporterState::Active })
                }
                Err(e) => {
                    error!("Failed to start a worker for exporter {}: {}", msg.exporter, e);
                    return Dispatch::SpawnFailed;
                }
            },
        };

        slot.last_seen = now;
        if slot.state == ExporterState::Idle {
            debug!("Exporter {} is active again", msg.exporter);
            slot.state = ExporterState::Active;
        }

        match slot.sender.try_send(msg) {
            Ok(()) if started => Dispatch::Started,
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(_)) => Dispatch::QueueFull,
            Err(TrySendError::Disconnected(msg)) => {
                self.exporters.remove(&id);
                error!("Worker of exporter {} has stopped", msg.exporter);
                Dispatch::WorkerGone
            }
        }
    }

    /// Moves silent exporters to idle, and releases those which stayed idle.
    /// Dropping the queue lets the worker drain it and exit along with its
    /// templates. Returns the number of exporters reaped.
    pub fn reap(&mut self, now: Instant) -> usize {
        let timeout = match self.limits.idle_timeout {
            Some(timeout) => timeout,
            None => return 0,
        };

        let mut reaped = 0;
        self.exporters.retain(|id, slot| {
            let silence = now.saturating_duration_since(slot.last_seen);

            match slot.state {
                ExporterState::Active if silence >= timeout => {
                    debug!("Exporter {} is idle", Ipv4Addr::from(*id));
                    slot.state = ExporterState::Idle;
                    true
                }
                ExporterState::Idle if silence >= timeout * 2 => {
                    info!("Reaping exporter {} after {:?} of silence", Ipv4Addr::from(*id), silence);
                    reaped += 1;
                    false
                }
                _ => true,
            }
        });

        reaped
    }

    pub fn state(&self, exporter: Ipv4Addr) -> Option<ExporterState> {
        self.exporters.get(&u32::from(exporter)).map(|slot| slot.state)
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }
}
