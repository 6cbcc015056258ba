use log::{error, info, warn};
use std::collections::HashMap;
use std::io;
use std::process;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;
use structopt::StructOpt;

mod enrichment;
mod entity;
mod error;
mod flow;
mod logger;
mod netflow;
mod settings;
mod stats;
mod threads;

use enrichment::RangeTable;
use error::Result;
use settings::{Opt, Settings};
use stats::Stats;
use threads::dispatch::Registry;
use threads::listener::{self, WorkerSpawner};
use threads::parser::Pipeline;
use threads::{output, prometheus};

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum ThreadType {
    Listener,
    Prometheus,
}

fn main() {
    let opt = Opt::from_args();

    let config = match Settings::init(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load the configuration: {}", e);
            process::exit(1);
        }
    };

    logger::init(&config.log.level);

    info!("Starting APP");

    if let Err(e) = run(config) {
        error!("{}", e);
        process::exit(1);
    }

    info!("Closing APP");
}

fn run(config: Settings) -> Result<()> {
    let path = &config.enrichment.file;
    if config.enrichment.download {
        enrichment::download(&config.enrichment.url, path)?;
    }

    let table = RangeTable::read(path)?;
    if table.is_empty() {
        warn!("The range table is empty, no flow will be enriched");
    }

    let stats = Arc::new(Stats::default());
    let socket = listener::bind(&config.listen_addr(), config.read_timeout())?;

    let (sender, receiver) = sync_channel(config.output.queue_depth);
    let pipeline = Pipeline {
        table: Arc::new(table),
        miss_policy: config.enrichment.miss_policy,
        cache_policy: config.cache_policy(),
        output: sender,
        stats: stats.clone(),
    };
    let registry = Registry::new(WorkerSpawner { queue_depth: config.dispatch.queue_depth, pipeline }, config.limits());

    let mut thread_maps: HashMap<ThreadType, _> = HashMap::new();

    if config.prometheus.enable {
        let tcp = prometheus::bind(&config.prometheus.host)?;
        let stats = stats.clone();

        thread_maps.insert(
            ThreadType::Prometheus,
            thread::Builder::new().name("prometheus".to_string()).spawn(move || {
                prometheus::listen(tcp, stats);
            })?,
        );
    }

    thread_maps.insert(
        ThreadType::Listener,
        thread::Builder::new().name("listener".to_string()).spawn(move || {
            listener::listen(socket, registry, stats);
        })?,
    );

    // only returns once the listener and every worker are gone
    let stdout = io::stdout();
    output::export(receiver, stdout.lock())?;

    // the prometheus thread never stops on its own, it goes down with the process
    match thread_maps.remove(&ThreadType::Listener).map(|handle| handle.join()) {
        Some(Err(_)) => Err(io::Error::new(io::ErrorKind::Other, "The listener thread panicked").into()),
        _ => Ok(()),
    }
}
