use config::{Config, ConfigError, Environment, File};
use serde::Deserializer;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

use crate::enrichment::{MissPolicy, DEFAULT_URL};
use crate::netflow::template::CachePolicy;
use crate::threads::dispatch::Limits;

/// NetFlow v9 collector writing enriched flows as JSON lines on stdout.
#[derive(Debug, StructOpt)]
#[structopt(name = "nf9collect")]
pub struct Opt {
    /// Configuration file, merged over the built-in defaults
    #[structopt(short, long, parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[structopt(long)]
    pub host: Option<String>,

    /// UDP port to listen on
    #[structopt(short, long)]
    pub port: Option<u16>,

    /// Local copy of the IP to ASN range file
    #[structopt(long, parse(from_os_str))]
    pub asn_file: Option<PathBuf>,

    /// Use the local range file as is
    #[structopt(long)]
    pub no_download: bool,

    /// What to do with a flow whose endpoint has no owner: drop or emit-partial
    #[structopt(long)]
    pub miss_policy: Option<MissPolicy>,
}

impl Opt {
    fn apply(&self, s: &mut Config) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            s.set("listener.host", host.as_str())?;
        }
        if let Some(port) = self.port {
            s.set("listener.port", port as i64)?;
        }
        if let Some(file) = &self.asn_file {
            s.set("enrichment.file", file.to_string_lossy().into_owned())?;
        }
        if self.no_download {
            s.set("enrichment.download", false)?;
        }
        if let Some(policy) = self.miss_policy {
            s.set("enrichment.miss_policy", policy.as_str())?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct Listener {
    pub host: String,
    pub port: u16,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Enrichment {
    pub file: PathBuf,
    pub url: String,
    pub download: bool,
    #[serde(deserialize_with = "miss_policy")]
    pub miss_policy: MissPolicy,
}

#[derive(Debug, Deserialize)]
pub struct Dispatch {
    pub max_exporters: usize, // 0 for no limit
    pub queue_depth: usize,
    pub idle_timeout_secs: u64, // 0 to never reap
}

#[derive(Debug, Deserialize)]
pub struct Templates {
    pub max_per_exporter: usize, // 0 for no limit
    pub ttl_secs: u64,           // 0 to keep templates until replaced
}

#[derive(Debug, Deserialize)]
pub struct Output {
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct Prometheus {
    pub enable: bool,
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub log: Log,
    pub listener: Listener,
    pub enrichment: Enrichment,
    pub dispatch: Dispatch,
    pub templates: Templates,
    pub output: Output,
    pub prometheus: Prometheus,
}

fn miss_policy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MissPolicy, D::Error> {
    let value: String = serde::Deserialize::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
}

impl Settings {
    /// Defaults, then the config file, then `NETFLOW_<SECTION>__<KEY>` variables,
    /// then the command line.
    pub fn init(opt: &Opt) -> Result<Self, ConfigError> {
        let mut s = Self::defaults()?;

        // surcharge the default config with the user config
        match &opt.config {
            Some(path) => {
                s.merge(File::from(path.as_path()))?;
            }
            None => eprintln!("No config provided, launching the app with the default configuration"),
        }
        s.merge(Environment::with_prefix("NETFLOW").separator("__"))?;
        opt.apply(&mut s)?;

        Self::freeze(s)
    }

    fn defaults() -> Result<Config, ConfigError> {
        let mut s = Config::new();

        s.set_default("log.level", "info")?;
        s.set_default("listener.host", "0.0.0.0")?;
        s.set_default("listener.port", 2055_i64)?;
        s.set_default("listener.read_timeout_ms", 1000_i64)?;
        s.set_default("enrichment.file", "ip2asn.gz")?;
        s.set_default("enrichment.url", DEFAULT_URL)?;
        s.set_default("enrichment.download", true)?;
        s.set_default("enrichment.miss_policy", MissPolicy::default().as_str())?;
        s.set_default("dispatch.max_exporters", 1024_i64)?;
        s.set_default("dispatch.queue_depth", 1024_i64)?;
        s.set_default("dispatch.idle_timeout_secs", 0_i64)?;
        s.set_default("templates.max_per_exporter", 0_i64)?;
        s.set_default("templates.ttl_secs", 0_i64)?;
        s.set_default("output.queue_depth", 8192_i64)?;
        s.set_default("prometheus.enable", false)?;
        s.set_default("prometheus.host", "127.0.0.1:9655")?;

        Ok(s)
    }

    fn freeze(s: Config) -> Result<Self, ConfigError> {
        let settings: Settings = s.try_into()?;

        if settings.dispatch.queue_depth == 0 || settings.output.queue_depth == 0 {
            return Err(ConfigError::Message("queue_depth must be at least 1".to_string()));
        }

        Ok(settings)
    }

    pub fn listen_addr(&self) -> String {
        if self.listener.host.contains(':') {
            format!("[{}]:{}", self.listener.host, self.listener.port)
        } else {
            format!("{}:{}", self.listener.host, self.listener.port)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.read_timeout_ms)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            max_templates: Some(self.templates.max_per_exporter).filter(|max| *max > 0),
            ttl: Some(self.templates.ttl_secs).filter(|ttl| *ttl > 0).map(Duration::from_secs),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_exporters: match self.dispatch.max_exporters {
                0 => usize::MAX,
                max => max,
            },
            idle_timeout: Some(self.dispatch.idle_timeout_secs).filter(|secs| *secs > 0).map(Duration::from_secs),
        }
    }
}
