use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::netflow::v9::TemplateField;

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<TemplateField>,
    pub length: usize, // size in bytes of one data record
}

impl Template {
    pub fn new(id: u16, fields: Vec<TemplateField>) -> Self {
        let length = fields.iter().map(|f| f.length as usize).sum();
        Template { id, fields, length }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "id: {}, field_count: {}, length: {}", self.id, self.fields.len(), self.length)?;

        for field in &self.fields {
            write!(f, "\n\t{}", field)?;
        }

        Ok(())
    }
}

/// Bounds applied to the templates of each exporter. The default keeps every
/// template until the cache is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CachePolicy {
    pub max_templates: Option<usize>,
    pub ttl: Option<Duration>,
}

#[derive(Debug)]
struct Entry {
    template: Template,
    installed: Instant,
}

/// Templates keyed by (exporter, template id). Template ids are only unique
/// per exporter. A cache is owned by a single dispatch worker, so it needs no
/// locking.
#[derive(Debug, Default)]
pub struct TemplateCache {
    exporters: HashMap<u32, HashMap<u16, Entry>>,
    policy: CachePolicy,
}

impl TemplateCache {
    pub fn with_policy(policy: CachePolicy) -> Self {
        TemplateCache { exporters: HashMap::new(), policy }
    }

    pub fn install(&mut self, exporter: u32, id: u16, fields: Vec<TemplateField>) -> Option<Template> {
        self.install_at(exporter, id, fields, Instant::now())
    }

    /// Replaces any template already known under the same key.
    pub fn install_at(&mut self, exporter: u32, id: u16, fields: Vec<TemplateField>, now: Instant) -> Option<Template> {
        let template = Template::new(id, fields);
        info!("Template received from {} : {}", Ipv4Addr::from(exporter), template);

        let templates = self.exporters.entry(exporter).or_default();

        if let Some(max) = self.policy.max_templates {
            if !templates.contains_key(&id) && templates.len() >= max.max(1) {
                let oldest = templates.iter().min_by_key(|(_, e)| e.installed).map(|(id, _)| *id);
                if let Some(oldest) = oldest {
                    debug!("Evicting template {} of {}, limit of {} reached", oldest, Ipv4Addr::from(exporter), max);
                    templates.remove(&oldest);
                }
            }
        }

        templates.insert(id, Entry { template, installed: now }).map(|e| e.template)
    }

    pub fn lookup(&mut self, exporter: u32, id: u16) -> Option<&Template> {
        self.lookup_at(exporter, id, Instant::now())
    }

    pub fn lookup_at(&mut self, exporter: u32, id: u16, now: Instant) -> Option<&Template> {
        let templates = self.exporters.get_mut(&exporter)?;

        if let Some(ttl) = self.policy.ttl {
            let expired = templates.get(&id).map_or(false, |e| now.saturating_duration_since(e.installed) > ttl);
            if expired {
                debug!("Template {} of {} expired", id, Ipv4Addr::from(exporter));
                templates.remove(&id);
                return None;
            }
        }

        templates.get(&id).map(|e| &e.template)
    }

    pub fn len(&self) -> usize {
        self.exporters.values().map(|t| t.len()).sum()
    }
}
