//! Named links built from configuration.
//!
//! The registry is an owned value: whoever builds it decides its lifetime, and two
//! registries never share a port. Links are kept in configuration order.

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::link::SerialLink;
use crate::serial::Connector;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
struct RegisteredLink {
    name: String,
    enabled: bool,
    link: Arc<SerialLink>,
}

/// The links of one configuration, addressable by name.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: Vec<RegisteredLink>,
}

impl LinkRegistry {
    /// Build a closed link for every `[[links]]` entry of a validated `config`.
    pub fn from_config(config: &LinkConfig, connector: Arc<dyn Connector>) -> LinkResult<Self> {
        config.validate()?;
        let settings = config.link_settings();

        let links = config
            .links
            .iter()
            .map(|definition| RegisteredLink {
                name: definition.name.clone(),
                enabled: definition.enabled,
                link: Arc::new(SerialLink::new(
                    definition.address.clone(),
                    settings.clone(),
                    connector.clone(),
                )),
            })
            .collect();

        Ok(Self { links })
    }

    /// The link registered as `name`.
    pub fn get(&self, name: &str) -> LinkResult<Arc<SerialLink>> {
        self.links
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.link.clone())
            .ok_or_else(|| LinkError::Configuration(format!("Unknown link: {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|entry| entry.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Open every enabled link that is not open yet.
    ///
    /// One link failing does not stop the others; the outcome of each attempt is
    /// returned by name.
    pub async fn open_all(&self) -> Vec<(String, LinkResult<()>)> {
        let mut outcomes = Vec::new();
        for entry in self.links.iter().filter(|entry| entry.enabled) {
            if entry.link.is_open() {
                continue;
            }
            let outcome = entry.link.open(None).await;
            match &outcome {
                Ok(()) => info!(link = %entry.name, port = %entry.link.address(), "Link ready"),
                Err(e) => warn!(link = %entry.name, error = %e, "Link unavailable"),
            }
            outcomes.push((entry.name.clone(), outcome));
        }
        outcomes
    }

    /// Close every open link. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in &self.links {
            if entry.link.is_open() && entry.link.close().await.is_ok() {
                closed += 1;
            }
        }
        info!(count = closed, "Closed links");
        closed
    }
}
