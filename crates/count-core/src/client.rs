use crate::util::atomic_write;
use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    BadForwardedFor(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BadForwardedFor(raw) => {
                write!(f, "could not determine client address from forwarded header {raw:?}")
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Peers whose `X-Forwarded-For` header is believed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrustedProxies {
    pub trusted: Vec<String>,
}

impl TrustedProxies {
    pub fn to_nets(&self) -> Vec<IpNet> {
        self.trusted
            .iter()
            .filter_map(|entry| parse_net(entry))
            .collect()
    }

    pub fn trusts(&self, ip: IpAddr) -> bool {
        self.to_nets().iter().any(|net| net.contains(&ip))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).context("read trusted proxies")?;
        let parsed = toml::from_str::<TrustedProxies>(&raw).context("parse trusted proxies")?;
        for entry in parsed.trusted.iter().filter(|e| parse_net(e).is_none()) {
            warn!(%entry, "ignoring invalid trusted proxy entry");
        }
        Ok(parsed)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = toml::to_string_pretty(self)?;
        atomic_write(path, data.as_bytes())
    }

    pub fn add(path: &Path, entry: &str) -> anyhow::Result<()> {
        let mut list = Self::load(path)?;
        if !list.trusted.iter().any(|e| e == entry) {
            list.trusted.push(entry.to_string());
            list.trusted.sort();
            list.save(path)?;
        }
        Ok(())
    }

    pub fn remove(path: &Path, entry: &str) -> anyhow::Result<()> {
        let mut list = Self::load(path)?;
        let before = list.trusted.len();
        list.trusted.retain(|e| e != entry);
        if list.trusted.len() == before {
            warn!(%entry, "trusted proxy not found");
            return Ok(());
        }
        list.save(path)
    }
}

fn parse_net(entry: &str) -> Option<IpNet> {
    if entry.contains('/') {
        entry.parse::<IpNet>().ok()
    } else {
        entry.parse::<IpAddr>().ok().map(IpNet::from)
    }
}

/// Identity recorded for a request from `peer`.
pub fn resolve_client(
    peer: IpAddr,
    forwarded_for: Option<&str>,
    proxies: &TrustedProxies,
) -> Result<String, ClientError> {
    let Some(raw) = forwarded_for else {
        return Ok(peer.to_string());
    };
    if !proxies.trusts(peer) {
        return Ok(peer.to_string());
    }
    let first = raw.split(',').next().unwrap_or("").trim();
    first
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ClientError::BadForwardedFor(raw.to_string()))
}
