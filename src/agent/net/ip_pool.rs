use std::{collections::BTreeSet, net::Ipv4Addr};

use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{VmError, VmResult};

pub type Ordinal = u8;

const GUEST_PREFIX_LEN: u8 = 24;

/// A guest /24. The last octet of every address in it is a host ordinal.
#[derive(Debug, Clone)]
pub struct IpRange {
    pub cidr: String,
    network: [u8; 3],
}

impl IpRange {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let (addr, prefix_len) = cidr
            .split_once('/')
            .with_context(|| format!("{cidr} has no prefix length"))?;

        let addr = addr
            .parse::<Ipv4Addr>()
            .with_context(|| format!("{cidr} has an invalid network address"))?;
        let prefix_len = prefix_len
            .parse::<u8>()
            .with_context(|| format!("{cidr} has an invalid prefix length"))?;

        if prefix_len != GUEST_PREFIX_LEN {
            bail!("guest subnet must be a /{GUEST_PREFIX_LEN}, got /{prefix_len}");
        }

        let [a, b, c, _] = addr.octets();
        Ok(Self {
            cidr: cidr.to_string(),
            network: [a, b, c],
        })
    }

    pub fn host(&self, ordinal: Ordinal) -> Ipv4Addr {
        let [a, b, c] = self.network;
        Ipv4Addr::new(a, b, c, ordinal)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.host(1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - GUEST_PREFIX_LEN))
    }
}

#[derive(Debug, Clone)]
pub struct IpPoolConfig {
    pub cidr: String,
    pub first_ordinal: Ordinal,
    pub last_ordinal: Ordinal,
}

/// Hands out guest host ordinals from a /24, lowest free first.
pub struct IpPool {
    range: IpRange,
    first_ordinal: Ordinal,
    last_ordinal: Ordinal,
    free: Mutex<BTreeSet<Ordinal>>,
}

impl IpPool {
    pub fn new(config: IpPoolConfig) -> Result<Self> {
        let range = IpRange::from_cidr(&config.cidr)?;

        // .0 is the network and .1 the gateway
        if config.first_ordinal < 2 || config.first_ordinal > config.last_ordinal {
            bail!(
                "Invalid ordinal range {}..={}",
                config.first_ordinal,
                config.last_ordinal
            );
        }

        let free = (config.first_ordinal..=config.last_ordinal).collect();

        Ok(Self {
            range,
            first_ordinal: config.first_ordinal,
            last_ordinal: config.last_ordinal,
            free: Mutex::new(free),
        })
    }

    pub async fn allocate(&self) -> VmResult<Ordinal> {
        let mut free = self.free.lock().await;
        let Some(ordinal) = free.pop_first() else {
            return Err(VmError::ResourceExhausted);
        };

        debug!("allocated ordinal {} ({} left)", ordinal, free.len());
        Ok(ordinal)
    }

    pub async fn release(&self, ordinal: Ordinal) {
        if ordinal < self.first_ordinal || ordinal > self.last_ordinal {
            return;
        }

        let mut free = self.free.lock().await;
        if free.insert(ordinal) {
            debug!("released ordinal {}", ordinal);
        }
    }

    pub async fn available(&self) -> usize {
        self.free.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        (self.last_ordinal - self.first_ordinal) as usize + 1
    }

    pub fn range(&self) -> &IpRange {
        &self.range
    }

    pub fn ip_for(&self, ordinal: Ordinal) -> Ipv4Addr {
        self.range.host(ordinal)
    }
}
