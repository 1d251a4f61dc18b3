//! Ketama consistent hashing, used to keep only the keys a given set of
//! instances owns.
//!
//! Every instance contributes `bucket_size / 4` labels of the form
//! `host/host:port-N`. Each label's MD5 digest gives four little-endian
//! 32-bit ring points. A key belongs to the instance owning the first point
//! at or after the first 32-bit word of the key's digest, wrapping around.

use crate::error::{DumpError, Result};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashSet};

/// Largest supported cluster.
pub const MAX_INSTANCES: usize = 1 << 23;

/// An immutable hash ring. Lookups take `&self` and are safe to share
/// between threads.
#[derive(Debug)]
pub struct HashRing {
    points: BTreeMap<u32, usize>,
    instances: Vec<String>,
}

impl HashRing {
    /// Build a ring from `host:port` instance names.
    pub fn new(instances: &[String], bucket_size: u32) -> Result<Self> {
        if instances.is_empty() || instances.len() > MAX_INSTANCES {
            return Err(DumpError::Filter(format!(
                "instance count {} out of range",
                instances.len()
            )));
        }
        if bucket_size < 4 {
            return Err(DumpError::Filter(format!(
                "bucket size {} gives no ring points",
                bucket_size
            )));
        }

        let mut points = BTreeMap::new();
        for (idx, instance) in instances.iter().enumerate() {
            let (host, port) = split_instance(instance)?;
            for j in 0..bucket_size / 4 {
                let label = format!("{host}/{host}:{port}-{j}");
                let digest = Md5::digest(label.as_bytes());
                for k in 0..4 {
                    // a later instance takes over a colliding point
                    points.insert(ring_point(&digest, k), idx);
                }
            }
        }

        Ok(Self {
            points,
            instances: instances.to_vec(),
        })
    }

    /// Index of the instance owning `key`.
    pub fn classify(&self, key: &[u8]) -> usize {
        let digest = Md5::digest(key);
        let hash = ring_point(&digest, 0);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, idx)| *idx)
            .unwrap_or(0)
    }

    /// Name of the instance at `idx`.
    pub fn instance(&self, idx: usize) -> Option<&str> {
        self.instances.get(idx).map(String::as_str)
    }

    pub fn index_of(&self, instance: &str) -> Option<usize> {
        self.instances.iter().position(|i| i == instance)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of distinct points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

fn split_instance(instance: &str) -> Result<(&str, &str)> {
    let mut parts = instance.split(':');
    match (parts.next(), parts.next()) {
        (Some(host), Some(port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok((host, port))
        }
        _ => Err(DumpError::Filter(format!(
            "instance '{}' is not host:port",
            instance
        ))),
    }
}

/// The `k`th little-endian 32-bit word of a digest.
fn ring_point(digest: &[u8], k: usize) -> u32 {
    let bytes = [
        digest[4 * k],
        digest[4 * k + 1],
        digest[4 * k + 2],
        digest[4 * k + 3],
    ];
    u32::from_le_bytes(bytes)
}

/// Decides which keys a dump scoped to some instances should drop.
#[derive(Debug)]
pub struct KeyFilter {
    ring: HashRing,
    targets: HashSet<usize>,
}

impl KeyFilter {
    /// Build a filter keeping keys owned by any of `targets`, where ownership
    /// is computed over the full cluster `instances`.
    pub fn new(instances: &[String], targets: &[String], bucket_size: u32) -> Result<Self> {
        let ring = HashRing::new(instances, bucket_size)?;

        let targets = targets
            .iter()
            .map(|target| {
                ring.index_of(target).ok_or_else(|| {
                    DumpError::Filter(format!("target '{}' is not in the instance list", target))
                })
            })
            .collect::<Result<HashSet<_>>>()?;

        if targets.is_empty() {
            return Err(DumpError::Filter("no target instances".to_string()));
        }

        Ok(Self { ring, targets })
    }

    /// True if `key` should be dropped: it is owned by none of the targets.
    pub fn filter(&self, key: &[u8]) -> bool {
        !self.targets.contains(&self.ring.classify(key))
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }
}
