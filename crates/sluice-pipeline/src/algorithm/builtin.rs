//! Built-in sharding algorithms

use sluice_rdbc::Value;

use super::{integer_key, prop_text, required_i64, AlgorithmProps, ShardingAlgorithm};
use crate::error::{PipelineError, Result};

/// `key mod sharding-count` over integer keys
#[derive(Debug, Clone)]
pub struct Mod {
    count: i64,
}

impl Mod {
    pub(super) fn create(props: &AlgorithmProps) -> Result<Box<dyn ShardingAlgorithm>> {
        Ok(Box::new(Self {
            count: sharding_count("MOD", props)?,
        }))
    }
}

impl ShardingAlgorithm for Mod {
    fn type_name(&self) -> &'static str {
        "MOD"
    }

    fn partition_count(&self) -> usize {
        self.count as usize
    }

    fn partition(&self, key: &Value) -> Result<usize> {
        Ok(integer_key("MOD", key)?.rem_euclid(self.count) as usize)
    }
}

/// Stable hash of the key's canonical text, mod `sharding-count`
#[derive(Debug, Clone)]
pub struct HashMod {
    count: u64,
}

impl HashMod {
    pub(super) fn create(props: &AlgorithmProps) -> Result<Box<dyn ShardingAlgorithm>> {
        Ok(Box::new(Self {
            count: sharding_count("HASH_MOD", props)? as u64,
        }))
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64 with the murmur3 finalizer
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

impl ShardingAlgorithm for HashMod {
    fn type_name(&self) -> &'static str {
        "HASH_MOD"
    }

    fn partition_count(&self) -> usize {
        self.count as usize
    }

    fn partition(&self, key: &Value) -> Result<usize> {
        if key.is_null() {
            return Err(PipelineError::routing("HASH_MOD cannot route a NULL key"));
        }
        Ok((stable_hash(key.canonical_text().as_bytes()) % self.count) as usize)
    }
}

/// Partitions delimited by ascending boundaries
#[derive(Debug, Clone)]
pub struct BoundaryRange {
    boundaries: Vec<i64>,
}

impl BoundaryRange {
    pub(super) fn create(props: &AlgorithmProps) -> Result<Box<dyn ShardingAlgorithm>> {
        const NAME: &str = "BOUNDARY_RANGE";
        let text = prop_text(props, "sharding-ranges")
            .ok_or_else(|| PipelineError::algorithm_props(NAME, "missing 'sharding-ranges'"))?;
        let boundaries = text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>().map_err(|_| {
                    PipelineError::algorithm_props(NAME, format!("invalid boundary '{s}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if boundaries.is_empty() {
            return Err(PipelineError::algorithm_props(NAME, "'sharding-ranges' is empty"));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::algorithm_props(
                NAME,
                "'sharding-ranges' must be strictly ascending",
            ));
        }
        Ok(Box::new(Self { boundaries }))
    }
}

impl ShardingAlgorithm for BoundaryRange {
    fn type_name(&self) -> &'static str {
        "BOUNDARY_RANGE"
    }

    fn partition_count(&self) -> usize {
        self.boundaries.len() + 1
    }

    fn partition(&self, key: &Value) -> Result<usize> {
        let key = integer_key("BOUNDARY_RANGE", key)?;
        Ok(self.boundaries.partition_point(|b| *b <= key))
    }
}

/// Fixed-volume partitions between a lower and an upper bound
#[derive(Debug, Clone)]
pub struct VolumeRange {
    lower: i64,
    upper: i64,
    volume: i64,
}

impl VolumeRange {
    pub(super) fn create(props: &AlgorithmProps) -> Result<Box<dyn ShardingAlgorithm>> {
        const NAME: &str = "VOLUME_RANGE";
        let lower = required_i64(NAME, props, "range-lower")?;
        let upper = required_i64(NAME, props, "range-upper")?;
        let volume = required_i64(NAME, props, "sharding-volume")?;
        if volume <= 0 {
            return Err(PipelineError::algorithm_props(NAME, "'sharding-volume' must be positive"));
        }
        if upper <= lower {
            return Err(PipelineError::algorithm_props(
                NAME,
                "'range-upper' must be greater than 'range-lower'",
            ));
        }
        Ok(Box::new(Self {
            lower,
            upper,
            volume,
        }))
    }

    fn inner_partitions(&self) -> usize {
        ((self.upper - self.lower + self.volume - 1) / self.volume) as usize
    }
}

impl ShardingAlgorithm for VolumeRange {
    fn type_name(&self) -> &'static str {
        "VOLUME_RANGE"
    }

    fn partition_count(&self) -> usize {
        self.inner_partitions() + 2
    }

    fn partition(&self, key: &Value) -> Result<usize> {
        let key = integer_key("VOLUME_RANGE", key)?;
        Ok(if key < self.lower {
            0
        } else if key >= self.upper {
            self.inner_partitions() + 1
        } else {
            1 + ((key - self.lower) / self.volume) as usize
        })
    }
}

fn sharding_count(type_name: &str, props: &AlgorithmProps) -> Result<i64> {
    let count = required_i64(type_name, props, "sharding-count")?;
    if count <= 0 {
        return Err(PipelineError::algorithm_props(
            type_name,
            "'sharding-count' must be positive",
        ));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::super::{AlgorithmDescriptor, AlgorithmRegistry};
    use super::*;

    fn resolve(d: AlgorithmDescriptor) -> Result<super::super::RoutingFn> {
        AlgorithmRegistry::builtin().resolve(&d)
    }

    #[test]
    fn test_mod_negative_keys() {
        let algo = resolve(AlgorithmDescriptor::new("MOD").with_prop("sharding-count", 3)).unwrap();
        assert_eq!(algo.partition(&Value::Int64(-1)).unwrap(), 2);
        assert_eq!(algo.partition(&Value::from("10")).unwrap(), 1);
        assert!(matches!(
            algo.partition(&Value::from("abc")),
            Err(PipelineError::Routing(_))
        ));
    }

    #[test]
    fn test_mod_rejects_bad_count() {
        for count in ["0", "-2", "four"] {
            let err = resolve(AlgorithmDescriptor::new("MOD").with_prop("sharding-count", count))
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidAlgorithmProps { .. }));
        }
        assert!(resolve(AlgorithmDescriptor::new("MOD")).is_err());
    }

    #[test]
    fn test_hash_mod_is_stable_across_widths() {
        let algo =
            resolve(AlgorithmDescriptor::new("HASH_MOD").with_prop("sharding-count", 8)).unwrap();
        let a = algo.partition(&Value::Int32(12345)).unwrap();
        let b = algo.partition(&Value::Int64(12345)).unwrap();
        assert_eq!(a, b);
        assert!(a < 8);
        assert_eq!(stable_hash(b"12345"), stable_hash(b"12345"));
        assert_ne!(stable_hash(b"a"), stable_hash(b"b"));
        assert!(algo.partition(&Value::Null).is_err());
    }

    #[test]
    fn test_boundary_range() {
        let algo = resolve(
            AlgorithmDescriptor::new("BOUNDARY_RANGE").with_prop("sharding-ranges", "10, 20, 30"),
        )
        .unwrap();
        assert_eq!(algo.partition_count(), 4);
        let parts: Vec<_> = [-5, 9, 10, 19, 20, 30, 1000]
            .iter()
            .map(|k| algo.partition(&Value::Int64(*k)).unwrap())
            .collect();
        assert_eq!(parts, vec![0, 0, 1, 1, 2, 3, 3]);

        assert!(resolve(
            AlgorithmDescriptor::new("BOUNDARY_RANGE").with_prop("sharding-ranges", "5,5")
        )
        .is_err());
    }

    #[test]
    fn test_volume_range() {
        let algo = resolve(
            AlgorithmDescriptor::new("VOLUME_RANGE")
                .with_prop("range-lower", 10)
                .with_prop("range-upper", 45)
                .with_prop("sharding-volume", 10),
        )
        .unwrap();
        // below, [10,20), [20,30), [30,40), [40,45), at/above
        assert_eq!(algo.partition_count(), 6);
        let parts: Vec<_> = [0, 10, 29, 44, 45]
            .iter()
            .map(|k| algo.partition(&Value::Int64(*k)).unwrap())
            .collect();
        assert_eq!(parts, vec![0, 1, 2, 4, 5]);
    }
}
