//! Sharding algorithm registry
//!
//! A job names its sharding algorithm by type and properties. The registry
//! resolves that descriptor once, at job start, into an immutable
//! [`ShardingAlgorithm`] that maps a sharding key to a partition id.
//!
//! The set of algorithms is compiled in; lookup is case-insensitive.
//!
//! | Type | Properties |
//! |------|------------|
//! | `MOD` | `sharding-count` |
//! | `HASH_MOD` | `sharding-count` |
//! | `BOUNDARY_RANGE` | `sharding-ranges` |
//! | `VOLUME_RANGE` | `range-lower`, `range-upper`, `sharding-volume` |

mod builtin;

pub use builtin::{BoundaryRange, HashMod, Mod, VolumeRange};
pub(crate) use builtin::stable_hash;

use serde::{Deserialize, Serialize};
use sluice_rdbc::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// Algorithm properties as written in the job file
pub type AlgorithmProps = BTreeMap<String, serde_json::Value>;

/// Named algorithm with its properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
    /// Algorithm type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Properties
    #[serde(default)]
    pub props: AlgorithmProps,
}

impl AlgorithmDescriptor {
    /// Descriptor without properties
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            props: AlgorithmProps::new(),
        }
    }

    /// Add a property
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}

/// Maps a sharding key to a partition id
pub trait ShardingAlgorithm: Send + Sync + fmt::Debug {
    /// Canonical type name
    fn type_name(&self) -> &'static str;

    /// Number of partitions the algorithm produces
    fn partition_count(&self) -> usize;

    /// Partition of `key`, in `0..partition_count()`
    fn partition(&self, key: &Value) -> Result<usize>;
}

/// Resolved routing function shared by copier and apply workers
pub type RoutingFn = Arc<dyn ShardingAlgorithm>;

type Factory = fn(&AlgorithmProps) -> Result<Box<dyn ShardingAlgorithm>>;

const BUILTIN: &[(&str, Factory)] = &[
    ("MOD", builtin::Mod::create),
    ("HASH_MOD", builtin::HashMod::create),
    ("BOUNDARY_RANGE", builtin::BoundaryRange::create),
    ("VOLUME_RANGE", builtin::VolumeRange::create),
];

/// Ordered, closed set of algorithm factories
#[derive(Clone)]
pub struct AlgorithmRegistry {
    factories: Vec<(&'static str, Factory)>,
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AlgorithmRegistry {
    /// Registry of the built-in algorithms
    pub fn builtin() -> Self {
        Self {
            factories: BUILTIN.to_vec(),
        }
    }

    fn factory(&self, type_name: &str) -> Option<Factory> {
        self.factories
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(type_name.trim()))
            .map(|(_, f)| *f)
    }

    /// Whether `type_name` is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.factory(type_name).is_some()
    }

    /// Registered type names in registration order
    pub fn type_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(name, _)| *name).collect()
    }

    /// Build the algorithm a descriptor names
    pub fn resolve(&self, descriptor: &AlgorithmDescriptor) -> Result<RoutingFn> {
        let factory =
            self.factory(&descriptor.type_name)
                .ok_or_else(|| PipelineError::UnknownAlgorithm {
                    type_name: descriptor.type_name.clone(),
                })?;
        Ok(Arc::from(factory(&descriptor.props)?))
    }
}

/// Read a property as text; numbers are rendered as written
fn prop_text(props: &AlgorithmProps, key: &str) -> Option<String> {
    match props.get(key)? {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_i64(type_name: &str, props: &AlgorithmProps, key: &str) -> Result<i64> {
    let text = prop_text(props, key)
        .ok_or_else(|| PipelineError::algorithm_props(type_name, format!("missing '{key}'")))?;
    text.parse().map_err(|_| {
        PipelineError::algorithm_props(type_name, format!("'{key}' must be an integer, got '{text}'"))
    })
}

fn integer_key(type_name: &str, key: &Value) -> Result<i64> {
    key.as_i64().ok_or_else(|| {
        PipelineError::routing(format!(
            "{type_name} needs an integer sharding value, got {key}"
        ))
    })
}
