//! Table rules: which target data node a source row lands on

use serde::{Deserialize, Serialize};
use sluice_rdbc::{Row, TableName};
use std::fmt;
use std::str::FromStr;

use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry, RoutingFn};
use crate::error::{PipelineError, Result};

/// One physical target table: `datasource.table` or `datasource.schema.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataNode {
    /// Target datasource name
    pub datasource: String,
    /// Physical table
    pub table: TableName,
}

impl DataNode {
    /// Create a data node
    pub fn new(datasource: impl Into<String>, table: TableName) -> Self {
        Self {
            datasource: datasource.into(),
            table,
        }
    }
}

impl FromStr for DataNode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let (datasource, table) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| PipelineError::config(format!("data node '{s}' needs 'datasource.table'")))?;
        if datasource.is_empty() {
            return Err(PipelineError::config(format!("data node '{s}' has no datasource")));
        }
        let table = table
            .parse::<TableName>()
            .map_err(|e| PipelineError::config(format!("data node '{s}': {e}")))?;
        Ok(Self::new(datasource, table))
    }
}

impl TryFrom<String> for DataNode {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DataNode> for String {
    fn from(n: DataNode) -> Self {
        n.to_string()
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.datasource, self.table)
    }
}

/// Source table location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceTable {
    /// Source datasource name
    pub datasource: String,
    /// Logical table
    pub table: TableName,
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.datasource, self.table)
    }
}

/// Sharding rule of one migrated table.
///
/// Partition id `i` of the algorithm maps to `data_nodes[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRule {
    /// Source table
    pub source: SourceTable,
    /// Column whose value selects the partition
    pub sharding_column: String,
    /// Sharding algorithm
    pub algorithm: AlgorithmDescriptor,
    /// Target data nodes, indexed by partition id
    pub data_nodes: Vec<DataNode>,
}

/// A [`TableRule`] with its algorithm resolved
#[derive(Debug, Clone)]
pub struct TableRouter {
    rule: TableRule,
    algorithm: RoutingFn,
}

impl TableRouter {
    /// Resolve the rule's algorithm and check it matches the data nodes
    pub fn new(rule: TableRule, registry: &AlgorithmRegistry) -> Result<Self> {
        if rule.data_nodes.is_empty() {
            return Err(PipelineError::config(format!(
                "table {} has no target data nodes",
                rule.source
            )));
        }
        let algorithm = registry.resolve(&rule.algorithm)?;
        if algorithm.partition_count() != rule.data_nodes.len() {
            return Err(PipelineError::config(format!(
                "table {}: {} produces {} partitions but {} data nodes are declared",
                rule.source,
                algorithm.type_name(),
                algorithm.partition_count(),
                rule.data_nodes.len()
            )));
        }
        Ok(Self { rule, algorithm })
    }

    /// The underlying rule
    pub fn rule(&self) -> &TableRule {
        &self.rule
    }

    /// Source table
    pub fn source(&self) -> &SourceTable {
        &self.rule.source
    }

    /// Target data nodes
    pub fn data_nodes(&self) -> &[DataNode] {
        &self.rule.data_nodes
    }

    /// Data node index of a row
    pub fn route_index(&self, row: &Row) -> Result<usize> {
        let key = row.get_by_name(&self.rule.sharding_column).ok_or_else(|| {
            PipelineError::routing(format!(
                "row of {} has no sharding column '{}'",
                self.rule.source, self.rule.sharding_column
            ))
        })?;
        let idx = self.algorithm.partition(key)?;
        if idx >= self.rule.data_nodes.len() {
            return Err(PipelineError::routing(format!(
                "partition {idx} of {} has no data node",
                self.rule.source
            )));
        }
        Ok(idx)
    }

    /// Data node of a row
    pub fn route(&self, row: &Row) -> Result<&DataNode> {
        let idx = self.route_index(row)?;
        Ok(&self.rule.data_nodes[idx])
    }
}
