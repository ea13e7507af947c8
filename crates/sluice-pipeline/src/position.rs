//! Change stream positions
//!
//! ## Formats
//!
//! - PostgreSQL / openGauss LSN: `0/16B3748`
//! - MySQL binlog: `mysql-bin.000003:154`
//! - Generic sequence: `#42`
//!
//! Positions of one stream are always the same kind. Comparing positions of
//! different kinds is total but meaningless.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// A point in a source change stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Position {
    /// WAL log sequence number
    Lsn(u64),
    /// Binlog file and byte offset
    Binlog {
        /// Binlog file name
        file: String,
        /// Offset inside the file
        offset: u64,
    },
    /// Monotonic sequence number
    Sequence(u64),
}

impl Position {
    /// Start of a sequence stream
    pub const fn origin() -> Self {
        Self::Sequence(0)
    }
}

/// Parse a PostgreSQL LSN in `XXX/XXX` form
pub fn parse_lsn(s: &str) -> Option<u64> {
    let (hi, lo) = s.split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
        return None;
    }
    Some((hi << 32) | lo)
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lsn(lsn) => write!(f, "{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF),
            Self::Binlog { file, offset } => write!(f, "{file}:{offset}"),
            Self::Sequence(n) => write!(f, "#{n}"),
        }
    }
}

impl FromStr for Position {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(n) = s.strip_prefix('#') {
            return n
                .parse()
                .map(Self::Sequence)
                .map_err(|_| PipelineError::config(format!("invalid sequence position: {s}")));
        }
        if s.contains('/') {
            return parse_lsn(s)
                .map(Self::Lsn)
                .ok_or_else(|| PipelineError::config(format!("invalid LSN: {s}")));
        }
        if let Some((file, offset)) = s.rsplit_once(':') {
            if !file.is_empty() {
                if let Ok(offset) = offset.parse() {
                    return Ok(Self::Binlog {
                        file: file.to_string(),
                        offset,
                    });
                }
            }
        }
        Err(PipelineError::config(format!("unrecognized position: {s}")))
    }
}

impl TryFrom<String> for Position {
    type Error = PipelineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Position> for String {
    fn from(p: Position) -> Self {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_format() {
        let p = Position::Lsn(0x16B3748);
        assert_eq!(p.to_string(), "0/16B3748");
        assert_eq!("0/16B3748".parse::<Position>().unwrap(), p);

        let p = Position::Lsn((3u64 << 32) | 0xA0);
        assert_eq!(p.to_string(), "3/A0");
        assert!("1/zz".parse::<Position>().is_err());
    }

    #[test]
    fn test_binlog_format_and_order() {
        let a: Position = "mysql-bin.000003:154".parse().unwrap();
        let b: Position = "mysql-bin.000003:2000".parse().unwrap();
        let c: Position = "mysql-bin.000004:4".parse().unwrap();
        assert_eq!(
            a,
            Position::Binlog {
                file: "mysql-bin.000003".into(),
                offset: 154
            }
        );
        assert!(a < b && b < c);
    }

    #[test]
    fn test_sequence_serde() {
        let p = Position::Sequence(42);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"#42\"");
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(Position::origin() < p);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!("".parse::<Position>().is_err());
        assert!("#x".parse::<Position>().is_err());
        assert!(":12".parse::<Position>().is_err());
    }
}
