//! Row operation descriptors and partition key derivation.

use std::{
    fmt::Display,
    hash::Hasher,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use siphasher::sip::SipHasher13;

use crate::{Error, Result, tablet::RemoteTablet};

/// Fixed siphash key so every client maps the same hashed columns to the same partition key.
const HASH_KEY: [u8; 16] = [
    0x3a, 0x91, 0x0e, 0x5c, 0xd7, 0x22, 0x68, 0xb4, 0x1f, 0xc0, 0x7d, 0x49, 0xe5, 0x03, 0x8a, 0x66,
];

/// How the rows of a table are spread over its tablets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSchema {
    /// Rows are placed by a 16 bit hash of their hashed key columns.
    Hash,
    /// Rows are placed by the ordering of their range key.
    Range,
}

impl PartitionSchema {
    pub fn is_hash_partitioning(&self) -> bool {
        matches!(self, Self::Hash)
    }

    /// Hash the given key components into the 16 bit hash space.
    pub fn hash_columns<'a>(components: impl IntoIterator<Item = &'a [u8]>) -> u16 {
        let mut hasher = SipHasher13::new_with_key(&HASH_KEY);
        for c in components {
            // Fixed width little endian length prefix so ("ab", "c") and ("a", "bc") hash
            // differently and the result does not depend on the target's usize.
            hasher.write(&(c.len() as u64).to_le_bytes());
            hasher.write(c);
        }
        (hasher.finish() & 0xffff) as u16
    }

    /// Encode a hash value as a partition key.
    pub fn encode_multi_column_hash_value(hash: u16) -> Vec<u8> {
        hash.to_be_bytes().to_vec()
    }

    /// Decode the hash value carried by a hash partition key.
    ///
    /// Keys shorter than two bytes are zero padded.
    pub fn decode_multi_column_hash_value(partition_key: &[u8]) -> u16 {
        let hi = partition_key.first().copied().unwrap_or_default();
        let lo = partition_key.get(1).copied().unwrap_or_default();
        u16::from_be_bytes([hi, lo])
    }
}

/// A table operations are issued against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    partition_schema: PartitionSchema,
}

impl Table {
    pub fn new(name: impl Into<String>, partition_schema: PartitionSchema) -> Self {
        Self {
            name: name.into(),
            partition_schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_schema(&self) -> PartitionSchema {
        self.partition_schema
    }
}

/// Read consistency requested by a QL read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Served by the tablet leader.
    #[default]
    Strong,
    /// Possibly stale but ordered results, may be served by a follower.
    ConsistentPrefix,
}

/// Key material of a QL or PGSQL row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowKey {
    /// Encoded values of the hashed key columns, in key order.
    pub hashed_columns: Vec<Bytes>,
    /// Encoded range key.
    pub range_key: Bytes,
}

impl RowKey {
    pub fn hashed(hashed_columns: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            hashed_columns: hashed_columns.into_iter().collect(),
            range_key: Bytes::new(),
        }
    }

    pub fn range(range_key: impl Into<Bytes>) -> Self {
        Self {
            hashed_columns: vec![],
            range_key: range_key.into(),
        }
    }

    fn size_bytes(&self) -> usize {
        self.hashed_columns.iter().map(Bytes::len).sum::<usize>() + self.range_key.len()
    }

    /// Partition key of this row in a table using `schema`.
    ///
    /// Returns an empty key for a hash partitioned row without hashed columns.
    fn partition_key(&self, schema: PartitionSchema) -> Vec<u8> {
        match schema {
            PartitionSchema::Hash if self.hashed_columns.is_empty() => vec![],
            PartitionSchema::Hash => {
                let columns = self.hashed_columns.iter().map(|c| &c[..]);
                let hash = PartitionSchema::hash_columns(columns);
                PartitionSchema::encode_multi_column_hash_value(hash)
            }
            PartitionSchema::Range => self.range_key.to_vec(),
        }
    }
}

/// The kind of an [`Operation`], without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    QlRead,
    QlWrite,
    RedisRead,
    RedisWrite,
    PgsqlRead,
    PgsqlWrite,
}

impl Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::QlRead => "QL_READ",
            Self::QlWrite => "QL_WRITE",
            Self::RedisRead => "REDIS_READ",
            Self::RedisWrite => "REDIS_WRITE",
            Self::PgsqlRead => "PGSQL_READ",
            Self::PgsqlWrite => "PGSQL_WRITE",
        };
        f.write_str(s)
    }
}

/// The request carried by an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    QlRead {
        key: RowKey,
        consistency_level: ConsistencyLevel,
        payload: Bytes,
    },
    QlWrite {
        key: RowKey,
        /// The write returns rows, e.g. a conditional write reporting the existing row.
        returns_rows: bool,
        payload: Bytes,
    },
    RedisRead {
        key: Bytes,
        payload: Bytes,
    },
    RedisWrite {
        key: Bytes,
        payload: Bytes,
    },
    PgsqlRead {
        key: RowKey,
        payload: Bytes,
    },
    PgsqlWrite {
        key: RowKey,
        payload: Bytes,
    },
}

/// An immutable row read or write submitted to a [`Batcher`](crate::Batcher).
///
/// Operations are shared between the caller and the batcher; errors recorded in the
/// [`ErrorCollector`](crate::ErrorCollector) refer back to the same `Arc<Operation>`.
#[derive(Debug)]
pub struct Operation {
    table: Arc<Table>,
    kind: OperationKind,
    tablet: Option<Arc<RemoteTablet>>,
    hash_code: OnceLock<u16>,
}

impl Operation {
    pub fn new(table: Arc<Table>, kind: OperationKind) -> Self {
        Self {
            table,
            kind,
            tablet: None,
            hash_code: OnceLock::new(),
        }
    }

    /// Attach an already known destination, skipping the tablet lookup on admission.
    pub fn with_tablet(self, tablet: Arc<RemoteTablet>) -> Self {
        Self {
            tablet: Some(tablet),
            ..self
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn tablet(&self) -> Option<&Arc<RemoteTablet>> {
        self.tablet.as_ref()
    }

    pub fn op_type(&self) -> OperationType {
        match &self.kind {
            OperationKind::QlRead { .. } => OperationType::QlRead,
            OperationKind::QlWrite { .. } => OperationType::QlWrite,
            OperationKind::RedisRead { .. } => OperationType::RedisRead,
            OperationKind::RedisWrite { .. } => OperationType::RedisWrite,
            OperationKind::PgsqlRead { .. } => OperationType::PgsqlRead,
            OperationKind::PgsqlWrite { .. } => OperationType::PgsqlWrite,
        }
    }

    pub fn read_only(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::QlRead { .. }
                | OperationKind::RedisRead { .. }
                | OperationKind::PgsqlRead { .. }
        )
    }

    /// Consistency level of a QL read, [`ConsistencyLevel::Strong`] for everything else.
    pub fn consistency_level(&self) -> ConsistencyLevel {
        match &self.kind {
            OperationKind::QlRead {
                consistency_level, ..
            } => *consistency_level,
            _ => ConsistencyLevel::Strong,
        }
    }

    /// True if the response to this operation carries a variable size row payload.
    pub fn returns_sidecar(&self) -> bool {
        match &self.kind {
            OperationKind::QlRead { .. } | OperationKind::PgsqlRead { .. } => true,
            OperationKind::QlWrite { returns_rows, .. } => *returns_rows,
            OperationKind::RedisRead { .. }
            | OperationKind::RedisWrite { .. }
            | OperationKind::PgsqlWrite { .. } => false,
        }
    }

    /// Bytes this operation occupies in a batcher's buffer.
    pub fn size_bytes(&self) -> usize {
        match &self.kind {
            OperationKind::QlRead { key, payload, .. }
            | OperationKind::QlWrite { key, payload, .. }
            | OperationKind::PgsqlRead { key, payload }
            | OperationKind::PgsqlWrite { key, payload } => key.size_bytes() + payload.len(),
            OperationKind::RedisRead { key, payload }
            | OperationKind::RedisWrite { key, payload } => key.len() + payload.len(),
        }
    }

    /// Derive the key used to locate the tablet owning this operation.
    pub fn partition_key(&self) -> Result<Vec<u8>> {
        let schema = self.table.partition_schema();
        match &self.kind {
            OperationKind::QlRead { key, .. } | OperationKind::PgsqlRead { key, .. } => {
                Ok(key.partition_key(schema))
            }
            OperationKind::QlWrite { key, .. } | OperationKind::PgsqlWrite { key, .. } => {
                let partition_key = key.partition_key(schema);
                if schema.is_hash_partitioning() && partition_key.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "{} on hash partitioned table {} has no hashed key columns",
                        self.op_type(),
                        self.table.name()
                    )));
                }
                Ok(partition_key)
            }
            OperationKind::RedisRead { key, .. } | OperationKind::RedisWrite { key, .. } => {
                match schema {
                    PartitionSchema::Hash => Ok(PartitionSchema::encode_multi_column_hash_value(
                        PartitionSchema::hash_columns([&key[..]]),
                    )),
                    PartitionSchema::Range => Ok(key.to_vec()),
                }
            }
        }
    }

    /// True if a hash partitioned request of this type must carry the hash code decoded from
    /// `partition_key`. Reads without a partition key scan from the first tablet and carry none.
    pub fn requires_hash_code(&self, partition_key: &[u8]) -> bool {
        match &self.kind {
            OperationKind::QlRead { .. } | OperationKind::PgsqlRead { .. } => {
                !partition_key.is_empty()
            }
            OperationKind::QlWrite { .. }
            | OperationKind::RedisRead { .. }
            | OperationKind::RedisWrite { .. }
            | OperationKind::PgsqlWrite { .. } => true,
        }
    }

    /// Hash code attached when the operation was admitted to a hash partitioned batch.
    pub fn hash_code(&self) -> Option<u16> {
        self.hash_code.get().copied()
    }

    /// Attach the hash code. Only the first value set sticks.
    pub(crate) fn set_hash_code(&self, hash_code: u16) {
        let _ = self.hash_code.set(hash_code);
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on table {}", self.op_type(), self.table.name())
    }
}
