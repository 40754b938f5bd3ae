pub mod error;
pub mod record;
pub mod storage;

pub use error::{ErrorKind, StorageError};
pub use record::{Envelope, OffsetInfo, Record};
pub use storage::{
    AssignmentBatch, AssignmentStream, PartitionRecords, PartitionSource, RecordsStorage,
    ResetPolicy, StorageFactory, Subscription,
};
