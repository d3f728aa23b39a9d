//! Module-wide pools and tables shared by the analyses and serializers

pub mod address_pool;
pub mod file_table;
pub mod labels;
pub mod loc_stream;
pub mod string_pool;

pub use address_pool::AddressPool;
pub use file_table::{FileTableEntry, LineFileTable};
pub use labels::{FunctionLabels, LabelAllocator, LabelRegistry};
pub use loc_stream::{DebugLocStream, LocEntry, LocList};
pub use string_pool::{StringPool, StringRef};
