//! Section serialization: the output sink and one writer per section family

pub mod accel;
pub mod aranges;
pub mod info;
pub mod line;
pub mod lists;
pub mod macros;
pub mod object;
pub mod pubnames;
pub mod sink;
pub mod unit_length;

pub use line::{LineRow, LineTable};
pub use object::{write_dwo_object, write_object};
pub use sink::{DebugSink, MemorySink, OutputSection, RelocTarget, Relocation, SinkOutput};
