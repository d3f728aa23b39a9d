//! Ghostscope DWARF Emission Library
//!
//! Produces DWARF v2-v5 debug sections from machine-level functions and
//! source-level metadata: location lists, call-site parameters, the unit
//! entry tree (with split units and type units), line tables and every
//! auxiliary index section.

// Core modules
pub mod core;

// Analyses run per function
pub mod analysis;

// Pools and tables shared across units
pub mod data;

// Entry tree construction and layout
pub mod dwarf;

// Section serialization
pub mod emit;

// Main entry point
pub mod debug;

pub use debug::DwarfDebug;

// Re-export essential core types
pub use core::{
    AccelTableKind, DebugModule, DebuggerTuning, EmitError, EmitOptions, EmitterConfig,
    GenericTarget, MachineFunction, MachineInstr, ObjectFormat, Result, TargetInfo,
};

pub use emit::{write_dwo_object, write_object, DebugSink, MemorySink, SinkOutput};

// Re-export gimli types that external users need
pub use gimli::{constants, RunTimeEndian};
