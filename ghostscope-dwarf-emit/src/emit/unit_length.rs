//! Initial length field shared by every length-prefixed contribution

use crate::core::{EmitOptions, Label, Result};
use crate::data::labels::LabelAllocator;
use crate::emit::sink::DebugSink;

/// Length is the distance from `start` (just after the length field) to
/// `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLength {
    pub start: Label,
    pub end: Label,
}

impl UnitLength {
    pub fn new(alloc: &mut LabelAllocator) -> Self {
        Self {
            start: alloc.create(),
            end: alloc.create(),
        }
    }

    pub fn emit_start(&self, sink: &mut dyn DebugSink, options: &EmitOptions) -> Result<()> {
        if options.is_dwarf64() {
            sink.emit_u32(0xffff_ffff)?;
        }
        sink.emit_label_difference(self.end, self.start, options.offset_size())?;
        sink.bind_label(self.start)
    }

    pub fn emit_end(&self, sink: &mut dyn DebugSink) -> Result<()> {
        sink.bind_label(self.end)
    }
}

/// Emits a literal initial length
pub fn emit_fixed_length(sink: &mut dyn DebugSink, options: &EmitOptions, length: u64) -> Result<()> {
    if options.is_dwarf64() {
        sink.emit_u32(0xffff_ffff)?;
    }
    sink.emit_int(length, options.offset_size())
}

/// Size of an initial length field
pub fn initial_length_size(options: &EmitOptions) -> u64 {
    if options.is_dwarf64() {
        12
    } else {
        4
    }
}
