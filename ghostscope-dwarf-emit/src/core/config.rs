//! Emitter configuration
//!
//! `EmitterConfig` is the user-facing, serde-loadable description of what to
//! produce. `EmitterConfig::resolve` performs the one-time format negotiation
//! and returns `EmitOptions`, which is immutable and threaded by reference
//! through every component.

use crate::core::{EmitError, Result};
use gimli::{Encoding, Format, RunTimeEndian};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Debugger the output is tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebuggerTuning {
    #[default]
    Gdb,
    Lldb,
    Sce,
    Dbx,
}

/// Accelerator table flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccelTableKind {
    /// Pick based on version and tuning
    #[default]
    Default,
    None,
    /// Hashed `.apple_*` tables
    Apple,
    /// Sorted DWARF v5 `.debug_names`
    Dwarf,
}

/// Address-minimization strategy for DWARF v5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MinimizeAddr {
    #[default]
    Default,
    /// Always describe single-range scopes with a range list so they share
    /// one base address
    Ranges,
    Disabled,
}

/// Tri-state switch with a target-dependent default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    #[default]
    Default,
    Enable,
    Disable,
}

/// Object file format the debug sections end up in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    #[default]
    Elf,
    MachO,
    Coff,
    Xcoff,
    Wasm,
}

/// Emitter configuration loaded from the `[dwarf]` table of a TOML file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmitterConfig {
    /// DWARF version to produce (2-5)
    #[serde(default = "default_version")]
    pub version: u16,
    /// Use the 64-bit DWARF format
    #[serde(default)]
    pub dwarf64: bool,
    /// Target pointer width in bytes
    #[serde(default = "default_address_size")]
    pub address_size: u8,
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub tuning: DebuggerTuning,
    #[serde(default)]
    pub accel_tables: AccelTableKind,
    /// Companion file name; setting it enables split debug info
    #[serde(default)]
    pub split_dwarf_file: Option<String>,
    /// Let several compile units share one companion file
    #[serde(default)]
    pub split_cross_cu_sharing: bool,
    #[serde(default)]
    pub generate_type_units: bool,
    /// Use externally ranked key instructions for statement marking
    #[serde(default)]
    pub key_instructions: bool,
    #[serde(default)]
    pub minimize_addr: MinimizeAddr,
    /// Line-0 records for instructions without a source location
    #[serde(default)]
    pub unknown_locations: Toggle,
    #[serde(default)]
    pub sections_as_references: Toggle,
    #[serde(default)]
    pub inline_strings: Toggle,
    /// Force `.debug_aranges` even when the tuning would not emit it
    #[serde(default)]
    pub aranges: bool,
    /// Emit call-site parameters and entry values
    #[serde(default = "default_entry_values")]
    pub entry_values: bool,
    /// Use the GNU `.debug_macro` extension before DWARF v5
    #[serde(default)]
    pub gnu_debug_macro: bool,
    /// Promote a lone constant in a predecessor-less block to whole-scope
    /// validity
    #[serde(default = "default_legacy_constant_promotion")]
    pub legacy_constant_promotion: bool,
    #[serde(default)]
    pub object_format: ObjectFormat,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct ConfigFile {
    #[serde(default)]
    dwarf: EmitterConfig,
}

fn default_version() -> u16 {
    4
}

fn default_address_size() -> u8 {
    8
}

fn default_entry_values() -> bool {
    true
}

fn default_legacy_constant_promotion() -> bool {
    true
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            dwarf64: false,
            address_size: default_address_size(),
            big_endian: false,
            tuning: DebuggerTuning::default(),
            accel_tables: AccelTableKind::default(),
            split_dwarf_file: None,
            split_cross_cu_sharing: false,
            generate_type_units: false,
            key_instructions: false,
            minimize_addr: MinimizeAddr::default(),
            unknown_locations: Toggle::default(),
            sections_as_references: Toggle::default(),
            inline_strings: Toggle::default(),
            aranges: false,
            entry_values: default_entry_values(),
            gnu_debug_macro: false,
            legacy_constant_promotion: default_legacy_constant_promotion(),
            object_format: ObjectFormat::default(),
        }
    }
}

impl EmitterConfig {
    /// Default configuration for the given DWARF version
    pub fn with_version(version: u16) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Parse the `[dwarf]` table of a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse emitter configuration: {}", e))?;
        Ok(file.dwarf)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read configuration file '{}': {}",
                path.display(),
                e
            )
        })?;
        info!("Loading emitter configuration from: {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Negotiate the output format once. Fails when the requested addressing
    /// width cannot be expressed by the target object format.
    pub fn resolve(&self) -> Result<EmitOptions> {
        if !(2..=5).contains(&self.version) {
            return Err(EmitError::UnsupportedConfig(format!(
                "DWARF version {} is not supported (expected 2-5)",
                self.version
            ))
            .into());
        }
        if self.address_size != 4 && self.address_size != 8 {
            return Err(EmitError::UnsupportedConfig(format!(
                "address size {} is not supported (expected 4 or 8)",
                self.address_size
            ))
            .into());
        }
        if self.object_format == ObjectFormat::Xcoff && self.address_size == 8 && !self.dwarf64 {
            return Err(EmitError::UnsupportedConfig(
                "XCOFF requires DWARF64 for 64-bit mode".to_string(),
            )
            .into());
        }
        if self.dwarf64 {
            if self.version < 3 {
                return Err(EmitError::UnsupportedConfig(
                    "DWARF64 was introduced in DWARF v3".to_string(),
                )
                .into());
            }
            if self.address_size != 8 {
                return Err(EmitError::UnsupportedConfig(
                    "DWARF64 requires 64-bit relocations".to_string(),
                )
                .into());
            }
            if !matches!(self.object_format, ObjectFormat::Elf | ObjectFormat::Xcoff) {
                return Err(EmitError::UnsupportedConfig(format!(
                    "DWARF64 is not supported for {:?} objects",
                    self.object_format
                ))
                .into());
            }
        }

        let version = self.version;
        let tuning = self.tuning;
        let split = self.split_dwarf_file.is_some();

        let generate_type_units = self.generate_type_units
            && matches!(self.object_format, ObjectFormat::Elf | ObjectFormat::Wasm);
        if self.generate_type_units && !generate_type_units {
            debug!(
                "Type units are not supported for {:?} objects, disabling",
                self.object_format
            );
        }

        let accel_kind = match self.accel_tables {
            AccelTableKind::Default => {
                if generate_type_units
                    && (version < 5 || self.object_format != ObjectFormat::Elf)
                {
                    AccelTableKind::None
                } else if version >= 5 {
                    AccelTableKind::Dwarf
                } else if tuning == DebuggerTuning::Lldb {
                    if self.object_format == ObjectFormat::MachO {
                        AccelTableKind::Apple
                    } else {
                        AccelTableKind::Dwarf
                    }
                } else {
                    AccelTableKind::None
                }
            }
            other => other,
        };

        let use_inline_strings = match self.inline_strings {
            Toggle::Default => tuning == DebuggerTuning::Dbx,
            Toggle::Enable => true,
            Toggle::Disable => false,
        };

        let encoding = Encoding {
            format: if self.dwarf64 {
                Format::Dwarf64
            } else {
                Format::Dwarf32
            },
            version,
            address_size: self.address_size,
        };

        let options = EmitOptions {
            encoding,
            endian: if self.big_endian {
                RunTimeEndian::Big
            } else {
                RunTimeEndian::Little
            },
            tuning,
            object_format: self.object_format,
            accel_kind,
            split_dwarf_file: self.split_dwarf_file.clone(),
            share_across_dwo_cus: self.split_cross_cu_sharing,
            generate_type_units,
            key_instructions: self.key_instructions,
            minimize_addr: if version >= 5 {
                self.minimize_addr
            } else {
                MinimizeAddr::Disabled
            },
            unknown_locations: self.unknown_locations,
            use_inline_strings,
            use_sections_as_references: self.sections_as_references == Toggle::Enable,
            use_aranges: self.aranges || tuning == DebuggerTuning::Sce,
            apple_extension_attributes: tuning == DebuggerTuning::Lldb,
            use_gnu_tls_opcode: tuning == DebuggerTuning::Gdb || version < 3,
            segmented_str_offsets: version >= 5,
            emit_entry_values: self.entry_values && version >= 4,
            use_debug_macro_section: version >= 5 || (self.gnu_debug_macro && !split),
            use_all_linkage_names: tuning != DebuggerTuning::Sce,
            legacy_constant_promotion: self.legacy_constant_promotion,
        };

        info!(
            "Resolved DWARF v{} {:?} output: accel={:?}, split={}, type_units={}",
            version,
            encoding.format,
            options.accel_kind,
            split,
            options.generate_type_units
        );
        Ok(options)
    }
}

/// Immutable, resolved output format
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub encoding: Encoding,
    pub endian: RunTimeEndian,
    pub tuning: DebuggerTuning,
    pub object_format: ObjectFormat,
    /// Never `AccelTableKind::Default` once resolved
    pub accel_kind: AccelTableKind,
    pub split_dwarf_file: Option<String>,
    pub share_across_dwo_cus: bool,
    pub generate_type_units: bool,
    pub key_instructions: bool,
    pub minimize_addr: MinimizeAddr,
    pub unknown_locations: Toggle,
    pub use_inline_strings: bool,
    pub use_sections_as_references: bool,
    pub use_aranges: bool,
    pub apple_extension_attributes: bool,
    pub use_gnu_tls_opcode: bool,
    pub segmented_str_offsets: bool,
    pub emit_entry_values: bool,
    pub use_debug_macro_section: bool,
    pub use_all_linkage_names: bool,
    pub legacy_constant_promotion: bool,
}

impl EmitOptions {
    pub fn version(&self) -> u16 {
        self.encoding.version
    }

    pub fn address_size(&self) -> u8 {
        self.encoding.address_size
    }

    pub fn is_dwarf64(&self) -> bool {
        self.encoding.format == Format::Dwarf64
    }

    /// Size of a section offset or unit length field
    pub fn offset_size(&self) -> u8 {
        self.encoding.format.word_size()
    }

    pub fn use_split_dwarf(&self) -> bool {
        self.split_dwarf_file.is_some()
    }

    pub fn tune_for_gdb(&self) -> bool {
        self.tuning == DebuggerTuning::Gdb
    }

    pub fn tune_for_lldb(&self) -> bool {
        self.tuning == DebuggerTuning::Lldb
    }

    pub fn tune_for_sce(&self) -> bool {
        self.tuning == DebuggerTuning::Sce
    }

    /// Call-site entries use the GNU vendor tags instead of DWARF v5 ones
    pub fn use_gnu_analog_for_dwarf5(&self) -> bool {
        self.version() == 4 && !self.tune_for_lldb()
    }

    /// Single-range scopes still get a range list
    pub fn always_use_ranges(&self) -> bool {
        match self.minimize_addr {
            MinimizeAddr::Ranges => true,
            MinimizeAddr::Disabled => false,
            MinimizeAddr::Default => self.use_split_dwarf(),
        }
    }

    /// Form of a reference into another debug section
    pub fn section_offset_form(&self) -> gimli::DwForm {
        if self.version() >= 4 {
            gimli::constants::DW_FORM_sec_offset
        } else if self.is_dwarf64() {
            gimli::constants::DW_FORM_data8
        } else {
            gimli::constants::DW_FORM_data4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_resolves() {
        let options = EmitterConfig::default().resolve().unwrap();
        assert_eq!(options.version(), 4);
        assert_eq!(options.offset_size(), 4);
        assert_eq!(options.accel_kind, AccelTableKind::None);
        assert!(options.use_gnu_tls_opcode);
        assert!(!options.use_debug_macro_section);
    }

    #[test]
    fn test_version5_picks_debug_names() {
        let options = EmitterConfig::with_version(5).resolve().unwrap();
        assert_eq!(options.accel_kind, AccelTableKind::Dwarf);
        assert!(options.segmented_str_offsets);
        assert!(options.use_debug_macro_section);
    }

    #[test]
    fn test_lldb_on_macho_uses_apple_tables() {
        let config = EmitterConfig {
            tuning: DebuggerTuning::Lldb,
            object_format: ObjectFormat::MachO,
            ..EmitterConfig::default()
        };
        let options = config.resolve().unwrap();
        assert_eq!(options.accel_kind, AccelTableKind::Apple);
        assert!(options.apple_extension_attributes);
        assert!(!options.use_gnu_analog_for_dwarf5());
    }

    #[test]
    fn test_unsupported_widths_are_fatal() {
        let config = EmitterConfig {
            version: 2,
            dwarf64: true,
            ..EmitterConfig::default()
        };
        assert!(config.resolve().is_err());

        let config = EmitterConfig {
            version: 5,
            dwarf64: true,
            address_size: 4,
            ..EmitterConfig::default()
        };
        assert!(config.resolve().is_err());

        let config = EmitterConfig {
            object_format: ObjectFormat::Xcoff,
            ..EmitterConfig::default()
        };
        assert!(config.resolve().is_err());

        let config = EmitterConfig::with_version(6);
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_minimize_addr_only_applies_to_v5() {
        let config = EmitterConfig {
            minimize_addr: MinimizeAddr::Ranges,
            ..EmitterConfig::default()
        };
        assert!(!config.resolve().unwrap().always_use_ranges());

        let config = EmitterConfig {
            version: 5,
            minimize_addr: MinimizeAddr::Ranges,
            ..EmitterConfig::default()
        };
        assert!(config.resolve().unwrap().always_use_ranges());
    }

    #[test]
    fn test_load_from_toml() {
        let content = r#"
            [dwarf]
            version = 5
            dwarf64 = true
            tuning = "lldb"
            split_dwarf_file = "out.dwo"
            accel_tables = "none"
        "#;
        let config = EmitterConfig::from_toml_str(content).unwrap();
        assert_eq!(config.version, 5);
        assert!(config.dwarf64);
        assert_eq!(config.tuning, DebuggerTuning::Lldb);
        let options = config.resolve().unwrap();
        assert!(options.use_split_dwarf());
        assert!(options.always_use_ranges());
        assert_eq!(options.accel_kind, AccelTableKind::None);
        assert_eq!(options.offset_size(), 8);
    }

    #[test]
    fn test_split_disables_gnu_macro_before_v5() {
        let config = EmitterConfig {
            gnu_debug_macro: true,
            split_dwarf_file: Some("a.dwo".to_string()),
            ..EmitterConfig::default()
        };
        assert!(!config.resolve().unwrap().use_debug_macro_section);
    }
}
