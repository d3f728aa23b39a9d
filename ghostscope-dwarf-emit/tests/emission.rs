//! End-to-end emission tests
//!
//! Each test runs the fixture module through `DwarfDebug` and reads the
//! produced sections back with gimli.

mod common;

use common::{emit, init, sample_module};
use ghostscope_dwarf_emit::constants::*;
use ghostscope_dwarf_emit::core::{DebugSection, SectionId};
use ghostscope_dwarf_emit::{EmitterConfig, SinkOutput};
use gimli::{AttributeValue, EndianSlice, RunTimeEndian, UnitType};
use pretty_assertions::assert_eq;

type Slice<'a> = EndianSlice<'a, RunTimeEndian>;

fn load(output: &SinkOutput, dwo: bool) -> gimli::Dwarf<Slice<'_>> {
    let mut dwarf = gimli::Dwarf::load(|id| -> Result<Slice<'_>, gimli::Error> {
        let name = if dwo { id.dwo_name() } else { Some(id.name()) };
        let data = output
            .sections
            .iter()
            .find(|s| matches!(s.id, SectionId::Debug(d) if Some(d.name()) == name))
            .map(|s| s.data.as_slice())
            .unwrap_or(&[]);
        Ok(EndianSlice::new(data, RunTimeEndian::Little))
    })
    .unwrap();
    if dwo {
        dwarf.file_type = gimli::DwarfFileType::Dwo;
    }
    dwarf
}

fn name_of(
    dwarf: &gimli::Dwarf<Slice<'_>>,
    unit: &gimli::Unit<Slice<'_>>,
    entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
) -> Option<String> {
    let value = entry.attr_value(DW_AT_name).unwrap()?;
    let name = dwarf.attr_string(unit, value).unwrap();
    Some(name.to_string_lossy().into_owned())
}

/// (tag, name) of every entry of the first unit, in order
fn entries(dwarf: &gimli::Dwarf<Slice<'_>>) -> Vec<(gimli::DwTag, Option<String>)> {
    let header = dwarf.units().next().unwrap().unwrap();
    let unit = dwarf.unit(header).unwrap();
    let mut cursor = unit.entries();
    let mut out = Vec::new();
    while let Some((_, entry)) = cursor.next_dfs().unwrap() {
        out.push((entry.tag(), name_of(dwarf, &unit, entry)));
    }
    out
}

fn has(entries: &[(gimli::DwTag, Option<String>)], tag: gimli::DwTag, name: &str) -> bool {
    entries
        .iter()
        .any(|(t, n)| *t == tag && n.as_deref() == Some(name))
}

#[test]
fn test_v4_unit_reads_back() {
    init();
    let fixture = sample_module();
    let output = emit(&fixture, &EmitterConfig::with_version(4)).unwrap();
    let dwarf = load(&output, false);

    let header = dwarf.units().next().unwrap().unwrap();
    assert_eq!(header.version(), 4);
    let entries = entries(&dwarf);
    assert_eq!(entries[0], (DW_TAG_compile_unit, Some("main.c".to_string())));
    assert!(has(&entries, DW_TAG_subprogram, "add"));
    assert!(has(&entries, DW_TAG_subprogram, "caller"));
    assert!(has(&entries, DW_TAG_variable, "counter"));
    assert!(has(&entries, DW_TAG_formal_parameter, "x"));
    assert!(has(&entries, DW_TAG_base_type, "int"));
    assert!(entries.iter().any(|(tag, _)| *tag == DW_TAG_GNU_call_site));
}

#[test]
fn test_parameter_location_list() {
    init();
    let fixture = sample_module();
    for version in [4, 5] {
        let output = emit(&fixture, &EmitterConfig::with_version(version)).unwrap();
        let dwarf = load(&output, false);
        let header = dwarf.units().next().unwrap().unwrap();
        let unit = dwarf.unit(header).unwrap();

        let mut cursor = unit.entries();
        let mut ranges = Vec::new();
        while let Some((_, entry)) = cursor.next_dfs().unwrap() {
            if entry.tag() != DW_TAG_formal_parameter {
                continue;
            }
            let value = entry.attr_value(DW_AT_location).unwrap().unwrap();
            let offset = dwarf.attr_locations_offset(&unit, value).unwrap().unwrap();
            let mut locations = dwarf.locations(&unit, offset).unwrap();
            while let Some(location) = locations.next().unwrap() {
                ranges.push((
                    location.range.begin,
                    location.range.end,
                    location.data.0.slice().to_vec(),
                ));
            }
        }
        assert_eq!(
            ranges,
            vec![
                (0, 4, vec![DW_OP_reg5.0]),
                (4, 6, vec![DW_OP_reg3.0]),
            ],
            "version {}",
            version
        );
    }
}

#[test]
fn test_v5_addresses_and_call_sites() {
    init();
    let fixture = sample_module();
    let output = emit(&fixture, &EmitterConfig::with_version(5)).unwrap();
    let dwarf = load(&output, false);
    let header = dwarf.units().next().unwrap().unwrap();
    assert_eq!(header.version(), 5);
    assert_eq!(header.type_(), UnitType::Compilation);
    let unit = dwarf.unit(header).unwrap();

    let mut low_pcs = Vec::new();
    let mut call_values = Vec::new();
    let mut cursor = unit.entries();
    while let Some((_, entry)) = cursor.next_dfs().unwrap() {
        match entry.tag() {
            DW_TAG_subprogram => {
                let value = entry.attr_value(DW_AT_low_pc).unwrap().unwrap();
                let address = dwarf.attr_address(&unit, value).unwrap().unwrap();
                low_pcs.push((name_of(&dwarf, &unit, entry).unwrap(), address));
            }
            DW_TAG_call_site_parameter => {
                if let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(DW_AT_call_value).unwrap() {
                    call_values.push(expr.0.slice().to_vec());
                }
            }
            _ => {}
        }
    }
    low_pcs.sort();
    assert_eq!(
        low_pcs,
        vec![("add".to_string(), 0), ("caller".to_string(), 6)]
    );
    assert_eq!(call_values, vec![vec![DW_OP_lit7.0]]);

    let program = unit.line_program.clone().unwrap();
    let mut rows = program.rows();
    let mut lines = Vec::new();
    while let Some((_, row)) = rows.next_row().unwrap() {
        if !row.end_sequence() {
            lines.push(row.line().map(|l| l.get()).unwrap_or(0));
        }
    }
    assert_eq!(lines, vec![11, 12, 20, 21, 22]);
}

#[test]
fn test_split_units_share_dwo_id() {
    init();
    let fixture = sample_module();
    let mut config = EmitterConfig::with_version(5);
    config.split_dwarf_file = Some("sample.dwo".to_string());
    let output = emit(&fixture, &config).unwrap();

    assert!(!output
        .section_data(SectionId::Debug(DebugSection::InfoDwo))
        .is_empty());

    let skeleton = load(&output, false);
    let header = skeleton.units().next().unwrap().unwrap();
    let UnitType::Skeleton(skeleton_id) = header.type_() else {
        panic!("expected a skeleton unit, got {:?}", header.type_());
    };

    let dwo = load(&output, true);
    let header = dwo.units().next().unwrap().unwrap();
    let UnitType::SplitCompilation(split_id) = header.type_() else {
        panic!("expected a split unit, got {:?}", header.type_());
    };
    assert_eq!(skeleton_id, split_id);

    let entries = entries(&dwo);
    assert!(has(&entries, DW_TAG_subprogram, "add"));
    assert!(has(&entries, DW_TAG_formal_parameter, "x"));
}

#[test]
fn test_aranges_cover_the_code() {
    init();
    let fixture = sample_module();
    let mut config = EmitterConfig::with_version(4);
    config.aranges = true;
    let output = emit(&fixture, &config).unwrap();
    let dwarf = load(&output, false);

    let mut headers = dwarf.debug_aranges.headers();
    let header = headers.next().unwrap().unwrap();
    let mut spans = Vec::new();
    let mut entries = header.entries();
    while let Some(entry) = entries.next().unwrap() {
        spans.push((entry.address(), entry.length()));
    }
    assert!(spans.contains(&(0, 21)), "spans: {:?}", spans);
    assert!(headers.next().unwrap().is_none());
}
