//! Debug entry tree: units, entries, abbreviations and their layout

pub mod abbrev;
pub mod die;
pub mod expr_writer;
pub mod function;
pub mod global;
pub mod hash;
pub mod layout;
pub mod tree;
pub mod types;
pub mod unit;

pub use die::{AttrValue, Attribute, Die, DieArena, LocBlock};
pub use tree::EntityTree;
pub use unit::{Unit, UnitFile, UnitKind};
