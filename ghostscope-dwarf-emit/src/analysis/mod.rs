//! Per-function analyses run around instruction emission

pub mod call_site;
pub mod history;
pub mod line_table;
pub mod location;
pub mod scopes;

pub use call_site::{collect_call_site_params, collect_call_sites, request_call_labels, CallSite, CallSiteParam};
pub use history::{calculate_history, DbgValueHistory, HistoryEntry, HistoryKind, InlinedLabel, InlinedVariable};
pub use line_table::{LineFlags, LineTableController, LocDirective};
pub use location::{
    debug_loc_value, ConcreteLabel, ConcreteVariable, DebugLocEntry, FrameSlot, FunctionEntities,
    LocationContext, VariableLocation,
};
pub use scopes::{InsnRange, LexicalScope, LexicalScopeRef, LexicalScopes};
