//! Lexical scope tree of one machine function
//!
//! Scopes come in three flavours: regular scopes of the function itself,
//! inlined scopes keyed by (scope, inlined-at) and abstract scopes that
//! describe an inlined subprogram once for all of its instances. Each
//! concrete scope records the instruction ranges it covers; dominance is
//! answered from DFS numbering of the concrete nest.

use crate::core::{
    DebugLoc, DebugModule, EmitError, InlinedAtId, InstrId, MachineFunction, Result, ScopeId,
    ScopeKind,
};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Index of a scope inside `LexicalScopes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LexicalScopeRef(pub u32);

/// Inclusive instruction range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnRange {
    pub first: InstrId,
    pub last: InstrId,
}

#[derive(Debug, Clone)]
pub struct LexicalScope {
    /// Metadata scope with lexical-block-file wrappers stripped
    pub desc: ScopeId,
    pub inlined_at: Option<InlinedAtId>,
    pub parent: Option<LexicalScopeRef>,
    pub children: Vec<LexicalScopeRef>,
    pub ranges: Vec<InsnRange>,
    pub is_abstract: bool,
    dfs_in: u32,
    dfs_out: u32,
    first: Option<InstrId>,
    last: Option<InstrId>,
}

impl LexicalScope {
    fn new(
        desc: ScopeId,
        inlined_at: Option<InlinedAtId>,
        parent: Option<LexicalScopeRef>,
        is_abstract: bool,
    ) -> Self {
        Self {
            desc,
            inlined_at,
            parent,
            children: Vec::new(),
            ranges: Vec::new(),
            is_abstract,
            dfs_in: 0,
            dfs_out: 0,
            first: None,
            last: None,
        }
    }

    pub fn first_instr(&self) -> Option<InstrId> {
        self.ranges.first().map(|r| r.first)
    }

    pub fn last_instr(&self) -> Option<InstrId> {
        self.ranges.last().map(|r| r.last)
    }
}

#[derive(Debug, Default)]
pub struct LexicalScopes {
    scopes: Vec<LexicalScope>,
    regular: HashMap<ScopeId, LexicalScopeRef>,
    inlined: HashMap<(ScopeId, InlinedAtId), LexicalScopeRef>,
    abstract_scopes: HashMap<ScopeId, LexicalScopeRef>,
    /// Abstract subprogram scopes in creation order
    abstract_subprograms: Vec<LexicalScopeRef>,
    root: Option<LexicalScopeRef>,
}

impl LexicalScopes {
    /// Builds the scope tree and instruction ranges of `func`
    pub fn initialize(module: &DebugModule, func: &MachineFunction) -> Result<Self> {
        let mut scopes = Self::default();
        if func.subprogram.is_none() {
            return Ok(scopes);
        }
        let (ranges, begins) = scopes.extract_ranges(module, func)?;
        let Some(root) = scopes.root else {
            trace!("Function {} has no located instructions", func.name);
            return Ok(scopes);
        };
        scopes.construct_scope_nest(root);
        scopes.assign_instruction_ranges(&ranges, &begins);
        debug!(
            "Lexical scopes for {}: {} scopes, {} ranges",
            func.name,
            scopes.scopes.len(),
            ranges.len()
        );
        Ok(scopes)
    }

    fn extract_ranges(
        &mut self,
        module: &DebugModule,
        func: &MachineFunction,
    ) -> Result<(Vec<InsnRange>, Vec<LexicalScopeRef>)> {
        let mut ranges = Vec::new();
        let mut begins = Vec::new();
        for block in &func.blocks {
            let mut range_begin: Option<InstrId> = None;
            let mut prev_instr: Option<InstrId> = None;
            let mut prev_loc: Option<DebugLoc> = None;
            for id in block.instrs() {
                let instr = func.instr(id);
                if instr.is_meta() {
                    continue;
                }
                let Some(loc) = instr.loc else {
                    prev_instr = Some(id);
                    continue;
                };
                if prev_loc.is_some_and(|prev| same_location(&prev, &loc)) {
                    prev_instr = Some(id);
                    continue;
                }
                if let (Some(begin), Some(prev), Some(prev_loc)) =
                    (range_begin, prev_instr, prev_loc)
                {
                    ranges.push(InsnRange {
                        first: begin,
                        last: prev,
                    });
                    begins.push(self.get_or_create_lexical_scope(
                        module,
                        prev_loc.scope,
                        prev_loc.inlined_at,
                    )?);
                }
                range_begin = Some(id);
                prev_instr = Some(id);
                prev_loc = Some(loc);
            }
            if let (Some(begin), Some(prev), Some(prev_loc)) = (range_begin, prev_instr, prev_loc) {
                ranges.push(InsnRange {
                    first: begin,
                    last: prev,
                });
                begins.push(self.get_or_create_lexical_scope(
                    module,
                    prev_loc.scope,
                    prev_loc.inlined_at,
                )?);
            }
        }
        Ok((ranges, begins))
    }

    fn push(&mut self, scope: LexicalScope) -> LexicalScopeRef {
        let id = LexicalScopeRef(self.scopes.len() as u32);
        if let Some(parent) = scope.parent {
            self.scopes[parent.0 as usize].children.push(id);
        }
        self.scopes.push(scope);
        id
    }

    fn get_or_create_lexical_scope(
        &mut self,
        module: &DebugModule,
        scope: ScopeId,
        inlined_at: Option<InlinedAtId>,
    ) -> Result<LexicalScopeRef> {
        match inlined_at {
            Some(ia) => {
                self.get_or_create_abstract_scope(module, scope)?;
                self.get_or_create_inlined_scope(module, scope, ia)
            }
            None => self.get_or_create_regular_scope(module, scope),
        }
    }

    fn get_or_create_regular_scope(
        &mut self,
        module: &DebugModule,
        scope: ScopeId,
    ) -> Result<LexicalScopeRef> {
        let scope = module.non_file_scope(scope)?;
        if let Some(existing) = self.regular.get(&scope) {
            return Ok(*existing);
        }
        let parent = match lexical_block_parent(module, scope)? {
            Some(parent) => Some(self.get_or_create_regular_scope(module, parent)?),
            None => None,
        };
        let id = self.push(LexicalScope::new(scope, None, parent, false));
        self.regular.insert(scope, id);
        if parent.is_none() {
            if self.root.is_some() {
                return Err(EmitError::InvalidInput(format!(
                    "scope {} is a second outermost scope of one function",
                    scope.0
                ))
                .into());
            }
            self.root = Some(id);
        }
        Ok(id)
    }

    fn get_or_create_inlined_scope(
        &mut self,
        module: &DebugModule,
        scope: ScopeId,
        inlined_at: InlinedAtId,
    ) -> Result<LexicalScopeRef> {
        let scope = module.non_file_scope(scope)?;
        if let Some(existing) = self.inlined.get(&(scope, inlined_at)) {
            return Ok(*existing);
        }
        let parent = match lexical_block_parent(module, scope)? {
            Some(parent) => self.get_or_create_inlined_scope(module, parent, inlined_at)?,
            None => {
                let site = module.inlined(inlined_at)?;
                let (site_scope, site_ia) = (site.scope, site.inlined_at);
                self.get_or_create_lexical_scope(module, site_scope, site_ia)?
            }
        };
        let id = self.push(LexicalScope::new(scope, Some(inlined_at), Some(parent), false));
        self.inlined.insert((scope, inlined_at), id);
        Ok(id)
    }

    /// Abstract scope shared by every inlined instance of `scope`
    pub fn get_or_create_abstract_scope(
        &mut self,
        module: &DebugModule,
        scope: ScopeId,
    ) -> Result<LexicalScopeRef> {
        let scope = module.non_file_scope(scope)?;
        if let Some(existing) = self.abstract_scopes.get(&scope) {
            return Ok(*existing);
        }
        let parent = match lexical_block_parent(module, scope)? {
            Some(parent) => Some(self.get_or_create_abstract_scope(module, parent)?),
            None => None,
        };
        let id = self.push(LexicalScope::new(scope, None, parent, true));
        self.abstract_scopes.insert(scope, id);
        if matches!(module.scope(scope)?.kind, ScopeKind::Subprogram(_)) {
            self.abstract_subprograms.push(id);
        }
        Ok(id)
    }

    fn construct_scope_nest(&mut self, root: LexicalScopeRef) {
        let mut counter = 0u32;
        let mut stack = vec![root];
        self.scopes[root.0 as usize].dfs_in = counter;
        counter += 1;
        while let Some(top) = stack.last().copied() {
            let next_child = self.scopes[top.0 as usize]
                .children
                .iter()
                .copied()
                .find(|child| self.scopes[child.0 as usize].dfs_out == 0);
            match next_child {
                Some(child) => {
                    stack.push(child);
                    self.scopes[child.0 as usize].dfs_in = counter;
                    counter += 1;
                }
                None => {
                    stack.pop();
                    self.scopes[top.0 as usize].dfs_out = counter;
                    counter += 1;
                }
            }
        }
    }

    fn assign_instruction_ranges(&mut self, ranges: &[InsnRange], begins: &[LexicalScopeRef]) {
        let mut prev: Option<LexicalScopeRef> = None;
        for (range, scope) in ranges.iter().zip(begins) {
            if let Some(prev) = prev {
                if !self.dominates(prev, *scope) {
                    self.close_range(prev, Some(*scope));
                }
            }
            self.open_range(*scope, range.first);
            self.extend_range(*scope, range.last);
            prev = Some(*scope);
        }
        if let Some(prev) = prev {
            self.close_range(prev, None);
        }
    }

    fn open_range(&mut self, scope: LexicalScopeRef, instr: InstrId) {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &mut self.scopes[id.0 as usize];
            if s.first.is_none() {
                s.first = Some(instr);
            }
            current = s.parent;
        }
    }

    fn extend_range(&mut self, scope: LexicalScopeRef, instr: InstrId) {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &mut self.scopes[id.0 as usize];
            s.last = Some(instr);
            current = s.parent;
        }
    }

    fn close_range(&mut self, scope: LexicalScopeRef, new_scope: Option<LexicalScopeRef>) {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &mut self.scopes[id.0 as usize];
            if let (Some(first), Some(last)) = (s.first.take(), s.last.take()) {
                s.ranges.push(InsnRange { first, last });
            }
            let parent = s.parent;
            current = match parent {
                Some(parent) => match new_scope {
                    Some(new_scope) if self.dominates(parent, new_scope) => None,
                    _ => Some(parent),
                },
                None => None,
            };
        }
    }

    /// `a` dominates `b` when `b` is `a` or nested inside it
    pub fn dominates(&self, a: LexicalScopeRef, b: LexicalScopeRef) -> bool {
        if a == b {
            return true;
        }
        let (a, b) = (&self.scopes[a.0 as usize], &self.scopes[b.0 as usize]);
        a.dfs_in < b.dfs_in && a.dfs_out > b.dfs_out
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Outermost scope: the function's own subprogram
    pub fn root(&self) -> Option<LexicalScopeRef> {
        self.root
    }

    pub fn scope(&self, id: LexicalScopeRef) -> &LexicalScope {
        &self.scopes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn find_lexical_scope(&self, module: &DebugModule, scope: ScopeId) -> Option<LexicalScopeRef> {
        let scope = module.non_file_scope(scope).ok()?;
        self.regular.get(&scope).copied()
    }

    pub fn find_inlined_scope(
        &self,
        module: &DebugModule,
        scope: ScopeId,
        inlined_at: InlinedAtId,
    ) -> Option<LexicalScopeRef> {
        let scope = module.non_file_scope(scope).ok()?;
        self.inlined.get(&(scope, inlined_at)).copied()
    }

    pub fn find_abstract_scope(&self, module: &DebugModule, scope: ScopeId) -> Option<LexicalScopeRef> {
        let scope = module.non_file_scope(scope).ok()?;
        self.abstract_scopes.get(&scope).copied()
    }

    /// Scope an instruction location belongs to
    pub fn find_scope(
        &self,
        module: &DebugModule,
        scope: ScopeId,
        inlined_at: Option<InlinedAtId>,
    ) -> Option<LexicalScopeRef> {
        match inlined_at {
            Some(ia) => self.find_inlined_scope(module, scope, ia),
            None => self.find_lexical_scope(module, scope),
        }
    }

    pub fn abstract_subprograms(&self) -> &[LexicalScopeRef] {
        &self.abstract_subprograms
    }

    /// Concrete scopes in creation order
    pub fn concrete_scopes(&self) -> impl Iterator<Item = LexicalScopeRef> + '_ {
        self.scopes
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_abstract)
            .map(|(idx, _)| LexicalScopeRef(idx as u32))
    }
}

fn same_location(a: &DebugLoc, b: &DebugLoc) -> bool {
    a.line == b.line && a.column == b.column && a.scope == b.scope && a.inlined_at == b.inlined_at
}

/// Parent scope for lexical blocks; `None` for subprograms
fn lexical_block_parent(module: &DebugModule, scope: ScopeId) -> Result<Option<ScopeId>> {
    let meta = module.scope(scope)?;
    match meta.kind {
        ScopeKind::LexicalBlock { .. } | ScopeKind::LexicalBlockFile { .. } => {
            let parent = meta.parent.ok_or_else(|| {
                EmitError::InvalidInput(format!("lexical block {} has no parent scope", scope.0))
            })?;
            Ok(Some(module.non_file_scope(parent)?))
        }
        ScopeKind::Subprogram(_) => Ok(None),
        _ => Err(EmitError::InvalidInput(format!(
            "scope {} is not a local scope",
            scope.0
        ))
        .into()),
    }
}
