//! ChunkBuilder - helper for emitting bytecode chunks.
//!
//! The compiler proper is an external collaborator; this assembler is the
//! producing side of the bytecode contract, used by embedders and tests.
//! It provides jump patching, constant-pool deduplication, locals slot
//! allocation, and exception-region bookkeeping.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::bytecode::{
    Chunk, ConstIndex, Constant, ExceptionEntry, ExceptionTable, FunctionInfo, HandlerKind,
    JumpTarget, LineEntry, LocalSlot, Op,
};
use crate::error::VmError;
use crate::value::{CheapClone, Str};

/// Placeholder for a jump that needs to be patched later.
#[derive(Debug, Clone, Copy)]
pub struct JumpPlaceholder {
    instruction_index: usize,
}

/// An open exception region; closed by one of the `close_*` methods.
#[derive(Debug, Clone, Copy)]
pub struct OpenRegion {
    start: usize,
    /// Operand-stack depth to restore when a handler in this region fires.
    stack_depth: u32,
}

/// Builder for constructing bytecode chunks.
pub struct ChunkBuilder {
    code: Vec<Op>,
    constants: Vec<Constant>,
    string_map: FxHashMap<Str, ConstIndex>,
    number_map: FxHashMap<u64, ConstIndex>,
    exception_table: ExceptionTable,
    lines: Vec<LineEntry>,
    current_line: Option<u32>,
    next_local: LocalSlot,
    info: FunctionInfo,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            string_map: FxHashMap::default(),
            number_map: FxHashMap::default(),
            exception_table: ExceptionTable::default(),
            lines: Vec::new(),
            current_line: None,
            next_local: 0,
            info: FunctionInfo::default(),
        }
    }

    /// Create a builder for a function body. Parameter slots are
    /// pre-allocated as locals `0..param_count`.
    pub fn for_function(info: FunctionInfo) -> Self {
        let mut builder = Self::new();
        builder.next_local = info.param_count as LocalSlot;
        builder.info = info;
        builder
    }

    /// Set the source line attributed to subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = Some(line);
    }

    /// Allocate a fresh locals slot.
    pub fn alloc_local(&mut self) -> LocalSlot {
        let slot = self.next_local;
        self.next_local += 1;
        slot
    }

    /// Emit an instruction and return its index.
    pub fn emit(&mut self, op: Op) -> usize {
        let index = self.code.len();
        if let Some(line) = self.current_line {
            let should_add = self.lines.last().is_none_or(|e| e.line != line);
            if should_add {
                self.lines.push(LineEntry {
                    offset: index as u32,
                    line,
                });
            }
        }
        self.code.push(op);
        index
    }

    /// Emit a jump with a placeholder target.
    pub fn emit_jump(&mut self) -> JumpPlaceholder {
        let index = self.emit(Op::Jump { target: 0 });
        JumpPlaceholder {
            instruction_index: index,
        }
    }

    pub fn emit_jump_if_true(&mut self) -> JumpPlaceholder {
        let index = self.emit(Op::JumpIfTrue { target: 0 });
        JumpPlaceholder {
            instruction_index: index,
        }
    }

    pub fn emit_jump_if_false(&mut self) -> JumpPlaceholder {
        let index = self.emit(Op::JumpIfFalse { target: 0 });
        JumpPlaceholder {
            instruction_index: index,
        }
    }

    pub fn emit_break(&mut self) -> JumpPlaceholder {
        let index = self.emit(Op::Break { target: 0 });
        JumpPlaceholder {
            instruction_index: index,
        }
    }

    pub fn emit_continue(&mut self) -> JumpPlaceholder {
        let index = self.emit(Op::Continue { target: 0 });
        JumpPlaceholder {
            instruction_index: index,
        }
    }

    /// Patch a placeholder to jump to the current position.
    pub fn patch_jump(&mut self, placeholder: JumpPlaceholder) {
        let target = self.code.len() as JumpTarget;
        self.patch_jump_to(placeholder, target);
    }

    /// Patch a placeholder to jump to a specific target.
    pub fn patch_jump_to(&mut self, placeholder: JumpPlaceholder, target: JumpTarget) {
        if let Some(op) = self.code.get_mut(placeholder.instruction_index) {
            match op {
                Op::Jump { target: t }
                | Op::JumpIfTrue { target: t }
                | Op::JumpIfFalse { target: t }
                | Op::Break { target: t }
                | Op::Continue { target: t } => *t = target,
                _ => {}
            }
        }
    }

    /// Current instruction offset (the target of a jump emitted to "here").
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Exception regions
    //
    // Regions nest; closing the inner region before the outer one appends
    // its entry first, which is exactly the innermost-first order the
    // table requires.
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a protected region starting at the current offset.
    /// `stack_depth` is the operand-stack depth at region entry.
    pub fn open_region(&mut self, stack_depth: u32) -> OpenRegion {
        OpenRegion {
            start: self.code.len(),
            stack_depth,
        }
    }

    /// Close a region with a `Catch` handler. The handler's code must be
    /// emitted outside `[start, end)`; its first instruction receives the
    /// thrown value on the operand stack.
    pub fn close_catch(&mut self, region: OpenRegion, handler: usize) -> u16 {
        self.push_entry(ExceptionEntry {
            start: region.start as JumpTarget,
            end: self.code.len() as JumpTarget,
            handler: handler as JumpTarget,
            handler_end: 0,
            kind: HandlerKind::Catch,
            stack_depth: region.stack_depth,
        })
    }

    /// Close a region with a `Finally` handler. The handler span is not
    /// known yet (the `EnterFinally` for the normal path and the handler
    /// body are emitted after the region closes); record it afterwards
    /// with [`Self::set_finally_handler`].
    pub fn close_finally(&mut self, region: OpenRegion) -> u16 {
        self.push_entry(ExceptionEntry {
            start: region.start as JumpTarget,
            end: self.code.len() as JumpTarget,
            handler: 0,
            handler_end: 0,
            kind: HandlerKind::Finally,
            stack_depth: region.stack_depth,
        })
    }

    /// Record the handler span of a `Finally` entry: `handler` is its
    /// first instruction, `handler_end` the offset just past its
    /// `EndFinally`.
    pub fn set_finally_handler(&mut self, entry: u16, handler: usize, handler_end: usize) {
        if let Some(e) = self.exception_table.entries.get_mut(entry as usize) {
            e.handler = handler as JumpTarget;
            e.handler_end = handler_end as JumpTarget;
        }
    }

    /// Close a region as a scope-teardown range: any unwind or non-local
    /// transfer leaving `[start, end)` pops one scope link.
    pub fn close_scope_exit(&mut self, region: OpenRegion) -> u16 {
        self.push_entry(ExceptionEntry {
            start: region.start as JumpTarget,
            end: self.code.len() as JumpTarget,
            handler: 0,
            handler_end: 0,
            kind: HandlerKind::ScopeExit,
            stack_depth: region.stack_depth,
        })
    }

    fn push_entry(&mut self, entry: ExceptionEntry) -> u16 {
        let index = self.exception_table.entries.len() as u16;
        self.exception_table.entries.push(entry);
        index
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Constants
    // ═══════════════════════════════════════════════════════════════════════════

    /// Add a string constant (deduplicated).
    pub fn add_str(&mut self, s: impl Into<Str>) -> ConstIndex {
        let s = s.into();
        if let Some(&idx) = self.string_map.get(&s) {
            return idx;
        }
        let idx = self.push_constant(Constant::Str(s.cheap_clone()));
        self.string_map.insert(s, idx);
        idx
    }

    /// Add a number constant (deduplicated by bit pattern).
    pub fn add_number(&mut self, n: f64) -> ConstIndex {
        let bits = n.to_bits();
        if let Some(&idx) = self.number_map.get(&bits) {
            return idx;
        }
        let idx = self.push_constant(Constant::Number(n));
        self.number_map.insert(bits, idx);
        idx
    }

    /// Add a nested chunk (for function literals).
    pub fn add_chunk(&mut self, chunk: Chunk) -> ConstIndex {
        self.push_constant(Constant::Chunk(Rc::new(chunk)))
    }

    fn push_constant(&mut self, constant: Constant) -> ConstIndex {
        let idx = self.constants.len() as ConstIndex;
        self.constants.push(constant);
        idx
    }

    /// Emit LoadConst for a number, using the inline form for small
    /// integers.
    pub fn emit_number(&mut self, n: f64) {
        if n.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&n) {
            self.emit(Op::LoadInt { value: n as i32 });
        } else {
            let idx = self.add_number(n);
            self.emit(Op::LoadConst { idx });
        }
    }

    /// Emit LoadConst for a string.
    pub fn emit_str(&mut self, s: impl Into<Str>) {
        let idx = self.add_str(s);
        self.emit(Op::LoadConst { idx });
    }

    /// Finish building, validating the result.
    pub fn finish(self) -> Result<Chunk, VmError> {
        let chunk = Chunk {
            code: self.code,
            constants: self.constants,
            exception_table: self.exception_table,
            local_count: self.next_local,
            lines: self.lines,
            info: self.info,
        };
        chunk.validate()?;
        Ok(chunk)
    }
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
