//! Low-level IR for the spindle middle end.
//!
//! A function body is an arena of instructions addressed by stable `InstId`
//! handles plus an arena of blocks addressed by `BlockId`. Blocks hold an
//! ordered list of instruction handles and exactly one terminator. Graph
//! surgery (replace-all-uses, erase, block splitting, whole-body cloning)
//! never invalidates a handle: erased instructions turn into `Nop`
//! tombstones detached from their block, and cloning copies both arenas
//! wholesale so every handle stays meaningful in the copy.

pub mod layout;
pub mod pretty;
pub mod ty;


pub use ty::Ty;

use crate::ident::Name;
use derive_more::From;

pub type InstId = u32;
pub type BlockId = u32;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name.as_str() == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name.as_str() == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: Name,
    pub ty: Ty,
    pub initializer: Option<Constant>,
    pub is_constant: bool,
    pub linkage: Linkage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    C,
    Fast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub return_type: Ty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: Name,
    pub sig: Signature,
    pub linkage: Linkage,
    pub calling_convention: CallingConvention,
    /// Set by bootstrap normalization when a begin marker is recognized.
    pub is_coroutine: bool,
    /// Two-phase split scheduling state: tagged on the first visit, split
    /// on the second.
    pub ready_for_split: bool,
    pub body: Body,
}

impl Function {
    pub fn new(name: impl Into<Name>, sig: Signature) -> Self {
        Function {
            name: name.into(),
            sig,
            linkage: Linkage::External,
            calling_convention: CallingConvention::C,
            is_coroutine: false,
            ready_for_split: false,
            body: Body::new(),
        }
    }

    /// Structural clone under a new name, with every use of the original
    /// parameters substituted by undefined placeholders. Handles remain
    /// stable across the copy; further substitutions are ordinary
    /// `replace_all_uses` calls on the clone.
    pub fn clone_with_undef_args(&self, name: impl Into<Name>) -> Function {
        let mut clone = self.clone();
        clone.name = name.into();
        for (i, ty) in self.sig.params.iter().enumerate() {
            clone
                .body
                .replace_all_uses(&Value::Arg(i as u32), &Value::Undef(ty.clone()));
        }
        clone
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    pub entry: BlockId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: Name,
    pub insts: Vec<InstId>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq, From)]
pub enum InstKind {
    /// Stack slot of the given type; result is a pointer to it.
    Alloca { ty: Ty },
    Load { addr: Value },
    Store { value: Value, addr: Value },
    /// Address of field `field` of the record `struct_ty` at `base`.
    FieldAddr {
        base: Value,
        struct_ty: Ty,
        field: u32,
    },
    /// Reinterpret `value` at the instruction's result type.
    Bitcast { value: Value },
    Eq { lhs: Value, rhs: Value },
    /// Signed less-than.
    Lt { lhs: Value, rhs: Value },
    Call { callee: Value, args: Vec<Value> },
    #[from]
    Coro(CoroInst),
    LandingPad { cleanup: bool },
    CleanupPad,
    LifetimeStart { ptr: Value },
    LifetimeEnd { ptr: Value },
    /// Tombstone left behind by `erase_inst`.
    Nop,
}

/// Coroutine protocol markers. Operand layout is fixed per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CoroInst {
    Begin {
        mem: Value,
        alloc: Value,
        align: Value,
        promise: Value,
        info: Value,
    },
    Alloc,
    Free { frame: Value },
    Save { is_final: bool },
    Suspend { save: Value },
    Size,
    Frame,
    End { unwind: bool },
    Return { frame: Value },
    SubFn { frame: Value, index: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Return(Option<Value>),
    Br(BlockId),
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    /// Propagate an in-flight exception out of the function.
    Resume(Value),
    CleanupRet {
        pad: Value,
        unwind: Option<BlockId>,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Return(_) | Terminator::Resume(_) | Terminator::Unreachable => Vec::new(),
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminator::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, bb)| *bb));
                out
            }
            Terminator::CleanupRet { unwind, .. } => unwind.iter().copied().collect(),
        }
    }

    pub fn for_each_value(&self, f: &mut impl FnMut(&Value)) {
        match self {
            Terminator::Return(Some(v)) => f(v),
            Terminator::Return(None) | Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
            Terminator::Resume(v) => f(v),
            Terminator::CleanupRet { pad, .. } => f(pad),
        }
    }

    pub fn for_each_value_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        match self {
            Terminator::Return(Some(v)) => f(v),
            Terminator::Return(None) | Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
            Terminator::Resume(v) => f(v),
            Terminator::CleanupRet { pad, .. } => f(pad),
        }
    }
}

#[derive(Debug, Clone, PartialEq, From)]
pub enum Value {
    Inst(InstId),
    Arg(u32),
    #[from]
    Const(Constant),
    Function(Name),
    Global(Name),
    Null(Ty),
    Undef(Ty),
}

impl Value {
    pub fn int(value: i64, ty: Ty) -> Value {
        Value::Const(Constant::Int(value, ty))
    }

    pub fn token_none() -> Value {
        Value::Const(Constant::TokenNone)
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Value::Const(Constant::Int(v, _)) => Some(*v),
            Value::Const(Constant::Bool(b)) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64, Ty),
    Bool(bool),
    TokenNone,
    FunctionRef(Name),
    Array(Vec<Constant>, Ty),
    Struct(Vec<Constant>, Ty),
}

impl InstKind {
    pub fn for_each_value(&self, f: &mut impl FnMut(&Value)) {
        match self {
            InstKind::Alloca { .. }
            | InstKind::LandingPad { .. }
            | InstKind::CleanupPad
            | InstKind::Nop => {}
            InstKind::Load { addr } => f(addr),
            InstKind::Store { value, addr } => {
                f(value);
                f(addr);
            }
            InstKind::FieldAddr { base, .. } => f(base),
            InstKind::Bitcast { value } => f(value),
            InstKind::Eq { lhs, rhs } | InstKind::Lt { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Call { callee, args } => {
                f(callee);
                for arg in args {
                    f(arg);
                }
            }
            InstKind::Coro(coro) => coro.for_each_value(f),
            InstKind::LifetimeStart { ptr } | InstKind::LifetimeEnd { ptr } => f(ptr),
        }
    }

    pub fn for_each_value_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        match self {
            InstKind::Alloca { .. }
            | InstKind::LandingPad { .. }
            | InstKind::CleanupPad
            | InstKind::Nop => {}
            InstKind::Load { addr } => f(addr),
            InstKind::Store { value, addr } => {
                f(value);
                f(addr);
            }
            InstKind::FieldAddr { base, .. } => f(base),
            InstKind::Bitcast { value } => f(value),
            InstKind::Eq { lhs, rhs } | InstKind::Lt { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Call { callee, args } => {
                f(callee);
                for arg in args {
                    f(arg);
                }
            }
            InstKind::Coro(coro) => coro.for_each_value_mut(f),
            InstKind::LifetimeStart { ptr } | InstKind::LifetimeEnd { ptr } => f(ptr),
        }
    }
}

impl CoroInst {
    pub fn for_each_value(&self, f: &mut impl FnMut(&Value)) {
        match self {
            CoroInst::Begin {
                mem,
                alloc,
                align,
                promise,
                info,
            } => {
                f(mem);
                f(alloc);
                f(align);
                f(promise);
                f(info);
            }
            CoroInst::Alloc | CoroInst::Size | CoroInst::Frame | CoroInst::End { .. } => {}
            CoroInst::Free { frame } | CoroInst::Return { frame } => f(frame),
            CoroInst::Save { .. } => {}
            CoroInst::Suspend { save } => f(save),
            CoroInst::SubFn { frame, index } => {
                f(frame);
                f(index);
            }
        }
    }

    pub fn for_each_value_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        match self {
            CoroInst::Begin {
                mem,
                alloc,
                align,
                promise,
                info,
            } => {
                f(mem);
                f(alloc);
                f(align);
                f(promise);
                f(info);
            }
            CoroInst::Alloc | CoroInst::Size | CoroInst::Frame | CoroInst::End { .. } => {}
            CoroInst::Free { frame } | CoroInst::Return { frame } => f(frame),
            CoroInst::Save { .. } => {}
            CoroInst::Suspend { save } => f(save),
            CoroInst::SubFn { frame, index } => {
                f(frame);
                f(index);
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::new()
    }
}

impl Body {
    pub fn new() -> Self {
        Body {
            blocks: vec![Block {
                name: Name::new("entry"),
                insts: Vec::new(),
                terminator: Terminator::Unreachable,
            }],
            insts: Vec::new(),
            entry: 0,
        }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id as usize]
    }

    pub fn new_block(&mut self, name: impl Into<Name>) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block {
            name: name.into(),
            insts: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    fn alloc_inst(&mut self, kind: InstKind, ty: Ty) -> InstId {
        let id = self.insts.len() as InstId;
        self.insts.push(Inst { kind, ty });
        id
    }

    /// Append an instruction at the end of `block`.
    pub fn push_inst(&mut self, block: BlockId, kind: impl Into<InstKind>, ty: Ty) -> InstId {
        let id = self.alloc_inst(kind.into(), ty);
        self.block_mut(block).insts.push(id);
        id
    }

    /// Insert an instruction at position `index` of `block`.
    pub fn insert_inst(
        &mut self,
        block: BlockId,
        index: usize,
        kind: impl Into<InstKind>,
        ty: Ty,
    ) -> InstId {
        let id = self.alloc_inst(kind.into(), ty);
        self.block_mut(block).insts.insert(index, id);
        id
    }

    /// Position of `inst` within `block`, if it is attached there.
    pub fn position(&self, block: BlockId, inst: InstId) -> Option<usize> {
        self.block(block).insts.iter().position(|&i| i == inst)
    }

    /// Block currently holding `inst`. Erased instructions have none.
    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.insts.contains(&inst))
            .map(|(i, _)| i as BlockId)
    }

    /// Insert a new instruction immediately before an attached one.
    pub fn insert_before(
        &mut self,
        before: InstId,
        kind: impl Into<InstKind>,
        ty: Ty,
    ) -> Option<InstId> {
        let block = self.block_of(before)?;
        let index = self.position(block, before)?;
        Some(self.insert_inst(block, index, kind, ty))
    }

    /// Insert a new instruction immediately after an attached one.
    pub fn insert_after(
        &mut self,
        after: InstId,
        kind: impl Into<InstKind>,
        ty: Ty,
    ) -> Option<InstId> {
        let block = self.block_of(after)?;
        let index = self.position(block, after)?;
        Some(self.insert_inst(block, index + 1, kind, ty))
    }

    /// Detach `inst` from its block and turn it into a `Nop` tombstone.
    /// The handle stays valid but the instruction no longer executes.
    pub fn erase_inst(&mut self, inst: InstId) {
        if let Some(block) = self.block_of(inst) {
            self.block_mut(block).insts.retain(|&i| i != inst);
        }
        let slot = self.inst_mut(inst);
        slot.kind = InstKind::Nop;
        slot.ty = Ty::Void;
    }

    /// Substitute every operand equal to `from` with `to`, across all
    /// instructions and terminators.
    pub fn replace_all_uses(&mut self, from: &Value, to: &Value) {
        for inst in &mut self.insts {
            inst.kind.for_each_value_mut(&mut |v| {
                if v == from {
                    *v = to.clone();
                }
            });
        }
        for block in &mut self.blocks {
            block.terminator.for_each_value_mut(&mut |v| {
                if v == from {
                    *v = to.clone();
                }
            });
        }
    }

    /// The atomic replace-then-erase operation: all uses of `inst` become
    /// `value`, then the instruction is erased.
    pub fn replace_inst_with_value(&mut self, inst: InstId, value: &Value) {
        self.replace_all_uses(&Value::Inst(inst), value);
        self.erase_inst(inst);
    }

    /// Replace `inst` in place with a fresh instruction occupying the same
    /// position; uses of the old instruction are redirected to the new one.
    pub fn replace_inst_with(
        &mut self,
        inst: InstId,
        kind: impl Into<InstKind>,
        ty: Ty,
    ) -> Option<InstId> {
        let block = self.block_of(inst)?;
        let index = self.position(block, inst)?;
        let new = self.insert_inst(block, index, kind, ty);
        self.replace_all_uses(&Value::Inst(inst), &Value::Inst(new));
        self.erase_inst(inst);
        Some(new)
    }

    /// Split `block` at instruction position `at`: the new block receives
    /// the instructions from `at` on plus the old terminator, and `block`
    /// is re-terminated with a jump to it.
    pub fn split_block(&mut self, block: BlockId, at: usize, name: impl Into<Name>) -> BlockId {
        let new = self.new_block(name);
        let moved: Vec<InstId> = self.block_mut(block).insts.split_off(at);
        let old_term = std::mem::replace(&mut self.block_mut(block).terminator, Terminator::Br(new));
        let new_block = self.block_mut(new);
        new_block.insts = moved;
        new_block.terminator = old_term;
        new
    }

    /// Live (attached) instruction ids of `block`, in order.
    pub fn block_insts(&self, block: BlockId) -> Vec<InstId> {
        self.block(block).insts.clone()
    }

    /// All block ids, in arena order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        0..self.blocks.len() as BlockId
    }
}
