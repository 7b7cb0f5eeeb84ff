//! Human-readable listing of IR modules, for logs and test failures.

use std::fmt::{self, Display, Formatter};

use super::{
    Block, Body, CallingConvention, Constant, CoroInst, Function, Global, InstKind, Linkage,
    Module, Terminator, Ty, Value,
};

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            write_global(global, f)?;
        }
        if !self.globals.is_empty() {
            writeln!(f)?;
        }
        for (idx, func) in self.functions.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

fn write_global(global: &Global, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "@{}: {} [{}]",
        global.name,
        format_ty(&global.ty),
        format_linkage(global.linkage)
    )?;
    if global.is_constant {
        write!(f, " const")?;
    }
    if let Some(init) = &global.initializer {
        write!(f, " = {}", format_constant(init))?;
    }
    writeln!(f)
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let params = self
            .sig
            .params
            .iter()
            .map(format_ty)
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            f,
            "fn @{}({}) -> {} [{}, {}] {{",
            self.name,
            params,
            format_ty(&self.sig.return_type),
            format_linkage(self.linkage),
            match self.calling_convention {
                CallingConvention::C => "cc C",
                CallingConvention::Fast => "cc fast",
            }
        )?;
        write_block(&self.body, self.body.entry, f)?;
        for bb in self.body.block_ids() {
            if bb != self.body.entry {
                write_block(&self.body, bb, f)?;
            }
        }
        writeln!(f, "}}")
    }
}

fn write_block(body: &Body, bb: u32, f: &mut Formatter<'_>) -> fmt::Result {
    let block: &Block = body.block(bb);
    writeln!(f, "bb{} {}:", bb, block.name)?;
    for &id in &block.insts {
        let inst = body.inst(id);
        if inst.ty.is_void() {
            writeln!(f, "  {}", format_inst(&inst.kind))?;
        } else {
            writeln!(
                f,
                "  %{} = {} : {}",
                id,
                format_inst(&inst.kind),
                format_ty(&inst.ty)
            )?;
        }
    }
    writeln!(f, "  {}", format_terminator(&block.terminator))
}

fn format_inst(kind: &InstKind) -> String {
    match kind {
        InstKind::Alloca { ty } => format!("alloca {}", format_ty(ty)),
        InstKind::Load { addr } => format!("load {}", format_value(addr)),
        InstKind::Store { value, addr } => {
            format!("store {}, {}", format_value(value), format_value(addr))
        }
        InstKind::FieldAddr { base, field, .. } => {
            format!("field.addr {}, {}", format_value(base), field)
        }
        InstKind::Bitcast { value } => format!("bitcast {}", format_value(value)),
        InstKind::Eq { lhs, rhs } => format!("eq {}, {}", format_value(lhs), format_value(rhs)),
        InstKind::Lt { lhs, rhs } => format!("lt {}, {}", format_value(lhs), format_value(rhs)),
        InstKind::Call { callee, args } => format!(
            "call {}({})",
            format_value(callee),
            args.iter().map(format_value).collect::<Vec<_>>().join(", ")
        ),
        InstKind::Coro(coro) => format_coro(coro),
        InstKind::LandingPad { cleanup } => format!("landing.pad cleanup={}", cleanup),
        InstKind::CleanupPad => "cleanup.pad".to_string(),
        InstKind::LifetimeStart { ptr } => format!("lifetime.start {}", format_value(ptr)),
        InstKind::LifetimeEnd { ptr } => format!("lifetime.end {}", format_value(ptr)),
        InstKind::Nop => "nop".to_string(),
    }
}

fn format_coro(coro: &CoroInst) -> String {
    match coro {
        CoroInst::Begin {
            mem,
            alloc,
            align,
            promise,
            info,
        } => format!(
            "coro.begin {}, {}, {}, {}, {}",
            format_value(mem),
            format_value(alloc),
            format_value(align),
            format_value(promise),
            format_value(info)
        ),
        CoroInst::Alloc => "coro.alloc".to_string(),
        CoroInst::Free { frame } => format!("coro.free {}", format_value(frame)),
        CoroInst::Save { is_final } => format!("coro.save final={}", is_final),
        CoroInst::Suspend { save } => format!("coro.suspend {}", format_value(save)),
        CoroInst::Size => "coro.size".to_string(),
        CoroInst::Frame => "coro.frame".to_string(),
        CoroInst::End { unwind } => format!("coro.end unwind={}", unwind),
        CoroInst::Return { frame } => format!("coro.return {}", format_value(frame)),
        CoroInst::SubFn { frame, index } => {
            format!("coro.subfn {}, {}", format_value(frame), format_value(index))
        }
    }
}

fn format_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Return(None) => "ret".to_string(),
        Terminator::Return(Some(v)) => format!("ret {}", format_value(v)),
        Terminator::Br(bb) => format!("br bb{}", bb),
        Terminator::CondBr {
            cond,
            if_true,
            if_false,
        } => format!("condbr {}, bb{}, bb{}", format_value(cond), if_true, if_false),
        Terminator::Switch {
            value,
            default,
            cases,
        } => {
            let cases = cases
                .iter()
                .map(|(k, bb)| format!("{} => bb{}", k, bb))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "switch {}, default bb{} [{}]",
                format_value(value),
                default,
                cases
            )
        }
        Terminator::Resume(v) => format!("resume {}", format_value(v)),
        Terminator::CleanupRet { pad, unwind } => match unwind {
            Some(bb) => format!("cleanup.ret {}, bb{}", format_value(pad), bb),
            None => format!("cleanup.ret {}", format_value(pad)),
        },
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Inst(id) => format!("%{}", id),
        Value::Arg(i) => format!("arg{}", i),
        Value::Const(c) => format_constant(c),
        Value::Function(name) => format!("@{}", name),
        Value::Global(name) => format!("@{}", name),
        Value::Null(_) => "null".to_string(),
        Value::Undef(_) => "undef".to_string(),
    }
}

fn format_constant(c: &Constant) -> String {
    match c {
        Constant::Int(v, ty) => format!("{} {}", format_ty(ty), v),
        Constant::Bool(b) => b.to_string(),
        Constant::TokenNone => "token.none".to_string(),
        Constant::FunctionRef(name) => format!("@{}", name),
        Constant::Array(elems, _) => format!(
            "[{}]",
            elems.iter().map(format_constant).collect::<Vec<_>>().join(", ")
        ),
        Constant::Struct(elems, _) => format!(
            "{{{}}}",
            elems.iter().map(format_constant).collect::<Vec<_>>().join(", ")
        ),
    }
}

fn format_linkage(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "external",
        Linkage::Internal => "internal",
        Linkage::Private => "private",
    }
}

fn format_ty(ty: &Ty) -> String {
    match ty {
        Ty::I1 => "i1".to_string(),
        Ty::I8 => "i8".to_string(),
        Ty::I16 => "i16".to_string(),
        Ty::I32 => "i32".to_string(),
        Ty::I64 => "i64".to_string(),
        Ty::F32 => "f32".to_string(),
        Ty::F64 => "f64".to_string(),
        Ty::Ptr(inner) => format!("ptr {}", format_ty(inner)),
        Ty::Array(elem, len) => format!("[{} x {}]", len, format_ty(elem)),
        Ty::Struct { name, fields, .. } => match name {
            Some(name) => format!("%{}", name),
            None => format!(
                "{{{}}}",
                fields.iter().map(format_ty).collect::<Vec<_>>().join(", ")
            ),
        },
        Ty::Function {
            return_type,
            param_types,
            ..
        } => format!(
            "fn({}) -> {}",
            param_types.iter().map(format_ty).collect::<Vec<_>>().join(", "),
            format_ty(return_type)
        ),
        Ty::Void => "void".to_string(),
        Ty::Token => "token".to_string(),
    }
}
