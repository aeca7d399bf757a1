//! Wasm backend: lowers typed HIR to a binary module with GC struct and
//! array heap types.
//!
//! The generator owns one builder per module section plus three caches:
//! function indices by top-level name, heap-type indices keyed by nominal
//! type identity (each distinct struct/array type is declared exactly once,
//! not once per use site), and a bump-allocated linear-memory layout for
//! string literal bytes and intrinsic scratch blocks. `fd_write` and
//! `proc_exit` are imported WASI-style; `print`, `exit` and `length` lower
//! directly to them (or to `array.len`) instead of through normal calls.
//!
//! Code generation assumes a clean, fully resolved tree. Inputs that break
//! that precondition fail fatally; this stage is not a second type checker.

use std::collections::HashMap;
use std::rc::Rc;

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind,
    ExportSection, FieldType, Function, FunctionSection, GlobalSection, GlobalType, HeapType,
    ImportSection, Instruction, MemorySection, MemoryType, Module, RefType, StartSection,
    StorageType, TypeSection, ValType,
};

use crate::ast::{BinOp, UnaryOp};
use crate::error::CoreError;
use crate::hir;
use crate::span::{FileId, SourceMap, Span};
use crate::types::{ArrayType, NominalId, Primitive, StructType, Type};

const PAGE_SIZE: u32 = 65536;
const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Walks a resolved program and emits the binary module.
pub struct CodeGenerator<'a> {
    files: &'a SourceMap,
    debug: bool,

    types: TypeSection,
    imports: ImportSection,
    functions: FunctionSection,
    memory: MemorySection,
    globals: GlobalSection,
    exports: ExportSection,
    code: CodeSection,
    start: Option<u32>,

    func_indices: HashMap<String, u32>,
    func_count: u32,
    fd_write: u32,
    proc_exit: u32,

    heap_types: HashMap<NominalId, u32>,
    global_indices: HashMap<String, u32>,
    global_count: u32,
    segments: MemoryLayout,
    debug_locs: Vec<DebugLoc>,
}

/// Linear-memory bump allocator: monotonically increasing, 4-byte aligned
/// offsets, one data segment per allocation.
#[derive(Debug, Default)]
struct MemoryLayout {
    next: u32,
    segments: Vec<(u32, Vec<u8>)>,
}

impl MemoryLayout {
    fn alloc(&mut self, bytes: Vec<u8>) -> u32 {
        let offset = self.next;
        let len = bytes.len() as u32;
        self.segments.push((offset, bytes));
        self.next += (len + 3) & !3;
        offset
    }
}

#[derive(Debug)]
struct DebugLoc {
    function: String,
    instruction: u32,
    file: FileId,
    line: u32,
    column: u32,
}

/// A function body under construction, counting emitted instructions so
/// debug records can reference an instruction handle.
struct FuncBuilder {
    func: Function,
    name: String,
    count: u32,
}

impl FuncBuilder {
    fn new(name: impl Into<String>, locals: Vec<(u32, ValType)>) -> FuncBuilder {
        FuncBuilder {
            func: Function::new(locals),
            name: name.into(),
            count: 0,
        }
    }

    fn ins(&mut self, instruction: &Instruction) -> &mut Self {
        self.func.instruction(instruction);
        self.count += 1;
        self
    }
}

struct FnEnv {
    param_count: u32,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(files: &'a SourceMap, debug: bool) -> CodeGenerator<'a> {
        CodeGenerator {
            files,
            debug,
            types: TypeSection::new(),
            imports: ImportSection::new(),
            functions: FunctionSection::new(),
            memory: MemorySection::new(),
            globals: GlobalSection::new(),
            exports: ExportSection::new(),
            code: CodeSection::new(),
            start: None,
            func_indices: HashMap::new(),
            func_count: 0,
            fd_write: 0,
            proc_exit: 0,
            heap_types: HashMap::new(),
            global_indices: HashMap::new(),
            global_count: 0,
            segments: MemoryLayout::default(),
            debug_locs: Vec::new(),
        }
    }

    /// Emit the module. The entry binding `main` must return `u32` (start
    /// wrapper forwards its result to `proc_exit`) or `void` (started
    /// directly); anything else fails before any section is assembled.
    pub fn emit(mut self, program: &hir::Program) -> Result<Vec<u8>, CoreError> {
        let main_ret = self.entry_return_type(program)?;

        self.declare_host_imports();

        // pass 1: function indices and types, so bodies can call forward
        for stmt in &program.statements {
            if let hir::StmtKind::Function(func) = &stmt.kind {
                // resolve value types first: they may register heap types,
                // which claim type-section slots of their own
                let params: Vec<ValType> = func
                    .params
                    .iter()
                    .map(|p| self.val_type(&p.ty))
                    .collect::<Result<_, _>>()?;
                let results = self.result_types(&func.ret)?;
                let type_index = self.types.len();
                self.types.ty().function(params, results);
                self.functions.function(type_index);
                self.func_indices.insert(func.name.clone(), self.func_count);
                self.func_count += 1;
            }
        }

        // globals: constant initializers go into the global section,
        // everything else is zeroed here and assigned in the start wrapper
        let mut runtime_inits: Vec<(u32, hir::Expr)> = Vec::new();
        for stmt in &program.statements {
            if let hir::StmtKind::Global(global) = &stmt.kind {
                let index = self.declare_global(global, &mut runtime_inits)?;
                self.global_indices.insert(global.name.clone(), index);
            }
        }

        // pass 2: bodies
        for stmt in &program.statements {
            if let hir::StmtKind::Function(func) = &stmt.kind {
                self.emit_function(func)?;
            }
        }

        self.install_start(main_ret, runtime_inits)?;

        let pages = (u64::from(self.segments.next) + u64::from(PAGE_SIZE) - 1)
            / u64::from(PAGE_SIZE);
        self.memory.memory(MemoryType {
            minimum: pages.max(1),
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        self.exports.export("memory", ExportKind::Memory, 0);

        Ok(self.finish())
    }

    fn entry_return_type(&self, program: &hir::Program) -> Result<Primitive, CoreError> {
        let main = program.statements.iter().find_map(|stmt| match &stmt.kind {
            hir::StmtKind::Function(func) if func.name == "main" => Some(func),
            _ => None,
        });
        let Some(main) = main else {
            return Err(CoreError::MissingEntry("main".to_string()));
        };
        if !main.params.is_empty() {
            return Err(CoreError::BadEntry {
                name: "main".to_string(),
                found: format!("a function with {} parameter(s)", main.params.len()),
            });
        }
        match main.ret.as_primitive() {
            Some(Primitive::U32) => Ok(Primitive::U32),
            Some(Primitive::Void) => Ok(Primitive::Void),
            _ => Err(CoreError::BadEntry {
                name: "main".to_string(),
                found: main.ret.to_string(),
            }),
        }
    }

    fn declare_host_imports(&mut self) {
        // fd_write: (fd, iovec_ptr, iovec_len, nwritten_ptr) -> errno
        let fd_write_ty = self.types.len();
        self.types.ty().function(
            vec![ValType::I32, ValType::I32, ValType::I32, ValType::I32],
            vec![ValType::I32],
        );
        self.imports
            .import(WASI_MODULE, "fd_write", EntityType::Function(fd_write_ty));
        self.fd_write = self.func_count;
        self.func_count += 1;

        // proc_exit: (code) -> ()
        let proc_exit_ty = self.types.len();
        self.types.ty().function(vec![ValType::I32], vec![]);
        self.imports
            .import(WASI_MODULE, "proc_exit", EntityType::Function(proc_exit_ty));
        self.proc_exit = self.func_count;
        self.func_count += 1;
    }

    fn declare_global(
        &mut self,
        global: &hir::GlobalLet,
        runtime_inits: &mut Vec<(u32, hir::Expr)>,
    ) -> Result<u32, CoreError> {
        let val_type = self.val_type(&global.ty)?;
        let init = match (&global.init.kind, &global.ty) {
            (hir::ExprKind::Int(v), ty) => match ty.as_primitive() {
                Some(Primitive::U64) => ConstExpr::i64_const(*v as i64),
                Some(p) if p.is_float() => float_const_expr(p, *v as f64),
                _ => ConstExpr::i32_const(*v as u32 as i32),
            },
            (hir::ExprKind::Float(v), ty) => {
                let p = ty.as_primitive().unwrap_or(Primitive::F64);
                float_const_expr(p, *v)
            }
            (hir::ExprKind::Bool(b), _) => ConstExpr::i32_const(i32::from(*b)),
            (hir::ExprKind::Str(s), _) => {
                let offset = self.segments.alloc(s.clone().into_bytes());
                ConstExpr::i32_const(offset as i32)
            }
            _ => {
                runtime_inits.push((self.global_count, global.init.clone()));
                self.zero_const(&global.ty)?
            }
        };
        self.globals.global(
            GlobalType {
                val_type,
                mutable: true,
                shared: false,
            },
            &init,
        );
        let index = self.global_count;
        self.global_count += 1;
        Ok(index)
    }

    fn zero_const(&mut self, ty: &Type) -> Result<ConstExpr, CoreError> {
        Ok(match ty {
            Type::Primitive(Primitive::U64) => ConstExpr::i64_const(0),
            Type::Primitive(Primitive::F32) => ConstExpr::f32_const(0.0f32.into()),
            Type::Primitive(Primitive::F64) => ConstExpr::f64_const(0.0f64.into()),
            Type::Primitive(_) => ConstExpr::i32_const(0),
            Type::Struct(s) => {
                let idx = self.heap_struct(s)?;
                ConstExpr::ref_null(HeapType::Concrete(idx))
            }
            Type::Array(a) => {
                let idx = self.heap_array(a)?;
                ConstExpr::ref_null(HeapType::Concrete(idx))
            }
            other => {
                return Err(CoreError::Codegen(format!(
                    "global of type {other} has no zero value"
                )));
            }
        })
    }

    fn emit_function(&mut self, func: &hir::FunctionDecl) -> Result<(), CoreError> {
        let locals: Vec<(u32, ValType)> = func
            .locals
            .iter()
            .map(|ty| Ok((1, self.val_type(ty)?)))
            .collect::<Result<_, CoreError>>()?;
        let mut builder = FuncBuilder::new(&func.name, locals);
        let env = FnEnv {
            param_count: func.params.len() as u32,
        };
        for stmt in &func.body.statements {
            self.gen_stmt(&mut builder, &env, stmt)?;
        }
        if !func.ret.is_void() {
            // fall-through of a value-returning function traps; every
            // well-behaved body returned before this point
            builder.ins(&Instruction::Unreachable);
        }
        builder.ins(&Instruction::End);
        self.code.function(&builder.func);
        Ok(())
    }

    /// Synthesize and install the module's start function. A wrapper is
    /// emitted when `main` returns u32 (its result is forwarded to
    /// `proc_exit`) or when globals need runtime initialization; a void
    /// `main` with no such globals starts directly.
    fn install_start(
        &mut self,
        main_ret: Primitive,
        runtime_inits: Vec<(u32, hir::Expr)>,
    ) -> Result<(), CoreError> {
        let main_index = *self
            .func_indices
            .get("main")
            .expect("entry presence was checked before emission");
        self.exports.export("main", ExportKind::Func, main_index);

        let start_index = if main_ret == Primitive::U32 || !runtime_inits.is_empty() {
            let type_index = self.types.len();
            self.types.ty().function(vec![], vec![]);
            self.functions.function(type_index);
            let wrapper_index = self.func_count;
            self.func_count += 1;

            let mut builder = FuncBuilder::new("_start", Vec::new());
            let env = FnEnv { param_count: 0 };
            for (global_index, init) in &runtime_inits {
                self.gen_expr(&mut builder, &env, init)?;
                builder.ins(&Instruction::GlobalSet(*global_index));
            }
            builder.ins(&Instruction::Call(main_index));
            if main_ret == Primitive::U32 {
                builder.ins(&Instruction::Call(self.proc_exit));
            }
            builder.ins(&Instruction::End);
            self.code.function(&builder.func);
            wrapper_index
        } else {
            main_index
        };

        self.start = Some(start_index);
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let mut module = Module::new();
        module.section(&self.types);
        module.section(&self.imports);
        module.section(&self.functions);
        module.section(&self.memory);
        module.section(&self.globals);
        module.section(&self.exports);
        if let Some(function_index) = self.start {
            module.section(&StartSection { function_index });
        }
        module.section(&self.code);

        let mut data = DataSection::new();
        for (offset, bytes) in &self.segments.segments {
            data.active(
                0,
                &ConstExpr::i32_const(*offset as i32),
                bytes.iter().copied(),
            );
        }
        module.section(&data);

        if self.debug && !self.debug_locs.is_empty() {
            let payload = encode_debug_section(self.files, &self.debug_locs);
            module.section(&CustomSection {
                name: "vader.debug".into(),
                data: payload.into(),
            });
        }

        module.finish()
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn gen_stmt(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        stmt: &hir::Stmt,
    ) -> Result<(), CoreError> {
        self.record_debug(builder, stmt.span);
        match &stmt.kind {
            hir::StmtKind::Local(local) => {
                self.gen_expr(builder, env, &local.init)?;
                builder.ins(&Instruction::LocalSet(env.param_count + local.index));
                Ok(())
            }
            hir::StmtKind::Assign(assign) => self.gen_assign(builder, env, assign),
            hir::StmtKind::Expr(expr) => {
                self.gen_expr(builder, env, expr)?;
                if !expr.ty.is_void() {
                    builder.ins(&Instruction::Drop);
                }
                Ok(())
            }
            hir::StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.gen_expr(builder, env, value)?;
                }
                builder.ins(&Instruction::Return);
                Ok(())
            }
            hir::StmtKind::For(for_stmt) => {
                self.gen_stmt(builder, env, &for_stmt.init)?;
                builder.ins(&Instruction::Block(BlockType::Empty));
                builder.ins(&Instruction::Loop(BlockType::Empty));
                self.gen_expr(builder, env, &for_stmt.condition)?;
                builder.ins(&Instruction::I32Eqz);
                builder.ins(&Instruction::BrIf(1));
                self.gen_block(builder, env, &for_stmt.body, false)?;
                self.gen_stmt(builder, env, &for_stmt.step)?;
                builder.ins(&Instruction::Br(0));
                builder.ins(&Instruction::End);
                builder.ins(&Instruction::End);
                Ok(())
            }
            hir::StmtKind::Global(_) | hir::StmtKind::Function(_) => Err(CoreError::Codegen(
                "top-level declaration nested inside a function body".to_string(),
            )),
        }
    }

    /// Emit statements of a block; when `want_value` the trailing
    /// value-producing expression statement is left on the stack.
    fn gen_block(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        block: &hir::Block,
        want_value: bool,
    ) -> Result<(), CoreError> {
        let last = block.statements.len().saturating_sub(1);
        for (i, stmt) in block.statements.iter().enumerate() {
            if want_value && i == last {
                if let hir::StmtKind::Expr(expr) = &stmt.kind {
                    if !expr.ty.is_void() {
                        self.record_debug(builder, stmt.span);
                        self.gen_expr(builder, env, expr)?;
                        continue;
                    }
                }
            }
            self.gen_stmt(builder, env, stmt)?;
        }
        Ok(())
    }

    /// Struct-field and array-element mutation is an in-place set against
    /// the heap value; plain variables use local/global sets.
    fn gen_assign(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        assign: &hir::Assign,
    ) -> Result<(), CoreError> {
        let place = &assign.place;
        if place.props.is_empty() {
            self.gen_expr(builder, env, &assign.value)?;
            match &place.base.kind {
                hir::ExprKind::Local { index } => {
                    builder.ins(&Instruction::LocalSet(env.param_count + index));
                }
                hir::ExprKind::Param { index } => {
                    builder.ins(&Instruction::LocalSet(*index));
                }
                hir::ExprKind::Global { name } => {
                    let index = self.global_index(name)?;
                    builder.ins(&Instruction::GlobalSet(index));
                }
                _ => {
                    return Err(CoreError::Codegen(
                        "assignment to a non-variable place".to_string(),
                    ));
                }
            }
            return Ok(());
        }

        self.gen_expr(builder, env, &place.base)?;
        let (last, walk) = place.props.split_last().expect("props checked non-empty");
        for prop in walk {
            self.gen_prop_read(builder, env, prop)?;
        }
        match last {
            hir::Prop::Field { owner, index, .. } => {
                let struct_type_index = self.heap_struct(owner)?;
                self.gen_expr(builder, env, &assign.value)?;
                builder.ins(&Instruction::StructSet {
                    struct_type_index,
                    field_index: *index,
                });
            }
            hir::Prop::Index { owner, index, .. } => {
                let array_type_index = self.heap_array(owner)?;
                self.gen_index_operand(builder, env, index)?;
                self.gen_expr(builder, env, &assign.value)?;
                builder.ins(&Instruction::ArraySet(array_type_index));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn gen_expr(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        expr: &hir::Expr,
    ) -> Result<(), CoreError> {
        match &expr.kind {
            hir::ExprKind::Int(value) => {
                match expr.ty.as_primitive() {
                    Some(Primitive::U64) => builder.ins(&Instruction::I64Const(*value as i64)),
                    Some(Primitive::F32) => {
                        builder.ins(&Instruction::F32Const((*value as f32).into()))
                    }
                    Some(Primitive::F64) => {
                        builder.ins(&Instruction::F64Const((*value as f64).into()))
                    }
                    _ => builder.ins(&Instruction::I32Const(*value as u32 as i32)),
                };
                Ok(())
            }
            hir::ExprKind::Float(value) => {
                match expr.ty.as_primitive() {
                    Some(Primitive::F32) => {
                        builder.ins(&Instruction::F32Const((*value as f32).into()))
                    }
                    _ => builder.ins(&Instruction::F64Const((*value).into())),
                };
                Ok(())
            }
            hir::ExprKind::Bool(value) => {
                builder.ins(&Instruction::I32Const(i32::from(*value)));
                Ok(())
            }
            hir::ExprKind::Str(text) => {
                let offset = self.segments.alloc(text.clone().into_bytes());
                builder.ins(&Instruction::I32Const(offset as i32));
                Ok(())
            }
            hir::ExprKind::Local { index } => {
                builder.ins(&Instruction::LocalGet(env.param_count + index));
                Ok(())
            }
            hir::ExprKind::Param { index } => {
                builder.ins(&Instruction::LocalGet(*index));
                Ok(())
            }
            hir::ExprKind::Global { name } => {
                let index = self.global_index(name)?;
                builder.ins(&Instruction::GlobalGet(index));
                Ok(())
            }
            hir::ExprKind::Unary { op, operand } => self.gen_unary(builder, env, *op, operand),
            hir::ExprKind::Binary { op, lhs, rhs } => {
                self.gen_expr(builder, env, lhs)?;
                self.gen_expr(builder, env, rhs)?;
                let prim = lhs.ty.as_primitive().ok_or_else(|| {
                    CoreError::MissingLowering {
                        op: op.symbol().to_string(),
                        ty: lhs.ty.to_string(),
                    }
                })?;
                let instruction = binary_instruction(*op, prim).ok_or_else(|| {
                    CoreError::MissingLowering {
                        op: op.symbol().to_string(),
                        ty: lhs.ty.to_string(),
                    }
                })?;
                builder.ins(&instruction);
                Ok(())
            }
            hir::ExprKind::Call { target, args } => match target {
                hir::CallTarget::Function(name) => {
                    for arg in args {
                        self.gen_expr(builder, env, arg)?;
                    }
                    let index = *self.func_indices.get(name).ok_or_else(|| {
                        CoreError::Codegen(format!("call to unknown function '{name}'"))
                    })?;
                    builder.ins(&Instruction::Call(index));
                    Ok(())
                }
                hir::CallTarget::Intrinsic(name) => {
                    self.gen_intrinsic(builder, env, name, args, expr.span)
                }
            },
            hir::ExprKind::Access { base, props } => {
                self.gen_expr(builder, env, base)?;
                for prop in props {
                    self.gen_prop_read(builder, env, prop)?;
                }
                Ok(())
            }
            hir::ExprKind::StructNew { ty, fields } => {
                let type_index = self.heap_struct(ty)?;
                for field in fields {
                    self.gen_expr(builder, env, field)?;
                }
                builder.ins(&Instruction::StructNew(type_index));
                Ok(())
            }
            hir::ExprKind::ArrayNew { ty, items } => {
                let array_type_index = self.heap_array(ty)?;
                for item in items {
                    self.gen_expr(builder, env, item)?;
                }
                builder.ins(&Instruction::ArrayNewFixed {
                    array_type_index,
                    array_size: items.len() as u32,
                });
                Ok(())
            }
            hir::ExprKind::ArrayNewDefault { ty, len } => {
                self.gen_array_default(builder, ty, *len)
            }
            hir::ExprKind::If(if_expr) => {
                self.gen_expr(builder, env, &if_expr.condition)?;
                let block_type = if expr.ty.is_void() {
                    BlockType::Empty
                } else {
                    BlockType::Result(self.val_type(&expr.ty)?)
                };
                builder.ins(&Instruction::If(block_type));
                let want_value = !expr.ty.is_void();
                self.gen_block(builder, env, &if_expr.then_body, want_value)?;
                if let Some(else_body) = &if_expr.else_body {
                    builder.ins(&Instruction::Else);
                    self.gen_block(builder, env, else_body, want_value)?;
                }
                builder.ins(&Instruction::End);
                Ok(())
            }
            hir::ExprKind::Error => Err(CoreError::Codegen(
                "unresolved expression reached code generation".to_string(),
            )),
        }
    }

    fn gen_unary(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        op: UnaryOp,
        operand: &hir::Expr,
    ) -> Result<(), CoreError> {
        match op {
            UnaryOp::Not => {
                self.gen_expr(builder, env, operand)?;
                builder.ins(&Instruction::I32Eqz);
                Ok(())
            }
            UnaryOp::Neg => match operand.ty.as_primitive() {
                Some(Primitive::F32) => {
                    self.gen_expr(builder, env, operand)?;
                    builder.ins(&Instruction::F32Neg);
                    Ok(())
                }
                Some(Primitive::F64) => {
                    self.gen_expr(builder, env, operand)?;
                    builder.ins(&Instruction::F64Neg);
                    Ok(())
                }
                Some(Primitive::U64) => {
                    builder.ins(&Instruction::I64Const(0));
                    self.gen_expr(builder, env, operand)?;
                    builder.ins(&Instruction::I64Sub);
                    Ok(())
                }
                Some(p) if p.is_integer() => {
                    builder.ins(&Instruction::I32Const(0));
                    self.gen_expr(builder, env, operand)?;
                    builder.ins(&Instruction::I32Sub);
                    Ok(())
                }
                _ => Err(CoreError::MissingLowering {
                    op: "-".to_string(),
                    ty: operand.ty.to_string(),
                }),
            },
        }
    }

    /// Dot-expression reads thread the previous result as the receiver of
    /// the next get; narrow integer fields read with the extension picked
    /// by their declared signedness.
    fn gen_prop_read(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        prop: &hir::Prop,
    ) -> Result<(), CoreError> {
        match prop {
            hir::Prop::Field { owner, index, ty } => {
                let struct_type_index = self.heap_struct(owner)?;
                let field_index = *index;
                match narrow_signedness(ty) {
                    Some(true) => builder.ins(&Instruction::StructGetS {
                        struct_type_index,
                        field_index,
                    }),
                    Some(false) => builder.ins(&Instruction::StructGetU {
                        struct_type_index,
                        field_index,
                    }),
                    None => builder.ins(&Instruction::StructGet {
                        struct_type_index,
                        field_index,
                    }),
                };
                Ok(())
            }
            hir::Prop::Index { owner, index, ty } => {
                let array_type_index = self.heap_array(owner)?;
                self.gen_index_operand(builder, env, index)?;
                match narrow_signedness(ty) {
                    Some(true) => builder.ins(&Instruction::ArrayGetS(array_type_index)),
                    Some(false) => builder.ins(&Instruction::ArrayGetU(array_type_index)),
                    None => builder.ins(&Instruction::ArrayGet(array_type_index)),
                };
                Ok(())
            }
        }
    }

    fn gen_index_operand(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        index: &hir::Expr,
    ) -> Result<(), CoreError> {
        self.gen_expr(builder, env, index)?;
        if index.ty.as_primitive() == Some(Primitive::U64) {
            builder.ins(&Instruction::I32WrapI64);
        }
        Ok(())
    }

    fn gen_intrinsic(
        &mut self,
        builder: &mut FuncBuilder,
        env: &FnEnv,
        name: &str,
        args: &[hir::Expr],
        span: Span,
    ) -> Result<(), CoreError> {
        let builtin = crate::builtins::find_builtin(name)
            .ok_or_else(|| CoreError::UnknownIntrinsic(name.to_string()))?;
        match builtin.kind {
            crate::builtins::IntrinsicKind::Print => {
                let Some(arg) = args.first() else {
                    return Err(CoreError::Codegen("'print' call without argument".into()));
                };
                let hir::ExprKind::Str(text) = &arg.kind else {
                    return Err(CoreError::Codegen(format!(
                        "'print' lowers only string literals ({})",
                        self.files.display(span)
                    )));
                };
                // literal bytes, a one-entry iovec block, and a scratch
                // word for the written-byte count
                let text_offset = self.segments.alloc(text.clone().into_bytes());
                let mut iovec = Vec::with_capacity(8);
                iovec.extend_from_slice(&text_offset.to_le_bytes());
                iovec.extend_from_slice(&(text.len() as u32).to_le_bytes());
                let iovec_offset = self.segments.alloc(iovec);
                let nwritten_offset = self.segments.alloc(vec![0; 4]);

                builder.ins(&Instruction::I32Const(1)); // stdout
                builder.ins(&Instruction::I32Const(iovec_offset as i32));
                builder.ins(&Instruction::I32Const(1)); // one iovec entry
                builder.ins(&Instruction::I32Const(nwritten_offset as i32));
                builder.ins(&Instruction::Call(self.fd_write));
                builder.ins(&Instruction::Drop); // errno is discarded
                Ok(())
            }
            crate::builtins::IntrinsicKind::Exit => {
                for arg in args {
                    self.gen_expr(builder, env, arg)?;
                }
                builder.ins(&Instruction::Call(self.proc_exit));
                Ok(())
            }
            crate::builtins::IntrinsicKind::Length => {
                for arg in args {
                    self.gen_expr(builder, env, arg)?;
                }
                builder.ins(&Instruction::ArrayLen);
                Ok(())
            }
        }
    }

    fn gen_array_default(
        &mut self,
        builder: &mut FuncBuilder,
        ty: &Rc<ArrayType>,
        len: u64,
    ) -> Result<(), CoreError> {
        let array_type_index = self.heap_array(ty)?;
        match &ty.elem {
            // aggregate elements get a synthesized default value
            Type::Struct(_) | Type::Array(_) => {
                self.gen_default_value(builder, &ty.elem)?;
                builder.ins(&Instruction::I32Const(len as i32));
                builder.ins(&Instruction::ArrayNew(array_type_index));
            }
            _ => {
                builder.ins(&Instruction::I32Const(len as i32));
                builder.ins(&Instruction::ArrayNewDefault(array_type_index));
            }
        }
        Ok(())
    }

    /// Recursively synthesized zero/default value for a type.
    fn gen_default_value(
        &mut self,
        builder: &mut FuncBuilder,
        ty: &Type,
    ) -> Result<(), CoreError> {
        match ty {
            Type::Primitive(Primitive::U64) => {
                builder.ins(&Instruction::I64Const(0));
            }
            Type::Primitive(Primitive::F32) => {
                builder.ins(&Instruction::F32Const(0.0f32.into()));
            }
            Type::Primitive(Primitive::F64) => {
                builder.ins(&Instruction::F64Const(0.0f64.into()));
            }
            Type::Primitive(_) => {
                builder.ins(&Instruction::I32Const(0));
            }
            Type::Struct(s) => {
                let type_index = self.heap_struct(s)?;
                for field in &s.fields {
                    self.gen_default_value(builder, &field.ty)?;
                }
                builder.ins(&Instruction::StructNew(type_index));
            }
            Type::Array(a) => match a.len {
                Some(len) => self.gen_array_default(builder, a, len)?,
                None => {
                    let idx = self.heap_array(a)?;
                    builder.ins(&Instruction::RefNull(HeapType::Concrete(idx)));
                }
            },
            other => {
                return Err(CoreError::Codegen(format!(
                    "type {other} has no default value"
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Types and heap descriptors
    // -----------------------------------------------------------------

    fn result_types(&mut self, ret: &Type) -> Result<Vec<ValType>, CoreError> {
        if ret.is_void() {
            Ok(vec![])
        } else {
            Ok(vec![self.val_type(ret)?])
        }
    }

    fn val_type(&mut self, ty: &Type) -> Result<ValType, CoreError> {
        Ok(match ty {
            Type::Primitive(p) => match p {
                Primitive::U64 => ValType::I64,
                Primitive::F32 => ValType::F32,
                Primitive::F64 => ValType::F64,
                Primitive::Void => {
                    return Err(CoreError::Codegen(
                        "void has no value representation".to_string(),
                    ));
                }
                // narrow integers widen to i32 on the stack; string and
                // ptr are linear-memory addresses
                _ => ValType::I32,
            },
            Type::Struct(s) => {
                let idx = self.heap_struct(s)?;
                ValType::Ref(RefType {
                    nullable: true,
                    heap_type: HeapType::Concrete(idx),
                })
            }
            Type::Array(a) => {
                let idx = self.heap_array(a)?;
                ValType::Ref(RefType {
                    nullable: true,
                    heap_type: HeapType::Concrete(idx),
                })
            }
            other => {
                return Err(CoreError::Codegen(format!(
                    "type {other} has no value representation"
                )));
            }
        })
    }

    fn storage_type(&mut self, ty: &Type) -> Result<StorageType, CoreError> {
        Ok(match ty.as_primitive() {
            Some(Primitive::U8) => StorageType::I8,
            Some(Primitive::U16) => StorageType::I16,
            _ => StorageType::Val(self.val_type(ty)?),
        })
    }

    /// Heap-type descriptor for a nominal struct type. Cached by identity:
    /// declared exactly once no matter how many use sites there are.
    fn heap_struct(&mut self, ty: &Rc<StructType>) -> Result<u32, CoreError> {
        if let Some(&idx) = self.heap_types.get(&ty.id) {
            return Ok(idx);
        }
        let fields: Vec<FieldType> = ty
            .fields
            .iter()
            .map(|f| {
                Ok(FieldType {
                    element_type: self.storage_type(&f.ty)?,
                    mutable: true,
                })
            })
            .collect::<Result<_, CoreError>>()?;
        let idx = self.types.len();
        self.types.ty().struct_(fields);
        self.heap_types.insert(ty.id, idx);
        Ok(idx)
    }

    /// Heap-type descriptor for a nominal array type, cached like structs.
    fn heap_array(&mut self, ty: &Rc<ArrayType>) -> Result<u32, CoreError> {
        if let Some(&idx) = self.heap_types.get(&ty.id) {
            return Ok(idx);
        }
        let storage = self.storage_type(&ty.elem)?;
        let idx = self.types.len();
        self.types.ty().array(&storage, true);
        self.heap_types.insert(ty.id, idx);
        Ok(idx)
    }

    fn global_index(&self, name: &str) -> Result<u32, CoreError> {
        self.global_indices
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::Codegen(format!("unknown global '{name}'")))
    }

    fn record_debug(&mut self, builder: &FuncBuilder, span: Span) {
        if self.debug {
            self.debug_locs.push(DebugLoc {
                function: builder.name.clone(),
                instruction: builder.count,
                file: span.file,
                line: span.start.line,
                column: span.start.column,
            });
        }
    }
}

/// Binary operator lowering, keyed by operator and operand type. A missing
/// entry means resolution let an unsupported combination through, which is
/// fatal here.
fn binary_instruction(op: BinOp, prim: Primitive) -> Option<Instruction<'static>> {
    use Instruction as I;
    match prim {
        Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::Ptr => Some(match op {
            BinOp::Add => I::I32Add,
            BinOp::Sub => I::I32Sub,
            BinOp::Mul => I::I32Mul,
            BinOp::Div => I::I32DivU,
            BinOp::Rem => I::I32RemU,
            BinOp::BitAnd => I::I32And,
            BinOp::BitOr => I::I32Or,
            BinOp::Lt => I::I32LtU,
            BinOp::Le => I::I32LeU,
            BinOp::Gt => I::I32GtU,
            BinOp::Ge => I::I32GeU,
            BinOp::Eq => I::I32Eq,
            BinOp::Ne => I::I32Ne,
            BinOp::And | BinOp::Or => return None,
        }),
        Primitive::U64 => Some(match op {
            BinOp::Add => I::I64Add,
            BinOp::Sub => I::I64Sub,
            BinOp::Mul => I::I64Mul,
            BinOp::Div => I::I64DivU,
            BinOp::Rem => I::I64RemU,
            BinOp::BitAnd => I::I64And,
            BinOp::BitOr => I::I64Or,
            BinOp::Lt => I::I64LtU,
            BinOp::Le => I::I64LeU,
            BinOp::Gt => I::I64GtU,
            BinOp::Ge => I::I64GeU,
            BinOp::Eq => I::I64Eq,
            BinOp::Ne => I::I64Ne,
            BinOp::And | BinOp::Or => return None,
        }),
        Primitive::F32 => Some(match op {
            BinOp::Add => I::F32Add,
            BinOp::Sub => I::F32Sub,
            BinOp::Mul => I::F32Mul,
            BinOp::Div => I::F32Div,
            BinOp::Lt => I::F32Lt,
            BinOp::Le => I::F32Le,
            BinOp::Gt => I::F32Gt,
            BinOp::Ge => I::F32Ge,
            BinOp::Eq => I::F32Eq,
            BinOp::Ne => I::F32Ne,
            _ => return None,
        }),
        Primitive::F64 => Some(match op {
            BinOp::Add => I::F64Add,
            BinOp::Sub => I::F64Sub,
            BinOp::Mul => I::F64Mul,
            BinOp::Div => I::F64Div,
            BinOp::Lt => I::F64Lt,
            BinOp::Le => I::F64Le,
            BinOp::Gt => I::F64Gt,
            BinOp::Ge => I::F64Ge,
            BinOp::Eq => I::F64Eq,
            BinOp::Ne => I::F64Ne,
            _ => return None,
        }),
        Primitive::Bool => Some(match op {
            BinOp::And | BinOp::BitAnd => I::I32And,
            BinOp::Or | BinOp::BitOr => I::I32Or,
            BinOp::Eq => I::I32Eq,
            BinOp::Ne => I::I32Ne,
            _ => return None,
        }),
        Primitive::Void | Primitive::Str => None,
    }
}

/// Signedness for packed reads: `Some(signed)` for u8/u16 fields, `None`
/// for everything stored unpacked.
fn narrow_signedness(ty: &Type) -> Option<bool> {
    match ty.as_primitive() {
        Some(p @ (Primitive::U8 | Primitive::U16)) => Some(p.is_signed()),
        _ => None,
    }
}

fn float_const_expr(prim: Primitive, value: f64) -> ConstExpr {
    match prim {
        Primitive::F32 => ConstExpr::f32_const((value as f32).into()),
        _ => ConstExpr::f64_const(value.into()),
    }
}

/// Debug locations flush into a little-endian custom section: a table of
/// file names (each file indexed the first time it is seen) followed by
/// (file, line, column, function, instruction) records.
fn encode_debug_section(files: &SourceMap, locs: &[DebugLoc]) -> Vec<u8> {
    let mut file_order: Vec<FileId> = Vec::new();
    let mut file_index: HashMap<FileId, u32> = HashMap::new();
    for loc in locs {
        file_index.entry(loc.file).or_insert_with(|| {
            file_order.push(loc.file);
            (file_order.len() - 1) as u32
        });
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(file_order.len() as u32).to_le_bytes());
    for file in &file_order {
        let name = files.name(*file).as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
    }
    out.extend_from_slice(&(locs.len() as u32).to_le_bytes());
    for loc in locs {
        out.extend_from_slice(&file_index[&loc.file].to_le_bytes());
        out.extend_from_slice(&loc.line.to_le_bytes());
        out.extend_from_slice(&loc.column.to_le_bytes());
        let name = loc.function.as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&loc.instruction.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_is_four_byte_aligned() {
        let mut layout = MemoryLayout::default();
        let a = layout.alloc(b"hi".to_vec());
        let b = layout.alloc(b"world".to_vec());
        let c = layout.alloc(vec![0; 4]);
        assert_eq!(a, 0);
        assert_eq!(b, 4);
        assert_eq!(c, 12);
        assert_eq!(layout.next, 16);
    }

    #[test]
    fn operator_table_covers_numeric_types() {
        assert!(binary_instruction(BinOp::Add, Primitive::U32).is_some());
        assert!(binary_instruction(BinOp::Div, Primitive::U64).is_some());
        assert!(binary_instruction(BinOp::Lt, Primitive::F64).is_some());
        assert!(binary_instruction(BinOp::And, Primitive::Bool).is_some());
        // holes are fatal at generation time, not silently patched
        assert!(binary_instruction(BinOp::Rem, Primitive::F32).is_none());
        assert!(binary_instruction(BinOp::Add, Primitive::Str).is_none());
        assert!(binary_instruction(BinOp::And, Primitive::U32).is_none());
    }

    #[test]
    fn narrow_fields_read_unsigned() {
        assert_eq!(narrow_signedness(&Type::Primitive(Primitive::U8)), Some(false));
        assert_eq!(narrow_signedness(&Type::Primitive(Primitive::U16)), Some(false));
        assert_eq!(narrow_signedness(&Type::U32), None);
        assert_eq!(narrow_signedness(&Type::BOOL), None);
    }

    #[test]
    fn debug_section_indexes_files_once() {
        let mut files = SourceMap::new();
        let main = files.add("main.vader");
        let util = files.add("util.vader");
        let locs = vec![
            DebugLoc {
                function: "main".into(),
                instruction: 0,
                file: main,
                line: 1,
                column: 1,
            },
            DebugLoc {
                function: "helper".into(),
                instruction: 3,
                file: util,
                line: 2,
                column: 5,
            },
            DebugLoc {
                function: "main".into(),
                instruction: 7,
                file: main,
                line: 4,
                column: 2,
            },
        ];
        let bytes = encode_debug_section(&files, &locs);
        let file_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(file_count, 2);
        let name_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(&bytes[8..8 + name_len], b"main.vader");
    }
}
