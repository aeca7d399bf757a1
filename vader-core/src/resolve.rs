//! Scope resolution and type checking.
//!
//! A single forward pass lowers the untyped AST into typed HIR. Semantic
//! problems are *reported, not thrown*: the pass keeps walking after an
//! error so one run surfaces as many independent problems as possible, and
//! error sites produce the explicit [`Type::Error`] sentinel, which is
//! compatible with everything and so never cascades. Callers must check the
//! diagnostics context for error entries before handing the result to code
//! generation; resolution does not fail closed by itself.
//!
//! Scoping rules: depth 0 is the global scope; a name may be declared at
//! most once per scope; parameters and locals are allocated dense integer
//! slots against the nearest *function-level* scope, so declarations inside
//! nested `for`/`if` blocks never reset the counter.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{self, ArrayDim, BinOp, ElseBody, UnaryOp};
use crate::builtins;
use crate::diagnostic::{Diagnostic, Diagnostics};
use crate::hir;
use crate::span::{SourceMap, Span};
use crate::types::{
    ArrayType, FunctionType, NominalId, Primitive, StructField, StructType, Type,
};

/// A resolved symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Ref {
    pub name: String,
    pub ty: Type,
    pub source: RefSource,
    pub span: Span,
    pub mutable: bool,
}

/// Where a symbol lives. Index values are dense, per-function-scope
/// allocation-order integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSource {
    Global,
    GlobalFunction,
    Param(u32),
    Local(u32),
    /// A type name introduced by a struct declaration.
    TypeDef,
}

/// Resolve a parsed program into typed HIR.
///
/// Resolving the same program twice yields the same HIR and the same
/// diagnostics; the pass has no hidden state between runs.
pub fn resolve(
    program: &ast::Program,
    files: &SourceMap,
    diagnostics: &mut Diagnostics,
) -> hir::Program {
    let mut resolver = Resolver {
        files,
        diagnostics,
        scopes: vec![Scope::new()],
        next_nominal: 0,
        fn_ctx: None,
    };
    let mut statements = Vec::new();
    for stmt in &program.statements {
        if let Some(lowered) = resolver.resolve_top_stmt(stmt) {
            statements.push(lowered);
        }
    }
    hir::Program { statements }
}

#[derive(Default)]
struct Scope {
    symbols: HashMap<String, Ref>,
}

impl Scope {
    fn new() -> Scope {
        Scope::default()
    }
}

struct FnCtx {
    locals: Vec<Type>,
    ret: Type,
}

struct Resolver<'a> {
    files: &'a SourceMap,
    diagnostics: &'a mut Diagnostics,
    scopes: Vec<Scope>,
    next_nominal: u32,
    fn_ctx: Option<FnCtx>,
}

impl<'a> Resolver<'a> {
    // -----------------------------------------------------------------
    // Scopes and symbols
    // -----------------------------------------------------------------

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics
            .report(Diagnostic::error(message, span).with_code("E0200"));
    }

    fn fresh_nominal(&mut self) -> NominalId {
        let id = NominalId(self.next_nominal);
        self.next_nominal += 1;
        id
    }

    fn lookup(&self, name: &str) -> Option<Ref> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.symbols.get(name))
            .cloned()
    }

    /// Declare a symbol in the innermost scope. Redeclaration within one
    /// scope is an error pointing back at the original declaration.
    fn declare(&mut self, symbol: Ref) {
        let existing = self
            .scopes
            .last()
            .expect("scope stack is never empty")
            .symbols
            .get(&symbol.name)
            .map(|r| r.span);
        if let Some(first) = existing {
            let message = format!(
                "redeclaration of '{}'; first declared at {}",
                symbol.name,
                self.files.display(first)
            );
            self.error(message, symbol.span);
            return;
        }
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .symbols
            .insert(symbol.name.clone(), symbol);
    }

    /// Allocate the next dense local slot of the enclosing function.
    fn alloc_local(&mut self, ty: Type) -> u32 {
        let ctx = self
            .fn_ctx
            .as_mut()
            .expect("locals are only allocated inside functions");
        let index = ctx.locals.len() as u32;
        ctx.locals.push(ty);
        index
    }

    // -----------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------

    fn resolve_type_expr(&mut self, texpr: &ast::TypeExpr) -> Type {
        match &texpr.kind {
            ast::TypeExprKind::Named(name) => {
                if let Some(primitive) = Primitive::from_name(name) {
                    return Type::Primitive(primitive);
                }
                match self.lookup(name) {
                    Some(symbol) if symbol.source == RefSource::TypeDef => symbol.ty,
                    Some(_) => {
                        self.error(format!("'{name}' is not a type"), texpr.span);
                        Type::Error
                    }
                    None => {
                        self.error(format!("unknown type '{name}'"), texpr.span);
                        Type::Error
                    }
                }
            }
            ast::TypeExprKind::Array { dims, elem } => {
                let mut ty = self.resolve_type_expr(elem);
                // innermost dimension first; every level mints a fresh
                // nominal identity
                for dim in dims.iter().rev() {
                    let len = match dim {
                        ArrayDim::Fixed(n) => Some(*n),
                        ArrayDim::Inferred => None,
                    };
                    ty = Type::Array(Rc::new(ArrayType {
                        id: self.fresh_nominal(),
                        elem: ty,
                        len,
                    }));
                }
                ty
            }
        }
    }

    /// Integer and float literals adopt a numeric annotation; nothing else
    /// converts implicitly.
    fn adapt_literal(&mut self, expr: &mut hir::Expr, target: &Type) {
        let Some(target_prim) = target.as_primitive() else {
            return;
        };
        match &expr.kind {
            hir::ExprKind::Int(_) if target_prim.is_numeric() => {
                expr.ty = target.clone();
            }
            hir::ExprKind::Float(_) if target_prim.is_float() => {
                expr.ty = target.clone();
            }
            _ => {}
        }
    }

    /// An array literal adopts an annotated array type when the shapes
    /// agree, so `a : [3]u32 = [3]u32{...}` binds one nominal type instead
    /// of two.
    fn adopt_array_literal(&mut self, expr: &mut hir::Expr, target: &Type) {
        let Some(target_arr) = target.as_array() else {
            return;
        };
        let same_shape = match &expr.kind {
            hir::ExprKind::ArrayNew { ty, items } => {
                ty.elem.same(&target_arr.elem)
                    && target_arr.len.is_none_or(|n| n == items.len() as u64)
            }
            hir::ExprKind::ArrayNewDefault { ty, len } => {
                ty.elem.same(&target_arr.elem) && target_arr.len.is_none_or(|n| n == *len)
            }
            _ => false,
        };
        if !same_shape {
            return;
        }
        let adopted = Rc::new(ArrayType {
            id: target_arr.id,
            elem: target_arr.elem.clone(),
            len: match &expr.kind {
                hir::ExprKind::ArrayNew { items, .. } => Some(items.len() as u64),
                hir::ExprKind::ArrayNewDefault { len, .. } => Some(*len),
                _ => unreachable!(),
            },
        });
        match &mut expr.kind {
            hir::ExprKind::ArrayNew { ty, .. } => *ty = adopted.clone(),
            hir::ExprKind::ArrayNewDefault { ty, .. } => *ty = adopted.clone(),
            _ => {}
        }
        expr.ty = Type::Array(adopted);
    }

    // -----------------------------------------------------------------
    // Top-level statements
    // -----------------------------------------------------------------

    fn resolve_top_stmt(&mut self, stmt: &ast::Stmt) -> Option<hir::Stmt> {
        match &stmt.kind {
            ast::StmtKind::Declaration(decl) => self.resolve_top_declaration(decl, stmt.span),
            _ => {
                self.error(
                    "only declarations are allowed at the top level",
                    stmt.span,
                );
                None
            }
        }
    }

    fn resolve_top_declaration(
        &mut self,
        decl: &ast::Declaration,
        span: Span,
    ) -> Option<hir::Stmt> {
        match &decl.value.kind {
            ast::ExprKind::StructDecl(fields) => {
                if decl.annotation.is_some() {
                    self.error(
                        "a struct declaration cannot carry a type annotation",
                        span,
                    );
                }
                let resolved: Vec<StructField> = fields
                    .iter()
                    .map(|f| StructField {
                        name: f.name.clone(),
                        ty: self.resolve_type_expr(&f.ty),
                    })
                    .collect();
                let mut seen = HashMap::new();
                for field in fields {
                    if let Some(_first) = seen.insert(field.name.clone(), field.span) {
                        self.error(
                            format!("duplicate field '{}' in struct", field.name),
                            field.span,
                        );
                    }
                }
                let ty = Type::Struct(Rc::new(StructType {
                    id: self.fresh_nominal(),
                    name: decl.name.clone(),
                    fields: resolved,
                }));
                self.declare(Ref {
                    name: decl.name.clone(),
                    ty,
                    source: RefSource::TypeDef,
                    span: decl.name_span,
                    mutable: false,
                });
                None
            }
            ast::ExprKind::Fn(fn_expr) => {
                self.resolve_function(decl, fn_expr, span)
            }
            _ => {
                let (name, ty, init) = self.resolve_variable_declaration(decl)?;
                self.declare(Ref {
                    name: name.clone(),
                    ty: ty.clone(),
                    source: RefSource::Global,
                    span: decl.name_span,
                    mutable: decl.mutable,
                });
                Some(hir::Stmt {
                    kind: hir::StmtKind::Global(hir::GlobalLet {
                        name,
                        ty,
                        mutable: decl.mutable,
                        init,
                    }),
                    span,
                })
            }
        }
    }

    fn resolve_function(
        &mut self,
        decl: &ast::Declaration,
        fn_expr: &ast::FnExpr,
        span: Span,
    ) -> Option<hir::Stmt> {
        let param_types: Vec<Type> = fn_expr
            .params
            .iter()
            .map(|p| self.resolve_type_expr(&p.ty))
            .collect();
        let ret = self.resolve_type_expr(&fn_expr.return_type);
        let fn_ty = Type::Function(Rc::new(FunctionType {
            params: param_types.clone(),
            ret: ret.clone(),
            intrinsic: decl.intrinsic,
        }));

        // The symbol is visible to the body, so functions can recurse.
        self.declare(Ref {
            name: decl.name.clone(),
            ty: fn_ty,
            source: RefSource::GlobalFunction,
            span: decl.name_span,
            mutable: false,
        });

        if decl.intrinsic {
            // No body; lowering is supplied by the backend.
            return None;
        }
        let body_ast = fn_expr
            .body
            .as_ref()
            .expect("parser guarantees non-intrinsic functions have a body");

        self.scopes.push(Scope::new());
        let saved_ctx = self.fn_ctx.replace(FnCtx {
            locals: Vec::new(),
            ret: ret.clone(),
        });

        let mut params = Vec::new();
        for (index, param) in fn_expr.params.iter().enumerate() {
            let ty = param_types[index].clone();
            self.declare(Ref {
                name: param.name.clone(),
                ty: ty.clone(),
                source: RefSource::Param(index as u32),
                span: param.span,
                mutable: false,
            });
            params.push(hir::ParamDecl {
                name: param.name.clone(),
                ty,
            });
        }

        let mut statements = Vec::new();
        for stmt in &body_ast.statements {
            if let Some(lowered) = self.resolve_stmt(stmt) {
                statements.push(lowered);
            }
        }
        let body = hir::Block {
            statements,
            ty: Type::VOID,
            span: body_ast.span,
        };

        let ctx = self.fn_ctx.take().expect("function context present");
        self.fn_ctx = saved_ctx;
        self.scopes.pop();

        Some(hir::Stmt {
            kind: hir::StmtKind::Function(hir::FunctionDecl {
                name: decl.name.clone(),
                params,
                ret,
                locals: ctx.locals,
                body,
            }),
            span,
        })
    }

    /// Shared declaration typing: explicit annotation wins, literals adopt
    /// it, and any other disagreement is an error at the declaration site.
    fn resolve_variable_declaration(
        &mut self,
        decl: &ast::Declaration,
    ) -> Option<(String, Type, hir::Expr)> {
        let mut init = self.resolve_expr(&decl.value);
        let ty = match &decl.annotation {
            Some(annotation) => {
                let annotated = self.resolve_type_expr(annotation);
                self.adapt_literal(&mut init, &annotated);
                self.adopt_array_literal(&mut init, &annotated);
                if !init.ty.compatible(&annotated) {
                    self.error(
                        format!(
                            "initializer has type {} but the declaration is annotated {}",
                            init.ty, annotated
                        ),
                        decl.value.span,
                    );
                }
                annotated
            }
            None => init.ty.clone(),
        };
        if ty.is_void() {
            self.error(
                format!("cannot declare '{}' with type void", decl.name),
                decl.name_span,
            );
            return None;
        }
        Some((decl.name.clone(), ty, init))
    }

    // -----------------------------------------------------------------
    // Function-body statements
    // -----------------------------------------------------------------

    fn resolve_stmt(&mut self, stmt: &ast::Stmt) -> Option<hir::Stmt> {
        match &stmt.kind {
            ast::StmtKind::Declaration(decl) => {
                match &decl.value.kind {
                    ast::ExprKind::Fn(_) => {
                        self.error(
                            "function declarations are only allowed at the top level",
                            stmt.span,
                        );
                        return None;
                    }
                    ast::ExprKind::StructDecl(_) => {
                        self.error(
                            "struct declarations are only allowed at the top level",
                            stmt.span,
                        );
                        return None;
                    }
                    _ => {}
                }
                if self.fn_ctx.is_none() {
                    self.error(
                        "a declaration here must be inside a function body",
                        stmt.span,
                    );
                    return None;
                }
                let (name, ty, init) = self.resolve_variable_declaration(decl)?;
                let index = self.alloc_local(ty.clone());
                self.declare(Ref {
                    name: name.clone(),
                    ty: ty.clone(),
                    source: RefSource::Local(index),
                    span: decl.name_span,
                    mutable: decl.mutable,
                });
                Some(hir::Stmt {
                    kind: hir::StmtKind::Local(hir::LocalLet {
                        name,
                        index,
                        ty,
                        init,
                    }),
                    span: stmt.span,
                })
            }
            ast::StmtKind::Assignment { target, value } => {
                let place = self.resolve_place(target)?;
                let mut value = self.resolve_expr(value);
                self.adapt_literal(&mut value, &place.ty);
                if !value.ty.compatible(&place.ty) {
                    self.error(
                        format!(
                            "cannot assign a value of type {} to a place of type {}",
                            value.ty, place.ty
                        ),
                        value.span,
                    );
                }
                Some(hir::Stmt {
                    kind: hir::StmtKind::Assign(hir::Assign { place, value }),
                    span: stmt.span,
                })
            }
            ast::StmtKind::Expression(expr) => {
                let lowered = self.resolve_expr(expr);
                Some(hir::Stmt {
                    kind: hir::StmtKind::Expr(lowered),
                    span: stmt.span,
                })
            }
            ast::StmtKind::Return { value } => {
                let ret = match &self.fn_ctx {
                    Some(ctx) => ctx.ret.clone(),
                    None => {
                        self.error("'return' outside of a function", stmt.span);
                        Type::Error
                    }
                };
                let value = match value {
                    Some(expr) => {
                        let mut lowered = self.resolve_expr(expr);
                        self.adapt_literal(&mut lowered, &ret);
                        if !lowered.ty.compatible(&ret) {
                            self.error(
                                format!(
                                    "return value has type {} but the function returns {}",
                                    lowered.ty, ret
                                ),
                                expr.span,
                            );
                        }
                        Some(lowered)
                    }
                    None => {
                        if !(ret.is_void() || ret.is_error()) {
                            self.error(
                                format!("function returns {ret} but 'return' has no value"),
                                stmt.span,
                            );
                        }
                        None
                    }
                };
                Some(hir::Stmt {
                    kind: hir::StmtKind::Return { value },
                    span: stmt.span,
                })
            }
            ast::StmtKind::For(for_stmt) => {
                self.scopes.push(Scope::new());
                let init = self.resolve_stmt(&for_stmt.init);
                let mut condition = self.resolve_expr(&for_stmt.condition);
                if !condition.ty.compatible(&Type::BOOL) {
                    self.error(
                        format!("loop condition must be boolean, found {}", condition.ty),
                        condition.span,
                    );
                    condition = hir::Expr::error(condition.span);
                }
                let step = self.resolve_stmt(&for_stmt.step);
                let body = self.resolve_block(&for_stmt.body);
                self.scopes.pop();
                let (init, step) = (init?, step?);
                Some(hir::Stmt {
                    kind: hir::StmtKind::For(Box::new(hir::For {
                        init,
                        condition,
                        step,
                        body,
                    })),
                    span: stmt.span,
                })
            }
        }
    }

    fn resolve_block(&mut self, block: &ast::Block) -> hir::Block {
        self.scopes.push(Scope::new());
        let mut statements = Vec::new();
        for stmt in &block.statements {
            if let Some(lowered) = self.resolve_stmt(stmt) {
                statements.push(lowered);
            }
        }
        self.scopes.pop();
        // the trailing value-producing statement gives the block its type
        let ty = match statements.last() {
            Some(hir::Stmt {
                kind: hir::StmtKind::Expr(expr),
                ..
            }) => expr.ty.clone(),
            _ => Type::VOID,
        };
        hir::Block {
            statements,
            ty,
            span: block.span,
        }
    }

    // -----------------------------------------------------------------
    // Places
    // -----------------------------------------------------------------

    fn resolve_place(&mut self, target: &ast::Expr) -> Option<hir::Place> {
        match &target.kind {
            ast::ExprKind::Identifier(name) => {
                let base = self.resolve_expr(target);
                if base.ty.is_error() {
                    return None;
                }
                if let Some(symbol) = self.lookup(name) {
                    if !symbol.mutable {
                        self.error(
                            format!("cannot assign to constant '{name}'"),
                            target.span,
                        );
                        return None;
                    }
                }
                Some(hir::Place {
                    ty: base.ty.clone(),
                    base,
                    props: Vec::new(),
                    span: target.span,
                })
            }
            ast::ExprKind::Access { base, props } => {
                let base = self.resolve_expr(base);
                if base.ty.is_error() {
                    return None;
                }
                let (props, ty) = self.resolve_props(&base.ty, props)?;
                Some(hir::Place {
                    base,
                    props,
                    ty,
                    span: target.span,
                })
            }
            _ => {
                self.error("invalid assignment target", target.span);
                None
            }
        }
    }

    /// Walk a property chain, switching on the previous resolved type:
    /// arrays take index properties, structs take named fields, anything
    /// else is an error.
    fn resolve_props(
        &mut self,
        base_ty: &Type,
        props: &[ast::Prop],
    ) -> Option<(Vec<hir::Prop>, Type)> {
        let mut current = base_ty.clone();
        let mut lowered = Vec::new();
        for prop in props {
            match (&current, prop) {
                (Type::Array(array), ast::Prop::Index { index, .. }) => {
                    let mut idx = self.resolve_expr(index);
                    self.adapt_literal(&mut idx, &Type::U32);
                    if !idx
                        .ty
                        .as_primitive()
                        .map(Primitive::is_integer)
                        .unwrap_or(false)
                        && !idx.ty.is_error()
                    {
                        self.error(
                            format!("array index must be an integer, found {}", idx.ty),
                            idx.span,
                        );
                    }
                    let elem = array.elem.clone();
                    lowered.push(hir::Prop::Index {
                        owner: array.clone(),
                        index: idx,
                        ty: elem.clone(),
                    });
                    current = elem;
                }
                (Type::Struct(struct_ty), ast::Prop::Field { name, span }) => {
                    match struct_ty.field_index(name) {
                        Some(index) => {
                            let field_ty = struct_ty.fields[index].ty.clone();
                            lowered.push(hir::Prop::Field {
                                owner: struct_ty.clone(),
                                index: index as u32,
                                ty: field_ty.clone(),
                            });
                            current = field_ty;
                        }
                        None => {
                            self.error(
                                format!(
                                    "struct {} has no field named '{name}'",
                                    struct_ty.name
                                ),
                                *span,
                            );
                            return None;
                        }
                    }
                }
                (Type::Error, _) => return None,
                (other, ast::Prop::Field { span, .. }) => {
                    self.error(format!("type {other} has no fields"), *span);
                    return None;
                }
                (other, ast::Prop::Index { span, .. }) => {
                    self.error(format!("type {other} cannot be indexed"), *span);
                    return None;
                }
            }
        }
        Some((lowered, current))
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn resolve_expr(&mut self, expr: &ast::Expr) -> hir::Expr {
        let span = expr.span;
        match &expr.kind {
            ast::ExprKind::Integer(value) => hir::Expr {
                kind: hir::ExprKind::Int(*value),
                ty: Type::U32,
                span,
            },
            ast::ExprKind::Float(value) => hir::Expr {
                kind: hir::ExprKind::Float(*value),
                ty: Type::Primitive(Primitive::F64),
                span,
            },
            ast::ExprKind::Bool(value) => hir::Expr {
                kind: hir::ExprKind::Bool(*value),
                ty: Type::BOOL,
                span,
            },
            ast::ExprKind::Str(value) => hir::Expr {
                kind: hir::ExprKind::Str(value.clone()),
                ty: Type::STR,
                span,
            },
            ast::ExprKind::Identifier(name) => match self.lookup(name) {
                Some(symbol) => match symbol.source {
                    RefSource::Local(index) => hir::Expr {
                        kind: hir::ExprKind::Local { index },
                        ty: symbol.ty,
                        span,
                    },
                    RefSource::Param(index) => hir::Expr {
                        kind: hir::ExprKind::Param { index },
                        ty: symbol.ty,
                        span,
                    },
                    RefSource::Global => hir::Expr {
                        kind: hir::ExprKind::Global { name: name.clone() },
                        ty: symbol.ty,
                        span,
                    },
                    RefSource::GlobalFunction => {
                        self.error(
                            format!("function '{name}' cannot be used as a value"),
                            span,
                        );
                        hir::Expr::error(span)
                    }
                    RefSource::TypeDef => {
                        self.error(format!("type '{name}' cannot be used as a value"), span);
                        hir::Expr::error(span)
                    }
                },
                None => {
                    self.error(format!("unresolved identifier '{name}'"), span);
                    hir::Expr::error(span)
                }
            },
            ast::ExprKind::Unary { op, operand } => {
                let operand = self.resolve_expr(operand);
                let ty = match op {
                    UnaryOp::Neg => {
                        if operand.ty.is_error()
                            || operand
                                .ty
                                .as_primitive()
                                .map(Primitive::is_numeric)
                                .unwrap_or(false)
                        {
                            operand.ty.clone()
                        } else {
                            self.error(
                                format!("cannot negate a value of type {}", operand.ty),
                                span,
                            );
                            Type::Error
                        }
                    }
                    UnaryOp::Not => {
                        if operand.ty.compatible(&Type::BOOL) {
                            Type::BOOL
                        } else {
                            self.error(
                                format!("'!' expects a boolean, found {}", operand.ty),
                                span,
                            );
                            Type::Error
                        }
                    }
                };
                hir::Expr {
                    kind: hir::ExprKind::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    ty,
                    span,
                }
            }
            ast::ExprKind::Binary { op, lhs, rhs } => {
                let mut lhs = self.resolve_expr(lhs);
                let mut rhs = self.resolve_expr(rhs);
                // numeric literals take the other operand's type
                let lhs_ty = lhs.ty.clone();
                self.adapt_literal(&mut rhs, &lhs_ty);
                let rhs_ty = rhs.ty.clone();
                self.adapt_literal(&mut lhs, &rhs_ty);
                let ty = self.binary_result(*op, &lhs, &rhs, span);
                hir::Expr {
                    kind: hir::ExprKind::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty,
                    span,
                }
            }
            ast::ExprKind::Call {
                callee,
                callee_span,
                args,
            } => self.resolve_call(callee, *callee_span, args, span),
            ast::ExprKind::Access { base, props } => {
                let base = self.resolve_expr(base);
                if base.ty.is_error() {
                    return hir::Expr::error(span);
                }
                match self.resolve_props(&base.ty, props) {
                    Some((props, ty)) => hir::Expr {
                        kind: hir::ExprKind::Access {
                            base: Box::new(base),
                            props,
                        },
                        ty,
                        span,
                    },
                    None => hir::Expr::error(span),
                }
            }
            ast::ExprKind::StructLiteral {
                name,
                name_span,
                inits,
            } => self.resolve_struct_literal(name, *name_span, inits, span),
            ast::ExprKind::ArrayLiteral { ty, items } => {
                self.resolve_array_literal(ty, items, span)
            }
            ast::ExprKind::If(if_expr) => self.resolve_if(if_expr, span),
            ast::ExprKind::Fn(_) => {
                self.error(
                    "a function expression is only allowed as the value of a declaration",
                    span,
                );
                hir::Expr::error(span)
            }
            ast::ExprKind::StructDecl(_) => {
                self.error(
                    "a struct declaration is only allowed as the value of a declaration",
                    span,
                );
                hir::Expr::error(span)
            }
        }
    }

    fn binary_result(
        &mut self,
        op: BinOp,
        lhs: &hir::Expr,
        rhs: &hir::Expr,
        span: Span,
    ) -> Type {
        if lhs.ty.is_error() || rhs.ty.is_error() {
            return Type::Error;
        }
        if !lhs.ty.same(&rhs.ty) {
            self.error(
                format!(
                    "operator '{}' requires matching operand types, found {} and {}",
                    op.symbol(),
                    lhs.ty,
                    rhs.ty
                ),
                span,
            );
            return Type::Error;
        }
        let Some(prim) = lhs.ty.as_primitive() else {
            self.error(
                format!(
                    "operator '{}' is not defined for type {}",
                    op.symbol(),
                    lhs.ty
                ),
                span,
            );
            return Type::Error;
        };
        let ok = match op {
            BinOp::And | BinOp::Or => prim == Primitive::Bool,
            BinOp::BitAnd | BinOp::BitOr => prim.is_integer() || prim == Primitive::Bool,
            BinOp::Eq | BinOp::Ne => prim.is_numeric() || prim == Primitive::Bool,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => prim.is_numeric(),
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => prim.is_numeric(),
            BinOp::Rem => prim.is_integer(),
        };
        if !ok {
            self.error(
                format!(
                    "operator '{}' is not defined for type {}",
                    op.symbol(),
                    lhs.ty
                ),
                span,
            );
            return Type::Error;
        }
        if op.is_comparison() {
            Type::BOOL
        } else {
            lhs.ty.clone()
        }
    }

    fn resolve_call(
        &mut self,
        callee: &str,
        callee_span: Span,
        args: &[ast::Expr],
        span: Span,
    ) -> hir::Expr {
        let mut lowered: Vec<hir::Expr> = args.iter().map(|a| self.resolve_expr(a)).collect();

        if let Some(symbol) = self.lookup(callee) {
            let Some(fn_ty) = symbol.ty.as_function().cloned() else {
                self.error(format!("'{callee}' is not callable"), callee_span);
                return hir::Expr::error(span);
            };
            if lowered.len() != fn_ty.params.len() {
                self.error(
                    format!(
                        "'{callee}' expects {} argument(s) but received {}",
                        fn_ty.params.len(),
                        lowered.len()
                    ),
                    span,
                );
            } else {
                for (arg, expected) in lowered.iter_mut().zip(&fn_ty.params) {
                    self.adapt_literal(arg, expected);
                    if !arg.ty.compatible(expected) {
                        let (found, at) = (arg.ty.clone(), arg.span);
                        self.error(
                            format!("argument has type {found} but '{callee}' expects {expected}"),
                            at,
                        );
                    }
                }
            }
            let target = if fn_ty.intrinsic {
                hir::CallTarget::Intrinsic(callee.to_string())
            } else {
                hir::CallTarget::Function(callee.to_string())
            };
            return hir::Expr {
                kind: hir::ExprKind::Call {
                    target,
                    args: lowered,
                },
                ty: fn_ty.ret.clone(),
                span,
            };
        }

        // not in scope: fall back to the intrinsic table
        if let Some(builtin) = builtins::find_builtin(callee) {
            let ty = self.check_intrinsic_args(builtin.kind, &mut lowered, callee, span);
            return hir::Expr {
                kind: hir::ExprKind::Call {
                    target: hir::CallTarget::Intrinsic(callee.to_string()),
                    args: lowered,
                },
                ty,
                span,
            };
        }

        self.error(format!("unresolved function '{callee}'"), callee_span);
        hir::Expr::error(span)
    }

    fn check_intrinsic_args(
        &mut self,
        kind: crate::builtins::IntrinsicKind,
        args: &mut [hir::Expr],
        name: &str,
        span: Span,
    ) -> Type {
        use crate::builtins::IntrinsicKind;
        if args.len() != 1 {
            self.error(
                format!("'{name}' expects 1 argument but received {}", args.len()),
                span,
            );
            return match kind {
                IntrinsicKind::Length => Type::U32,
                _ => Type::VOID,
            };
        }
        let arg = &mut args[0];
        match kind {
            IntrinsicKind::Print => {
                if !arg.ty.compatible(&Type::STR) {
                    self.error(
                        format!("'print' expects a string, found {}", arg.ty),
                        arg.span,
                    );
                }
                Type::VOID
            }
            IntrinsicKind::Exit => {
                self.adapt_literal(arg, &Type::U32);
                if !arg.ty.compatible(&Type::U32) {
                    self.error(
                        format!("'exit' expects a u32, found {}", arg.ty),
                        arg.span,
                    );
                }
                Type::VOID
            }
            IntrinsicKind::Length => {
                if arg.ty.as_array().is_none() && !arg.ty.is_error() {
                    self.error(
                        format!("'length' expects an array, found {}", arg.ty),
                        arg.span,
                    );
                }
                Type::U32
            }
        }
    }

    /// Struct instantiation: named arguments match by field name in any
    /// order, positional arguments align by index. Argument-level type
    /// errors are reported but the expression still takes the nominal
    /// struct type, so resolution keeps going.
    fn resolve_struct_literal(
        &mut self,
        name: &str,
        name_span: Span,
        inits: &[ast::FieldInit],
        span: Span,
    ) -> hir::Expr {
        let struct_ty = match self.lookup(name) {
            Some(symbol) if symbol.source == RefSource::TypeDef => {
                match symbol.ty.as_struct() {
                    Some(s) => s.clone(),
                    None => {
                        self.error(format!("'{name}' is not a struct type"), name_span);
                        return hir::Expr::error(span);
                    }
                }
            }
            Some(_) => {
                self.error(format!("'{name}' is not a struct type"), name_span);
                return hir::Expr::error(span);
            }
            None => {
                self.error(format!("unknown struct type '{name}'"), name_span);
                return hir::Expr::error(span);
            }
        };

        if inits.len() != struct_ty.fields.len() {
            self.error(
                format!(
                    "struct {} has {} field(s) but {} were initialized",
                    struct_ty.name,
                    struct_ty.fields.len(),
                    inits.len()
                ),
                span,
            );
        }

        let named = inits.iter().any(|init| init.name.is_some());
        if named && inits.iter().any(|init| init.name.is_none()) {
            self.error(
                "cannot mix named and positional field initializers",
                span,
            );
        }

        // one expression per declared field, in declaration order
        let mut fields: Vec<Option<hir::Expr>> = vec![None; struct_ty.fields.len()];
        for (position, init) in inits.iter().enumerate() {
            let slot = match &init.name {
                Some(field_name) => match struct_ty.field_index(field_name) {
                    Some(index) => index,
                    None => {
                        self.error(
                            format!(
                                "struct {} has no field named '{field_name}'",
                                struct_ty.name
                            ),
                            init.span,
                        );
                        continue;
                    }
                },
                None => position,
            };
            if slot >= fields.len() {
                continue;
            }
            if fields[slot].is_some() {
                self.error(
                    format!(
                        "field '{}' is initialized more than once",
                        struct_ty.fields[slot].name
                    ),
                    init.span,
                );
                continue;
            }
            let mut value = self.resolve_expr(&init.value);
            let expected = struct_ty.fields[slot].ty.clone();
            self.adapt_literal(&mut value, &expected);
            if !value.ty.compatible(&expected) {
                self.error(
                    format!(
                        "field '{}' expects {} but the initializer has type {}",
                        struct_ty.fields[slot].name, expected, value.ty
                    ),
                    value.span,
                );
            }
            fields[slot] = Some(value);
        }

        let fields: Vec<hir::Expr> = fields
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| hir::Expr::error(span)))
            .collect();

        hir::Expr {
            kind: hir::ExprKind::StructNew {
                ty: struct_ty.clone(),
                fields,
            },
            ty: Type::Struct(struct_ty),
            span,
        }
    }

    fn resolve_array_literal(
        &mut self,
        ty: &ast::TypeExpr,
        items: &[ast::Expr],
        span: Span,
    ) -> hir::Expr {
        let resolved = self.resolve_type_expr(ty);
        let Some(array_ty) = resolved.as_array().cloned() else {
            return hir::Expr::error(span);
        };
        // inner dimensions of a default-initialized array must be sized
        let mut inner = &array_ty.elem;
        while let Type::Array(next) = inner {
            if next.len.is_none() {
                self.error(
                    "inner array dimensions must have an explicit length",
                    ty.span,
                );
                return hir::Expr::error(span);
            }
            inner = &next.elem;
        }

        if items.is_empty() {
            let len = array_ty
                .len
                .expect("parser rejects inferred lengths without items");
            return hir::Expr {
                kind: hir::ExprKind::ArrayNewDefault {
                    ty: array_ty.clone(),
                    len,
                },
                ty: Type::Array(array_ty),
                span,
            };
        }

        let sized = Rc::new(ArrayType {
            id: array_ty.id,
            elem: array_ty.elem.clone(),
            len: Some(items.len() as u64),
        });
        let mut lowered = Vec::new();
        for item in items {
            let mut value = self.resolve_expr(item);
            self.adapt_literal(&mut value, &sized.elem);
            self.adopt_array_literal(&mut value, &sized.elem);
            if !value.ty.compatible(&sized.elem) {
                self.error(
                    format!(
                        "array element has type {} but the element type is {}",
                        value.ty, sized.elem
                    ),
                    value.span,
                );
            }
            lowered.push(value);
        }
        hir::Expr {
            kind: hir::ExprKind::ArrayNew {
                ty: sized.clone(),
                items: lowered,
            },
            ty: Type::Array(sized),
            span,
        }
    }

    /// Both branches are resolved; when both exist their trailing types
    /// must match exactly, and the whole expression takes the then-branch
    /// type. `elif` chains become an `if` in the else block.
    fn resolve_if(&mut self, if_expr: &ast::IfExpr, span: Span) -> hir::Expr {
        let mut condition = self.resolve_expr(&if_expr.condition);
        if !condition.ty.compatible(&Type::BOOL) {
            self.error(
                format!("condition must be boolean, found {}", condition.ty),
                condition.span,
            );
            condition = hir::Expr::error(condition.span);
        }
        let then_body = self.resolve_block(&if_expr.then_body);
        let else_body = match &if_expr.else_body {
            Some(ElseBody::Else(block)) => Some(self.resolve_block(block)),
            Some(ElseBody::Elif(chained, elif_span)) => {
                let nested = self.resolve_if(chained, *elif_span);
                let ty = nested.ty.clone();
                Some(hir::Block {
                    statements: vec![hir::Stmt {
                        kind: hir::StmtKind::Expr(nested),
                        span: *elif_span,
                    }],
                    ty,
                    span: *elif_span,
                })
            }
            None => None,
        };

        let ty = match &else_body {
            Some(else_block) => {
                if !then_body.ty.same(&else_block.ty)
                    && !then_body.ty.is_error()
                    && !else_block.ty.is_error()
                {
                    self.error(
                        format!(
                            "if branches have mismatched types: {} and {}",
                            then_body.ty, else_block.ty
                        ),
                        span,
                    );
                }
                then_body.ty.clone()
            }
            None => Type::VOID,
        };

        hir::Expr {
            kind: hir::ExprKind::If(Box::new(hir::If {
                condition,
                then_body,
                else_body,
            })),
            ty,
            span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Severity;
    use crate::loader::MemoryLoader;
    use crate::parser::parse_program;

    fn run(source: &str) -> (hir::Program, Diagnostics) {
        let mut loader = MemoryLoader::new();
        loader.insert("main", source);
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let ast = parse_program("main", &mut loader, &mut files, &mut diags)
            .expect("parse should succeed");
        let program = resolve(&ast, &files, &mut diags);
        (program, diags)
    }

    fn run_clean(source: &str) -> hir::Program {
        let (program, diags) = run(source);
        let messages: Vec<_> = diags.iter().map(|d| d.message.clone()).collect();
        assert!(!diags.has_errors(), "unexpected diagnostics: {messages:?}");
        program
    }

    #[test]
    fn resolves_simple_entry() {
        let program = run_clean("main := fn() -> u32 { return 42 }");
        assert_eq!(program.statements.len(), 1);
        let hir::StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function");
        };
        assert_eq!(func.name, "main");
        assert_eq!(func.ret, Type::U32);
        assert!(func.locals.is_empty());
    }

    #[test]
    fn struct_field_roundtrip() {
        let program = run_clean(
            "Point :: struct { x: u32 y: u32 }\n\
             main := fn() -> u32 {\n\
               p := Point{x: 1, y: 2}\n\
               p.x = 99\n\
               return p.x\n\
             }",
        );
        let hir::StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function");
        };
        // p's declared type is the nominal Point struct
        let hir::StmtKind::Local(local) = &func.body.statements[0].kind else {
            panic!("expected local declaration");
        };
        let Type::Struct(s) = &local.ty else {
            panic!("expected struct type");
        };
        assert_eq!(s.name, "Point");
        assert!(matches!(
            &func.body.statements[1].kind,
            hir::StmtKind::Assign(assign) if assign.place.props.len() == 1
        ));
    }

    #[test]
    fn redeclaration_reports_exactly_one_error() {
        let (_, diags) = run("x :: 1\nx :: 2");
        assert_eq!(diags.error_count(), 1);
        let message = &diags.entries()[0].message;
        assert!(message.contains("redeclaration of 'x'"), "{message}");
        assert!(message.contains("main:1:1"), "{message}");
    }

    #[test]
    fn same_shape_structs_are_not_interchangeable() {
        let (_, diags) = run(
            "A :: struct { v: u32 }\n\
             B :: struct { v: u32 }\n\
             pick :: fn(a: A) -> u32 { return a.v }\n\
             main := fn() -> u32 { return pick(B{v: 1}) }",
        );
        assert_eq!(diags.error_count(), 1);
        assert!(diags.entries()[0].message.contains("expects A"));
    }

    #[test]
    fn local_slots_are_dense_across_nested_blocks() {
        let program = run_clean(
            "main := fn() -> u32 {\n\
               a := 1\n\
               for (i := 0; i < 3; i++) {\n\
                 b := i\n\
                 if b < 2 { c := b d := c }\n\
               }\n\
               e := 5\n\
               return e\n\
             }",
        );
        let hir::StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function");
        };
        // a, i, b, c, d, e in allocation order
        assert_eq!(func.locals.len(), 6);
        let mut indices = Vec::new();
        collect_local_indices(&func.body.statements, &mut indices);
        indices.sort_unstable();
        assert_eq!(indices, (0..6).collect::<Vec<u32>>());
    }

    fn collect_local_indices(statements: &[hir::Stmt], out: &mut Vec<u32>) {
        for stmt in statements {
            match &stmt.kind {
                hir::StmtKind::Local(local) => out.push(local.index),
                hir::StmtKind::For(f) => {
                    if let hir::StmtKind::Local(local) = &f.init.kind {
                        out.push(local.index);
                    }
                    collect_local_indices(&f.body.statements, out);
                }
                hir::StmtKind::Expr(expr) => {
                    if let hir::ExprKind::If(if_expr) = &expr.kind {
                        collect_local_indices(&if_expr.then_body.statements, out);
                        if let Some(else_body) = &if_expr.else_body {
                            collect_local_indices(&else_body.statements, out);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn unknown_struct_instantiation_is_one_error() {
        let (_, diags) = run("main := fn() -> u32 { f := Foo{} return 0 }");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.entries()[0].message.contains("unknown struct type 'Foo'"));
    }

    #[test]
    fn branch_type_mismatch_is_reported() {
        let (_, diags) = run(
            "main := fn() -> u32 { x := if 1 < 2 { 1 } else { true } return x }",
        );
        assert!(
            diags
                .iter()
                .any(|d| d.message.contains("mismatched types")),
            "expected a branch mismatch diagnostic"
        );
    }

    #[test]
    fn literal_adopts_annotation_but_values_do_not() {
        run_clean("w : u8 = 5\nmain := fn() -> u32 { return 0 }");
        let (_, diags) = run("w : u8 = true\nmain := fn() -> u32 { return 0 }");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.entries()[0].message.contains("annotated u8"));
    }

    #[test]
    fn intrinsics_resolve_without_declarations() {
        let program = run_clean(
            "main := fn() -> u32 {\n\
               arr := [3]u32{1, 2, 3}\n\
               print(\"hi\")\n\
               return length(arr)\n\
             }",
        );
        let hir::StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function");
        };
        let hir::StmtKind::Return { value: Some(ret) } = &func.body.statements.last().unwrap().kind
        else {
            panic!("expected return");
        };
        assert!(matches!(
            &ret.kind,
            hir::ExprKind::Call {
                target: hir::CallTarget::Intrinsic(name),
                ..
            } if name == "length"
        ));
        assert_eq!(ret.ty, Type::U32);
    }

    #[test]
    fn intrinsic_declaration_binds_explicitly() {
        let program = run_clean(
            "@intrinsic exit :: fn(code: u32) -> void\n\
             main := fn() -> void { exit(3) }",
        );
        // the intrinsic itself produces no HIR statement
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn ufcs_receiver_becomes_first_argument() {
        run_clean(
            "add :: fn(a: u32, b: u32) -> u32 { return a + b }\n\
             main := fn() -> u32 { x := 1 return x.add(2) }",
        );
    }

    #[test]
    fn indexing_a_struct_is_an_error() {
        let (_, diags) = run(
            "P :: struct { v: u32 }\n\
             main := fn() -> u32 { p := P{v: 1} return p[0] }",
        );
        assert!(diags.iter().any(|d| d.message.contains("cannot be indexed")));
    }

    #[test]
    fn assignment_to_constant_is_an_error() {
        let (_, diags) = run("main := fn() -> u32 { x :: 1 x = 2 return x }");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("cannot assign to constant 'x'")));
    }

    #[test]
    fn resolution_is_a_fixed_point() {
        let source = "Point :: struct { x: u32 y: u32 }\n\
                      main := fn() -> u32 { p := Point{x: 1, y: 2} return p.x }";
        let mut loader = MemoryLoader::new();
        loader.insert("main", source);
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let ast = parse_program("main", &mut loader, &mut files, &mut diags).expect("parse");
        let first = resolve(&ast, &files, &mut diags);
        let after_first = diags.len();
        let second = resolve(&ast, &files, &mut diags);
        assert_eq!(first, second, "resolution must be deterministic");
        assert_eq!(diags.len(), after_first, "no new diagnostics on re-resolution");
    }

    #[test]
    fn clean_programs_produce_no_diagnostics() {
        let (_, diags) = run("main := fn() -> void { }");
        assert!(diags.is_empty());
        assert!(!diags.iter().any(|d| d.severity == Severity::Error));
    }
}
