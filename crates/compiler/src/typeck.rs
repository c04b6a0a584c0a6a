//! Type propagation and semantic checking.
//!
//! Walks the AST once, annotating every expression with its result type,
//! resolving identifiers against locals and globals, validating calls
//! against helper signatures and the mod API manifest, and reclassifying
//! string literals to `resource`/`entity` at use sites that demand them.
//!
//! Two loose ends feed the code generator: the globals block layout
//! (`me` at offset 0 plus every declared global at its fixed offset) and the
//! per-`on_` `calls_helper_fn` / `contains_while_loop` flags that decide
//! which sandbox arming code its safe prologue gets.

use std::collections::HashMap;

use grug_core::Type;

use crate::ast::*;
use crate::error::{Result, bail, ensure};
use crate::modapi::{Entity, ModApi, Param};

/// One slot of the per-entity globals block.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub type_name: String,
    pub offset: usize,
}

/// Layout of the globals block: `me` first, then every declared global at
/// the next free offset (sizes: bool=1, i32=4, f32=4, string=8, id=8).
#[derive(Debug, Default)]
pub struct GlobalsLayout {
    vars: Vec<GlobalVar>,
    index: HashMap<String, usize>,
    pub total_bytes: usize,
}

impl GlobalsLayout {
    pub fn get(&self, name: &str) -> Option<&GlobalVar> {
        self.index.get(name).map(|&i| &self.vars[i])
    }

    pub fn vars(&self) -> &[GlobalVar] {
        &self.vars
    }

    fn add(&mut self, name: &str, ty: Type, type_name: &str) -> Result<()> {
        ensure!(
            self.get(name).is_none(),
            "The global variable '{}' shadows an earlier global variable with the same name, so change the name of one of them",
            name
        );
        self.index.insert(name.to_string(), self.vars.len());
        self.vars.push(GlobalVar {
            name: name.to_string(),
            ty,
            type_name: type_name.to_string(),
            offset: self.total_bytes,
        });
        self.total_bytes += ty.size();
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct HelperSig {
    params: Vec<FnParam>,
    return_type: Type,
    return_type_name: Option<String>,
}

struct LocalVar {
    ty: Type,
    type_name: String,
    reachable: bool,
}

/// A callee parameter, from either a helper signature or the manifest.
struct ParamSpec<'a> {
    name: &'a str,
    ty: Type,
    type_name: &'a str,
    resource_extension: Option<&'a str>,
    entity_type: Option<&'a str>,
}

impl<'a> From<&'a FnParam> for ParamSpec<'a> {
    fn from(p: &'a FnParam) -> ParamSpec<'a> {
        ParamSpec {
            name: &p.name,
            ty: p.ty,
            type_name: &p.type_name,
            resource_extension: None,
            entity_type: None,
        }
    }
}

impl<'a> From<&'a Param> for ParamSpec<'a> {
    fn from(p: &'a Param) -> ParamSpec<'a> {
        ParamSpec {
            name: &p.name,
            ty: p.ty,
            type_name: &p.type_name,
            resource_extension: p.resource_extension.as_deref(),
            entity_type: p.entity_type.as_deref(),
        }
    }
}

/// `a` fails to match `b` when the types differ, or both are id types with
/// different custom names. A plain `id` on either side matches any id type;
/// callers handle that before asking.
fn is_wrong_type(a: Type, b: Type, a_name: &str, b_name: &str) -> bool {
    if a != b {
        return true;
    }
    if a != Type::Id {
        return false;
    }
    a_name != b_name
}

pub struct Checker<'a> {
    api: &'a ModApi,
    entity: &'a Entity,
    mod_name: &'a str,
    file_entity_type: &'a str,
    helper_sigs: HashMap<String, HelperSig>,
    globals: GlobalsLayout,

    locals: Vec<LocalVar>,
    local_index: HashMap<String, Vec<usize>>,

    fn_return_type: Type,
    fn_return_type_name: String,
    current_fn_name: String,

    calls_helper_fn: bool,
    contains_while_loop: bool,
}

/// Run type propagation over a parsed file. On success the AST is fully
/// annotated and the returned layout describes the globals block.
pub fn fill_result_types(
    ast: &mut GrugFileAst,
    api: &ModApi,
    mod_name: &str,
    file_entity_type: &str,
) -> Result<GlobalsLayout> {
    let entity = match api.entity(file_entity_type) {
        Some(entity) => entity,
        None => bail!("The entity '{}' was not declared by mod_api.json", file_entity_type),
    };

    let helper_sigs = ast
        .helper_fns
        .iter()
        .map(|f| {
            (
                f.name.clone(),
                HelperSig {
                    params: f.params.clone(),
                    return_type: f.return_type,
                    return_type_name: f.return_type_name.clone(),
                },
            )
        })
        .collect();

    let mut checker = Checker {
        api,
        entity,
        mod_name,
        file_entity_type,
        helper_sigs,
        globals: GlobalsLayout::default(),
        locals: Vec::new(),
        local_index: HashMap::new(),
        fn_return_type: Type::Void,
        fn_return_type_name: String::new(),
        current_fn_name: String::new(),
        calls_helper_fn: false,
        contains_while_loop: false,
    };

    checker.fill_global_variables(&mut ast.globals)?;
    checker.fill_on_fns(&mut ast.on_fns)?;
    checker.fill_helper_fns(&mut ast.helper_fns)?;

    Ok(checker.globals)
}

impl<'a> Checker<'a> {
    // ---- Variables ----

    fn get_local(&self, name: &str) -> Option<&LocalVar> {
        let indices = self.local_index.get(name)?;
        // A name can be declared again after the scope holding the earlier
        // declaration was exited, so walk from the most recent one.
        indices
            .iter()
            .rev()
            .map(|&i| &self.locals[i])
            .find(|v| v.reachable)
    }

    fn add_local(&mut self, name: &str, ty: Type, type_name: &str) -> Result<()> {
        ensure!(
            self.get_local(name).is_none(),
            "The local variable '{}' shadows an earlier local variable with the same name, so change the name of one of them",
            name
        );
        ensure!(
            self.globals.get(name).is_none(),
            "The local variable '{}' shadows an earlier global variable with the same name, so change the name of one of them",
            name
        );
        self.local_index
            .entry(name.to_string())
            .or_default()
            .push(self.locals.len());
        self.locals.push(LocalVar {
            ty,
            type_name: type_name.to_string(),
            reachable: true,
        });
        Ok(())
    }

    fn reset_locals(&mut self, params: &[FnParam]) -> Result<()> {
        self.locals.clear();
        self.local_index.clear();
        for param in params {
            self.add_local(&param.name, param.ty, &param.type_name)?;
        }
        Ok(())
    }

    /// Leaving a scope makes the variables it declared unreachable, so a
    /// later scope may reuse their names.
    fn mark_scope_unreachable(&mut self, body: &[Statement]) {
        for statement in body {
            if let Statement::Variable(var) = statement
                && var.declared_type.is_some()
            {
                if let Some(indices) = self.local_index.get(&var.name) {
                    for &i in indices.iter().rev() {
                        if self.locals[i].reachable {
                            self.locals[i].reachable = false;
                            break;
                        }
                    }
                }
            }
        }
    }

    // ---- Expressions ----

    fn fill_expr(&mut self, expr: &mut Expr) -> Result<()> {
        match &mut expr.kind {
            ExprKind::True | ExprKind::False => {
                expr.result_type = Type::Bool;
                expr.result_type_name = "bool".to_string();
            }
            ExprKind::StringLit(_) => {
                expr.result_type = Type::String;
                expr.result_type_name = "string".to_string();
            }
            ExprKind::Resource(_) | ExprKind::EntityRef(_) => {
                bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
            }
            ExprKind::Identifier(name) => {
                let (ty, type_name) = match self.get_local(name) {
                    Some(var) => (var.ty, var.type_name.clone()),
                    None => match self.globals.get(name) {
                        Some(var) => (var.ty, var.type_name.clone()),
                        None => bail!("The variable '{}' does not exist", name),
                    },
                };
                expr.result_type = ty;
                expr.result_type_name = type_name;
            }
            ExprKind::I32(_) => {
                expr.result_type = Type::I32;
                expr.result_type_name = "i32".to_string();
            }
            ExprKind::F32 { .. } => {
                expr.result_type = Type::F32;
                expr.result_type_name = "f32".to_string();
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                if let ExprKind::Unary { op: inner_op, .. } = &operand.kind {
                    ensure!(
                        op != *inner_op,
                        "Found '{}' directly next to another '{}', which can be simplified by just removing both of them",
                        op.symbol(),
                        inner_op.symbol()
                    );
                }

                self.fill_expr(operand)?;
                expr.result_type = operand.result_type;
                expr.result_type_name = operand.result_type_name.clone();

                match op {
                    UnaryOp::Not => ensure!(
                        expr.result_type == Type::Bool,
                        "Found 'not' before {}, but it can only be put before a bool",
                        expr.result_type_name
                    ),
                    UnaryOp::Neg => ensure!(
                        expr.result_type == Type::I32 || expr.result_type == Type::F32,
                        "Found '-' before {}, but it can only be put before an i32 or f32",
                        expr.result_type_name
                    ),
                }
            }
            ExprKind::Binary { .. } => self.fill_binary_expr(expr)?,
            ExprKind::Logical { .. } => self.fill_logical_expr(expr)?,
            ExprKind::Call { .. } => self.fill_call_expr(expr)?,
            ExprKind::Parenthesized(inner) => {
                self.fill_expr(inner)?;
                expr.result_type = inner.result_type;
                expr.result_type_name = inner.result_type_name.clone();
            }
        }
        Ok(())
    }

    fn check_operand_types(
        &self,
        symbol: &str,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<()> {
        if lhs.result_type == Type::String {
            ensure!(
                symbol == "==" || symbol == "!=",
                "You can't use the {} operator on a string",
                symbol
            );
        }

        let id = lhs.result_type_name == "id" || rhs.result_type_name == "id";
        if !id
            && is_wrong_type(
                lhs.result_type,
                rhs.result_type,
                &lhs.result_type_name,
                &rhs.result_type_name,
            )
        {
            bail!(
                "The left and right operand of a binary expression ('{}') must have the same type, but got {} and {}",
                symbol,
                lhs.result_type_name,
                rhs.result_type_name
            );
        }
        Ok(())
    }

    fn fill_binary_expr(&mut self, expr: &mut Expr) -> Result<()> {
        let ExprKind::Binary { op, lhs, rhs } = &mut expr.kind else {
            unreachable!("fill_binary_expr only sees binary expressions");
        };
        let op = *op;

        self.fill_expr(lhs)?;
        self.fill_expr(rhs)?;
        self.check_operand_types(op.symbol(), lhs, rhs)?;

        if op.is_equality() {
            expr.result_type = Type::Bool;
            expr.result_type_name = "bool".to_string();
        } else if op.is_comparison() {
            ensure!(
                lhs.result_type == Type::I32 || lhs.result_type == Type::F32,
                "'{}' operator expects i32 or f32",
                op.symbol()
            );
            expr.result_type = Type::Bool;
            expr.result_type_name = "bool".to_string();
        } else if op == BinaryOp::Rem {
            ensure!(lhs.result_type == Type::I32, "'%' operator expects i32");
            expr.result_type = Type::I32;
            expr.result_type_name = "i32".to_string();
        } else {
            ensure!(
                lhs.result_type == Type::I32 || lhs.result_type == Type::F32,
                "'{}' operator expects i32 or f32",
                op.symbol()
            );
            expr.result_type = lhs.result_type;
            expr.result_type_name = lhs.result_type_name.clone();
        }
        Ok(())
    }

    fn fill_logical_expr(&mut self, expr: &mut Expr) -> Result<()> {
        let ExprKind::Logical { op, lhs, rhs } = &mut expr.kind else {
            unreachable!("fill_logical_expr only sees logical expressions");
        };
        let op = *op;

        self.fill_expr(lhs)?;
        self.fill_expr(rhs)?;
        self.check_operand_types(op.symbol(), lhs, rhs)?;

        ensure!(
            lhs.result_type == Type::Bool,
            "'{}' operator expects bool",
            op.symbol()
        );
        expr.result_type = Type::Bool;
        expr.result_type_name = "bool".to_string();
        Ok(())
    }

    fn check_arguments(&self, name: &str, params: &[ParamSpec], args: &mut [Expr]) -> Result<()> {
        if args.len() < params.len() {
            let missing = &params[args.len()];
            bail!(
                "Function call '{}' expected the argument '{}' with type {}",
                name,
                missing.name,
                missing.type_name
            );
        }
        if args.len() > params.len() {
            bail!(
                "Function call '{}' got an unexpected extra argument with type {}",
                name,
                args[params.len()].result_type_name
            );
        }

        for (arg, param) in args.iter_mut().zip(params) {
            if let ExprKind::StringLit(s) = &arg.kind {
                if param.ty == Type::Resource {
                    let extension = param.resource_extension.unwrap_or_default();
                    validate_resource_string(s, extension)?;
                    arg.kind = ExprKind::Resource(s.clone());
                    arg.result_type = Type::Resource;
                    arg.result_type_name = "resource".to_string();
                } else if param.ty == Type::Entity {
                    validate_entity_string(s, self.mod_name)?;
                    arg.kind = ExprKind::EntityRef(s.clone());
                    arg.result_type = Type::Entity;
                    arg.result_type_name = "entity".to_string();
                }
            }

            ensure!(
                arg.result_type != Type::Void,
                "Function call '{}' expected the type {} for argument '{}', but got a function call that doesn't return anything",
                name,
                param.type_name,
                param.name
            );

            if param.type_name != "id"
                && is_wrong_type(arg.result_type, param.ty, &arg.result_type_name, param.type_name)
            {
                bail!(
                    "Function call '{}' expected the type {} for argument '{}', but got {}",
                    name,
                    param.type_name,
                    param.name,
                    arg.result_type_name
                );
            }
        }
        Ok(())
    }

    fn fill_call_expr(&mut self, expr: &mut Expr) -> Result<()> {
        let ExprKind::Call { name, args } = &mut expr.kind else {
            unreachable!("fill_call_expr only sees call expressions");
        };
        let name = name.clone();

        for arg in args.iter_mut() {
            self.fill_expr(arg)?;
        }

        if name.starts_with("helper_") {
            self.calls_helper_fn = true;
        }

        if let Some(sig) = self.helper_sigs.get(&name) {
            expr.result_type = sig.return_type;
            expr.result_type_name = sig.return_type_name.clone().unwrap_or_default();

            let sig = sig.clone();
            let params: Vec<ParamSpec> = sig.params.iter().map(ParamSpec::from).collect();
            let ExprKind::Call { args, .. } = &mut expr.kind else { unreachable!() };
            return self.check_arguments(&name, &params, args);
        }

        if let Some(game_fn) = self.api.game_fn(&name) {
            expr.result_type = game_fn.return_type;
            expr.result_type_name = game_fn.return_type_name.clone();

            let params: Vec<ParamSpec> = game_fn.params.iter().map(ParamSpec::from).collect();
            let ExprKind::Call { args, .. } = &mut expr.kind else { unreachable!() };
            return self.check_arguments(&name, &params, args);
        }

        if name.starts_with("on_") {
            bail!("Mods aren't allowed to call their own on_ functions, but '{}' was called", name);
        }
        bail!("The function '{}' does not exist", name);
    }

    // ---- Statements ----

    fn fill_variable_statement(&mut self, var: &mut VariableStatement) -> Result<()> {
        // This has to happen before the add_local below, because
        // `a: i32 = a` should throw
        self.fill_expr(&mut var.value)?;

        let existing = self
            .get_local(&var.name)
            .map(|v| (v.ty, v.type_name.clone()))
            .or_else(|| self.globals.get(&var.name).map(|v| (v.ty, v.type_name.clone())));

        if let Some((ty, type_name)) = &var.declared_type {
            ensure!(existing.is_none(), "The variable '{}' already exists", var.name);

            if type_name != "id"
                && is_wrong_type(*ty, var.value.result_type, type_name, &var.value.result_type_name)
            {
                bail!(
                    "Can't assign {} to '{}', which has type {}",
                    var.value.result_type_name,
                    var.name,
                    type_name
                );
            }

            let (ty, type_name) = (*ty, type_name.clone());
            self.add_local(&var.name, ty, &type_name)?;
        } else {
            let Some((ty, type_name)) = existing else {
                bail!("Can't assign to the variable '{}', since it does not exist", var.name);
            };

            if type_name != "id"
                && is_wrong_type(ty, var.value.result_type, &type_name, &var.value.result_type_name)
            {
                bail!(
                    "Can't assign {} to '{}', which has type {}",
                    var.value.result_type_name,
                    var.name,
                    type_name
                );
            }
        }
        Ok(())
    }

    fn fill_statements(&mut self, body: &mut [Statement]) -> Result<()> {
        for statement in body.iter_mut() {
            match statement {
                Statement::Variable(var) => self.fill_variable_statement(var)?,
                Statement::Call(expr) => self.fill_call_expr(expr)?,
                Statement::If { condition, then_body, else_body } => {
                    self.fill_expr(condition)?;
                    self.fill_statements(then_body)?;
                    if !else_body.is_empty() {
                        self.fill_statements(else_body)?;
                    }
                }
                Statement::Return(value) => match value {
                    Some(value) => {
                        self.fill_expr(value)?;
                        ensure!(
                            self.fn_return_type != Type::Void,
                            "Function '{}' wasn't supposed to return any value",
                            self.current_fn_name
                        );
                        if self.fn_return_type_name != "id"
                            && is_wrong_type(
                                value.result_type,
                                self.fn_return_type,
                                &value.result_type_name,
                                &self.fn_return_type_name,
                            )
                        {
                            bail!(
                                "Function '{}' is supposed to return {}, not {}",
                                self.current_fn_name,
                                self.fn_return_type_name,
                                value.result_type_name
                            );
                        }
                    }
                    None => ensure!(
                        self.fn_return_type == Type::Void,
                        "Function '{}' is supposed to return a value of type {}",
                        self.current_fn_name,
                        self.fn_return_type_name
                    ),
                },
                Statement::While { condition, body } => {
                    self.fill_expr(condition)?;
                    self.fill_statements(body)?;
                    self.contains_while_loop = true;
                }
                Statement::Break
                | Statement::Continue
                | Statement::EmptyLine
                | Statement::Comment(_) => {}
            }
        }

        let body: &[Statement] = body;
        self.mark_scope_unreachable(body);
        Ok(())
    }

    // ---- Top-level fills ----

    /// The initializer of a global may call game functions, but never
    /// helper or on_ functions (the globals block is built before any mod
    /// code has run).
    fn check_global_expr(&self, expr: &Expr, name: &str) -> Result<()> {
        match &expr.kind {
            ExprKind::True
            | ExprKind::False
            | ExprKind::StringLit(_)
            | ExprKind::I32(_)
            | ExprKind::F32 { .. }
            | ExprKind::Identifier(_) => Ok(()),
            ExprKind::Resource(_) | ExprKind::EntityRef(_) => {
                bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!")
            }
            ExprKind::Unary { operand, .. } => self.check_global_expr(operand, name),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
                self.check_global_expr(lhs, name)?;
                self.check_global_expr(rhs, name)
            }
            ExprKind::Call { name: fn_name, args } => {
                ensure!(
                    !fn_name.starts_with("helper_"),
                    "The global variable '{}' isn't allowed to call helper functions",
                    name
                );
                for arg in args {
                    self.check_global_expr(arg, name)?;
                }
                Ok(())
            }
            ExprKind::Parenthesized(inner) => self.check_global_expr(inner, name),
        }
    }

    fn fill_global_variables(&mut self, globals: &mut [GlobalVariable]) -> Result<()> {
        self.globals.add("me", Type::Id, self.file_entity_type)?;

        for global in globals.iter_mut() {
            self.check_global_expr(&global.value, &global.name)?;
            self.fill_expr(&mut global.value)?;

            if let ExprKind::Identifier(id) = &global.value.kind {
                ensure!(id != "me", "Global variables can't be assigned 'me'");
            }

            if global.type_name != "id"
                && is_wrong_type(
                    global.ty,
                    global.value.result_type,
                    &global.type_name,
                    &global.value.result_type_name,
                )
            {
                bail!(
                    "Can't assign {} to '{}', which has type {}",
                    global.value.result_type_name,
                    global.name,
                    global.type_name
                );
            }

            self.globals.add(&global.name, global.ty, &global.type_name)?;
        }
        Ok(())
    }

    fn fill_on_fns(&mut self, on_fns: &mut [OnFn]) -> Result<()> {
        for fn_ in on_fns.iter_mut() {
            self.fn_return_type = Type::Void;
            self.fn_return_type_name = String::new();
            self.current_fn_name = fn_.name.clone();

            let Some((_, declared)) = self.entity.on_fn(&fn_.name) else {
                bail!(
                    "The function '{}' was not declared by entity '{}' in mod_api.json",
                    fn_.name,
                    self.file_entity_type
                );
            };

            if fn_.params.len() < declared.params.len() {
                let missing = &declared.params[fn_.params.len()];
                bail!(
                    "Function '{}' expected the parameter '{}' with type {}",
                    fn_.name,
                    missing.name,
                    missing.type_name
                );
            }
            if fn_.params.len() > declared.params.len() {
                let extra = &fn_.params[declared.params.len()];
                bail!(
                    "Function '{}' got an unexpected extra parameter '{}' with type {}",
                    fn_.name,
                    extra.name,
                    extra.type_name
                );
            }
            for (param, declared_param) in fn_.params.iter().zip(&declared.params) {
                ensure!(
                    param.name == declared_param.name,
                    "Function '{}' its '{}' parameter was supposed to be named '{}'",
                    fn_.name,
                    param.name,
                    declared_param.name
                );
                if is_wrong_type(
                    param.ty,
                    declared_param.ty,
                    &param.type_name,
                    &declared_param.type_name,
                ) {
                    bail!(
                        "Function '{}' its '{}' parameter was supposed to have the type {}, but got {}",
                        fn_.name,
                        declared_param.name,
                        declared_param.type_name,
                        param.type_name
                    );
                }
            }

            self.reset_locals(&fn_.params)?;
            self.calls_helper_fn = false;
            self.contains_while_loop = false;
            self.fill_statements(&mut fn_.body)?;
            fn_.calls_helper_fn = self.calls_helper_fn;
            fn_.contains_while_loop = self.contains_while_loop;
        }
        Ok(())
    }

    fn fill_helper_fns(&mut self, helper_fns: &mut [HelperFn]) -> Result<()> {
        for fn_ in helper_fns.iter_mut() {
            self.fn_return_type = fn_.return_type;
            self.fn_return_type_name = fn_.return_type_name.clone().unwrap_or_default();
            self.current_fn_name = fn_.name.clone();

            self.reset_locals(&fn_.params)?;
            self.fill_statements(&mut fn_.body)?;

            // A declared return type means the last line must be a return;
            // returns in the middle were already checked above.
            if fn_.return_type != Type::Void {
                let returns_last = matches!(fn_.body.last(), Some(Statement::Return(_)));
                ensure!(
                    returns_last,
                    "Function '{}' is supposed to return {} as its last line",
                    fn_.name,
                    self.fn_return_type_name
                );
            }
        }
        Ok(())
    }
}

/// Resource paths are relative, forward-slashed, free of `.`/`..`
/// components, and must carry the declared extension.
pub fn validate_resource_string(string: &str, resource_extension: &str) -> Result<()> {
    ensure!(!string.is_empty(), "Resources can't be empty strings");
    ensure!(
        !string.starts_with('/'),
        "Remove the leading slash from the resource \"{}\"",
        string
    );
    ensure!(
        !string.ends_with('/'),
        "Remove the trailing slash from the resource \"{}\"",
        string
    );
    ensure!(
        !string.contains('\\'),
        "Replace the '\\' with '/' in the resource \"{}\"",
        string
    );
    ensure!(
        !string.contains("//"),
        "Replace the '//' with '/' in the resource \"{}\"",
        string
    );

    for component in string.split('/') {
        ensure!(component != ".", "Remove the '.' from the resource \"{}\"", string);
        ensure!(component != "..", "Remove the '..' from the resource \"{}\"", string);
    }

    ensure!(
        string.ends_with(resource_extension),
        "The resource '{}' was supposed to have the extension '{}'",
        string,
        resource_extension
    );
    Ok(())
}

fn is_entity_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
}

/// Entity references are `entityname` or `modname:entityname`, both parts
/// lowercase/digits/underscores/dashes. Naming the current mod explicitly
/// is rejected, since a bare name already means "this mod".
pub fn validate_entity_string(string: &str, current_mod: &str) -> Result<()> {
    ensure!(!string.is_empty(), "Entities can't be empty strings");

    let (mod_name, entity_name) = match string.split_once(':') {
        Some((mod_name, entity_name)) => {
            ensure!(!mod_name.is_empty(), "Entity '{}' is missing a mod name", string);
            ensure!(
                !entity_name.is_empty(),
                "Entity '{}' specifies the mod name '{}', but it is missing an entity name after the ':'",
                string,
                mod_name
            );
            ensure!(
                mod_name != current_mod,
                "Entity '{}' its mod name '{}' is invalid, since the file it is in refers to its own mod; just change it to '{}'",
                string,
                mod_name,
                entity_name
            );
            (mod_name, entity_name)
        }
        None => (current_mod, string),
    };

    for c in mod_name.chars() {
        ensure!(
            is_entity_char(c),
            "Entity '{}' its mod name contains the invalid character '{}'",
            string,
            c
        );
    }
    for c in entity_name.chars() {
        ensure!(
            is_entity_char(c),
            "Entity '{}' its entity name contains the invalid character '{}'",
            string,
            c
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::parse_json;
    use crate::parser::parse;

    fn test_api() -> ModApi {
        ModApi::from_tree(
            &parse_json(
                r#"{
                    "entities": {
                        "Greeter": {
                            "description": "says hi",
                            "on_functions": {
                                "on_start": {"description": "called once"},
                                "on_tick": {
                                    "description": "called per frame",
                                    "arguments": [{"name": "dt", "type": "f32"}]
                                }
                            }
                        },
                        "Weapon": {"description": "stabs"}
                    },
                    "game_functions": {
                        "play": {
                            "description": "play a sound",
                            "arguments": [
                                {"name": "path", "type": "resource", "resource_extension": ".wav"}
                            ]
                        },
                        "equip": {
                            "description": "equip an entity",
                            "arguments": [
                                {"name": "what", "type": "entity", "entity_type": "Weapon"}
                            ]
                        },
                        "rand": {
                            "description": "random i32",
                            "return_type": "i32",
                            "arguments": [
                                {"name": "min", "type": "i32"},
                                {"name": "max", "type": "i32"}
                            ]
                        },
                        "opponent": {"description": "who we fight", "return_type": "Human"},
                        "noop": {"description": "does nothing"}
                    }
                }"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn check(source: &str) -> Result<(GrugFileAst, GlobalsLayout)> {
        let api = test_api();
        let mut ast = parse(source)?;
        let layout = fill_result_types(&mut ast, &api, "guns", "Greeter")?;
        Ok((ast, layout))
    }

    #[test]
    fn test_me_occupies_offset_zero() {
        let (_, layout) = check("on_start() {\n    noop()\n}\n").unwrap();
        let me = layout.get("me").unwrap();
        assert_eq!(me.offset, 0);
        assert_eq!(me.ty, Type::Id);
        assert_eq!(me.type_name, "Greeter");
        assert_eq!(layout.total_bytes, 8);
    }

    #[test]
    fn test_globals_layout_offsets() {
        let source = "flag: bool = true\ncount: i32 = 0\nspeed: f32 = 1.5\n\non_start() {\n    noop()\n}\n";
        let (_, layout) = check(source).unwrap();
        assert_eq!(layout.get("flag").unwrap().offset, 8);
        assert_eq!(layout.get("count").unwrap().offset, 9);
        assert_eq!(layout.get("speed").unwrap().offset, 13);
        assert_eq!(layout.total_bytes, 17);
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let api = test_api();
        let mut ast = parse("on_start() {\n    noop()\n}\n").unwrap();
        let err = fill_result_types(&mut ast, &api, "guns", "Villain").unwrap_err();
        assert!(err.msg.contains("was not declared by mod_api.json"), "{}", err.msg);
    }

    #[test]
    fn test_unknown_on_fn_rejected() {
        let err = check("on_explode() {\n    noop()\n}\n").unwrap_err();
        assert!(err.msg.contains("was not declared by entity 'Greeter'"), "{}", err.msg);
    }

    #[test]
    fn test_on_fn_param_name_checked() {
        let err = check("on_tick(delta: f32) {\n    noop()\n}\n").unwrap_err();
        assert!(err.msg.contains("supposed to be named 'dt'"), "{}", err.msg);
    }

    #[test]
    fn test_on_fn_param_type_checked() {
        let err = check("on_tick(dt: i32) {\n    noop()\n}\n").unwrap_err();
        assert!(err.msg.contains("supposed to have the type f32"), "{}", err.msg);
    }

    #[test]
    fn test_arith_requires_matching_types() {
        let err = check("on_start() {\n    x: i32 = 1 + 1.5\n}\n").unwrap_err();
        assert!(err.msg.contains("must have the same type"), "{}", err.msg);
    }

    #[test]
    fn test_remainder_requires_i32() {
        let err = check("on_start() {\n    x: f32 = 1.5 % 2.5\n}\n").unwrap_err();
        assert!(err.msg.contains("'%' operator expects i32"), "{}", err.msg);
    }

    #[test]
    fn test_string_only_admits_equality() {
        let err = check("on_start() {\n    x: bool = \"a\" < \"b\"\n}\n").unwrap_err();
        assert!(err.msg.contains("can't use the < operator on a string"), "{}", err.msg);

        let (ast, _) = check("on_start() {\n    x: bool = \"a\" == \"b\"\n}\n").unwrap();
        let Statement::Variable(var) = &ast.on_fns[0].body[0] else { panic!() };
        assert_eq!(var.value.result_type, Type::Bool);
    }

    #[test]
    fn test_shadowing_rejected() {
        let err = check("on_start() {\n    x: i32 = 1\n    x: i32 = 2\n}\n").unwrap_err();
        assert!(err.msg.contains("already exists"), "{}", err.msg);
    }

    #[test]
    fn test_scope_exit_allows_name_reuse() {
        let source = concat!(
            "on_start() {\n",
            "    if true {\n",
            "        x: i32 = 1\n",
            "    }\n",
            "    x: i32 = 2\n",
            "}\n",
        );
        assert!(check(source).is_ok());
    }

    #[test]
    fn test_self_reference_in_declaration_rejected() {
        let err = check("on_start() {\n    a: i32 = a\n}\n").unwrap_err();
        assert!(err.msg.contains("does not exist"), "{}", err.msg);
    }

    #[test]
    fn test_resource_literal_reclassified() {
        let (ast, _) = check("on_start() {\n    play(\"sounds/hi.wav\")\n}\n").unwrap();
        let Statement::Call(call) = &ast.on_fns[0].body[0] else { panic!() };
        let ExprKind::Call { args, .. } = &call.kind else { panic!() };
        assert!(matches!(&args[0].kind, ExprKind::Resource(s) if s == "sounds/hi.wav"));
        assert_eq!(args[0].result_type, Type::Resource);
    }

    #[test]
    fn test_resource_extension_enforced() {
        let err = check("on_start() {\n    play(\"sounds/hi.ogg\")\n}\n").unwrap_err();
        assert!(err.msg.contains("supposed to have the extension '.wav'"), "{}", err.msg);
    }

    #[test]
    fn test_entity_literal_reclassified() {
        let (ast, _) = check("on_start() {\n    equip(\"swords:katana\")\n}\n").unwrap();
        let Statement::Call(call) = &ast.on_fns[0].body[0] else { panic!() };
        let ExprKind::Call { args, .. } = &call.kind else { panic!() };
        assert!(matches!(&args[0].kind, ExprKind::EntityRef(s) if s == "swords:katana"));
    }

    #[test]
    fn test_entity_naming_own_mod_rejected() {
        let err = check("on_start() {\n    equip(\"guns:pistol\")\n}\n").unwrap_err();
        assert!(err.msg.contains("just change it to 'pistol'"), "{}", err.msg);
    }

    #[test]
    fn test_custom_id_return_type_flows() {
        let source = "on_start() {\n    who: Human = opponent()\n}\n";
        let (ast, _) = check(source).unwrap();
        let Statement::Variable(var) = &ast.on_fns[0].body[0] else { panic!() };
        assert_eq!(var.value.result_type, Type::Id);
        assert_eq!(var.value.result_type_name, "Human");
    }

    #[test]
    fn test_plain_id_matches_any_id_type() {
        let source = "on_start() {\n    who: id = opponent()\n}\n";
        assert!(check(source).is_ok());
    }

    #[test]
    fn test_mismatched_custom_ids_rejected() {
        let source = "on_start() {\n    who: Weapon = opponent()\n}\n";
        let err = check(source).unwrap_err();
        assert!(err.msg.contains("has type Weapon"), "{}", err.msg);
    }

    #[test]
    fn test_void_call_as_argument_rejected() {
        let err = check("on_start() {\n    x: i32 = rand(noop(), 1)\n}\n").unwrap_err();
        assert!(err.msg.contains("doesn't return anything"), "{}", err.msg);
    }

    #[test]
    fn test_on_fn_call_from_mod_rejected() {
        let err = check("on_start() {\n    on_tick(1.5)\n}\n").unwrap_err();
        assert!(err.msg.contains("aren't allowed to call their own on_ functions"), "{}", err.msg);
    }

    #[test]
    fn test_global_cannot_call_helper() {
        let source = "x: i32 = helper_f()\n\non_start() {\n    helper_f()\n}\n\nhelper_f() i32 {\n    return 1\n}\n";
        let err = check(source).unwrap_err();
        assert!(err.msg.contains("isn't allowed to call helper functions"), "{}", err.msg);
    }

    #[test]
    fn test_global_can_call_game_fn() {
        let source = "x: i32 = rand(1, 2)\n\non_start() {\n    noop()\n}\n";
        assert!(check(source).is_ok());
    }

    #[test]
    fn test_global_cannot_be_me() {
        let source = "x: id = me\n\non_start() {\n    noop()\n}\n";
        let err = check(source).unwrap_err();
        assert!(err.msg.contains("can't be assigned 'me'"), "{}", err.msg);
    }

    #[test]
    fn test_helper_flags_recorded() {
        let source = concat!(
            "on_start() {\n",
            "    helper_f()\n",
            "}\n",
            "\n",
            "on_tick(dt: f32) {\n",
            "    while false {\n",
            "        noop()\n",
            "    }\n",
            "}\n",
            "\n",
            "helper_f() {\n",
            "    noop()\n",
            "}\n",
        );
        let (ast, _) = check(source).unwrap();
        assert!(ast.on_fns[0].calls_helper_fn);
        assert!(!ast.on_fns[0].contains_while_loop);
        assert!(!ast.on_fns[1].calls_helper_fn);
        assert!(ast.on_fns[1].contains_while_loop);
    }

    #[test]
    fn test_helper_missing_final_return_rejected() {
        let source = concat!(
            "on_start() {\n",
            "    x: i32 = helper_f()\n",
            "}\n",
            "\n",
            "helper_f() i32 {\n",
            "    noop()\n",
            "}\n",
        );
        let err = check(source).unwrap_err();
        assert!(err.msg.contains("as its last line"), "{}", err.msg);
    }

    #[test]
    fn test_double_negation_rejected() {
        let err = check("on_start() {\n    x: i32 = - -1\n}\n").unwrap_err();
        assert!(err.msg.contains("can be simplified"), "{}", err.msg);
    }

    #[test]
    fn test_validate_resource_string_rules() {
        assert!(validate_resource_string("a.wav", ".wav").is_ok());
        assert!(validate_resource_string("dir/a.wav", ".wav").is_ok());
        assert!(validate_resource_string("", ".wav").is_err());
        assert!(validate_resource_string("/a.wav", ".wav").is_err());
        assert!(validate_resource_string("a.wav/", ".wav").is_err());
        assert!(validate_resource_string("a\\b.wav", ".wav").is_err());
        assert!(validate_resource_string("a//b.wav", ".wav").is_err());
        assert!(validate_resource_string("./a.wav", ".wav").is_err());
        assert!(validate_resource_string("../a.wav", ".wav").is_err());
        assert!(validate_resource_string("x/../a.wav", ".wav").is_err());
        assert!(validate_resource_string("a.ogg", ".wav").is_err());
    }

    #[test]
    fn test_validate_entity_string_rules() {
        assert!(validate_entity_string("knife", "guns").is_ok());
        assert!(validate_entity_string("swords:katana", "guns").is_ok());
        assert!(validate_entity_string("", "guns").is_err());
        assert!(validate_entity_string(":katana", "guns").is_err());
        assert!(validate_entity_string("swords:", "guns").is_err());
        assert!(validate_entity_string("guns:pistol", "guns").is_err());
        assert!(validate_entity_string("Swords:katana", "guns").is_err());
        assert!(validate_entity_string("swords:Katana", "guns").is_err());
    }
}
