//! AST → source text.
//!
//! The grammar pins down every spacing decision (one space around binary
//! operators, 4-space indentation, ` {` block openers, one blank line
//! between top-level items), and the AST keeps comments, empty lines, and
//! the original spelling of f32 literals. Dumping a parsed file therefore
//! reproduces it byte for byte: `dump(&parse(s)?) == s` for every accepted
//! `s`.
//!
//! This is what external tooling builds on to rewrite mods mechanically,
//! e.g. renaming a game function call across a whole mods directory.

use crate::ast::*;

pub fn dump(ast: &GrugFileAst) -> String {
    let mut out = String::new();

    for item in &ast.layout {
        match item {
            TopLevel::GlobalVariable(i) => {
                let global = &ast.globals[*i];
                out.push_str(&global.name);
                out.push_str(": ");
                out.push_str(&global.type_name);
                out.push_str(" = ");
                dump_expr(&global.value, &mut out);
                out.push('\n');
            }
            TopLevel::OnFn(i) => {
                let fn_ = &ast.on_fns[*i];
                out.push_str(&fn_.name);
                dump_params(&fn_.params, &mut out);
                dump_block(&fn_.body, 1, &mut out);
                out.push('\n');
            }
            TopLevel::HelperFn(i) => {
                let fn_ = &ast.helper_fns[*i];
                out.push_str(&fn_.name);
                dump_params(&fn_.params, &mut out);
                if let Some(return_type_name) = &fn_.return_type_name {
                    out.push(' ');
                    out.push_str(return_type_name);
                }
                dump_block(&fn_.body, 1, &mut out);
                out.push('\n');
            }
            TopLevel::EmptyLine => out.push('\n'),
            TopLevel::Comment(text) => {
                out.push_str("# ");
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    out
}

fn dump_params(params: &[FnParam], out: &mut String) {
    out.push('(');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&param.name);
        out.push_str(": ");
        out.push_str(&param.type_name);
    }
    out.push(')');
}

/// ` {`, the statements at `depth * 4` spaces, and `}` at the enclosing
/// indentation. Leaves the cursor after the closing brace.
fn dump_block(body: &[Statement], depth: usize, out: &mut String) {
    out.push_str(" {\n");
    for statement in body {
        dump_statement(statement, depth, out);
    }
    for _ in 0..(depth - 1) * 4 {
        out.push(' ');
    }
    out.push('}');
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth * 4 {
        out.push(' ');
    }
}

fn dump_statement(statement: &Statement, depth: usize, out: &mut String) {
    match statement {
        Statement::EmptyLine => {
            out.push('\n');
            return;
        }
        _ => indent(depth, out),
    }

    match statement {
        Statement::Variable(var) => {
            out.push_str(&var.name);
            if let Some((_, type_name)) = &var.declared_type {
                out.push_str(": ");
                out.push_str(type_name);
            }
            out.push_str(" = ");
            dump_expr(&var.value, out);
        }
        Statement::Call(expr) => dump_expr(expr, out),
        Statement::If { condition, then_body, else_body } => {
            out.push_str("if ");
            dump_if(condition, then_body, else_body, depth, out);
        }
        Statement::Return(value) => {
            out.push_str("return");
            if let Some(value) = value {
                out.push(' ');
                dump_expr(value, out);
            }
        }
        Statement::While { condition, body } => {
            out.push_str("while ");
            dump_expr(condition, out);
            dump_block(body, depth + 1, out);
        }
        Statement::Break => out.push_str("break"),
        Statement::Continue => out.push_str("continue"),
        Statement::Comment(text) => {
            out.push_str("# ");
            out.push_str(text);
        }
        Statement::EmptyLine => unreachable!("handled above"),
    }
    out.push('\n');
}

fn dump_if(
    condition: &Expr,
    then_body: &[Statement],
    else_body: &[Statement],
    depth: usize,
    out: &mut String,
) {
    dump_expr(condition, out);
    dump_block(then_body, depth + 1, out);

    if else_body.is_empty() {
        return;
    }

    // An else-if chain is one nested If statement
    if let [Statement::If { condition, then_body, else_body }] = else_body {
        out.push_str(" else if ");
        dump_if(condition, then_body, else_body, depth, out);
    } else {
        out.push_str(" else");
        dump_block(else_body, depth + 1, out);
    }
}

fn dump_expr(expr: &Expr, out: &mut String) {
    match &expr.kind {
        ExprKind::True => out.push_str("true"),
        ExprKind::False => out.push_str("false"),
        ExprKind::StringLit(s) | ExprKind::Resource(s) | ExprKind::EntityRef(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        ExprKind::Identifier(name) => out.push_str(name),
        ExprKind::I32(n) => out.push_str(&n.to_string()),
        ExprKind::F32 { text, .. } => out.push_str(text),
        ExprKind::Unary { op, operand } => {
            out.push_str(op.symbol());
            if *op == UnaryOp::Not {
                out.push(' ');
            }
            dump_expr(operand, out);
        }
        ExprKind::Binary { op, lhs, rhs } => {
            dump_expr(lhs, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            dump_expr(rhs, out);
        }
        ExprKind::Logical { op, lhs, rhs } => {
            dump_expr(lhs, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            dump_expr(rhs, out);
        }
        ExprKind::Call { name, args } => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                dump_expr(arg, out);
            }
            out.push(')');
        }
        ExprKind::Parenthesized(inner) => {
            out.push('(');
            dump_expr(inner, out);
            out.push(')');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn round_trip(source: &str) {
        let ast = parse(source).unwrap();
        assert_eq!(dump(&ast), source);
    }

    #[test]
    fn test_round_trip_minimal() {
        round_trip("on_start() {\n    play()\n}\n");
    }

    #[test]
    fn test_round_trip_globals_and_comments() {
        round_trip(concat!(
            "# how many times we fired\n",
            "shots: i32 = 0\n",
            "speed: f32 = 1.5\n",
            "\n",
            "on_start() {\n",
            "    # warm up\n",
            "    play()\n",
            "}\n",
        ));
    }

    #[test]
    fn test_round_trip_expressions() {
        round_trip(concat!(
            "on_start() {\n",
            "    x: i32 = 1 + 2 * (3 - -4)\n",
            "    b: bool = not x >= 5 and true or false\n",
            "    s: string = \"hello\"\n",
            "    play(x, 1.25, \"boom\")\n",
            "}\n",
        ));
    }

    #[test]
    fn test_round_trip_control_flow() {
        round_trip(concat!(
            "on_start() {\n",
            "    while x < 10 {\n",
            "        if x == 3 {\n",
            "            break\n",
            "        } else if x == 4 {\n",
            "            continue\n",
            "        } else {\n",
            "            x = x + 1\n",
            "        }\n",
            "    }\n",
            "}\n",
        ));
    }

    #[test]
    fn test_round_trip_helper_fns() {
        round_trip(concat!(
            "on_start() {\n",
            "    x: i32 = helper_add(1, 2)\n",
            "}\n",
            "\n",
            "helper_add(a: i32, b: i32) i32 {\n",
            "    return a + b\n",
            "}\n",
        ));
    }

    #[test]
    fn test_round_trip_blank_lines_in_body() {
        round_trip(concat!(
            "on_start() {\n",
            "    x: i32 = 1\n",
            "\n",
            "    x = 2\n",
            "}\n",
        ));
    }

    #[test]
    fn test_round_trip_f32_spelling() {
        round_trip("on_start() {\n    x: f32 = 1.50\n}\n");
    }
}
