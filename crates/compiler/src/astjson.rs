//! AST ↔ JSON.
//!
//! A parsed grug file serializes to a JSON document and back, losslessly:
//! comments, empty lines and f32 spellings are all part of the AST, so
//!
//! ```text
//! generate(dump_to_json(s)) == s
//! ```
//!
//! for every accepted source `s`. This is the bridge for external tooling:
//! a game can ship a migration script that reads the JSON of every mod,
//! renames a game-function call or rescales a constant, and writes the
//! mods back, without being tied to the game's release cycle.
//!
//! Every scalar is encoded as a JSON string (matching the manifest format,
//! which has no other scalar kind), and numbers keep their original
//! spelling so the round trip is exact.

use std::fs;
use std::path::Path;

use crate::ast::*;
use crate::dump;
use crate::error::{CompileError, Result, bail, ensure};
use crate::json::{self, JsonValue};
use crate::parser;

use grug_core::Type;

// ---- AST -> JSON ----

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

fn push_string(s: &str, out: &mut String) {
    out.push('"');
    escape_into(s, out);
    out.push('"');
}

fn push_field(key: &str, out: &mut String) {
    push_string(key, out);
    out.push(':');
}

fn write_expr(expr: &Expr, out: &mut String) {
    out.push('{');
    push_field("type", out);
    match &expr.kind {
        ExprKind::True => push_string("true", out),
        ExprKind::False => push_string("false", out),
        ExprKind::StringLit(s) | ExprKind::Resource(s) | ExprKind::EntityRef(s) => {
            // Reclassification is a type-propagation artifact; the JSON
            // always speaks of plain strings
            push_string("string", out);
            out.push(',');
            push_field("str", out);
            push_string(s, out);
        }
        ExprKind::Identifier(name) => {
            push_string("identifier", out);
            out.push(',');
            push_field("name", out);
            push_string(name, out);
        }
        ExprKind::I32(n) => {
            push_string("i32", out);
            out.push(',');
            push_field("value", out);
            push_string(&n.to_string(), out);
        }
        ExprKind::F32 { text, .. } => {
            push_string("f32", out);
            out.push(',');
            push_field("value", out);
            push_string(text, out);
        }
        ExprKind::Unary { op, operand } => {
            push_string("unary", out);
            out.push(',');
            push_field("operator", out);
            push_string(op.symbol(), out);
            out.push(',');
            push_field("expr", out);
            write_expr(operand, out);
        }
        ExprKind::Binary { op, lhs, rhs } => {
            push_string("binary", out);
            out.push(',');
            push_field("operator", out);
            push_string(op.symbol(), out);
            out.push(',');
            push_field("left_expr", out);
            write_expr(lhs, out);
            out.push(',');
            push_field("right_expr", out);
            write_expr(rhs, out);
        }
        ExprKind::Logical { op, lhs, rhs } => {
            push_string("logical", out);
            out.push(',');
            push_field("operator", out);
            push_string(op.symbol(), out);
            out.push(',');
            push_field("left_expr", out);
            write_expr(lhs, out);
            out.push(',');
            push_field("right_expr", out);
            write_expr(rhs, out);
        }
        ExprKind::Call { name, args } => {
            push_string("call", out);
            out.push(',');
            push_field("name", out);
            push_string(name, out);
            out.push(',');
            push_field("arguments", out);
            out.push('[');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_expr(arg, out);
            }
            out.push(']');
        }
        ExprKind::Parenthesized(inner) => {
            push_string("parenthesized", out);
            out.push(',');
            push_field("expr", out);
            write_expr(inner, out);
        }
    }
    out.push('}');
}

fn write_statement(statement: &Statement, out: &mut String) {
    out.push('{');
    push_field("type", out);
    match statement {
        Statement::Variable(var) => {
            push_string("variable", out);
            out.push(',');
            push_field("name", out);
            push_string(&var.name, out);
            if let Some((_, type_name)) = &var.declared_type {
                out.push(',');
                push_field("variable_type", out);
                push_string(type_name, out);
            }
            out.push(',');
            push_field("assignment", out);
            write_expr(&var.value, out);
        }
        Statement::Call(expr) => {
            push_string("call", out);
            out.push(',');
            push_field("expr", out);
            write_expr(expr, out);
        }
        Statement::If { condition, then_body, else_body } => {
            push_string("if", out);
            out.push(',');
            push_field("condition", out);
            write_expr(condition, out);
            out.push(',');
            push_field("if_statements", out);
            write_statements(then_body, out);
            if !else_body.is_empty() {
                out.push(',');
                push_field("else_statements", out);
                write_statements(else_body, out);
            }
        }
        Statement::Return(value) => {
            push_string("return", out);
            if let Some(value) = value {
                out.push(',');
                push_field("expr", out);
                write_expr(value, out);
            }
        }
        Statement::While { condition, body } => {
            push_string("while", out);
            out.push(',');
            push_field("condition", out);
            write_expr(condition, out);
            out.push(',');
            push_field("statements", out);
            write_statements(body, out);
        }
        Statement::Break => push_string("break", out),
        Statement::Continue => push_string("continue", out),
        Statement::EmptyLine => push_string("empty_line", out),
        Statement::Comment(text) => {
            push_string("comment", out);
            out.push(',');
            push_field("comment", out);
            push_string(text, out);
        }
    }
    out.push('}');
}

fn write_statements(body: &[Statement], out: &mut String) {
    out.push('[');
    for (i, statement) in body.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_statement(statement, out);
    }
    out.push(']');
}

fn write_params(params: &[FnParam], out: &mut String) {
    out.push('[');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('{');
        push_field("name", out);
        push_string(&param.name, out);
        out.push(',');
        push_field("type", out);
        push_string(&param.type_name, out);
        out.push('}');
    }
    out.push(']');
}

/// Serialize a parsed file to JSON text.
pub fn ast_to_json(ast: &GrugFileAst) -> String {
    let mut out = String::new();
    out.push('{');
    push_field("statements", &mut out);
    out.push('[');

    for (i, item) in ast.layout.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('{');
        push_field("type", &mut out);
        match item {
            TopLevel::GlobalVariable(index) => {
                let global = &ast.globals[*index];
                push_string("global_variable", &mut out);
                out.push(',');
                push_field("name", &mut out);
                push_string(&global.name, &mut out);
                out.push(',');
                push_field("variable_type", &mut out);
                push_string(&global.type_name, &mut out);
                out.push(',');
                push_field("assignment", &mut out);
                write_expr(&global.value, &mut out);
            }
            TopLevel::OnFn(index) => {
                let fn_ = &ast.on_fns[*index];
                push_string("on_fn", &mut out);
                out.push(',');
                push_field("name", &mut out);
                push_string(&fn_.name, &mut out);
                out.push(',');
                push_field("arguments", &mut out);
                write_params(&fn_.params, &mut out);
                out.push(',');
                push_field("statements", &mut out);
                write_statements(&fn_.body, &mut out);
            }
            TopLevel::HelperFn(index) => {
                let fn_ = &ast.helper_fns[*index];
                push_string("helper_fn", &mut out);
                out.push(',');
                push_field("name", &mut out);
                push_string(&fn_.name, &mut out);
                out.push(',');
                push_field("arguments", &mut out);
                write_params(&fn_.params, &mut out);
                if let Some(return_type_name) = &fn_.return_type_name {
                    out.push(',');
                    push_field("return_type", &mut out);
                    push_string(return_type_name, &mut out);
                }
                out.push(',');
                push_field("statements", &mut out);
                write_statements(&fn_.body, &mut out);
            }
            TopLevel::EmptyLine => push_string("empty_line", &mut out),
            TopLevel::Comment(text) => {
                push_string("comment", &mut out);
                out.push(',');
                push_field("comment", &mut out);
                push_string(text, &mut out);
            }
        }
        out.push('}');
    }

    out.push(']');
    out.push('}');
    out
}

// ---- JSON -> AST ----

fn object_field<'a>(fields: &'a [(String, JsonValue)], key: &str) -> Option<&'a JsonValue> {
    fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn required_str<'a>(fields: &'a [(String, JsonValue)], key: &str, what: &str) -> Result<&'a str> {
    match object_field(fields, key).and_then(JsonValue::as_str) {
        Some(s) => Ok(s),
        None => bail!("{} requires a \"{}\" string field", what, key),
    }
}

fn read_expr(value: &JsonValue) -> Result<Expr> {
    let Some(fields) = value.as_object() else {
        bail!("Expressions must be JSON objects");
    };
    let ty = required_str(fields, "type", "An expression")?;

    let kind = match ty {
        "true" => ExprKind::True,
        "false" => ExprKind::False,
        "string" => ExprKind::StringLit(required_str(fields, "str", "A string expression")?.to_string()),
        "identifier" => {
            ExprKind::Identifier(required_str(fields, "name", "An identifier expression")?.to_string())
        }
        "i32" => {
            let text = required_str(fields, "value", "An i32 expression")?;
            match text.parse::<i32>() {
                Ok(n) => ExprKind::I32(n),
                Err(_) => bail!("The i32 {} is malformed", text),
            }
        }
        "f32" => {
            let text = required_str(fields, "value", "An f32 expression")?;
            match text.parse::<f32>() {
                Ok(value) => ExprKind::F32 { value, text: text.to_string() },
                Err(_) => bail!("The f32 {} is malformed", text),
            }
        }
        "unary" => {
            let operator = required_str(fields, "operator", "A unary expression")?;
            let op = match operator {
                "-" => UnaryOp::Neg,
                "not" => UnaryOp::Not,
                _ => bail!("Unknown unary operator \"{}\"", operator),
            };
            let Some(operand) = object_field(fields, "expr") else {
                bail!("A unary expression requires an \"expr\" field");
            };
            ExprKind::Unary { op, operand: Box::new(read_expr(operand)?) }
        }
        "binary" => {
            let operator = required_str(fields, "operator", "A binary expression")?;
            let op = match operator {
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "%" => BinaryOp::Rem,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                _ => bail!("Unknown binary operator \"{}\"", operator),
            };
            let (Some(lhs), Some(rhs)) =
                (object_field(fields, "left_expr"), object_field(fields, "right_expr"))
            else {
                bail!("A binary expression requires \"left_expr\" and \"right_expr\" fields");
            };
            ExprKind::Binary {
                op,
                lhs: Box::new(read_expr(lhs)?),
                rhs: Box::new(read_expr(rhs)?),
            }
        }
        "logical" => {
            let operator = required_str(fields, "operator", "A logical expression")?;
            let op = match operator {
                "and" => LogicalOp::And,
                "or" => LogicalOp::Or,
                _ => bail!("Unknown logical operator \"{}\"", operator),
            };
            let (Some(lhs), Some(rhs)) =
                (object_field(fields, "left_expr"), object_field(fields, "right_expr"))
            else {
                bail!("A logical expression requires \"left_expr\" and \"right_expr\" fields");
            };
            ExprKind::Logical {
                op,
                lhs: Box::new(read_expr(lhs)?),
                rhs: Box::new(read_expr(rhs)?),
            }
        }
        "call" => {
            let name = required_str(fields, "name", "A call expression")?.to_string();
            let Some(arguments) = object_field(fields, "arguments").and_then(JsonValue::as_array)
            else {
                bail!("A call expression requires an \"arguments\" array field");
            };
            let mut args = Vec::with_capacity(arguments.len());
            for argument in arguments {
                args.push(read_expr(argument)?);
            }
            ExprKind::Call { name, args }
        }
        "parenthesized" => {
            let Some(inner) = object_field(fields, "expr") else {
                bail!("A parenthesized expression requires an \"expr\" field");
            };
            ExprKind::Parenthesized(Box::new(read_expr(inner)?))
        }
        _ => bail!("Unknown expression type \"{}\"", ty),
    };
    Ok(Expr::new(kind))
}

fn read_statements(value: &JsonValue) -> Result<Vec<Statement>> {
    let Some(values) = value.as_array() else {
        bail!("Statement lists must be JSON arrays");
    };
    let mut statements = Vec::with_capacity(values.len());
    for value in values {
        statements.push(read_statement(value)?);
    }
    Ok(statements)
}

fn read_statement(value: &JsonValue) -> Result<Statement> {
    let Some(fields) = value.as_object() else {
        bail!("Statements must be JSON objects");
    };
    let ty = required_str(fields, "type", "A statement")?;

    let statement = match ty {
        "variable" => {
            let name = required_str(fields, "name", "A variable statement")?.to_string();
            let declared_type = match object_field(fields, "variable_type") {
                Some(value) => match value.as_str() {
                    Some(type_name) => Some((Type::parse(type_name), type_name.to_string())),
                    None => bail!("\"variable_type\" must be a string"),
                },
                None => None,
            };
            let Some(assignment) = object_field(fields, "assignment") else {
                bail!("A variable statement requires an \"assignment\" field");
            };
            Statement::Variable(VariableStatement {
                name,
                declared_type,
                value: read_expr(assignment)?,
            })
        }
        "call" => {
            let Some(expr) = object_field(fields, "expr") else {
                bail!("A call statement requires an \"expr\" field");
            };
            let expr = read_expr(expr)?;
            ensure!(
                matches!(expr.kind, ExprKind::Call { .. }),
                "A call statement's \"expr\" must be a call expression"
            );
            Statement::Call(expr)
        }
        "if" => {
            let Some(condition) = object_field(fields, "condition") else {
                bail!("An if statement requires a \"condition\" field");
            };
            let Some(then_body) = object_field(fields, "if_statements") else {
                bail!("An if statement requires an \"if_statements\" field");
            };
            let else_body = match object_field(fields, "else_statements") {
                Some(value) => read_statements(value)?,
                None => Vec::new(),
            };
            Statement::If {
                condition: read_expr(condition)?,
                then_body: read_statements(then_body)?,
                else_body,
            }
        }
        "return" => match object_field(fields, "expr") {
            Some(value) => Statement::Return(Some(read_expr(value)?)),
            None => Statement::Return(None),
        },
        "while" => {
            let Some(condition) = object_field(fields, "condition") else {
                bail!("A while statement requires a \"condition\" field");
            };
            let Some(body) = object_field(fields, "statements") else {
                bail!("A while statement requires a \"statements\" field");
            };
            Statement::While {
                condition: read_expr(condition)?,
                body: read_statements(body)?,
            }
        }
        "break" => Statement::Break,
        "continue" => Statement::Continue,
        "empty_line" => Statement::EmptyLine,
        "comment" => {
            Statement::Comment(required_str(fields, "comment", "A comment statement")?.to_string())
        }
        _ => bail!("Unknown statement type \"{}\"", ty),
    };
    Ok(statement)
}

fn read_params(value: &JsonValue) -> Result<Vec<FnParam>> {
    let Some(values) = value.as_array() else {
        bail!("\"arguments\" must be a JSON array");
    };
    let mut params = Vec::with_capacity(values.len());
    for value in values {
        let Some(fields) = value.as_object() else {
            bail!("Function arguments must be JSON objects");
        };
        let name = required_str(fields, "name", "A function argument")?.to_string();
        let type_name = required_str(fields, "type", "A function argument")?.to_string();
        params.push(FnParam { name, ty: Type::parse(&type_name), type_name });
    }
    Ok(params)
}

/// Rebuild an AST from its JSON serialization.
pub fn ast_from_json(text: &str) -> Result<GrugFileAst> {
    let root = json::parse_json(text)?;
    let Some(root_fields) = root.as_object() else {
        bail!("The AST JSON's root must be an object");
    };
    let Some(statements) = object_field(root_fields, "statements").and_then(JsonValue::as_array)
    else {
        bail!("The AST JSON's root must have a \"statements\" array");
    };

    let mut ast = GrugFileAst::default();

    for value in statements {
        let Some(fields) = value.as_object() else {
            bail!("Top-level statements must be JSON objects");
        };
        let ty = required_str(fields, "type", "A top-level statement")?;

        match ty {
            "global_variable" => {
                let name = required_str(fields, "name", "A global variable")?.to_string();
                let type_name = required_str(fields, "variable_type", "A global variable")?;
                let Some(assignment) = object_field(fields, "assignment") else {
                    bail!("A global variable requires an \"assignment\" field");
                };
                ast.globals.push(GlobalVariable {
                    name,
                    ty: Type::parse(type_name),
                    type_name: type_name.to_string(),
                    value: read_expr(assignment)?,
                });
                ast.layout.push(TopLevel::GlobalVariable(ast.globals.len() - 1));
            }
            "on_fn" => {
                let name = required_str(fields, "name", "An on_ function")?.to_string();
                let params = match object_field(fields, "arguments") {
                    Some(value) => read_params(value)?,
                    None => Vec::new(),
                };
                let Some(body) = object_field(fields, "statements") else {
                    bail!("An on_ function requires a \"statements\" field");
                };
                ast.on_fns.push(OnFn {
                    name,
                    params,
                    body: read_statements(body)?,
                    calls_helper_fn: false,
                    contains_while_loop: false,
                });
                ast.layout.push(TopLevel::OnFn(ast.on_fns.len() - 1));
            }
            "helper_fn" => {
                let name = required_str(fields, "name", "A helper function")?.to_string();
                let params = match object_field(fields, "arguments") {
                    Some(value) => read_params(value)?,
                    None => Vec::new(),
                };
                let return_type_name = match object_field(fields, "return_type") {
                    Some(value) => match value.as_str() {
                        Some(s) => Some(s.to_string()),
                        None => bail!("\"return_type\" must be a string"),
                    },
                    None => None,
                };
                let return_type = return_type_name
                    .as_deref()
                    .map_or(Type::Void, Type::parse);
                let Some(body) = object_field(fields, "statements") else {
                    bail!("A helper function requires a \"statements\" field");
                };
                ast.helper_fns.push(HelperFn {
                    name,
                    params,
                    return_type,
                    return_type_name,
                    body: read_statements(body)?,
                });
                ast.layout.push(TopLevel::HelperFn(ast.helper_fns.len() - 1));
            }
            "empty_line" => ast.layout.push(TopLevel::EmptyLine),
            "comment" => {
                let text = required_str(fields, "comment", "A top-level comment")?;
                ast.layout.push(TopLevel::Comment(text.to_string()));
            }
            _ => bail!("Unknown top-level statement type \"{}\"", ty),
        }
    }

    Ok(ast)
}

// ---- File-level entry points ----

/// Parse a grug file and write its AST as JSON.
pub fn dump_file_to_json(input_grug_path: &Path, output_json_path: &Path) -> Result<()> {
    let source = fs::read_to_string(input_grug_path).map_err(|e| {
        CompileError::new(format!("{}: {}", input_grug_path.display(), e))
            .with_path(input_grug_path)
    })?;
    let ast = parser::parse(&source).map_err(|e| e.with_path(input_grug_path))?;
    fs::write(output_json_path, ast_to_json(&ast)).map_err(|e| {
        CompileError::new(format!("{}: {}", output_json_path.display(), e))
    })?;
    Ok(())
}

/// Read an AST JSON file and write it back out as grug source.
pub fn generate_file_from_json(input_json_path: &Path, output_grug_path: &Path) -> Result<()> {
    let text = fs::read_to_string(input_json_path).map_err(|e| {
        CompileError::new(format!("{}: {}", input_json_path.display(), e))
            .with_path(input_json_path)
    })?;
    let ast = ast_from_json(&text).map_err(|e| e.with_path(input_json_path))?;
    fs::write(output_grug_path, dump::dump(&ast)).map_err(|e| {
        CompileError::new(format!("{}: {}", output_grug_path.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_round_trip(source: &str) {
        let ast = parser::parse(source).unwrap();
        let json_text = ast_to_json(&ast);
        let rebuilt = ast_from_json(&json_text).unwrap();
        assert_eq!(dump::dump(&rebuilt), source, "through {}", json_text);
    }

    #[test]
    fn test_json_round_trip_minimal() {
        json_round_trip("on_start() {\n    play()\n}\n");
    }

    #[test]
    fn test_json_round_trip_full_shapes() {
        json_round_trip(concat!(
            "# global state\n",
            "count: i32 = 0\n",
            "ratio: f32 = 0.50\n",
            "\n",
            "on_tick(dt: f32) {\n",
            "    count = count + 1\n",
            "    if count >= 10 and not done {\n",
            "        play(\"boom.wav\")\n",
            "    } else if count == 5 {\n",
            "        helper_reset(-3, (count * 2))\n",
            "    } else {\n",
            "        # idle\n",
            "        done = true or false\n",
            "    }\n",
            "\n",
            "    while count != 0 {\n",
            "        count = count - 1\n",
            "        if count == 2 {\n",
            "            break\n",
            "        }\n",
            "        continue\n",
            "    }\n",
            "}\n",
            "\n",
            "helper_reset(a: i32, b: i32) i32 {\n",
            "    return a % b\n",
            "}\n",
        ));
    }

    #[test]
    fn test_json_escapes_special_characters() {
        let ast = parser::parse("on_start() {\n    log(\"a\\b\")\n}\n").unwrap();
        let json_text = ast_to_json(&ast);
        assert!(json_text.contains("a\\\\b"), "{}", json_text);
        let rebuilt = ast_from_json(&json_text).unwrap();
        assert_eq!(dump::dump(&rebuilt), "on_start() {\n    log(\"a\\b\")\n}\n");
    }

    #[test]
    fn test_json_keeps_f32_spelling() {
        let source = "on_start() {\n    set(1.250)\n}\n";
        json_round_trip(source);
    }

    #[test]
    fn test_ast_from_json_rejects_unknown_types() {
        let err = ast_from_json(r#"{"statements": [{"type": "mystery"}]}"#).unwrap_err();
        assert!(err.msg.contains("Unknown top-level statement type"), "{}", err.msg);
    }

    #[test]
    fn test_ast_from_json_rejects_call_statement_without_call() {
        let err = ast_from_json(
            r#"{"statements": [{"type": "on_fn", "name": "on_x", "arguments": [],
                "statements": [{"type": "call", "expr": {"type": "i32", "value": "1"}}]}]}"#,
        )
        .unwrap_err();
        assert!(err.msg.contains("must be a call expression"), "{}", err.msg);
    }

    #[test]
    fn test_file_level_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let grug_path = dir.path().join("widget-Counter.grug");
        let json_path = dir.path().join("widget.json");
        let regenerated_path = dir.path().join("regenerated-Counter.grug");

        let source = "on_start() {\n    play(\"hi.wav\")\n}\n";
        fs::write(&grug_path, source).unwrap();

        dump_file_to_json(&grug_path, &json_path).unwrap();
        generate_file_from_json(&json_path, &regenerated_path).unwrap();

        assert_eq!(fs::read_to_string(&regenerated_path).unwrap(), source);
    }
}
