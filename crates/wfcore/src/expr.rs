//! Jinja expressions and `{{ ... }}` templates evaluated over execution
//! bindings, via minijinja.
//!
//! Used by decision nodes, transform mappings, conditional edges and
//! prompt templates. Paths that do not resolve evaluate to `null` and
//! render as empty text.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("{0}")]
    Syntax(String),

    #[error("{0}")]
    Evaluation(String),
}

impl From<minijinja::Error> for ExprError {
    fn from(e: minijinja::Error) -> Self {
        match e.kind() {
            minijinja::ErrorKind::SyntaxError => ExprError::Syntax(e.to_string()),
            _ => ExprError::Evaluation(e.to_string()),
        }
    }
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.set_formatter(|out, state, value| {
        if value.is_none() {
            Ok(())
        } else {
            minijinja::escape_formatter(out, state, value)
        }
    });
    env
}

/// Compiles `source` without evaluating it.
pub fn validate(source: &str) -> Result<(), ExprError> {
    environment().compile_expression(source)?;
    Ok(())
}

/// Compiles and evaluates one expression against `scope`.
pub fn evaluate(source: &str, scope: &Value) -> Result<Value, ExprError> {
    let env = environment();
    let expression = env.compile_expression(source)?;
    let value = expression.eval(minijinja::Value::from_serialize(scope))?;
    to_json(&value)
}

/// Renders `template` against `scope`.
pub fn render_template(template: &str, scope: &Value) -> Result<String, ExprError> {
    let rendered = environment().render_str(template, minijinja::Value::from_serialize(scope))?;
    Ok(rendered)
}

fn to_json(value: &minijinja::Value) -> Result<Value, ExprError> {
    if value.is_undefined() || value.is_none() {
        return Ok(Value::Null);
    }
    let json = serde_json::to_value(value).map_err(|e| ExprError::Evaluation(e.to_string()))?;
    Ok(match json {
        // 2.5 * 4 is 10, not 10.0
        Value::Number(n) => match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        other => other,
    })
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Renders a value the way branch labels and debug output see it: strings
/// verbatim, null as empty, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "x": 5,
            "name": "Ada",
            "agentA": {"output": "hello world", "items": [1, 2, 3]},
            "iterations": {"body": 2},
            "results": {"node-1": "dash"}
        })
    }

    #[test]
    fn evaluates_comparisons_and_logic() {
        let s = scope();
        assert_eq!(evaluate("x > 0", &s).unwrap(), json!(true));
        assert_eq!(evaluate("x > 0 and name == 'Ada'", &s).unwrap(), json!(true));
        assert_eq!(evaluate("not (x >= 5) or x < 0", &s).unwrap(), json!(false));
        assert_eq!(evaluate("iterations.body < 3", &s).unwrap(), json!(true));
        assert_eq!(evaluate("'world' in agentA.output", &s).unwrap(), json!(true));
    }

    #[test]
    fn resolves_paths_indexes_and_missing_values() {
        let s = scope();
        assert_eq!(evaluate("agentA.items[1]", &s).unwrap(), json!(2));
        assert_eq!(evaluate("results['node-1']", &s).unwrap(), json!("dash"));
        assert_eq!(evaluate("nope.deeper", &s).unwrap(), Value::Null);
        assert_eq!(evaluate("agentA", &s).unwrap()["items"], json!([1, 2, 3]));
    }

    #[test]
    fn arithmetic_and_filters() {
        let s = scope();
        assert_eq!(evaluate("x * 2 + 1", &s).unwrap(), json!(11));
        assert_eq!(evaluate("x / 2", &s).unwrap(), json!(2.5));
        assert_eq!(evaluate("x * 0.5 * 4", &s).unwrap(), json!(10));
        assert_eq!(evaluate("'n=' ~ x", &s).unwrap(), json!("n=5"));
        assert_eq!(evaluate("agentA.items | length", &s).unwrap(), json!(3));
        assert_eq!(evaluate("name | upper", &s).unwrap(), json!("ADA"));
        assert!(evaluate("shout(x)", &s).is_err());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for source in ["x >", "'open", "(x", ""] {
            assert!(
                matches!(validate(source), Err(ExprError::Syntax(_))),
                "{source:?} should not compile"
            );
        }
        assert!(validate("a and b").is_ok());
    }

    #[test]
    fn renders_templates() {
        let s = scope();
        assert_eq!(
            render_template("Hi {{ name }}, x+1={{ x + 1 }}", &s).unwrap(),
            "Hi Ada, x+1=6"
        );
        assert_eq!(render_template("{{ missing }}!", &s).unwrap(), "!");
        assert_eq!(render_template("{{ missing.deeper }}{{ none }}.", &s).unwrap(), ".");
        assert!(matches!(
            render_template("oops {{ name", &s),
            Err(ExprError::Syntax(_))
        ));
    }
}
