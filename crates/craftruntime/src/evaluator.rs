use craftcore::WorkflowError;
use serde_json::Value;

/// Evaluates edge `condition` and `transform` expressions against a scope.
///
/// Implementations must not execute arbitrary code unless the caller opts
/// in by supplying their own evaluator.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, WorkflowError>;
}

/// JS-like truthiness: `null`, `false`, `0`, and `""` are falsy; arrays and
/// objects (empty or not) are truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Safe default evaluator: property paths, literals, unary `!`, and a single
/// binary comparison. No method calls, no arithmetic, no code execution.
pub struct PathEvaluator;

impl Evaluator for PathEvaluator {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, WorkflowError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(WorkflowError::Configuration(
                "empty expression".to_string(),
            ));
        }
        if let Some((left, op, right)) = split_comparison(expr) {
            let lhs = eval_operand(left.trim(), scope)?;
            let rhs = eval_operand(right.trim(), scope)?;
            return Ok(Value::Bool(compare(&lhs, op, &rhs)));
        }
        eval_operand(expr, scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Splits on the first top-level comparison operator, skipping quoted
/// string literals.
fn split_comparison(expr: &str) -> Option<(&str, CompareOp, &str)> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'=' | b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                    let op = if b == b'=' { CompareOp::Eq } else { CompareOp::Ne };
                    return Some((&expr[..i], op, &expr[i + 2..]));
                }
                b'>' | b'<' => {
                    let two = i + 1 < bytes.len() && bytes[i + 1] == b'=';
                    let op = match (b, two) {
                        (b'>', true) => CompareOp::Ge,
                        (b'<', true) => CompareOp::Le,
                        (b'>', false) => CompareOp::Gt,
                        _ => CompareOp::Lt,
                    };
                    let rest = if two { &expr[i + 2..] } else { &expr[i + 1..] };
                    return Some((&expr[..i], op, rest));
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn eval_operand(operand: &str, scope: &Value) -> Result<Value, WorkflowError> {
    if let Some(inner) = operand.strip_prefix('!') {
        let value = eval_operand(inner.trim(), scope)?;
        return Ok(Value::Bool(!truthy(&value)));
    }
    if let Some(literal) = parse_literal(operand) {
        return Ok(literal);
    }
    Ok(lookup_path(operand, scope))
}

fn parse_literal(token: &str) -> Option<Value> {
    match token {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
        || (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
    {
        return Some(Value::String(token[1..token.len() - 1].to_string()));
    }
    if token
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || c == '-')
        .unwrap_or(false)
    {
        if let Ok(n) = token.parse::<i64>() {
            return Some(Value::Number(n.into()));
        }
        if let Ok(f) = token.parse::<f64>() {
            return serde_json::Number::from_f64(f).map(Value::Number);
        }
    }
    None
}

/// Resolves `a.b.c` and `a[0].b` style paths; missing segments yield null.
fn lookup_path(path: &str, scope: &Value) -> Value {
    let mut current = scope;
    for segment in path.split('.') {
        let (name, indices) = split_indices(segment);
        if !name.is_empty() {
            match current.get(name) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        for index in indices {
            match current.get(index) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
    }
    current.clone()
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(open) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let name = &segment[..open];
    let indices = segment[open..]
        .split('[')
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.trim_end_matches(']').parse::<usize>().ok())
        .collect();
    (name, indices)
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    use std::cmp::Ordering;
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CompareOp::Eq => match ordering {
            Some(ord) => ord == Ordering::Equal,
            None => lhs == rhs,
        },
        CompareOp::Ne => match ordering {
            Some(ord) => ord != Ordering::Equal,
            None => lhs != rhs,
        },
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, scope: &Value) -> Value {
        PathEvaluator.evaluate(expr, scope).unwrap()
    }

    #[test]
    fn path_lookup_with_nesting_and_indices() {
        let scope = json!({"user": {"name": "ada", "tags": ["eng", "ops"]}, "n": 3});
        assert_eq!(eval("user.name", &scope), json!("ada"));
        assert_eq!(eval("user.tags[1]", &scope), json!("ops"));
        assert_eq!(eval("user.missing.deep", &scope), Value::Null);
        assert_eq!(eval("n", &scope), json!(3));
    }

    #[test]
    fn comparisons() {
        let scope = json!({"result": {"output": {"v": 75}}, "label": "high"});
        assert_eq!(eval("result.output.v > 50", &scope), json!(true));
        assert_eq!(eval("result.output.v <= 74", &scope), json!(false));
        assert_eq!(eval("label == 'high'", &scope), json!(true));
        assert_eq!(eval("label != \"low\"", &scope), json!(true));
        assert_eq!(eval("result.output.v == 75", &scope), json!(true));
    }

    #[test]
    fn negation_and_literals() {
        let scope = json!({"flag": false, "empty": ""});
        assert_eq!(eval("!flag", &scope), json!(true));
        assert_eq!(eval("!empty", &scope), json!(true));
        assert_eq!(eval("true", &scope), json!(true));
        assert_eq!(eval("-2", &scope), json!(-2));
        assert_eq!(eval("'quoted > text'", &scope), json!("quoted > text"));
    }

    #[test]
    fn truthiness_matches_loose_semantics() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(0.5)));
    }

    #[test]
    fn quoted_operators_do_not_split() {
        let scope = json!({"s": "a<b"});
        assert_eq!(eval("s == 'a<b'", &scope), json!(true));
    }
}
