//! Pattern matching shared by the VM and the tree-walker

use crate::ast::Pattern;
use crate::compiler::literal_value;
use crate::value::{Str, Value};

/// Match `value` against `pattern`, returning the bindings on success
pub fn match_pattern(pattern: &Pattern, value: &Value) -> Option<Vec<(Str, Value)>> {
    let mut bindings = Vec::new();
    if collect(pattern, value, &mut bindings) {
        Some(bindings)
    } else {
        None
    }
}

fn collect(pattern: &Pattern, value: &Value, out: &mut Vec<(Str, Value)>) -> bool {
    match pattern {
        Pattern::Wildcard => true,
        Pattern::Binding(name) => {
            out.push((name.clone(), value.clone()));
            true
        }
        Pattern::Literal(lit) => literal_value(lit) == *value,
        Pattern::Array(items) => {
            let Value::Array(array) = value else {
                return false;
            };
            let elements = array.snapshot();
            elements.len() == items.len()
                && items
                    .iter()
                    .zip(elements.iter())
                    .all(|(p, v)| collect(p, v, out))
        }
        Pattern::Struct { name, fields } => match value {
            Value::Struct(instance) => {
                if name.as_ref().is_some_and(|n| *n != instance.name) {
                    return false;
                }
                fields.iter().all(|(field, p)| {
                    instance
                        .get_field(field.as_str())
                        .is_some_and(|v| collect(p, &v, out))
                })
            }
            // Error values destructure like `Error { kind, message }`
            Value::Error(err) => {
                if name
                    .as_ref()
                    .is_some_and(|n| *n != "Error" && *n != err.kind)
                {
                    return false;
                }
                fields.iter().all(|(field, p)| {
                    let v = match field.as_str() {
                        "kind" => Value::String(err.kind.clone()),
                        "message" => Value::String(err.message.clone()),
                        "payload" => err.payload.clone().unwrap_or_default(),
                        _ => return false,
                    };
                    collect(p, &v, out)
                })
            }
            _ => false,
        },
        Pattern::Typed { type_name, inner } => {
            let type_matches = match value {
                Value::Error(err) => *type_name == "Error" || err.kind == *type_name,
                other => other.type_name() == type_name.as_str(),
            };
            type_matches && collect(inner, value, out)
        }
    }
}
