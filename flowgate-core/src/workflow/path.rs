//! Rooted reference paths into working data (`$`, `$.a.b`, `$.items[2].id`)

use serde_json::{Map, Value};

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// Parse a reference path into segments
pub fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| format!("path '{}' must start with '$'", path))?;
    if rest.starts_with('$') {
        return Err(format!("context path '{}' is not supported", path));
    }

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                if name.is_empty() {
                    return Err(format!("empty field name in path '{}'", path));
                }
                segments.push(Segment::Field(name));
            }
            '[' => {
                let mut inner = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next);
                }
                if !closed {
                    return Err(format!("unclosed '[' in path '{}'", path));
                }
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                match quoted {
                    Some(name) => segments.push(Segment::Field(name.to_string())),
                    None => {
                        let index = inner
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| format!("invalid index '{}' in path '{}'", inner, path))?;
                        segments.push(Segment::Index(index));
                    }
                }
            }
            other => {
                return Err(format!(
                    "unexpected character '{}' in path '{}'",
                    other, path
                ))
            }
        }
    }

    Ok(segments)
}

/// Select the value at `path`; `Ok(None)` when any step is missing
pub fn select<'a>(data: &'a Value, path: &str) -> Result<Option<&'a Value>, String> {
    let segments = parse_path(path)?;
    let mut current = data;
    for segment in &segments {
        let next = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name),
            (Segment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Select a required value, cloning it
pub fn select_required(data: &Value, path: &str) -> Result<Value, String> {
    select(data, path)?
        .cloned()
        .ok_or_else(|| format!("path '{}' did not match any data", path))
}

/// Write `value` at `path`, creating intermediate objects. `$` replaces `data`.
pub fn set(data: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let segments = parse_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        *data = value;
        return Ok(());
    };

    let mut current = data;
    for segment in parents {
        current = match segment {
            Segment::Field(name) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let map = current
                    .as_object_mut()
                    .ok_or_else(|| format!("cannot set '{}': '{}' is not an object", path, name))?;
                map.entry(name.clone())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            Segment::Index(index) => current
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or_else(|| format!("cannot set '{}': index {} out of range", path, index))?,
        };
    }

    match last {
        Segment::Field(name) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            let map = current
                .as_object_mut()
                .ok_or_else(|| format!("cannot set '{}': parent is not an object", path))?;
            map.insert(name.clone(), value);
        }
        Segment::Index(index) => {
            let slot = current
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or_else(|| format!("cannot set '{}': index {} out of range", path, index))?;
            *slot = value;
        }
    }
    Ok(())
}

/// Place `result` into `input` at `result_path` (`None` means `$`)
pub fn merge_result(input: &Value, result_path: Option<&str>, result: Value) -> Result<Value, String> {
    match result_path {
        None | Some("$") => Ok(result),
        Some(path) => {
            let mut output = input.clone();
            set(&mut output, path, result)?;
            Ok(output)
        }
    }
}

/// Apply an optional input/output path filter
pub fn filter(data: &Value, path: Option<&str>) -> Result<Value, String> {
    match path {
        None | Some("$") => Ok(data.clone()),
        Some(path) => select_required(data, path),
    }
}

/// Resolve a `Parameters` template: keys ending in `.$` are paths into `input`
pub fn apply_parameters(template: &Value, input: &Value) -> Result<Value, String> {
    match template {
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, value) in map {
                match key.strip_suffix(".$") {
                    Some(field) => {
                        let path = value.as_str().ok_or_else(|| {
                            format!("parameter '{}' must be a path string", key)
                        })?;
                        resolved.insert(field.to_string(), select_required(input, path)?);
                    }
                    None => {
                        resolved.insert(key.clone(), apply_parameters(value, input)?);
                    }
                }
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| apply_parameters(item, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Every path referenced by a `Parameters` template, for validation
pub fn template_paths(template: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    let mut stack = vec![template];
    while let Some(value) = stack.pop() {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    if key.ends_with(".$") {
                        if let Some(path) = value.as_str() {
                            paths.push(path.to_string());
                        }
                    } else {
                        stack.push(value);
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    paths
}
