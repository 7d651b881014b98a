use sb_core::{BridgeError, HostList, HostMap, HostValue};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits `a.b[0]['c d']` (optionally prefixed with `$` or `$.`) into segments.
pub(crate) fn parse_value_path(path: &str) -> Result<Vec<PathSegment>, BridgeError> {
    let trimmed = path.trim();
    let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let chars = body.chars().collect::<Vec<_>>();
    let mut segments = Vec::new();
    let mut index = 0usize;
    while index < chars.len() {
        match chars[index] {
            '.' => index += 1,
            '[' => {
                let Some(close) = chars[index..].iter().position(|ch| *ch == ']') else {
                    return Err(BridgeError::invalid_path(path, "missing ']'"));
                };
                let inner = chars[index + 1..index + close].iter().collect::<String>();
                let inner = inner.trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|rest| rest.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')));
                match quoted {
                    Some(key) => segments.push(PathSegment::Key(key.to_string())),
                    None => {
                        let position = inner.parse::<usize>().map_err(|_| {
                            BridgeError::invalid_path(path, format!("bad index '{}'", inner))
                        })?;
                        segments.push(PathSegment::Index(position));
                    }
                }
                index += close + 1;
            }
            _ => {
                let start = index;
                while index < chars.len() && chars[index] != '.' && chars[index] != '[' {
                    index += 1;
                }
                let key = chars[start..index].iter().collect::<String>();
                segments.push(PathSegment::Key(key.trim().to_string()));
            }
        }
    }
    Ok(segments)
}

pub(crate) fn resolve_path(value: &HostValue, path: &[PathSegment]) -> Option<HostValue> {
    let Some((head, rest)) = path.split_first() else {
        return Some(value.clone());
    };
    let next = match (value, head) {
        (HostValue::Mapping(map), PathSegment::Key(key)) => map.get(key)?,
        (HostValue::Sequence(list), PathSegment::Index(index)) => list.get(*index)?,
        (HostValue::Sequence(list), PathSegment::Key(key)) if key == "length" => {
            HostValue::int(list.len() as i64)
        }
        _ => return None,
    };
    resolve_path(&next, rest)
}

/// Writes `value` at `path` inside `target`, creating intermediate maps (or
/// lists when the next segment is an index).
pub(crate) fn assign_nested_path(
    target: &HostValue,
    path: &[PathSegment],
    value: HostValue,
) -> Result<(), String> {
    let Some((head, rest)) = path.split_first() else {
        return Err("empty path".to_string());
    };
    if rest.is_empty() {
        return match (target, head) {
            (HostValue::Mapping(map), PathSegment::Key(key)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (HostValue::Sequence(list), PathSegment::Index(index)) => {
                list.set(*index, value);
                Ok(())
            }
            _ => Err(format!(
                "cannot write {:?} into a {}",
                head,
                target.type_name()
            )),
        };
    }
    let existing = match (target, head) {
        (HostValue::Mapping(map), PathSegment::Key(key)) => map.get(key),
        (HostValue::Sequence(list), PathSegment::Index(index)) => list.get(*index),
        _ => {
            return Err(format!(
                "cannot walk {:?} through a {}",
                head,
                target.type_name()
            ))
        }
    };
    let child = match existing {
        Some(child) if child.is_map_or_list() => child,
        _ => {
            let fresh = match rest[0] {
                PathSegment::Index(_) => HostValue::Sequence(HostList::new()),
                PathSegment::Key(_) => HostValue::Mapping(HostMap::new()),
            };
            match (target, head) {
                (HostValue::Mapping(map), PathSegment::Key(key)) => {
                    map.insert(key.clone(), fresh.clone());
                }
                (HostValue::Sequence(list), PathSegment::Index(index)) => {
                    list.set(*index, fresh.clone());
                }
                _ => {}
            }
            fresh
        }
    };
    assign_nested_path(&child, rest, value)
}

pub(crate) fn remove_nested_path(target: &HostValue, path: &[PathSegment]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let Some(parent) = resolve_path(target, parents) else {
        return false;
    };
    match (&parent, last) {
        (HostValue::Mapping(map), PathSegment::Key(key)) => map.remove(key).is_some(),
        (HostValue::Sequence(list), PathSegment::Index(index)) => list.remove(*index).is_some(),
        _ => false,
    }
}
