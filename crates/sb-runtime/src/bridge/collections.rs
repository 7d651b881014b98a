use indexmap::IndexMap;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, INT};
use sb_core::{from_json, BridgeError, Document, FunctionRef, HostList, HostMap, HostValue};
use tracing::warn;

use super::ScriptBridge;
use crate::value_bridge::{host, lift, to_script_value, ScriptResult};

fn callable(value: &HostValue) -> Result<&FunctionRef, BridgeError> {
    value.as_function().ok_or_else(|| BridgeError::NotCallable {
        type_name: value.type_name().to_string(),
    })
}

/// Items of anything list-like; other values have none.
fn items_of(value: &HostValue) -> Vec<HostValue> {
    match value {
        HostValue::Sequence(list) => list.snapshot(),
        HostValue::Document(Document::Json(json)) if json.is_array() => match from_json(json) {
            HostValue::Sequence(list) => list.snapshot(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn entries_of(value: &HostValue) -> Option<IndexMap<String, HostValue>> {
    match value {
        HostValue::Mapping(map) => Some(map.snapshot()),
        HostValue::Document(Document::Json(json)) if json.is_object() => match from_json(json) {
            HostValue::Mapping(map) => Some(map.snapshot()),
            _ => None,
        },
        _ => None,
    }
}

impl ScriptBridge {
    /// `f(item, index)` for every item.
    pub fn map(&self, list: &HostValue, f: &HostValue) -> Result<HostValue, BridgeError> {
        let function = callable(f)?;
        let mut out = Vec::new();
        for (index, item) in items_of(list).into_iter().enumerate() {
            out.push(function.call(vec![item, HostValue::int(index as i64)])?);
        }
        Ok(HostValue::list(out))
    }

    pub fn filter(&self, list: &HostValue, f: &HostValue) -> Result<HostValue, BridgeError> {
        let function = callable(f)?;
        let mut out = Vec::new();
        for (index, item) in items_of(list).into_iter().enumerate() {
            match function.call(vec![item.clone(), HostValue::int(index as i64)])? {
                HostValue::Bool(true) => out.push(item),
                HostValue::Bool(false) => {}
                other => {
                    return Err(BridgeError::NotBoolean {
                        type_name: other.type_name().to_string(),
                    })
                }
            }
        }
        Ok(HostValue::list(out))
    }

    /// Lists call `f(item, index)`, maps call `f(key, value, index)`.
    pub fn for_each(&self, value: &HostValue, f: &HostValue) -> Result<(), BridgeError> {
        let function = callable(f)?;
        if let Some(entries) = entries_of(value) {
            for (index, (key, item)) in entries.into_iter().enumerate() {
                function.call(vec![
                    HostValue::Text(key),
                    item,
                    HostValue::int(index as i64),
                ])?;
            }
            return Ok(());
        }
        for (index, item) in items_of(value).into_iter().enumerate() {
            function.call(vec![item, HostValue::int(index as i64)])?;
        }
        Ok(())
    }

    pub fn repeat(&self, count: i64, f: &HostValue) -> Result<HostValue, BridgeError> {
        let function = callable(f)?;
        let mut out = Vec::new();
        for index in 0..count.max(0) {
            out.push(function.call(vec![HostValue::int(index)])?);
        }
        Ok(HostValue::list(out))
    }

    /// A new list of every argument, with list arguments spliced in.
    pub fn append(&self, values: Vec<HostValue>) -> HostValue {
        let out = HostList::new();
        for value in values {
            match value {
                HostValue::Sequence(list) => out.extend(list.snapshot()),
                other => out.push(other),
            }
        }
        HostValue::Sequence(out)
    }

    /// Appends to a list in place. A text reference names a variable, which
    /// is created (or replaced when it is not a list).
    pub fn append_to(&self, target: &HostValue, values: Vec<HostValue>) -> Result<HostValue, BridgeError> {
        let list = match target {
            HostValue::Sequence(list) => list.clone(),
            HostValue::Text(name) => {
                let runtime = self.runtime()?;
                match runtime.variable(name) {
                    Some(HostValue::Sequence(list)) => list,
                    _ => {
                        let list = HostList::new();
                        self.set(name, HostValue::Sequence(list.clone()))?;
                        list
                    }
                }
            }
            other => {
                return Err(BridgeError::unsupported(format!(
                    "appendTo target {}",
                    other.type_name()
                )))
            }
        };
        for value in values {
            match value {
                HostValue::Sequence(items) => list.extend(items.snapshot()),
                other => list.push(other),
            }
        }
        Ok(HostValue::Sequence(list))
    }

    /// Later maps win on key clashes. A single argument comes back as is.
    pub fn merge(&self, mut values: Vec<HostValue>) -> HostValue {
        if values.len() <= 1 {
            return values.pop().unwrap_or_default();
        }
        let out = HostMap::new();
        for value in &values {
            match entries_of(value) {
                Some(entries) => {
                    for (key, item) in entries {
                        out.insert(key, item);
                    }
                }
                None => warn!(target: "sb::bridge", "merge skipped a {}", value.type_name()),
            }
        }
        HostValue::Mapping(out)
    }

    /// Keys may be given as text, lists of text, or maps whose keys are used.
    pub fn filter_keys(&self, value: &HostValue, keys: Vec<HostValue>) -> HostValue {
        let Some(entries) = entries_of(value) else {
            return HostValue::Mapping(HostMap::new());
        };
        let mut wanted = Vec::new();
        for key in keys {
            match key {
                HostValue::Text(text) => wanted.push(text),
                HostValue::Sequence(list) => wanted.extend(
                    list.snapshot()
                        .iter()
                        .map(HostValue::to_display_text),
                ),
                HostValue::Mapping(map) => wanted.extend(map.keys()),
                other => wanted.push(other.to_display_text()),
            }
        }
        let out = HostMap::new();
        for key in wanted {
            if let Some(item) = entries.get(&key) {
                out.insert(key, item.clone());
            }
        }
        HostValue::Mapping(out)
    }

    pub fn keys_of(&self, value: &HostValue) -> HostValue {
        let keys = entries_of(value)
            .map(|entries| entries.into_keys().map(HostValue::Text).collect())
            .unwrap_or_default();
        HostValue::list(keys)
    }

    pub fn values_of(&self, value: &HostValue) -> HostValue {
        if let Some(entries) = entries_of(value) {
            return HostValue::list(entries.into_values().collect());
        }
        match value {
            HostValue::Sequence(_) | HostValue::Document(Document::Json(_)) => {
                HostValue::list(items_of(value))
            }
            _ => HostValue::Null,
        }
    }

    /// Item or entry count, `-1` for anything that is neither.
    pub fn size_of(&self, value: &HostValue) -> i64 {
        if let Some(entries) = entries_of(value) {
            return entries.len() as i64;
        }
        match value {
            HostValue::Sequence(list) => list.len() as i64,
            HostValue::Document(Document::Json(json)) if json.is_array() => {
                items_of(value).len() as i64
            }
            _ => -1,
        }
    }

    /// Wraps every item as `{ key: item }`.
    pub fn map_with_key(&self, list: &HostValue, key: &str) -> HostValue {
        HostValue::list(
            items_of(list)
                .into_iter()
                .map(|item| HostValue::map([(key, item)]))
                .collect(),
        )
    }
}

fn hosts(values: Vec<Dynamic>) -> Result<Vec<HostValue>, Box<EvalAltResult>> {
    values.into_iter().map(host).collect()
}

pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_fn(
            "map",
            |bridge: &mut ScriptBridge, list: Dynamic, f: Dynamic| -> ScriptResult {
                lift(bridge.map(&host(list)?, &host(f)?))
            },
        )
        .register_fn(
            "filter",
            |bridge: &mut ScriptBridge, list: Dynamic, f: Dynamic| -> ScriptResult {
                lift(bridge.filter(&host(list)?, &host(f)?))
            },
        )
        .register_fn(
            "forEach",
            |bridge: &mut ScriptBridge, value: Dynamic, f: Dynamic| -> ScriptResult {
                lift(bridge.for_each(&host(value)?, &host(f)?).map(|_| HostValue::Null))
            },
        )
        .register_fn(
            "repeat",
            |bridge: &mut ScriptBridge, count: INT, f: Dynamic| -> ScriptResult {
                lift(bridge.repeat(count as i64, &host(f)?))
            },
        )
        .register_fn(
            "mapWithKey",
            |bridge: &mut ScriptBridge, list: Dynamic, key: ImmutableString| -> ScriptResult {
                Ok(to_script_value(&bridge.map_with_key(&host(list)?, &key)))
            },
        )
        .register_fn("keysOf", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.keys_of(&host(value)?)))
        })
        .register_fn("valuesOf", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.values_of(&host(value)?)))
        })
        .register_fn(
            "sizeOf",
            |bridge: &mut ScriptBridge, value: Dynamic| -> Result<INT, Box<EvalAltResult>> {
                Ok(bridge.size_of(&host(value)?) as INT)
            },
        );

    engine
        .register_fn("append", |bridge: &mut ScriptBridge, a: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.append(hosts(vec![a])?)))
        })
        .register_fn(
            "append",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.append(hosts(vec![a, b])?)))
            },
        )
        .register_fn(
            "append",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic, c: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.append(hosts(vec![a, b, c])?)))
            },
        )
        .register_fn(
            "append",
            |bridge: &mut ScriptBridge,
             a: Dynamic,
             b: Dynamic,
             c: Dynamic,
             d: Dynamic|
             -> ScriptResult {
                Ok(to_script_value(&bridge.append(hosts(vec![a, b, c, d])?)))
            },
        )
        .register_fn(
            "appendTo",
            |bridge: &mut ScriptBridge, target: Dynamic, a: Dynamic| -> ScriptResult {
                lift(bridge.append_to(&host(target)?, hosts(vec![a])?))
            },
        )
        .register_fn(
            "appendTo",
            |bridge: &mut ScriptBridge, target: Dynamic, a: Dynamic, b: Dynamic| -> ScriptResult {
                lift(bridge.append_to(&host(target)?, hosts(vec![a, b])?))
            },
        )
        .register_fn(
            "appendTo",
            |bridge: &mut ScriptBridge,
             target: Dynamic,
             a: Dynamic,
             b: Dynamic,
             c: Dynamic|
             -> ScriptResult {
                lift(bridge.append_to(&host(target)?, hosts(vec![a, b, c])?))
            },
        );

    engine
        .register_fn("merge", |bridge: &mut ScriptBridge| {
            to_script_value(&bridge.merge(Vec::new()))
        })
        .register_fn("merge", |bridge: &mut ScriptBridge, a: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.merge(hosts(vec![a])?)))
        })
        .register_fn(
            "merge",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.merge(hosts(vec![a, b])?)))
            },
        )
        .register_fn(
            "merge",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic, c: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.merge(hosts(vec![a, b, c])?)))
            },
        )
        .register_fn(
            "merge",
            |bridge: &mut ScriptBridge,
             a: Dynamic,
             b: Dynamic,
             c: Dynamic,
             d: Dynamic|
             -> ScriptResult {
                Ok(to_script_value(&bridge.merge(hosts(vec![a, b, c, d])?)))
            },
        )
        .register_fn(
            "filterKeys",
            |bridge: &mut ScriptBridge, value: Dynamic, a: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.filter_keys(&host(value)?, hosts(vec![a])?)))
            },
        )
        .register_fn(
            "filterKeys",
            |bridge: &mut ScriptBridge, value: Dynamic, a: Dynamic, b: Dynamic| -> ScriptResult {
                Ok(to_script_value(&bridge.filter_keys(&host(value)?, hosts(vec![a, b])?)))
            },
        )
        .register_fn(
            "filterKeys",
            |bridge: &mut ScriptBridge,
             value: Dynamic,
             a: Dynamic,
             b: Dynamic,
             c: Dynamic|
             -> ScriptResult {
                Ok(to_script_value(&bridge.filter_keys(&host(value)?, hosts(vec![a, b, c])?)))
            },
        );
}

#[cfg(test)]
mod collections_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bridge() -> ScriptBridge {
        ScriptBridge::new(std::sync::Weak::new())
    }

    #[test]
    fn size_of_is_negative_for_scalars() {
        let bridge = bridge();
        assert_eq!(bridge.size_of(&HostValue::int(3)), -1);
        assert_eq!(bridge.size_of(&HostValue::list(vec![HostValue::Null])), 1);
        assert_eq!(
            bridge.size_of(&HostValue::map([("a", HostValue::Null), ("b", HostValue::Null)])),
            2
        );
    }

    #[test]
    fn non_callables_are_rejected_before_iterating() {
        let bridge = bridge();
        let list = HostValue::list(vec![HostValue::int(1)]);
        let error = bridge
            .map(&list, &HostValue::text("not a function"))
            .expect_err("not callable");
        assert_eq!(error.code(), "BRIDGE_NOT_CALLABLE");
        let error = bridge
            .filter(&HostValue::list(Vec::new()), &HostValue::int(1))
            .expect_err("checked even for empty input");
        assert_eq!(error.code(), "BRIDGE_NOT_CALLABLE");
    }

    #[test]
    fn append_splices_lists() {
        let bridge = bridge();
        let value = bridge.append(vec![
            HostValue::list(vec![HostValue::int(1), HostValue::int(2)]),
            HostValue::int(3),
        ]);
        assert_eq!(value.to_json(), json!([1, 2, 3]));
    }

    #[test]
    fn append_to_extends_in_place() {
        let bridge = bridge();
        let list = HostList::from_vec(vec![HostValue::int(1)]);
        bridge
            .append_to(&HostValue::Sequence(list.clone()), vec![HostValue::int(2)])
            .expect("append");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn merge_prefers_later_maps() {
        let bridge = bridge();
        let merged = bridge.merge(vec![
            HostValue::map([("a", HostValue::int(1)), ("b", HostValue::int(1))]),
            HostValue::map([("b", HostValue::int(2))]),
        ]);
        assert_eq!(merged.to_json(), json!({"a": 1, "b": 2}));
        assert_eq!(bridge.merge(Vec::new()), HostValue::Null);
    }

    #[test]
    fn filter_keys_accepts_lists_and_text() {
        let bridge = bridge();
        let source = HostValue::map([
            ("a", HostValue::int(1)),
            ("b", HostValue::int(2)),
            ("c", HostValue::int(3)),
        ]);
        let picked = bridge.filter_keys(
            &source,
            vec![
                HostValue::text("c"),
                HostValue::list(vec![HostValue::text("a"), HostValue::text("z")]),
            ],
        );
        assert_eq!(picked.to_json(), json!({"c": 3, "a": 1}));
    }

    #[test]
    fn keys_and_values() {
        let bridge = bridge();
        let source = HostValue::Document(Document::Json(json!({"x": 1, "y": [2]})));
        assert_eq!(bridge.keys_of(&source).to_json(), json!(["x", "y"]));
        assert_eq!(bridge.values_of(&source).to_json(), json!([1, [2]]));
        assert_eq!(bridge.values_of(&HostValue::int(1)), HostValue::Null);
        assert_eq!(
            bridge
                .map_with_key(&HostValue::list(vec![HostValue::int(1)]), "id")
                .to_json(),
            json!([{"id": 1}])
        );
    }
}
