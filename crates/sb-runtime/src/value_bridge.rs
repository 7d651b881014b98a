use std::sync::Arc;

use rhai::{
    Array, Blob, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Position, FLOAT,
    INT,
};
use sb_core::{
    parse_json, BridgeError, Document, FunctionRef, HostList, HostMap, HostValue, Number,
    OpaqueRef,
};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::bridge::http::WebSocketHandle;
use crate::context::ExecutionContext;
use crate::function::FunctionHandle;

pub(crate) type ScriptResult = Result<Dynamic, Box<EvalAltResult>>;

/// Native function behind script-side pointers to host functions. The host
/// function travels as the first curried argument.
pub(crate) const HOST_INVOKE: &str = "sb_host_invoke";

/// Script view of a host list. Clones share the underlying storage.
#[derive(Debug, Clone)]
pub struct ListProxy(pub HostList);

/// Script view of a host map. Clones share the underlying storage.
#[derive(Debug, Clone)]
pub struct MapProxy(pub HostMap);

impl IntoIterator for ListProxy {
    type Item = Dynamic;
    type IntoIter = std::vec::IntoIter<Dynamic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0
            .snapshot()
            .iter()
            .map(to_script_value)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl IntoIterator for MapProxy {
    type Item = Dynamic;
    type IntoIter = std::vec::IntoIter<Dynamic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0
            .keys()
            .into_iter()
            .map(Dynamic::from)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

/// Host to script. Lists and maps keep their identity; everything else is
/// copied into the matching script type.
pub fn to_script_value(value: &HostValue) -> Dynamic {
    match value {
        HostValue::Null => Dynamic::UNIT,
        HostValue::Bool(flag) => Dynamic::from_bool(*flag),
        HostValue::Number(Number::Int(number)) => Dynamic::from_int(*number as INT),
        HostValue::Number(Number::Float(number)) => Dynamic::from_float(*number as FLOAT),
        HostValue::Text(text) => Dynamic::from(text.clone()),
        HostValue::Sequence(list) => Dynamic::from(ListProxy(list.clone())),
        HostValue::Mapping(map) => Dynamic::from(MapProxy(map.clone())),
        HostValue::Document(document) => Dynamic::from(document.clone()),
        HostValue::Binary(bytes) => Dynamic::from_blob(bytes.clone()),
        HostValue::Function(function) => function_to_script(function),
        HostValue::Opaque(opaque) => match opaque.downcast_ref::<WebSocketHandle>() {
            Some(socket) => Dynamic::from(socket.clone()),
            None => Dynamic::from(opaque.clone()),
        },
    }
}

/// Functions of the current context go back as their own pointer. Anything
/// else becomes a pointer to [`HOST_INVOKE`] carrying the host function.
fn function_to_script(function: &FunctionRef) -> Dynamic {
    if let Some(handle) = FunctionHandle::from_ref(function) {
        let same_context = ExecutionContext::current()
            .is_some_and(|current| Arc::ptr_eq(&current, handle.context()));
        if same_context {
            return Dynamic::from(handle.fn_ptr().clone());
        }
    }
    let opaque = OpaqueRef::new(Arc::clone(function));
    match FnPtr::new(HOST_INVOKE) {
        Ok(mut fn_ptr) => {
            fn_ptr.add_curry(Dynamic::from(opaque));
            Dynamic::from(fn_ptr)
        }
        Err(_) => Dynamic::from(opaque),
    }
}

/// Script to host, using the context entered on this thread for callables.
pub fn to_host_value(value: Dynamic) -> Result<HostValue, BridgeError> {
    let context = ExecutionContext::current();
    convert(context.as_ref(), value)
}

pub fn to_host_value_in(
    context: &Arc<ExecutionContext>,
    value: Dynamic,
) -> Result<HostValue, BridgeError> {
    convert(Some(context), value)
}

fn convert(
    context: Option<&Arc<ExecutionContext>>,
    value: Dynamic,
) -> Result<HostValue, BridgeError> {
    let value = value.flatten();
    if value.is_unit() {
        return Ok(HostValue::Null);
    }
    if value.is::<ImmutableString>() {
        return Ok(HostValue::Text(value.cast::<ImmutableString>().to_string()));
    }
    if value.is::<char>() {
        return Ok(HostValue::Text(value.cast::<char>().to_string()));
    }
    if value.is::<INT>() {
        return Ok(HostValue::int(value.cast::<INT>()));
    }
    if value.is::<FLOAT>() {
        return Ok(HostValue::float(value.cast::<FLOAT>()));
    }
    if value.is::<bool>() {
        return Ok(HostValue::Bool(value.cast::<bool>()));
    }
    if value.is::<FnPtr>() {
        let fn_ptr = value.cast::<FnPtr>();
        if let Some(function) = host_function_behind(&fn_ptr) {
            return Ok(HostValue::Function(function));
        }
        let Some(context) = context else {
            return Err(BridgeError::unsupported(format!(
                "function {} outside of an execution context",
                fn_ptr.fn_name()
            )));
        };
        return Ok(HostValue::Function(Arc::new(FunctionHandle::capture(
            context, fn_ptr,
        ))));
    }
    if value.is::<ListProxy>() {
        return Ok(HostValue::Sequence(value.cast::<ListProxy>().0));
    }
    if value.is::<MapProxy>() {
        return Ok(HostValue::Mapping(value.cast::<MapProxy>().0));
    }
    if value.is::<Document>() {
        return Ok(HostValue::Document(value.cast::<Document>()));
    }
    if value.is::<Blob>() {
        return Ok(HostValue::Binary(value.cast::<Blob>()));
    }
    if value.is::<OpaqueRef>() {
        let opaque = value.cast::<OpaqueRef>();
        return Ok(match opaque.downcast_ref::<FunctionRef>() {
            Some(function) => HostValue::Function(Arc::clone(function)),
            None => HostValue::Opaque(opaque),
        });
    }
    if value.is::<WebSocketHandle>() {
        return Ok(HostValue::Opaque(OpaqueRef::new(value.cast::<WebSocketHandle>())));
    }
    if value.is::<HostValue>() {
        return Ok(value.cast::<HostValue>());
    }
    if value.is::<Array>() || value.is::<Map>() {
        return restructure(context, &value);
    }
    Err(BridgeError::unsupported(value.type_name()))
}

/// Native arrays and maps take a JSON detour: written by the context and
/// parsed back into fresh host storage. Functions inside them are lost.
fn restructure(
    context: Option<&Arc<ExecutionContext>>,
    value: &Dynamic,
) -> Result<HostValue, BridgeError> {
    let text = match context {
        Some(context) => context.stringify(value)?,
        None => serde_json::to_string(&dynamic_to_json(value))?,
    };
    parse_json(&text)
}

fn host_function_behind(fn_ptr: &FnPtr) -> Option<FunctionRef> {
    if fn_ptr.fn_name() != HOST_INVOKE {
        return None;
    }
    let opaque = fn_ptr.curry().first()?.clone().try_cast::<OpaqueRef>()?;
    opaque.downcast_ref::<FunctionRef>().cloned()
}

pub(crate) fn dynamic_to_json(value: &Dynamic) -> JsonValue {
    let value = value.flatten_clone();
    if value.is_unit() {
        return JsonValue::Null;
    }
    if value.is::<bool>() {
        return JsonValue::Bool(value.cast::<bool>());
    }
    if value.is::<INT>() {
        return JsonValue::from(value.cast::<INT>());
    }
    if value.is::<FLOAT>() {
        return serde_json::Number::from_f64(value.cast::<FLOAT>())
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if value.is::<ImmutableString>() {
        return JsonValue::String(value.cast::<ImmutableString>().to_string());
    }
    if value.is::<char>() {
        return JsonValue::String(value.cast::<char>().to_string());
    }
    if value.is::<Array>() {
        return JsonValue::Array(
            value
                .cast::<Array>()
                .iter()
                .map(|item| {
                    if item.is::<FnPtr>() {
                        JsonValue::Null
                    } else {
                        dynamic_to_json(item)
                    }
                })
                .collect(),
        );
    }
    if value.is::<Map>() {
        let mut object = JsonMap::new();
        for (key, item) in value.cast::<Map>() {
            if item.is::<FnPtr>() {
                continue;
            }
            object.insert(key.to_string(), dynamic_to_json(&item));
        }
        return JsonValue::Object(object);
    }
    if value.is::<ListProxy>() {
        return HostValue::Sequence(value.cast::<ListProxy>().0).to_json();
    }
    if value.is::<MapProxy>() {
        return HostValue::Mapping(value.cast::<MapProxy>().0).to_json();
    }
    if value.is::<Document>() {
        return HostValue::Document(value.cast::<Document>()).to_json();
    }
    if value.is::<Blob>() {
        return HostValue::Binary(value.cast::<Blob>()).to_json();
    }
    if value.is::<HostValue>() {
        return value.cast::<HostValue>().to_json();
    }
    if value.is::<FnPtr>() {
        return JsonValue::Null;
    }
    JsonValue::String(format!("[{}]", value.type_name()))
}

pub(crate) fn raise(error: BridgeError) -> Box<EvalAltResult> {
    let message = error.to_string();
    if let Some(context) = ExecutionContext::current() {
        context.stash_error(error);
    }
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message),
        Position::NONE,
    ))
}

pub(crate) fn host(value: Dynamic) -> Result<HostValue, Box<EvalAltResult>> {
    to_host_value(value).map_err(raise)
}

pub(crate) fn lift(result: Result<HostValue, BridgeError>) -> ScriptResult {
    result.map(|value| to_script_value(&value)).map_err(raise)
}

fn invoke_host_function(target: OpaqueRef, args: Vec<Dynamic>) -> ScriptResult {
    let Some(function) = target.downcast_ref::<FunctionRef>() else {
        return Err(raise(BridgeError::NotCallable {
            type_name: target.type_name().to_string(),
        }));
    };
    let args = args
        .into_iter()
        .map(host)
        .collect::<Result<Vec<_>, _>>()?;
    lift(function.call(args))
}

fn list_index(list: &HostList, index: INT) -> Option<usize> {
    let len = list.len() as INT;
    let resolved = if index < 0 { len + index } else { index };
    (resolved >= 0).then_some(resolved as usize)
}

pub(crate) fn register_types(engine: &mut Engine) {
    engine
        .register_type_with_name::<ListProxy>("HostList")
        .register_indexer_get(|list: &mut ListProxy, index: INT| -> Dynamic {
            list_index(&list.0, index)
                .and_then(|position| list.0.get(position))
                .map(|value| to_script_value(&value))
                .unwrap_or(Dynamic::UNIT)
        })
        .register_indexer_set(
            |list: &mut ListProxy, index: INT, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let Some(position) = list_index(&list.0, index) else {
                    return Err(raise(BridgeError::invalid_path(
                        format!("[{}]", index),
                        "index before the start of the list",
                    )));
                };
                list.0.set(position, host(value)?);
                Ok(())
            },
        )
        .register_fn("len", |list: &mut ListProxy| list.0.len() as INT)
        .register_fn("is_empty", |list: &mut ListProxy| list.0.is_empty())
        .register_fn(
            "push",
            |list: &mut ListProxy, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                list.0.push(host(value)?);
                Ok(())
            },
        )
        .register_fn("to_string", |list: &mut ListProxy| {
            HostValue::Sequence(list.0.clone()).to_json().to_string()
        })
        .register_fn("to_debug", |list: &mut ListProxy| {
            HostValue::Sequence(list.0.clone()).to_json().to_string()
        })
        .register_iterator::<ListProxy>();

    engine
        .register_type_with_name::<MapProxy>("HostMap")
        .register_indexer_get(|map: &mut MapProxy, key: ImmutableString| -> Dynamic {
            map.0
                .get(key.as_str())
                .map(|value| to_script_value(&value))
                .unwrap_or(Dynamic::UNIT)
        })
        .register_indexer_set(
            |map: &mut MapProxy,
             key: ImmutableString,
             value: Dynamic|
             -> Result<(), Box<EvalAltResult>> {
                map.0.insert(key.to_string(), host(value)?);
                Ok(())
            },
        )
        .register_fn("len", |map: &mut MapProxy| map.0.len() as INT)
        .register_fn("is_empty", |map: &mut MapProxy| map.0.is_empty())
        .register_fn("contains", |map: &mut MapProxy, key: ImmutableString| {
            map.0.contains_key(key.as_str())
        })
        .register_fn("remove", |map: &mut MapProxy, key: ImmutableString| -> Dynamic {
            map.0
                .remove(key.as_str())
                .map(|value| to_script_value(&value))
                .unwrap_or(Dynamic::UNIT)
        })
        .register_fn("keys", |map: &mut MapProxy| -> Array {
            map.0.keys().into_iter().map(Dynamic::from).collect()
        })
        .register_fn("values", |map: &mut MapProxy| -> Array {
            map.0.values().iter().map(to_script_value).collect()
        })
        .register_fn("to_string", |map: &mut MapProxy| {
            HostValue::Mapping(map.0.clone()).to_json().to_string()
        })
        .register_fn("to_debug", |map: &mut MapProxy| {
            HostValue::Mapping(map.0.clone()).to_json().to_string()
        })
        .register_iterator::<MapProxy>();

    engine
        .register_type_with_name::<Document>("Document")
        .register_fn("to_string", |document: &mut Document| {
            HostValue::Document(document.clone()).to_display_text()
        });
    engine.register_type_with_name::<OpaqueRef>("Opaque");
    engine.register_type_with_name::<HostValue>("HostValue");

    engine.register_fn(HOST_INVOKE, |target: OpaqueRef| {
        invoke_host_function(target, Vec::new())
    });
    engine.register_fn(HOST_INVOKE, |target: OpaqueRef, a: Dynamic| {
        invoke_host_function(target, vec![a])
    });
    engine.register_fn(HOST_INVOKE, |target: OpaqueRef, a: Dynamic, b: Dynamic| {
        invoke_host_function(target, vec![a, b])
    });
    engine.register_fn(
        HOST_INVOKE,
        |target: OpaqueRef, a: Dynamic, b: Dynamic, c: Dynamic| {
            invoke_host_function(target, vec![a, b, c])
        },
    );
}

#[cfg(test)]
mod value_bridge_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn scalars_round_trip() {
        for value in [
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::int(-3),
            HostValue::float(2.5),
            HostValue::text("héllo"),
            HostValue::Binary(vec![0, 255]),
        ] {
            let back = to_host_value(to_script_value(&value)).expect("round trip");
            assert_eq!(back, value);
        }
    }

    #[test]
    fn collections_round_trip_by_identity() {
        let list = HostList::from_vec(vec![HostValue::int(1)]);
        let map = HostMap::new();
        let HostValue::Sequence(back) =
            to_host_value(to_script_value(&HostValue::Sequence(list.clone()))).expect("list")
        else {
            panic!("expected a list");
        };
        assert!(back.ptr_eq(&list));
        let HostValue::Mapping(back) =
            to_host_value(to_script_value(&HostValue::Mapping(map.clone()))).expect("map")
        else {
            panic!("expected a map");
        };
        assert!(back.ptr_eq(&map));
    }

    #[test]
    fn documents_and_opaque_values_pass_through() {
        let document = HostValue::Document(Document::Json(json!({"a": 1})));
        assert_eq!(
            to_host_value(to_script_value(&document)).expect("document"),
            document
        );
        let opaque = HostValue::Opaque(OpaqueRef::new(17_u32));
        assert_eq!(to_host_value(to_script_value(&opaque)).expect("opaque"), opaque);
    }

    #[test]
    fn native_collections_are_restructured() {
        let context = ExecutionContext::new();
        let value = context.evaluate("['a', 'b', 'c']").expect("array literal");
        let host = to_host_value_in(&context, value).expect("convert");
        assert_eq!(host.to_json(), json!(["a", "b", "c"]));

        let value = context
            .evaluate("#{ n: 1, nested: #{ ok: true }, f: |x| x }")
            .expect("map literal");
        let host = to_host_value_in(&context, value).expect("convert");
        assert_eq!(host.to_json(), json!({"n": 1, "nested": {"ok": true}}));
    }

    #[test]
    fn functions_need_an_entered_context() {
        let context = ExecutionContext::new();
        let value = context.evaluate("|x| x + 1").expect("closure");
        let error = to_host_value(value.clone()).expect_err("no context entered");
        assert_eq!(error.code(), "BRIDGE_VALUE_UNSUPPORTED");
        let host = to_host_value_in(&context, value).expect("with context");
        assert_eq!(host.type_name(), "function");
    }

    #[test]
    fn unknown_script_types_are_unsupported() {
        let error = to_host_value(Dynamic::from(std::time::Duration::from_secs(1)))
            .expect_err("unsupported");
        assert_eq!(error.code(), "BRIDGE_VALUE_UNSUPPORTED");
    }

    #[test]
    fn script_mutations_alias_host_maps() {
        let context = ExecutionContext::new();
        let map = HostMap::new();
        context.bind_host("p", &HostValue::Mapping(map.clone()));
        context.evaluate("p.foo = 1; p[\"bar\"] = [1, 2];").expect("mutate");
        assert_eq!(map.get("foo"), Some(HostValue::int(1)));
        assert_eq!(
            map.get("bar").expect("bar").to_json(),
            json!([1, 2])
        );
    }

    #[test]
    fn host_mutations_are_visible_to_scripts() {
        let context = ExecutionContext::new();
        let map = HostMap::new();
        context.bind_host("p", &HostValue::Mapping(map.clone()));
        map.insert("foo", HostValue::int(2));
        let value = context.evaluate("p.foo * 10").expect("read");
        assert_eq!(value.as_int().expect("int"), 20);
        map.insert("foo", HostValue::int(3));
        let value = context.eval_host("p").expect("read map");
        assert_eq!(value.to_json(), json!({"foo": 3}));
    }

    #[test]
    fn script_sees_host_lists_as_indexable() {
        let context = ExecutionContext::new();
        let list = HostList::from_vec(vec![HostValue::int(5), HostValue::int(6)]);
        context.bind_host("xs", &HostValue::Sequence(list.clone()));
        let value = context
            .evaluate("let total = 0; for x in xs { total += x; } total + xs[-1] + xs.len()")
            .expect("iterate");
        assert_eq!(value.as_int().expect("int"), 5 + 6 + 6 + 2);
        context.evaluate("xs.push(7); xs[0] = 1;").expect("mutate");
        assert_eq!(
            list.snapshot(),
            vec![HostValue::int(1), HostValue::int(6), HostValue::int(7)]
        );
    }
}
