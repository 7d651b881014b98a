pub mod collections;
pub mod diagnostics;
pub mod http;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, INT};
use sb_core::{
    from_json, parse_json, BridgeError, Document, FunctionRef, HostList, HostMap, HostValue, OpaqueRef,
    XmlDocument, XmlElement,
};
use tracing::{debug, trace};

use crate::call_once::DiskShadow;
use crate::collaborators::{FeatureUnit, Resource};
use crate::context::ExecutionContext;
use crate::function::FunctionHandle;
use crate::helpers::value_path::{
    assign_nested_path, parse_value_path, remove_nested_path, resolve_path, PathSegment,
};
use crate::scenario::ScenarioRuntime;
use crate::value_bridge::{host, lift, to_host_value_in, to_script_value, ScriptResult};

/// The host object scripts see as `karate`.
///
/// It only holds a weak link to its scenario, so a bridge left behind in a
/// script value never keeps a finished scenario alive.
#[derive(Debug, Clone)]
pub struct ScriptBridge {
    runtime: Weak<ScenarioRuntime>,
}

impl ScriptBridge {
    pub fn new(runtime: Weak<ScenarioRuntime>) -> Self {
        Self { runtime }
    }

    pub fn for_runtime(runtime: &Arc<ScenarioRuntime>) -> Self {
        Self::new(Arc::downgrade(runtime))
    }

    pub fn runtime(&self) -> Result<Arc<ScenarioRuntime>, BridgeError> {
        self.runtime.upgrade().ok_or_else(|| BridgeError::Config {
            message: "no scenario runtime behind this context".to_string(),
        })
    }

    /// The context evaluating on this thread, or the scenario's main one.
    fn context(&self) -> Result<Arc<ExecutionContext>, BridgeError> {
        match ExecutionContext::current() {
            Some(context) => Ok(context),
            None => Ok(self.runtime()?.main_context()),
        }
    }

    /// Resolves `name`, `name.a[0].b` or `$name.a` against the scenario
    /// variables, falling back to evaluating `expr`. Never fails: anything
    /// unresolvable is `Null`.
    pub fn get(&self, expr: &str) -> HostValue {
        match self.try_get(expr) {
            Ok(value) => value,
            Err(error) => {
                trace!(target: "sb::bridge", "get('{}') is null: {}", expr, error);
                HostValue::Null
            }
        }
    }

    pub fn get_or(&self, expr: &str, default: HostValue) -> HostValue {
        match self.get(expr) {
            HostValue::Null => default,
            value => value,
        }
    }

    fn try_get(&self, expr: &str) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        if let Ok(segments) = parse_value_path(expr) {
            if let Some((PathSegment::Key(name), rest)) = segments.split_first() {
                if let Some(value) = runtime.variable(name) {
                    return Ok(lookup(&value, rest).unwrap_or_default());
                }
            }
        }
        self.context()?
            .eval_host(expr)
            .map_err(|error| BridgeError::ExpressionEvaluation {
                expr: expr.to_string(),
                message: error.to_string(),
            })
    }

    /// Sets a scenario variable. A context-local binding of the same name is
    /// dropped so the next evaluation sees the new value.
    pub fn set(&self, name: &str, value: HostValue) -> Result<(), BridgeError> {
        let runtime = self.runtime()?;
        runtime.set_variable(name, value);
        if let Some(context) = ExecutionContext::current() {
            context.forget(name);
        }
        Ok(())
    }

    pub fn set_all(&self, values: &HostValue) -> Result<(), BridgeError> {
        let Some(map) = values.as_map() else {
            return Err(BridgeError::unsupported(values.type_name()));
        };
        for (name, value) in map.snapshot() {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Writes `value` at `path` inside variable `name`. XML variables (and
    /// missing variables addressed with `/root/..`) take element paths;
    /// everything else takes `a.b[0]` paths and gets intermediate containers.
    pub fn set_path(&self, name: &str, path: &str, value: HostValue) -> Result<(), BridgeError> {
        let runtime = self.runtime()?;
        let current = runtime.variable(name);
        if is_xml_target(current.as_ref(), path) {
            let mut document = xml_variable(current, path)?;
            match value {
                HostValue::Document(Document::Xml(fragment)) => {
                    document.set_element(path, fragment.root().clone())?
                }
                other => document.set_text(path, &other.to_display_text())?,
            }
            return self.set(name, HostValue::Document(Document::Xml(document)));
        }
        let segments = parse_value_path(path)?;
        let target = match current {
            Some(HostValue::Document(Document::Json(json))) => from_json(&json),
            Some(existing) if existing.is_map_or_list() => existing,
            Some(other) => {
                return Err(BridgeError::invalid_path(
                    path,
                    format!("cannot set a path inside a {}", other.type_name()),
                ))
            }
            None => match segments.first() {
                Some(PathSegment::Index(_)) => HostValue::Sequence(HostList::new()),
                _ => HostValue::Mapping(HostMap::new()),
            },
        };
        assign_nested_path(&target, &segments, value)
            .map_err(|message| BridgeError::invalid_path(path, message))?;
        self.set(name, target)
    }

    pub fn remove(&self, name: &str, path: &str) -> Result<(), BridgeError> {
        let runtime = self.runtime()?;
        match runtime.variable(name) {
            Some(HostValue::Document(Document::Xml(mut document))) => {
                document.remove(path)?;
                self.set(name, HostValue::Document(Document::Xml(document)))
            }
            Some(HostValue::Document(Document::Json(json))) => {
                let target = from_json(&json);
                remove_nested_path(&target, &parse_value_path(path)?);
                self.set(name, target)
            }
            Some(target) => {
                remove_nested_path(&target, &parse_value_path(path)?);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn set_xml(&self, name: &str, xml: &str) -> Result<(), BridgeError> {
        let document = XmlDocument::parse(xml)?;
        self.set(name, HostValue::Document(Document::Xml(document)))
    }

    pub fn set_xml_path(&self, name: &str, path: &str, xml: &str) -> Result<(), BridgeError> {
        let document = XmlDocument::parse(xml)?;
        self.set_path(name, path, HostValue::Document(Document::Xml(document)))
    }

    /// JSON text is parsed, markup becomes an XML document and anything else
    /// is evaluated. Text that does not evaluate comes back unchanged.
    pub fn from_string(&self, text: &str) -> HostValue {
        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = parse_json(trimmed) {
                return value;
            }
        }
        if trimmed.starts_with('<') {
            if let Ok(document) = XmlDocument::parse(trimmed) {
                return HostValue::Document(Document::Xml(document));
            }
        }
        match self.context().and_then(|context| context.eval_host(trimmed)) {
            Ok(value) => value,
            Err(error) => {
                trace!(target: "sb::bridge", "fromString kept text: {}", error);
                HostValue::text(text)
            }
        }
    }

    pub fn eval(&self, source: &str) -> Result<HostValue, BridgeError> {
        self.context()?.eval_host(source)
    }

    pub fn read(&self, path: &str) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        match runtime.suite().resolver().read(path)? {
            Resource::Script(source) => self.context()?.eval_host(&source),
            Resource::Feature(feature) => Ok(HostValue::Opaque(OpaqueRef::new(feature))),
            Resource::Value(value) => Ok(value),
        }
    }

    pub fn read_as_string(&self, path: &str) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        Ok(HostValue::Text(runtime.suite().resolver().read_text(path)?))
    }

    pub fn call(
        &self,
        shared: bool,
        path: &str,
        arg: Option<HostValue>,
    ) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        debug!(target: "sb::bridge", "call {} (shared: {})", path, shared);
        match runtime.suite().resolver().read(path)? {
            Resource::Script(source) => {
                let context = if shared {
                    self.context()?
                } else {
                    ExecutionContext::for_scenario(&runtime)
                };
                let value = context.evaluate(&source)?;
                if value.is::<FnPtr>() {
                    FunctionHandle::capture(&context, value.cast::<FnPtr>()).invoke(arg)
                } else {
                    to_host_value_in(&context, value)
                }
            }
            Resource::Feature(feature) => self.run_feature(&runtime, &feature, arg, shared),
            Resource::Value(value) => Ok(value),
        }
    }

    /// `call` for whatever a script passes: a path, a feature returned by
    /// `read`, or a function.
    pub fn call_target(
        &self,
        shared: bool,
        target: &HostValue,
        arg: Option<HostValue>,
    ) -> Result<HostValue, BridgeError> {
        match target {
            HostValue::Text(path) => self.call(shared, path, arg),
            HostValue::Function(function) => function.call(arg.into_iter().collect()),
            HostValue::Opaque(opaque) => match opaque.downcast_ref::<FeatureUnit>() {
                Some(feature) => {
                    let runtime = self.runtime()?;
                    self.run_feature(&runtime, feature, arg, shared)
                }
                None => Err(BridgeError::NotCallable {
                    type_name: opaque.type_name().to_string(),
                }),
            },
            other => Err(BridgeError::NotCallable {
                type_name: other.type_name().to_string(),
            }),
        }
    }

    fn run_feature(
        &self,
        runtime: &Arc<ScenarioRuntime>,
        feature: &FeatureUnit,
        arg: Option<HostValue>,
        shared: bool,
    ) -> Result<HostValue, BridgeError> {
        runtime.suite().features().run(feature, arg, runtime, shared)
    }

    /// `call` at most once per suite for `path`; later callers get the cached
    /// result, whatever argument they pass.
    pub fn call_single(&self, path: &str, arg: Option<HostValue>) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        let config = runtime.config();
        let shadow = (config.call_single_cache_minutes > 0).then(|| DiskShadow {
            dir: PathBuf::from(&config.call_single_cache_dir),
            minutes: config.call_single_cache_minutes,
        });
        let cache = Arc::clone(runtime.suite().call_once());
        cache.get_or_compute_persisted(path, shadow.as_ref(), || self.call(false, path, arg))
    }

    pub fn fail(&self, reason: &str) -> Result<(), BridgeError> {
        self.runtime()?.fail(reason);
        Ok(())
    }

    pub fn abort(&self) -> Result<(), BridgeError> {
        self.runtime()?.abort();
        Ok(())
    }

    pub fn configure(&self, key: &str, value: &HostValue) -> Result<(), BridgeError> {
        self.runtime()?.configure(key, value)
    }

    pub fn embed(&self, value: &HostValue, content_type: &str) -> Result<(), BridgeError> {
        self.runtime()?.embed(value_bytes(value), content_type);
        Ok(())
    }

    /// Writes `value` under the build directory and returns the file path.
    pub fn write(&self, value: &HostValue, path: &str) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        let file = PathBuf::from(runtime.config().build_dir).join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|error| BridgeError::io(parent, &error))?;
        }
        std::fs::write(&file, value_bytes(value)).map_err(|error| BridgeError::io(&file, &error))?;
        Ok(HostValue::text(file.display().to_string()))
    }

    pub fn signal(&self, value: HostValue) -> Result<(), BridgeError> {
        self.runtime()?.signal(value);
        Ok(())
    }

    pub fn listen(&self, timeout_millis: u64) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        Ok(runtime
            .listen(Duration::from_millis(timeout_millis))
            .unwrap_or_default())
    }

    pub fn env(&self) -> HostValue {
        self.runtime
            .upgrade()
            .and_then(|runtime| runtime.config().env)
            .map(HostValue::Text)
            .unwrap_or_default()
    }

    pub fn tags(&self) -> HostValue {
        let Some(runtime) = self.runtime.upgrade() else {
            return HostValue::Null;
        };
        HostValue::list(
            runtime
                .info()
                .tags
                .iter()
                .map(|tag| HostValue::text(tag.trim_start_matches('@')))
                .collect(),
        )
    }

    pub fn tag_values(&self) -> HostValue {
        let Some(runtime) = self.runtime.upgrade() else {
            return HostValue::Null;
        };
        HostValue::map(runtime.info().tag_values().into_iter().map(|(name, values)| {
            (
                name,
                HostValue::list(values.into_iter().map(HostValue::Text).collect()),
            )
        }))
    }

    pub fn info(&self) -> HostValue {
        let Some(runtime) = self.runtime.upgrade() else {
            return HostValue::Null;
        };
        let info = runtime.info();
        HostValue::map([
            ("scenarioName", HostValue::text(info.name.clone())),
            ("featureFileName", HostValue::text(info.feature_file.clone())),
            (
                "errorMessage",
                runtime.failure().map(HostValue::Text).unwrap_or_default(),
            ),
        ])
    }

    pub fn os(&self) -> HostValue {
        let family = match std::env::consts::OS {
            "macos" => "macosx",
            other => other,
        };
        HostValue::map([
            ("type", HostValue::text(family)),
            ("name", HostValue::text(std::env::consts::OS)),
        ])
    }

    pub fn properties(&self) -> HostValue {
        let Some(runtime) = self.runtime.upgrade() else {
            return HostValue::Null;
        };
        HostValue::map(
            runtime
                .suite()
                .properties()
                .iter()
                .map(|(key, value)| (key.clone(), HostValue::text(value.clone()))),
        )
    }

    pub fn prev_request(&self) -> HostValue {
        self.runtime
            .upgrade()
            .and_then(|runtime| runtime.prev_request())
            .map(|request| request.to_host_value())
            .unwrap_or_default()
    }

    /// Detaches a script function from this scenario's context: the result is
    /// a copy that keeps working after the scenario ends, boxed so scripts
    /// pass it along without calling it.
    pub fn to_java(&self, value: HostValue) -> Result<HostValue, BridgeError> {
        let HostValue::Function(function) = &value else {
            return Ok(value);
        };
        let Some(handle) = FunctionHandle::from_ref(function) else {
            return Ok(HostValue::Opaque(OpaqueRef::new(Arc::clone(function))));
        };
        let copied: FunctionRef = Arc::new(handle.copy(&self.runtime()?)?);
        Ok(HostValue::Opaque(OpaqueRef::new(copied)))
    }

    pub fn matches(&self, actual: &HostValue, expected: &HostValue) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        Ok(runtime.suite().matcher().matches(actual, expected).to_host_value())
    }
}

fn lookup(value: &HostValue, path: &[PathSegment]) -> Option<HostValue> {
    match value {
        HostValue::Document(Document::Json(json)) if !path.is_empty() => {
            resolve_path(&from_json(json), path)
        }
        other => resolve_path(other, path),
    }
}

fn is_xml_target(current: Option<&HostValue>, path: &str) -> bool {
    match current {
        Some(HostValue::Document(Document::Xml(_))) => true,
        None => path.starts_with('/'),
        Some(_) => false,
    }
}

/// The XML document stored in a variable, or a new one rooted at the first
/// step of `path`.
fn xml_variable(current: Option<HostValue>, path: &str) -> Result<XmlDocument, BridgeError> {
    if let Some(HostValue::Document(Document::Xml(document))) = current {
        return Ok(document);
    }
    let root = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .map(|step| step.split('[').next().unwrap_or(step))
        .filter(|name| !name.is_empty() && !name.starts_with('@'))
        .ok_or_else(|| BridgeError::invalid_path(path, "no root element"))?;
    Ok(XmlDocument::new(XmlElement::new(root)))
}

pub(crate) fn value_bytes(value: &HostValue) -> Vec<u8> {
    match value {
        HostValue::Binary(bytes) => bytes.clone(),
        other => other.to_display_text().into_bytes(),
    }
}

fn optional(value: Dynamic) -> Result<Option<HostValue>, Box<EvalAltResult>> {
    let value = host(value)?;
    Ok((!value.is_null()).then_some(value))
}

fn unit(result: Result<(), BridgeError>) -> ScriptResult {
    lift(result.map(|_| HostValue::Null))
}

/// Wraps the `read` global for the context entered on this thread.
fn read_global(path: &str) -> ScriptResult {
    let runtime = ExecutionContext::current().and_then(|context| context.runtime());
    let Some(runtime) = runtime else {
        return lift(Err(BridgeError::Config {
            message: format!("read('{}') outside of a scenario", path),
        }));
    };
    lift(ScriptBridge::for_runtime(&runtime).read(path))
}

pub(crate) fn register(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptBridge>("ScriptBridge");
    engine.register_fn("read", |path: ImmutableString| read_global(&path));

    engine
        .register_fn("get", |bridge: &mut ScriptBridge, expr: ImmutableString| {
            to_script_value(&bridge.get(&expr))
        })
        .register_fn(
            "get",
            |bridge: &mut ScriptBridge, expr: ImmutableString, default: Dynamic| -> ScriptResult {
                let default = host(default)?;
                Ok(to_script_value(&bridge.get_or(&expr, default)))
            },
        )
        .register_fn("set", |bridge: &mut ScriptBridge, values: Dynamic| -> ScriptResult {
            unit(bridge.set_all(&host(values)?))
        })
        .register_fn(
            "set",
            |bridge: &mut ScriptBridge, name: ImmutableString, value: Dynamic| -> ScriptResult {
                unit(bridge.set(&name, host(value)?))
            },
        )
        .register_fn(
            "set",
            |bridge: &mut ScriptBridge,
             name: ImmutableString,
             path: ImmutableString,
             value: Dynamic|
             -> ScriptResult { unit(bridge.set_path(&name, &path, host(value)?)) },
        )
        .register_fn(
            "remove",
            |bridge: &mut ScriptBridge, name: ImmutableString, path: ImmutableString| {
                unit(bridge.remove(&name, &path))
            },
        )
        .register_fn(
            "setXml",
            |bridge: &mut ScriptBridge, name: ImmutableString, xml: ImmutableString| {
                unit(bridge.set_xml(&name, &xml))
            },
        )
        .register_fn(
            "setXml",
            |bridge: &mut ScriptBridge,
             name: ImmutableString,
             path: ImmutableString,
             xml: ImmutableString| { unit(bridge.set_xml_path(&name, &path, &xml)) },
        )
        .register_fn("fromString", |bridge: &mut ScriptBridge, text: ImmutableString| {
            to_script_value(&bridge.from_string(&text))
        })
        .register_fn("evaluate", |bridge: &mut ScriptBridge, source: ImmutableString| {
            lift(bridge.eval(&source))
        })
        .register_fn("read", |bridge: &mut ScriptBridge, path: ImmutableString| {
            lift(bridge.read(&path))
        })
        .register_fn(
            "readAsString",
            |bridge: &mut ScriptBridge, path: ImmutableString| lift(bridge.read_as_string(&path)),
        );

    engine
        .register_fn("callUnit", |bridge: &mut ScriptBridge, target: Dynamic| -> ScriptResult {
            lift(bridge.call_target(false, &host(target)?, None))
        })
        .register_fn(
            "callUnit",
            |bridge: &mut ScriptBridge, target: Dynamic, arg: Dynamic| -> ScriptResult {
                lift(bridge.call_target(false, &host(target)?, optional(arg)?))
            },
        )
        .register_fn(
            "callUnit",
            |bridge: &mut ScriptBridge, shared: bool, target: Dynamic, arg: Dynamic| -> ScriptResult {
                lift(bridge.call_target(shared, &host(target)?, optional(arg)?))
            },
        )
        .register_fn("callSingle", |bridge: &mut ScriptBridge, path: ImmutableString| {
            lift(bridge.call_single(&path, None))
        })
        .register_fn(
            "callSingle",
            |bridge: &mut ScriptBridge, path: ImmutableString, arg: Dynamic| -> ScriptResult {
                lift(bridge.call_single(&path, optional(arg)?))
            },
        );

    engine
        .register_fn("fail", |bridge: &mut ScriptBridge, reason: Dynamic| -> ScriptResult {
            unit(bridge.fail(&host(reason)?.to_display_text()))
        })
        .register_fn("abort", |bridge: &mut ScriptBridge| unit(bridge.abort()))
        .register_fn(
            "configure",
            |bridge: &mut ScriptBridge, key: ImmutableString, value: Dynamic| -> ScriptResult {
                unit(bridge.configure(&key, &host(value)?))
            },
        )
        .register_fn(
            "embed",
            |bridge: &mut ScriptBridge, value: Dynamic, content_type: ImmutableString| -> ScriptResult {
                unit(bridge.embed(&host(value)?, &content_type))
            },
        )
        .register_fn(
            "write",
            |bridge: &mut ScriptBridge, value: Dynamic, path: ImmutableString| -> ScriptResult {
                lift(bridge.write(&host(value)?, &path))
            },
        )
        .register_fn("signal", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            unit(bridge.signal(host(value)?))
        })
        .register_fn("listen", |bridge: &mut ScriptBridge, timeout: INT| {
            lift(bridge.listen(timeout.max(0) as u64))
        })
        .register_fn("toJava", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            lift(bridge.to_java(host(value)?))
        })
        .register_fn(
            "matches",
            |bridge: &mut ScriptBridge, actual: Dynamic, expected: Dynamic| -> ScriptResult {
                lift(bridge.matches(&host(actual)?, &host(expected)?))
            },
        );

    engine
        .register_get("env", |bridge: &mut ScriptBridge| to_script_value(&bridge.env()))
        .register_get("tags", |bridge: &mut ScriptBridge| to_script_value(&bridge.tags()))
        .register_get("tagValues", |bridge: &mut ScriptBridge| {
            to_script_value(&bridge.tag_values())
        })
        .register_get("info", |bridge: &mut ScriptBridge| to_script_value(&bridge.info()))
        .register_get("os", |bridge: &mut ScriptBridge| to_script_value(&bridge.os()))
        .register_get("properties", |bridge: &mut ScriptBridge| {
            to_script_value(&bridge.properties())
        })
        .register_get("prevRequest", |bridge: &mut ScriptBridge| {
            to_script_value(&bridge.prev_request())
        });

    collections::register(engine);
    diagnostics::register(engine);
    http::register(engine);
}

#[cfg(test)]
mod tests;
