use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sb_core::{BridgeConfig, FunctionRef};
use serde_json::json;

use super::*;
use crate::collaborators::{DirFileResolver, FeatureRunner};
use crate::scenario::{ScenarioInfo, Suite, SuiteOptions};

#[derive(Default)]
struct SlowFeature {
    runs: AtomicUsize,
}

impl FeatureRunner for SlowFeature {
    fn run(
        &self,
        feature: &FeatureUnit,
        arg: Option<HostValue>,
        _caller: &Arc<ScenarioRuntime>,
        _shared: bool,
    ) -> Result<HostValue, BridgeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(HostValue::map([
            ("token", HostValue::text("abc")),
            ("feature", HostValue::text(feature.path.clone())),
            ("arg", arg.unwrap_or_default()),
        ]))
    }
}

fn units() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("unit.feature"), "Feature: token").expect("feature");
    std::fs::write(dir.path().join("double.rhai"), "|x| x * 2").expect("script");
    std::fs::write(dir.path().join("plain.rhai"), "base + 1").expect("script");
    std::fs::write(dir.path().join("data.json"), "{\"a\": [1, 2]}").expect("json");
    dir
}

fn suite_in(dir: &tempfile::TempDir, features: Arc<SlowFeature>) -> Arc<Suite> {
    Suite::new(SuiteOptions {
        resolver: Some(Arc::new(DirFileResolver::new(dir.path()))),
        features: Some(features),
        ..SuiteOptions::default()
    })
}

fn scenario() -> Arc<ScenarioRuntime> {
    Suite::new(SuiteOptions::default()).scenario(ScenarioInfo::new("bridge"))
}

#[test]
fn get_on_empty_state_is_null() {
    let runtime = scenario();
    let bridge = runtime.bridge();
    assert_eq!(bridge.get("missing"), HostValue::Null);
    assert_eq!(bridge.get("missing.a[0]"), HostValue::Null);
    assert_eq!(
        ScriptBridge::new(Weak::new()).get("anything"),
        HostValue::Null
    );
    let value = runtime
        .evaluate(r#"karate.get("missing", 5)"#)
        .expect("default");
    assert_eq!(value, HostValue::int(5));
}

#[test]
fn get_walks_variable_paths() {
    let runtime = scenario();
    runtime.set_variable(
        "user",
        HostValue::map([(
            "roles",
            HostValue::list(vec![HostValue::map([("name", HostValue::text("admin"))])]),
        )]),
    );
    let bridge = runtime.bridge();
    assert_eq!(bridge.get("user.roles[0].name"), HostValue::text("admin"));
    assert_eq!(bridge.get("$user.roles[0].name"), HostValue::text("admin"));
    assert_eq!(bridge.get("user.roles.length"), HostValue::int(1));
}

#[test]
fn filter_keeps_even_numbers() {
    let runtime = scenario();
    let value = runtime
        .evaluate("karate.filter([1, 2, 3, 4], |x| x % 2 == 0)")
        .expect("filter");
    assert_eq!(value.to_json(), json!([2, 4]));
}

#[test]
fn filter_predicate_must_return_boolean() {
    let runtime = scenario();
    let error = runtime
        .evaluate("karate.filter([1, 2], |x| x)")
        .expect_err("not boolean");
    assert_eq!(error.code(), "BRIDGE_NOT_BOOLEAN");
}

#[test]
fn map_rejects_non_callables() {
    let runtime = scenario();
    let error = runtime
        .evaluate("karate.map([1, 2], 5)")
        .expect_err("not callable");
    assert_eq!(error.code(), "BRIDGE_NOT_CALLABLE");
}

#[test]
fn for_each_passes_keys_for_maps() {
    let runtime = scenario();
    runtime.set_variable("seen", HostValue::list(Vec::new()));
    runtime
        .evaluate(r#"karate.forEach(#{ a: 1, b: 2 }, |k, v, i| seen.push(k + ":" + v + ":" + i))"#)
        .expect("for each");
    assert_eq!(
        runtime.variable("seen").expect("seen").to_json(),
        json!(["a:1:0", "b:2:1"])
    );
}

#[test]
fn size_of_is_minus_one_for_scalars() {
    let runtime = scenario();
    let value = runtime
        .evaluate(r#"[karate.sizeOf("text"), karate.sizeOf([1, 2]), karate.sizeOf(#{ a: 1 })]"#)
        .expect("sizes");
    assert_eq!(value.to_json(), json!([-1, 2, 1]));
}

#[test]
fn set_with_path_builds_nested_state() {
    let runtime = scenario();
    runtime
        .evaluate(r#"karate.set("user", "address.city", "Paris"); karate.set("user", "tags[1]", "b");"#)
        .expect("set path");
    assert_eq!(
        runtime.variable("user").expect("user").to_json(),
        json!({"address": {"city": "Paris"}, "tags": [null, "b"]})
    );
    let city = runtime
        .evaluate(r#"karate.get("user.address.city")"#)
        .expect("read back");
    assert_eq!(city, HostValue::text("Paris"));
}

#[test]
fn set_with_xml_path_updates_documents() {
    let runtime = scenario();
    runtime
        .evaluate(r#"karate.setXml("order", "<order><id>1</id></order>"); karate.set("order", "/order/id", 7);"#)
        .expect("set xml");
    let order = runtime.variable("order").expect("order");
    let bridge = runtime.bridge();
    assert_eq!(
        bridge.xml_path(&order, "/order/id").expect("id"),
        HostValue::text("7")
    );
    bridge.remove("order", "/order/id").expect("remove");
    let order = runtime.variable("order").expect("order");
    assert_eq!(bridge.xml_path(&order, "/order/id").expect("gone"), HostValue::Null);
}

#[test]
fn set_is_visible_to_the_next_evaluation() {
    let runtime = scenario();
    runtime
        .evaluate(r#"let token = "local"; karate.set("token", "shared");"#)
        .expect("set");
    let value = runtime.evaluate("token").expect("read");
    assert_eq!(value, HostValue::text("shared"));
}

#[test]
fn fail_and_abort_record_state_without_raising() {
    let runtime = scenario();
    let value = runtime
        .evaluate(r#"karate.fail("bad thing"); karate.abort(); 1"#)
        .expect("no raise");
    assert_eq!(value, HostValue::int(1));
    assert_eq!(runtime.failure(), Some("bad thing".to_string()));
    assert!(runtime.is_aborted());
    let info = runtime.evaluate("karate.info").expect("info");
    assert_eq!(info.to_json()["errorMessage"], json!("bad thing"));
}

#[test]
fn call_runs_script_units() {
    let dir = units();
    let suite = suite_in(&dir, Arc::new(SlowFeature::default()));
    let runtime = suite.scenario(ScenarioInfo::new("call"));
    runtime.set_variable("base", HostValue::int(9));
    let doubled = runtime
        .evaluate(r#"karate.callUnit("double.rhai", 21)"#)
        .expect("function unit");
    assert_eq!(doubled, HostValue::int(42));
    let plain = runtime
        .evaluate(r#"karate.callUnit("classpath:plain.rhai")"#)
        .expect("expression unit");
    assert_eq!(plain, HostValue::int(10));
    let data = runtime.evaluate(r#"read("data.json").a[1]"#).expect("read");
    assert_eq!(data, HostValue::int(2));
}

#[test]
fn call_features_through_the_runner() {
    let dir = units();
    let features = Arc::new(SlowFeature::default());
    let runtime = suite_in(&dir, Arc::clone(&features)).scenario(ScenarioInfo::new("feature"));
    let value = runtime
        .evaluate(r#"karate.callUnit(read("unit.feature"), #{ id: 3 })"#)
        .expect("feature");
    assert_eq!(value.to_json()["arg"], json!({"id": 3}));
    assert_eq!(features.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_units_surface_their_error() {
    let dir = units();
    let runtime = suite_in(&dir, Arc::new(SlowFeature::default())).scenario(ScenarioInfo::new("x"));
    let error = runtime
        .evaluate(r#"karate.callUnit("nope.rhai")"#)
        .expect_err("missing");
    assert_eq!(error.code(), "BRIDGE_UNIT_NOT_FOUND");
}

#[test]
fn call_single_runs_once_across_scenarios() {
    let dir = units();
    let features = Arc::new(SlowFeature::default());
    let suite = suite_in(&dir, Arc::clone(&features));
    let threads = (0..6)
        .map(|index| {
            let suite = Arc::clone(&suite);
            thread::spawn(move || {
                let runtime = suite.scenario(ScenarioInfo::new(format!("worker-{}", index)));
                runtime
                    .evaluate(r#"karate.callSingle("unit.feature").token"#)
                    .expect("call single")
            })
        })
        .collect::<Vec<_>>();
    for thread in threads {
        assert_eq!(thread.join().expect("join"), HostValue::text("abc"));
    }
    assert_eq!(features.runs.load(Ordering::SeqCst), 1);
    assert!(suite.call_once().contains("unit.feature"));
}

#[test]
fn call_single_uses_the_disk_shadow_when_configured() {
    let dir = units();
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let features = Arc::new(SlowFeature::default());
    let suite = Suite::new(SuiteOptions {
        resolver: Some(Arc::new(DirFileResolver::new(dir.path()))),
        features: Some(features.clone()),
        config: Some(BridgeConfig {
            call_single_cache_minutes: 5,
            call_single_cache_dir: cache_dir.path().to_path_buf(),
            ..BridgeConfig::default()
        }),
        ..SuiteOptions::default()
    });
    suite
        .scenario(ScenarioInfo::new("first"))
        .bridge()
        .call_single("unit.feature", None)
        .expect("compute");
    assert!(cache_dir.path().join("unit.feature.txt").is_file());

    let fresh_suite = Suite::new(SuiteOptions {
        resolver: Some(Arc::new(DirFileResolver::new(dir.path()))),
        features: Some(features.clone()),
        config: Some(suite.config().clone()),
        ..SuiteOptions::default()
    });
    let value = fresh_suite
        .scenario(ScenarioInfo::new("second"))
        .bridge()
        .call_single("unit.feature", None)
        .expect("shadow hit");
    assert_eq!(value.to_json()["token"], json!("abc"));
    assert_eq!(features.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn copied_functions_survive_the_original_context() {
    let runtime = scenario();
    runtime.set_variable("base", HostValue::int(10));
    let HostValue::Function(original) = runtime.evaluate("|x| x + base").expect("closure") else {
        panic!("expected a function");
    };
    let copied = runtime
        .bridge()
        .to_java(HostValue::Function(Arc::clone(&original)))
        .expect("copy");
    let HostValue::Opaque(boxed) = copied else {
        panic!("expected an opaque copy");
    };
    let copied: FunctionRef = boxed
        .downcast_ref::<FunctionRef>()
        .cloned()
        .expect("boxed function");

    runtime.close();
    assert!(original.call(vec![HostValue::int(1)]).is_err());
    let handle = thread::spawn(move || copied.call(vec![HostValue::int(1)]));
    assert_eq!(handle.join().expect("join").expect("copy works"), HostValue::int(11));
}

fn copy_of(runtime: &Arc<ScenarioRuntime>, function: &FunctionRef) -> FunctionRef {
    let HostValue::Opaque(boxed) = runtime
        .bridge()
        .to_java(HostValue::Function(Arc::clone(function)))
        .expect("copy")
    else {
        panic!("expected an opaque copy");
    };
    boxed
        .downcast_ref::<FunctionRef>()
        .cloned()
        .expect("boxed function")
}

#[test]
fn copied_inline_closures_keep_their_own_state() {
    let runtime = scenario();
    runtime.set_variable("n", HostValue::int(0));
    let HostValue::Function(original) = runtime
        .evaluate("let counters = [|| { n += 1; n }]; counters[0]")
        .expect("closure")
    else {
        panic!("expected a function");
    };
    assert_eq!(original.source(), "|| { n += 1; n }");

    let copied = copy_of(&runtime, &original);
    assert_eq!(copied.call(Vec::new()).expect("copy"), HostValue::int(1));
    assert_eq!(copied.call(Vec::new()).expect("copy"), HostValue::int(2));
    assert_eq!(original.call(Vec::new()).expect("original"), HostValue::int(1));
    assert_eq!(runtime.variable("n"), Some(HostValue::int(0)));
}

#[test]
fn copying_does_not_rerun_the_defining_program() {
    let runtime = scenario();
    let HostValue::Function(original) = runtime
        .evaluate(r#"karate.set("hits", karate.get("hits", 0) + 1); |x| x + 1"#)
        .expect("closure")
    else {
        panic!("expected a function");
    };
    assert_eq!(runtime.variable("hits"), Some(HostValue::int(1)));

    let copied = copy_of(&runtime, &original);
    assert_eq!(copied.source(), "|x| x + 1");
    assert_eq!(copied.call(vec![HostValue::int(1)]).expect("copy"), HostValue::int(2));
    assert_eq!(runtime.variable("hits"), Some(HostValue::int(1)));
}

#[test]
fn functions_without_recorded_source_are_not_copied() {
    let runtime = scenario();
    let context = ExecutionContext::for_scenario(&runtime);
    let fn_ptr = FnPtr::new("nowhere").expect("fn pointer");
    let handle = FunctionHandle::capture(&context, fn_ptr);
    let error = handle.copy(&runtime).expect_err("nothing to rebuild");
    assert_eq!(error.code(), "BRIDGE_SCRIPT_INVOCATION");
}

#[test]
fn failing_inline_predicates_report_their_own_text() {
    let runtime = scenario();
    let error = runtime
        .evaluate("karate.map([1, 2], |x| x.no_such_method())")
        .expect_err("missing method");
    let BridgeError::ScriptInvocation { source_text, .. } = &error else {
        panic!("unexpected error {:?}", error);
    };
    assert_eq!(source_text, "|x| x.no_such_method()");
}

#[test]
fn from_string_parses_or_keeps_text() {
    let runtime = scenario();
    let bridge = runtime.bridge();
    assert_eq!(bridge.from_string("{\"a\": 1}").to_json(), json!({"a": 1}));
    assert_eq!(bridge.from_string("1 + 2"), HostValue::int(3));
    assert_eq!(bridge.type_of(&bridge.from_string("<a>1</a>")), HostValue::text("xml"));
    assert_eq!(bridge.from_string("not valid ((("), HostValue::text("not valid ((("));
}

#[test]
fn runtime_info_getters() {
    let runtime = Suite::new(SuiteOptions {
        config: Some(BridgeConfig {
            env: Some("qa".to_string()),
            ..BridgeConfig::default()
        }),
        ..SuiteOptions::default()
    })
    .scenario(ScenarioInfo::new("info").with_tags(["@smoke", "@region=eu,us"]));
    let value = runtime
        .evaluate("[karate.env, karate.tags, karate.tagValues.region]")
        .expect("getters");
    assert_eq!(value.to_json(), json!(["qa", ["smoke", "region=eu,us"], ["eu", "us"]]));
}

#[test]
fn write_lands_under_the_build_dir() {
    let build = tempfile::tempdir().expect("build dir");
    let runtime = Suite::new(SuiteOptions {
        config: Some(BridgeConfig {
            build_dir: build.path().to_path_buf(),
            ..BridgeConfig::default()
        }),
        ..SuiteOptions::default()
    })
    .scenario(ScenarioInfo::new("write"));
    runtime
        .evaluate(r#"karate.write(#{ ok: true }, "out/result.json")"#)
        .expect("write");
    let written = std::fs::read_to_string(build.path().join("out/result.json")).expect("file");
    assert_eq!(written, "{\"ok\":true}");
}

#[test]
fn matches_uses_the_matcher() {
    let runtime = scenario();
    let value = runtime
        .evaluate("karate.matches(#{ a: 1 }, #{ a: 2 })")
        .expect("match");
    assert_eq!(value.to_json()["pass"], json!(false));
}
