use std::path::{Path, PathBuf};
use std::sync::Arc;

use sb_core::{parse_json, BridgeConfig, HostValue};
use sb_runtime::{DirFileResolver, ScenarioInfo, Suite, SuiteOptions};
use tracing::{debug, info};

use crate::source_loader::{list_units, resolve_root, DEFAULT_CONFIG_FILE};
use crate::{CliError, RunArgs, UnitsArgs};

/// What a unit run produced: its value and the failure the scenario recorded,
/// if any.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunOutcome {
    pub(crate) value: HostValue,
    pub(crate) failure: Option<String>,
}

pub(crate) fn run_unit(args: RunArgs) -> Result<i32, CliError> {
    let root = resolve_root(&args.root)?;
    let config = load_config(&root, args.config.as_deref(), args.env)?;
    let arg = args.arg.as_deref().map(parse_json).transpose()?;
    let outcome = evaluate_unit(&root, config, &args.unit, arg, args.tags, args.single)?;
    emit_outcome(&outcome);
    Ok(if outcome.failure.is_some() { 1 } else { 0 })
}

pub(crate) fn run_units(args: UnitsArgs) -> Result<i32, CliError> {
    let root = resolve_root(&args.root)?;
    let units = list_units(&root)?;
    println!("RESULT:OK");
    for unit in &units {
        println!("UNIT:{}", unit);
    }
    println!("COUNT:{}", units.len());
    Ok(0)
}

/// `--config` when given, else `sb.toml` under the root, else defaults.
/// `--env` wins over the file.
fn load_config(
    root: &Path,
    explicit: Option<&str>,
    env: Option<String>,
) -> Result<BridgeConfig, CliError> {
    let path = match explicit {
        Some(path) => Some(PathBuf::from(path)),
        None => Some(root.join(DEFAULT_CONFIG_FILE)).filter(|path| path.is_file()),
    };
    let mut config = match path {
        Some(path) => {
            debug!(target: "sb::cli", "loading config from {}", path.display());
            BridgeConfig::load(&path)?
        }
        None => BridgeConfig::default(),
    };
    if env.is_some() {
        config.env = env;
    }
    Ok(config)
}

fn evaluate_unit(
    root: &Path,
    config: BridgeConfig,
    unit: &str,
    arg: Option<HostValue>,
    tags: Vec<String>,
    single: bool,
) -> Result<RunOutcome, CliError> {
    let suite = Suite::new(SuiteOptions {
        config: Some(config),
        resolver: Some(Arc::new(DirFileResolver::new(root))),
        ..SuiteOptions::default()
    });
    let runtime = suite.scenario(
        ScenarioInfo::new(unit)
            .with_feature_file(unit)
            .with_tags(tags),
    );
    info!(target: "sb::cli", "running {} under {}", unit, root.display());
    let bridge = runtime.bridge();
    let result = if single {
        bridge.call_single(unit, arg)
    } else {
        bridge.call(false, unit, arg)
    };
    runtime.close();
    Ok(RunOutcome {
        value: result?,
        failure: runtime.failure(),
    })
}

fn emit_outcome(outcome: &RunOutcome) {
    match &outcome.failure {
        None => println!("RESULT:OK"),
        Some(reason) => {
            println!("RESULT:FAILED");
            println!("FAILURE_JSON:{}", serde_json::Value::String(reason.clone()));
        }
    }
    println!("VALUE_JSON:{}", outcome.value.to_json());
}

#[cfg(test)]
mod runner_tests {
    use super::*;
    use serde_json::json;

    fn units() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("double.rhai"), "|x| x * 2").expect("script");
        std::fs::write(
            dir.path().join("greet.rhai"),
            r#"if karate.env == "qa" { "hi qa" } else { karate.fail("wrong env"); "" }"#,
        )
        .expect("script");
        dir
    }

    #[test]
    fn evaluate_unit_applies_function_units() {
        let dir = units();
        let outcome = evaluate_unit(
            dir.path(),
            BridgeConfig::default(),
            "double.rhai",
            Some(HostValue::int(21)),
            Vec::new(),
            false,
        )
        .expect("run");
        assert_eq!(outcome.value.to_json(), json!(42));
        assert_eq!(outcome.failure, None);
    }

    #[test]
    fn evaluate_unit_reports_scenario_failure() {
        let dir = units();
        let outcome = evaluate_unit(
            dir.path(),
            BridgeConfig::default(),
            "greet.rhai",
            None,
            Vec::new(),
            true,
        )
        .expect("run");
        assert_eq!(outcome.failure, Some("wrong env".to_string()));
    }

    #[test]
    fn load_config_prefers_env_flag() {
        let dir = units();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "env = \"dev\"\ncall_single_cache_minutes = 5\n",
        )
        .expect("config");
        let from_file = load_config(dir.path(), None, None).expect("file config");
        assert_eq!(from_file.env.as_deref(), Some("dev"));
        assert_eq!(from_file.call_single_cache_minutes, 5);

        let overridden = load_config(dir.path(), None, Some("qa".to_string())).expect("override");
        assert_eq!(overridden.env.as_deref(), Some("qa"));
    }

    #[test]
    fn missing_units_keep_the_bridge_code() {
        let dir = units();
        let error = evaluate_unit(
            dir.path(),
            BridgeConfig::default(),
            "nope.rhai",
            None,
            Vec::new(),
            false,
        )
        .expect_err("missing");
        assert_eq!(error.code, "BRIDGE_UNIT_NOT_FOUND");
    }
}
