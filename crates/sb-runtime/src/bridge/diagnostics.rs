use std::fmt;

use regex::Regex;
use rhai::{Dynamic, Engine, ImmutableString, INT};
use sb_core::{
    from_json, json_path, parse_json, strip_nulls, BridgeError, Document, HostValue, XmlDocument,
    XmlNode, XmlSelection,
};
use tracing::{info, warn, Level};

use super::ScriptBridge;
use crate::value_bridge::{host, lift, to_script_value, ScriptResult};

/// Formats log arguments only when the line is actually written.
struct LogLine<'a>(&'a [HostValue]);

impl fmt::Display for LogLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&pretty_text(value))?;
        }
        Ok(())
    }
}

fn pretty_text(value: &HostValue) -> String {
    match value {
        HostValue::Sequence(_) | HostValue::Mapping(_) | HostValue::Document(Document::Json(_)) => {
            serde_json::to_string_pretty(&value.to_json()).unwrap_or_else(|_| value.to_display_text())
        }
        HostValue::Document(Document::Xml(document)) => document.to_pretty_string(),
        other => other.to_display_text(),
    }
}

fn xml_of(value: &HostValue) -> Result<XmlDocument, BridgeError> {
    match value {
        HostValue::Document(Document::Xml(document)) => Ok(document.clone()),
        HostValue::Text(text) => XmlDocument::parse(text),
        other => Err(BridgeError::unsupported(format!("{} as xml", other.type_name()))),
    }
}

fn compile(pattern: &str) -> Result<Regex, BridgeError> {
    Regex::new(pattern).map_err(|error| BridgeError::invalid_path(pattern, error.to_string()))
}

impl ScriptBridge {
    /// Writes one INFO line on `sb::script`. Nothing is formatted when
    /// printing is switched off or INFO is filtered out.
    pub fn log(&self, values: &[HostValue]) {
        let enabled = self
            .runtime()
            .map(|runtime| runtime.config().print_enabled)
            .unwrap_or(true);
        if !enabled || !tracing::enabled!(target: "sb::script", Level::INFO) {
            return;
        }
        info!(target: "sb::script", "{}", LogLine(values));
    }

    pub fn pretty(&self, value: &HostValue) -> HostValue {
        HostValue::Text(pretty_text(value))
    }

    pub fn pretty_xml(&self, value: &HostValue) -> Result<HostValue, BridgeError> {
        Ok(HostValue::Text(xml_of(value)?.to_pretty_string()))
    }

    pub fn type_of(&self, value: &HostValue) -> HostValue {
        HostValue::text(value.type_name())
    }

    pub fn to_string(&self, value: &HostValue) -> HostValue {
        HostValue::Text(value.to_display_text())
    }

    pub fn to_json(&self, value: &HostValue, remove_nulls: bool) -> HostValue {
        let json = value.to_json();
        if remove_nulls {
            from_json(&strip_nulls(&json))
        } else {
            from_json(&json)
        }
    }

    /// Lower-cases text, and the serialized form of JSON and XML values.
    pub fn lower_case(&self, value: &HostValue) -> Result<HostValue, BridgeError> {
        match value {
            HostValue::Text(text) => Ok(HostValue::Text(text.to_lowercase())),
            HostValue::Sequence(_) | HostValue::Mapping(_) | HostValue::Document(Document::Json(_)) => {
                parse_json(&value.to_json().to_string().to_lowercase())
            }
            HostValue::Document(Document::Xml(document)) => Ok(HostValue::Document(Document::Xml(
                XmlDocument::parse(&document.to_xml_string().to_lowercase())?,
            ))),
            other => Ok(other.clone()),
        }
    }

    /// Capture `group` of the first match of `pattern`, or `Null`.
    pub fn extract(&self, text: &str, pattern: &str, group: usize) -> Result<HostValue, BridgeError> {
        let regex = compile(pattern)?;
        let Some(captures) = regex.captures(text) else {
            warn!(target: "sb::bridge", "failed to find pattern: {}", pattern);
            return Ok(HostValue::Null);
        };
        Ok(captures
            .get(group)
            .map(|found| HostValue::text(found.as_str()))
            .unwrap_or_default())
    }

    pub fn extract_all(&self, text: &str, pattern: &str, group: usize) -> Result<HostValue, BridgeError> {
        let regex = compile(pattern)?;
        let found = regex
            .captures_iter(text)
            .filter_map(|captures| captures.get(group))
            .map(|found| HostValue::text(found.as_str()))
            .collect::<Vec<_>>();
        if found.is_empty() {
            warn!(target: "sb::bridge", "failed to find pattern: {}", pattern);
        }
        Ok(HostValue::list(found))
    }

    pub fn json_path(&self, value: &HostValue, path: &str) -> Result<HostValue, BridgeError> {
        let json = match value {
            HostValue::Text(text) => parse_json(text)?.to_json(),
            other => other.to_json(),
        };
        Ok(json_path(&json, path)?
            .map(|found| from_json(&found))
            .unwrap_or_default())
    }

    /// Leaf elements come back as their text, other elements as documents.
    pub fn xml_path(&self, value: &HostValue, path: &str) -> Result<HostValue, BridgeError> {
        let selection = xml_of(value)?.select(path)?;
        Ok(match selection {
            None => HostValue::Null,
            Some(XmlSelection::Attribute(text)) | Some(XmlSelection::Text(text)) => {
                HostValue::Text(text)
            }
            Some(XmlSelection::Element(element)) => {
                let leaf = element
                    .children
                    .iter()
                    .all(|child| matches!(child, XmlNode::Text(_)));
                if leaf {
                    HostValue::Text(element.text())
                } else {
                    HostValue::Document(Document::Xml(XmlDocument::new(element)))
                }
            }
        })
    }
}

fn log_values(bridge: &ScriptBridge, values: Vec<Dynamic>) -> ScriptResult {
    let values = values.into_iter().map(host).collect::<Result<Vec<_>, _>>()?;
    bridge.log(&values);
    Ok(Dynamic::UNIT)
}

fn group_index(group: INT) -> usize {
    group.max(0) as usize
}

pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_fn("log", |bridge: &mut ScriptBridge, a: Dynamic| log_values(bridge, vec![a]))
        .register_fn("log", |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic| {
            log_values(bridge, vec![a, b])
        })
        .register_fn(
            "log",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic, c: Dynamic| {
                log_values(bridge, vec![a, b, c])
            },
        )
        .register_fn(
            "log",
            |bridge: &mut ScriptBridge, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                log_values(bridge, vec![a, b, c, d])
            },
        );

    engine
        .register_fn("pretty", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.pretty(&host(value)?)))
        })
        .register_fn("prettyXml", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            lift(bridge.pretty_xml(&host(value)?))
        })
        .register_fn("typeOf", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.type_of(&host(value)?)))
        })
        .register_fn("toString", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.to_string(&host(value)?)))
        })
        .register_fn("toJson", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            Ok(to_script_value(&bridge.to_json(&host(value)?, false)))
        })
        .register_fn(
            "toJson",
            |bridge: &mut ScriptBridge, value: Dynamic, remove_nulls: bool| -> ScriptResult {
                Ok(to_script_value(&bridge.to_json(&host(value)?, remove_nulls)))
            },
        )
        .register_fn("lowerCase", |bridge: &mut ScriptBridge, value: Dynamic| -> ScriptResult {
            lift(bridge.lower_case(&host(value)?))
        });

    engine
        .register_fn(
            "extract",
            |bridge: &mut ScriptBridge,
             text: ImmutableString,
             pattern: ImmutableString,
             group: INT| { lift(bridge.extract(&text, &pattern, group_index(group))) },
        )
        .register_fn(
            "extractAll",
            |bridge: &mut ScriptBridge,
             text: ImmutableString,
             pattern: ImmutableString,
             group: INT| {
                lift(bridge.extract_all(&text, &pattern, group_index(group)))
            },
        )
        .register_fn(
            "jsonPath",
            |bridge: &mut ScriptBridge, value: Dynamic, path: ImmutableString| -> ScriptResult {
                lift(bridge.json_path(&host(value)?, &path))
            },
        )
        .register_fn(
            "xmlPath",
            |bridge: &mut ScriptBridge, value: Dynamic, path: ImmutableString| -> ScriptResult {
                lift(bridge.xml_path(&host(value)?, &path))
            },
        );
}

#[cfg(test)]
mod diagnostics_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sb_core::HostFunction;
    use serde_json::json;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::scenario::{ScenarioInfo, Suite, SuiteOptions};
    use sb_core::BridgeConfig;

    #[derive(Debug, Default)]
    struct CountingFunction {
        rendered: AtomicUsize,
    }

    impl HostFunction for CountingFunction {
        fn source(&self) -> &str {
            self.rendered.fetch_add(1, Ordering::SeqCst);
            "counted"
        }

        fn call(&self, _args: Vec<HostValue>) -> Result<HostValue, BridgeError> {
            Ok(HostValue::Null)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn detached() -> ScriptBridge {
        ScriptBridge::new(std::sync::Weak::new())
    }

    #[test]
    fn log_does_not_format_when_printing_is_off() {
        let suite = Suite::new(SuiteOptions {
            config: Some(BridgeConfig {
                print_enabled: false,
                ..BridgeConfig::default()
            }),
            ..SuiteOptions::default()
        });
        let runtime = suite.scenario(ScenarioInfo::new("quiet"));
        let counter = Arc::new(CountingFunction::default());
        let function: sb_core::FunctionRef = counter.clone();
        runtime.bridge().log(&[HostValue::Function(function)]);
        assert_eq!(counter.rendered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_does_not_format_without_an_info_subscriber() {
        let runtime = Suite::new(SuiteOptions::default()).scenario(ScenarioInfo::new("loud"));
        let counter = Arc::new(CountingFunction::default());
        let function: sb_core::FunctionRef = counter.clone();
        runtime.bridge().log(&[HostValue::Function(function)]);
        assert_eq!(counter.rendered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn extract_returns_group_or_null() {
        let bridge = detached();
        assert_eq!(
            bridge.extract("id=42;", r"id=(\d+)", 1).expect("extract"),
            HostValue::text("42")
        );
        assert_eq!(
            bridge.extract("nothing", r"id=(\d+)", 1).expect("no match"),
            HostValue::Null
        );
        assert_eq!(
            bridge
                .extract_all("a1 b2 c3", r"[a-z](\d)", 1)
                .expect("all")
                .to_json(),
            json!(["1", "2", "3"])
        );
        assert_eq!(
            bridge.extract("x", "(", 0).expect_err("bad regex").code(),
            "BRIDGE_INVALID_PATH"
        );
    }

    #[test]
    fn to_json_can_strip_nulls() {
        let bridge = detached();
        let value = HostValue::map([("a", HostValue::Null), ("b", HostValue::int(1))]);
        assert_eq!(bridge.to_json(&value, true).to_json(), json!({"b": 1}));
        assert_eq!(bridge.to_json(&value, false).to_json(), json!({"a": null, "b": 1}));
    }

    #[test]
    fn lower_case_handles_text_and_json() {
        let bridge = detached();
        assert_eq!(
            bridge.lower_case(&HostValue::text("AbC")).expect("text"),
            HostValue::text("abc")
        );
        let value = HostValue::map([("Key", HostValue::text("VALUE"))]);
        assert_eq!(
            bridge.lower_case(&value).expect("json").to_json(),
            json!({"key": "value"})
        );
    }

    #[test]
    fn paths_into_documents() {
        let bridge = detached();
        let json = HostValue::Document(Document::Json(json!({"a": [{"b": 7}]})));
        assert_eq!(
            bridge.json_path(&json, "$.a[0].b").expect("json path"),
            HostValue::int(7)
        );
        let xml = HostValue::text("<r><a id=\"x\">hi</a><b><c>1</c></b></r>");
        assert_eq!(bridge.xml_path(&xml, "/r/a").expect("leaf"), HostValue::text("hi"));
        assert_eq!(bridge.xml_path(&xml, "/r/a/@id").expect("attr"), HostValue::text("x"));
        assert_eq!(bridge.type_of(&bridge.xml_path(&xml, "/r/b").expect("element")), HostValue::text("xml"));
        assert_eq!(bridge.xml_path(&xml, "/r/zzz").expect("missing"), HostValue::Null);
    }

    #[test]
    fn type_names_for_scripts() {
        let bridge = detached();
        assert_eq!(bridge.type_of(&HostValue::int(1)), HostValue::text("number"));
        assert_eq!(bridge.type_of(&HostValue::list(Vec::new())), HostValue::text("list"));
        assert_eq!(bridge.type_of(&HostValue::Null), HostValue::text("null"));
    }
}
