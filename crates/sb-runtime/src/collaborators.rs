use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use sb_core::{parse_json, BridgeError, Document, FunctionRef, HostValue, XmlDocument};

use crate::scenario::ScenarioRuntime;

/// A feature file handed to the [`FeatureRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureUnit {
    pub path: String,
    pub text: String,
}

/// What a path read through the [`FileResolver`] turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Script(String),
    Feature(FeatureUnit),
    Value(HostValue),
}

pub trait FileResolver: Send + Sync {
    fn read(&self, path: &str) -> Result<Resource, BridgeError>;
    fn read_text(&self, path: &str) -> Result<String, BridgeError>;
}

pub trait FeatureRunner: Send + Sync {
    /// Runs `feature` on behalf of `caller`. With `shared` the callee works on
    /// the caller's variables instead of a copy.
    fn run(
        &self,
        feature: &FeatureUnit,
        arg: Option<HostValue>,
        caller: &Arc<ScenarioRuntime>,
        shared: bool,
    ) -> Result<HostValue, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<HostValue>,
}

impl HttpRequest {
    pub fn to_host_value(&self) -> HostValue {
        HostValue::map([
            ("method", HostValue::text(self.method.clone())),
            ("url", HostValue::text(self.url.clone())),
            (
                "headers",
                HostValue::map(
                    self.headers
                        .iter()
                        .map(|(key, value)| (key.clone(), HostValue::text(value.clone()))),
                ),
            ),
            ("body", self.body.clone().unwrap_or_default()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: HostValue,
}

pub trait HttpClient: Send + Sync {
    fn invoke(&self, request: &HttpRequest) -> Result<HttpResponse, BridgeError>;
}

/// Connection request for a [`WebSocketFactory`]. The handler, when present,
/// is already detached from the calling scenario and may be invoked from any
/// thread.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub url: String,
    pub handler: Option<FunctionRef>,
    pub options: HostValue,
}

pub trait WebSocketClient: Send + Sync + fmt::Debug {
    fn send(&self, text: &str) -> Result<(), BridgeError>;
    fn close(&self);
}

pub trait WebSocketFactory: Send + Sync {
    fn connect(&self, options: WebSocketOptions) -> Result<Arc<dyn WebSocketClient>, BridgeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub pass: bool,
    pub message: Option<String>,
}

impl MatchResult {
    pub fn to_host_value(&self) -> HostValue {
        HostValue::map([
            ("pass", HostValue::Bool(self.pass)),
            (
                "message",
                self.message.clone().map(HostValue::Text).unwrap_or_default(),
            ),
        ])
    }
}

pub trait Matcher: Send + Sync {
    fn matches(&self, actual: &HostValue, expected: &HostValue) -> MatchResult;
}

/// Reads units from a directory. `classpath:` prefixes are resolved against
/// the same root.
#[derive(Debug, Clone)]
pub struct DirFileResolver {
    root: PathBuf,
}

impl DirFileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, path: &str) -> Result<PathBuf, BridgeError> {
        let relative = path
            .strip_prefix("classpath:")
            .or_else(|| path.strip_prefix("this:"))
            .unwrap_or(path)
            .trim_start_matches('/');
        let full = self.root.join(relative);
        if !full.is_file() {
            return Err(BridgeError::UnitNotFound {
                path: path.to_string(),
            });
        }
        Ok(full)
    }
}

impl FileResolver for DirFileResolver {
    fn read(&self, path: &str) -> Result<Resource, BridgeError> {
        let text = self.read_text(path)?;
        let extension = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let resource = match extension.as_str() {
            "rhai" | "js" => Resource::Script(text),
            "feature" => Resource::Feature(FeatureUnit {
                path: path.to_string(),
                text,
            }),
            "json" => Resource::Value(parse_json(&text)?),
            "xml" => Resource::Value(HostValue::Document(Document::Xml(XmlDocument::parse(
                &text,
            )?))),
            _ => Resource::Value(HostValue::Text(text)),
        };
        Ok(resource)
    }

    fn read_text(&self, path: &str) -> Result<String, BridgeError> {
        let full = self.locate(path)?;
        std::fs::read_to_string(&full).map_err(|error| BridgeError::io(full, &error))
    }
}

#[derive(Debug, Default)]
pub struct NoFeatureRunner;

impl FeatureRunner for NoFeatureRunner {
    fn run(
        &self,
        feature: &FeatureUnit,
        _arg: Option<HostValue>,
        _caller: &Arc<ScenarioRuntime>,
        _shared: bool,
    ) -> Result<HostValue, BridgeError> {
        Err(BridgeError::Config {
            message: format!("no feature runner configured for {}", feature.path),
        })
    }
}

#[derive(Debug, Default)]
pub struct NoHttpClient;

impl HttpClient for NoHttpClient {
    fn invoke(&self, request: &HttpRequest) -> Result<HttpResponse, BridgeError> {
        Err(BridgeError::Http {
            message: format!("no http client configured for {} {}", request.method, request.url),
        })
    }
}

#[derive(Debug, Default)]
pub struct NoWebSocketFactory;

impl WebSocketFactory for NoWebSocketFactory {
    fn connect(&self, options: WebSocketOptions) -> Result<Arc<dyn WebSocketClient>, BridgeError> {
        Err(BridgeError::Http {
            message: format!("no websocket transport configured for {}", options.url),
        })
    }
}

/// Structural equality over the JSON view of both sides.
#[derive(Debug, Default)]
pub struct DeepEqualMatcher;

impl Matcher for DeepEqualMatcher {
    fn matches(&self, actual: &HostValue, expected: &HostValue) -> MatchResult {
        let actual_json = actual.to_json();
        let expected_json = expected.to_json();
        if actual_json == expected_json {
            MatchResult {
                pass: true,
                message: None,
            }
        } else {
            MatchResult {
                pass: false,
                message: Some(format!(
                    "match failed: actual {} != expected {}",
                    actual_json, expected_json
                )),
            }
        }
    }
}

#[cfg(test)]
mod collaborators_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dir_resolver_classifies_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("unit.rhai"), "|x| x + 1").expect("write script");
        std::fs::write(dir.path().join("data.json"), "{\"a\": [1]}").expect("write json");
        std::fs::write(dir.path().join("doc.xml"), "<r><a>1</a></r>").expect("write xml");
        std::fs::write(dir.path().join("login.feature"), "Feature: x").expect("write feature");
        std::fs::write(dir.path().join("notes.txt"), "hello").expect("write text");
        let resolver = DirFileResolver::new(dir.path());

        assert_eq!(
            resolver.read("classpath:unit.rhai").expect("script"),
            Resource::Script("|x| x + 1".to_string())
        );
        let Resource::Value(data) = resolver.read("data.json").expect("json") else {
            panic!("json should be a value");
        };
        assert_eq!(data.to_json(), serde_json::json!({"a": [1]}));
        assert!(matches!(
            resolver.read("doc.xml").expect("xml"),
            Resource::Value(HostValue::Document(Document::Xml(_)))
        ));
        assert!(matches!(
            resolver.read("login.feature").expect("feature"),
            Resource::Feature(FeatureUnit { .. })
        ));
        assert_eq!(
            resolver.read("notes.txt").expect("text"),
            Resource::Value(HostValue::text("hello"))
        );
    }

    #[test]
    fn dir_resolver_reports_missing_units() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = DirFileResolver::new(dir.path());
        let error = resolver.read("missing.feature").expect_err("missing");
        assert_eq!(error.code(), "BRIDGE_UNIT_NOT_FOUND");
    }

    #[test]
    fn deep_equal_matcher_describes_mismatch() {
        let matcher = DeepEqualMatcher;
        let left = HostValue::map([("a", HostValue::int(1))]);
        assert!(matcher.matches(&left, &left.detached()).pass);
        let result = matcher.matches(&left, &HostValue::map([("a", HostValue::int(2))]));
        assert!(!result.pass);
        assert!(result.message.expect("message").contains("match failed"));
    }
}
