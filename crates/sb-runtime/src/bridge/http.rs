use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString};
use sb_core::{BridgeError, HostValue, OpaqueRef};
use tracing::debug;

use super::ScriptBridge;
use crate::collaborators::{HttpClient, HttpRequest, HttpResponse, WebSocketClient, WebSocketOptions};
use crate::function::FunctionHandle;
use crate::scenario::ScenarioRuntime;
use crate::value_bridge::{host, lift, raise, ScriptResult};

/// A live connection returned by `webSocket`.
#[derive(Clone)]
pub struct WebSocketHandle(pub Arc<dyn WebSocketClient>);

impl fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WebSocketHandle").field(&self.0).finish()
    }
}

/// Request assembled step by step from a script: `karate.http(url).path('a').get()`.
#[derive(Clone)]
pub struct HttpRequestBuilder {
    client: Arc<dyn HttpClient>,
    runtime: Weak<ScenarioRuntime>,
    url: String,
    paths: Vec<String>,
    params: Vec<(String, String)>,
    headers: IndexMap<String, String>,
}

impl fmt::Debug for HttpRequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequestBuilder")
            .field("url", &self.full_url())
            .field("headers", &self.headers)
            .finish()
    }
}

impl HttpRequestBuilder {
    pub fn new(client: Arc<dyn HttpClient>, runtime: Weak<ScenarioRuntime>, url: impl Into<String>) -> Self {
        Self {
            client,
            runtime,
            url: url.into(),
            paths: Vec::new(),
            params: Vec::new(),
            headers: IndexMap::new(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Query values are appended as given.
    pub fn full_url(&self) -> String {
        let mut url = self.url.trim_end_matches('/').to_string();
        for path in &self.paths {
            let segment = path.trim_matches('/');
            if !segment.is_empty() {
                url.push('/');
                url.push_str(segment);
            }
        }
        for (index, (name, value)) in self.params.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(value);
        }
        url
    }

    pub fn method(&self, method: &str, body: Option<HostValue>) -> Result<HostValue, BridgeError> {
        let request = HttpRequest {
            method: method.to_ascii_uppercase(),
            url: self.full_url(),
            headers: self.headers.clone(),
            body,
        };
        debug!(target: "sb::http", "{} {}", request.method, request.url);
        let response = self.client.invoke(&request)?;
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.record_request(request);
        }
        Ok(response_value(&response))
    }
}

fn response_value(response: &HttpResponse) -> HostValue {
    HostValue::map([
        ("status", HostValue::int(i64::from(response.status))),
        ("headers", headers_value(&response.headers)),
        ("body", response.body.clone()),
    ])
}

fn headers_value(headers: &IndexMap<String, String>) -> HostValue {
    HostValue::map(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), HostValue::text(value.clone()))),
    )
}

/// Header maps from scripts may hold lists; those are joined with `,`.
fn headers_from(value: Option<HostValue>) -> IndexMap<String, String> {
    let Some(HostValue::Mapping(map)) = value else {
        return IndexMap::new();
    };
    map.snapshot()
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("content-length"))
        .map(|(name, value)| {
            let text = match &value {
                HostValue::Sequence(list) => list
                    .snapshot()
                    .iter()
                    .map(HostValue::to_display_text)
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_display_text(),
            };
            (name, text)
        })
        .collect()
}

fn join_url(base: &str, uri: &str) -> String {
    if uri.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), uri.trim_start_matches('/'))
}

impl ScriptBridge {
    /// Forwards the request described by the `request*` variables and stores
    /// the outcome in `response`, `responseStatus` and `responseHeaders`.
    pub fn proceed(&self, url_base: Option<&str>) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        let base = match url_base {
            Some(base) => base.to_string(),
            None => runtime
                .variable("requestUrlBase")
                .and_then(|value| value.as_text().map(str::to_string))
                .or_else(|| runtime.config().url_base)
                .ok_or_else(|| BridgeError::Http {
                    message: "no url base to proceed to".to_string(),
                })?,
        };
        let uri = runtime
            .variable("requestUri")
            .map(|value| value.to_display_text())
            .unwrap_or_default();
        let method = runtime
            .variable("requestMethod")
            .and_then(|value| value.as_text().map(str::to_string))
            .unwrap_or_else(|| "GET".to_string());
        let body = runtime.variable("request").filter(|value| !value.is_null());
        let request = HttpRequest {
            method: method.to_ascii_uppercase(),
            url: join_url(&base, &uri),
            headers: headers_from(runtime.variable("requestHeaders")),
            body,
        };
        debug!(target: "sb::http", "proceed {} {}", request.method, request.url);
        let response = runtime.suite().http().invoke(&request)?;
        runtime.set_variable("response", response.body.clone());
        runtime.set_variable("responseStatus", HostValue::int(i64::from(response.status)));
        runtime.set_variable("responseHeaders", headers_value(&response.headers));
        runtime.record_request(request);
        Ok(response.body)
    }

    pub fn http(&self, url: &str) -> Result<HttpRequestBuilder, BridgeError> {
        let runtime = self.runtime()?;
        Ok(HttpRequestBuilder::new(
            Arc::clone(runtime.suite().http()),
            self.runtime.clone(),
            url,
        ))
    }

    /// Opens a connection. The handler is copied out of this scenario first
    /// because the transport calls it from its own threads.
    pub fn web_socket(
        &self,
        url: &str,
        handler: Option<HostValue>,
        options: HostValue,
    ) -> Result<HostValue, BridgeError> {
        let runtime = self.runtime()?;
        let handler = match handler {
            None | Some(HostValue::Null) => None,
            Some(HostValue::Function(function)) => match FunctionHandle::from_ref(&function) {
                Some(handle) => Some(Arc::new(handle.copy(&runtime)?) as sb_core::FunctionRef),
                None => Some(function),
            },
            Some(other) => {
                return Err(BridgeError::NotCallable {
                    type_name: other.type_name().to_string(),
                })
            }
        };
        let client = runtime.suite().web_sockets().connect(WebSocketOptions {
            url: url.to_string(),
            handler,
            options,
        })?;
        Ok(HostValue::Opaque(OpaqueRef::new(WebSocketHandle(client))))
    }
}

fn body_of(value: Dynamic) -> Result<Option<HostValue>, Box<EvalAltResult>> {
    let body = host(value)?;
    Ok((!body.is_null()).then_some(body))
}

pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_fn("proceed", |bridge: &mut ScriptBridge| lift(bridge.proceed(None)))
        .register_fn("proceed", |bridge: &mut ScriptBridge, base: ImmutableString| {
            lift(bridge.proceed(Some(&base)))
        })
        .register_fn(
            "http",
            |bridge: &mut ScriptBridge, url: ImmutableString| -> Result<HttpRequestBuilder, Box<EvalAltResult>> {
                bridge.http(&url).map_err(raise)
            },
        )
        .register_fn("webSocket", |bridge: &mut ScriptBridge, url: ImmutableString| {
            lift(bridge.web_socket(&url, None, HostValue::Null))
        })
        .register_fn(
            "webSocket",
            |bridge: &mut ScriptBridge, url: ImmutableString, handler: Dynamic| -> ScriptResult {
                lift(bridge.web_socket(&url, Some(host(handler)?), HostValue::Null))
            },
        )
        .register_fn(
            "webSocket",
            |bridge: &mut ScriptBridge,
             url: ImmutableString,
             handler: Dynamic,
             options: Dynamic|
             -> ScriptResult {
                lift(bridge.web_socket(&url, Some(host(handler)?), host(options)?))
            },
        );

    engine
        .register_type_with_name::<HttpRequestBuilder>("HttpRequestBuilder")
        .register_fn("path", |builder: &mut HttpRequestBuilder, path: ImmutableString| {
            builder.clone().path(path.to_string())
        })
        .register_fn(
            "param",
            |builder: &mut HttpRequestBuilder, name: ImmutableString, value: Dynamic| -> Result<HttpRequestBuilder, Box<EvalAltResult>> {
                Ok(builder.clone().param(name.to_string(), host(value)?.to_display_text()))
            },
        )
        .register_fn(
            "header",
            |builder: &mut HttpRequestBuilder, name: ImmutableString, value: Dynamic| -> Result<HttpRequestBuilder, Box<EvalAltResult>> {
                Ok(builder.clone().header(name.to_string(), host(value)?.to_display_text()))
            },
        )
        .register_fn("get", |builder: &mut HttpRequestBuilder| lift(builder.method("GET", None)))
        .register_fn("delete", |builder: &mut HttpRequestBuilder| {
            lift(builder.method("DELETE", None))
        })
        .register_fn(
            "post",
            |builder: &mut HttpRequestBuilder, body: Dynamic| -> ScriptResult {
                lift(builder.method("POST", body_of(body)?))
            },
        )
        .register_fn(
            "put",
            |builder: &mut HttpRequestBuilder, body: Dynamic| -> ScriptResult {
                lift(builder.method("PUT", body_of(body)?))
            },
        )
        .register_fn(
            "method",
            |builder: &mut HttpRequestBuilder, method: ImmutableString, body: Dynamic| -> ScriptResult {
                lift(builder.method(&method, body_of(body)?))
            },
        );

    engine
        .register_type_with_name::<WebSocketHandle>("WebSocket")
        .register_fn(
            "send",
            |socket: &mut WebSocketHandle, text: Dynamic| -> ScriptResult {
                let text = host(text)?.to_display_text();
                socket.0.send(&text).map_err(raise)?;
                Ok(Dynamic::UNIT)
            },
        )
        .register_fn("close", |socket: &mut WebSocketHandle| socket.0.close());
}
