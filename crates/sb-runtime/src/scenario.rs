use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use sb_core::{BridgeConfig, BridgeError, HostValue};
use tracing::{info, warn};

use crate::bridge::ScriptBridge;
use crate::call_once::CallOnceCache;
use crate::collaborators::{
    DeepEqualMatcher, DirFileResolver, FeatureRunner, FileResolver, HttpClient, HttpRequest,
    Matcher, NoFeatureRunner, NoHttpClient, NoWebSocketFactory, WebSocketFactory,
};
use crate::context::ExecutionContext;

/// Everything a suite shares between its scenarios. Unset collaborators fall
/// back to the built-in defaults.
#[derive(Default)]
pub struct SuiteOptions {
    pub config: Option<BridgeConfig>,
    pub call_once: Option<Arc<CallOnceCache>>,
    pub resolver: Option<Arc<dyn FileResolver>>,
    pub features: Option<Arc<dyn FeatureRunner>>,
    pub http: Option<Arc<dyn HttpClient>>,
    pub web_sockets: Option<Arc<dyn WebSocketFactory>>,
    pub matcher: Option<Arc<dyn Matcher>>,
    pub properties: Option<IndexMap<String, String>>,
}

pub struct Suite {
    config: BridgeConfig,
    call_once: Arc<CallOnceCache>,
    resolver: Arc<dyn FileResolver>,
    features: Arc<dyn FeatureRunner>,
    http: Arc<dyn HttpClient>,
    web_sockets: Arc<dyn WebSocketFactory>,
    matcher: Arc<dyn Matcher>,
    properties: IndexMap<String, String>,
}

impl Suite {
    pub fn new(options: SuiteOptions) -> Arc<Self> {
        Arc::new(Self {
            config: options.config.unwrap_or_default(),
            call_once: options.call_once.unwrap_or_default(),
            resolver: options
                .resolver
                .unwrap_or_else(|| Arc::new(DirFileResolver::new("."))),
            features: options
                .features
                .unwrap_or_else(|| Arc::new(NoFeatureRunner)),
            http: options.http.unwrap_or_else(|| Arc::new(NoHttpClient)),
            web_sockets: options
                .web_sockets
                .unwrap_or_else(|| Arc::new(NoWebSocketFactory)),
            matcher: options
                .matcher
                .unwrap_or_else(|| Arc::new(DeepEqualMatcher)),
            properties: options.properties.unwrap_or_default(),
        })
    }

    pub fn scenario(self: &Arc<Self>, info: ScenarioInfo) -> Arc<ScenarioRuntime> {
        ScenarioRuntime::new(Arc::clone(self), info)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn call_once(&self) -> &Arc<CallOnceCache> {
        &self.call_once
    }

    pub fn resolver(&self) -> &Arc<dyn FileResolver> {
        &self.resolver
    }

    pub fn features(&self) -> &Arc<dyn FeatureRunner> {
        &self.features
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    pub fn web_sockets(&self) -> &Arc<dyn WebSocketFactory> {
        &self.web_sockets
    }

    pub fn matcher(&self) -> &Arc<dyn Matcher> {
        &self.matcher
    }

    pub fn properties(&self) -> &IndexMap<String, String> {
        &self.properties
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScenarioInfo {
    pub name: String,
    pub feature_file: String,
    pub tags: Vec<String>,
}

impl ScenarioInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_feature_file(mut self, feature_file: impl Into<String>) -> Self {
        self.feature_file = feature_file.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// `@env=dev,qa` becomes `env -> [dev, qa]`; bare tags map to an empty list.
    pub fn tag_values(&self) -> IndexMap<String, Vec<String>> {
        let mut values = IndexMap::new();
        for tag in &self.tags {
            let tag = tag.trim_start_matches('@');
            match tag.split_once('=') {
                Some((name, rest)) => {
                    values.insert(
                        name.to_string(),
                        rest.split(',')
                            .map(str::trim)
                            .filter(|value| !value.is_empty())
                            .map(ToString::to_string)
                            .collect(),
                    );
                }
                None => {
                    values.insert(tag.to_string(), Vec::new());
                }
            }
        }
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Per-scenario state behind the bridge: variables, run-time config,
/// failure flags and collaborator access.
pub struct ScenarioRuntime {
    suite: Arc<Suite>,
    info: ScenarioInfo,
    vars: RwLock<IndexMap<String, HostValue>>,
    config: RwLock<BridgeConfig>,
    failure: Mutex<Option<String>>,
    aborted: AtomicBool,
    prev_request: Mutex<Option<HttpRequest>>,
    embeds: Mutex<Vec<Embed>>,
    signal: Mutex<Option<HostValue>>,
    signalled: Condvar,
    main: OnceLock<Arc<ExecutionContext>>,
}

impl ScenarioRuntime {
    pub fn new(suite: Arc<Suite>, info: ScenarioInfo) -> Arc<Self> {
        let config = suite.config().clone();
        Arc::new(Self {
            suite,
            info,
            vars: RwLock::new(IndexMap::new()),
            config: RwLock::new(config),
            failure: Mutex::new(None),
            aborted: AtomicBool::new(false),
            prev_request: Mutex::new(None),
            embeds: Mutex::new(Vec::new()),
            signal: Mutex::new(None),
            signalled: Condvar::new(),
            main: OnceLock::new(),
        })
    }

    pub fn suite(&self) -> &Arc<Suite> {
        &self.suite
    }

    pub fn info(&self) -> &ScenarioInfo {
        &self.info
    }

    pub fn bridge(self: &Arc<Self>) -> ScriptBridge {
        ScriptBridge::for_runtime(self)
    }

    /// The context scenario steps evaluate in, created on first use.
    pub fn main_context(self: &Arc<Self>) -> Arc<ExecutionContext> {
        Arc::clone(
            self.main
                .get_or_init(|| ExecutionContext::for_scenario(self)),
        )
    }

    pub fn evaluate(self: &Arc<Self>, source: &str) -> Result<HostValue, BridgeError> {
        self.main_context().eval_host(source)
    }

    pub fn variables(&self) -> IndexMap<String, HostValue> {
        self.vars.read().clone()
    }

    pub fn variable(&self, name: &str) -> Option<HostValue> {
        self.vars.read().get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: HostValue) {
        self.vars.write().insert(name.into(), value);
    }

    pub fn remove_variable(&self, name: &str) -> Option<HostValue> {
        self.vars.write().shift_remove(name)
    }

    pub fn config(&self) -> BridgeConfig {
        self.config.read().clone()
    }

    pub fn configure(&self, key: &str, value: &HostValue) -> Result<(), BridgeError> {
        self.config.write().apply(key, value)
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: "sb::scenario", "scenario '{}' failed: {}", self.info.name, reason);
        *self.failure.lock() = Some(reason);
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn abort(&self) {
        info!(target: "sb::scenario", "scenario '{}' aborted", self.info.name);
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn record_request(&self, request: HttpRequest) {
        *self.prev_request.lock() = Some(request);
    }

    pub fn prev_request(&self) -> Option<HttpRequest> {
        self.prev_request.lock().clone()
    }

    pub fn embed(&self, bytes: Vec<u8>, content_type: impl Into<String>) {
        self.embeds.lock().push(Embed {
            bytes,
            content_type: content_type.into(),
        });
    }

    pub fn embeds(&self) -> Vec<Embed> {
        self.embeds.lock().clone()
    }

    /// Hands `value` to whoever is blocked in [`listen`](Self::listen).
    pub fn signal(&self, value: HostValue) {
        *self.signal.lock() = Some(value);
        self.signalled.notify_all();
    }

    /// Waits up to `timeout` for a [`signal`](Self::signal) and consumes it.
    pub fn listen(&self, timeout: Duration) -> Option<HostValue> {
        let mut slot = self.signal.lock();
        if slot.is_none() {
            let _ = self
                .signalled
                .wait_while_for(&mut slot, |value| value.is_none(), timeout);
        }
        slot.take()
    }

    /// Closes the main context; functions created in it stop working.
    pub fn close(&self) {
        if let Some(context) = self.main.get() {
            context.close();
        }
    }
}
