pub mod bridge;
pub mod call_once;
pub mod collaborators;
pub mod context;
pub mod function;
mod helpers;
pub mod scenario;
pub mod value_bridge;

pub use bridge::http::{HttpRequestBuilder, WebSocketHandle};
pub use bridge::ScriptBridge;
pub use call_once::{qualified_name, CallOnceCache, DiskShadow};
pub use collaborators::{
    DeepEqualMatcher, DirFileResolver, FeatureRunner, FeatureUnit, FileResolver, HttpClient,
    HttpRequest, HttpResponse, MatchResult, Matcher, NoFeatureRunner, NoHttpClient,
    NoWebSocketFactory, Resource, WebSocketClient, WebSocketFactory, WebSocketOptions,
};
pub use context::{ExecutionContext, BRIDGE_VAR};
pub use function::FunctionHandle;
pub use scenario::{Embed, ScenarioInfo, ScenarioRuntime, Suite, SuiteOptions};
pub use value_bridge::{to_host_value, to_host_value_in, to_script_value, ListProxy, MapProxy};
