use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Scope, AST};
use sb_core::{BridgeError, HostValue};
use tracing::{debug, info};

use crate::bridge::{self, ScriptBridge};
use crate::helpers::function_source::{tag_function_sources, SOURCE_TAG_FN};
use crate::scenario::ScenarioRuntime;
use crate::value_bridge::{self, dynamic_to_json, to_host_value_in, to_script_value};

/// Name under which the bridge object is visible to scripts.
pub const BRIDGE_VAR: &str = "karate";

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

thread_local! {
    static ENTERED: RefCell<Vec<Arc<ExecutionContext>>> = const { RefCell::new(Vec::new()) };
}

/// One isolated script environment: its own variables and function library
/// on top of the shared engine.
///
/// Evaluations and function invocations on a context are serialized by a
/// re-entrant lock, so a script may call back into the bridge which in turn
/// calls a function of the same context on the same thread.
pub struct ExecutionContext {
    id: u64,
    engine: Arc<Engine>,
    runtime: Weak<ScenarioRuntime>,
    bindings: RwLock<IndexMap<String, Dynamic>>,
    lib: RwLock<Arc<AST>>,
    sources: RwLock<HashMap<String, Arc<str>>>,
    invocation: ReentrantMutex<()>,
    pending_error: Mutex<Option<BridgeError>>,
    closed: AtomicBool,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("bindings", &self.bindings.read().keys().collect::<Vec<_>>())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Keeps a context registered as the thread's current one until dropped.
pub(crate) struct EnteredContext {
    _private: (),
}

impl Drop for EnteredContext {
    fn drop(&mut self) {
        ENTERED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl ExecutionContext {
    /// A context with no scenario behind it. Bridge operations that need
    /// scenario state fail inside it.
    pub fn new() -> Arc<Self> {
        Self::build(Weak::new())
    }

    pub fn for_scenario(runtime: &Arc<ScenarioRuntime>) -> Arc<Self> {
        Self::build(Arc::downgrade(runtime))
    }

    fn build(runtime: Weak<ScenarioRuntime>) -> Arc<Self> {
        let context = Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            engine: shared_engine(),
            runtime,
            bindings: RwLock::new(IndexMap::new()),
            lib: RwLock::new(Arc::new(AST::empty())),
            sources: RwLock::new(HashMap::new()),
            invocation: ReentrantMutex::new(()),
            pending_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        debug!(target: "sb::context", "created execution context {}", context.id);
        context
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn runtime(&self) -> Option<Arc<ScenarioRuntime>> {
        self.runtime.upgrade()
    }

    /// The context currently evaluating on this thread, innermost first.
    pub fn current() -> Option<Arc<ExecutionContext>> {
        ENTERED.with(|stack| stack.borrow().last().cloned())
    }

    pub(crate) fn enter(self: &Arc<Self>) -> EnteredContext {
        ENTERED.with(|stack| stack.borrow_mut().push(Arc::clone(self)));
        EnteredContext { _private: () }
    }

    pub(crate) fn lock_invocation(&self) -> ReentrantMutexGuard<'_, ()> {
        self.invocation.lock()
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "sb::context", "closed execution context {}", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Compiles and runs `source`. Functions it defines join the context's
    /// library; top-level variables persist for later evaluations.
    pub fn evaluate(self: &Arc<Self>, source: &str) -> Result<Dynamic, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::evaluation(format!(
                "execution context {} is closed",
                self.id
            )));
        }
        let _invocation = self.invocation.lock();
        let _entered = self.enter();
        let ast = self.compile(source)?;
        let lib = self.merge_functions(&ast);
        let runnable = lib.merge(&ast);

        let (mut scope, injected) = self.build_scope();
        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &runnable);
        self.absorb_scope(&scope, &injected);

        result.map_err(|error| self.surface_error(&error))
    }

    /// Compiles `source` with every function expression tagged so its text
    /// is recorded when the function value is created.
    fn compile(&self, source: &str) -> Result<AST, BridgeError> {
        let tagged = tag_function_sources(source);
        if let Cow::Borrowed(_) = tagged {
            return self
                .engine
                .compile(source)
                .map_err(|error| BridgeError::evaluation(error.to_string()));
        }
        match self.engine.compile(tagged.as_ref()) {
            Ok(ast) => Ok(ast),
            Err(tag_error) => match self.engine.compile(source) {
                Err(error) => Err(BridgeError::evaluation(error.to_string())),
                Ok(ast) => {
                    debug!(
                        target: "sb::context",
                        "function sources not recorded for this program: {}",
                        tag_error
                    );
                    Ok(ast)
                }
            },
        }
    }

    /// [`evaluate`](Self::evaluate) with the result converted to host space.
    pub fn eval_host(self: &Arc<Self>, source: &str) -> Result<HostValue, BridgeError> {
        let value = self.evaluate(source)?;
        let _entered = self.enter();
        to_host_value_in(self, value)
    }

    pub fn bind(&self, name: impl Into<String>, value: Dynamic) {
        self.bindings.write().insert(name.into(), value);
    }

    pub fn bind_host(self: &Arc<Self>, name: impl Into<String>, value: &HostValue) {
        let _entered = self.enter();
        let converted = to_script_value(value);
        self.bind(name, converted);
    }

    pub fn binding(&self, name: &str) -> Option<Dynamic> {
        self.bindings.read().get(name).cloned()
    }

    pub fn binding_names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    /// Drops a context-local binding so the scenario variable of the same
    /// name becomes visible again.
    pub fn forget(&self, name: &str) -> bool {
        self.bindings.write().shift_remove(name).is_some()
    }

    /// JSON text for a script value. Functions are left out of maps and
    /// written as `null` inside arrays.
    pub fn stringify(&self, value: &Dynamic) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(&dynamic_to_json(value))?)
    }

    pub(crate) fn lib(&self) -> Arc<AST> {
        Arc::clone(&self.lib.read())
    }

    pub(crate) fn merge_functions(&self, ast: &AST) -> Arc<AST> {
        let mut lib = self.lib.write();
        let merged = lib.merge(&ast.clone_functions_only());
        *lib = Arc::new(merged);
        Arc::clone(&lib)
    }

    pub(crate) fn source_of(&self, fn_name: &str) -> Option<Arc<str>> {
        self.sources.read().get(fn_name).cloned()
    }

    pub(crate) fn record_source(&self, fn_name: &str, text: &str) {
        self.sources
            .write()
            .insert(fn_name.to_string(), Arc::from(text));
    }

    pub(crate) fn stash_error(&self, error: BridgeError) {
        *self.pending_error.lock() = Some(error);
    }

    pub(crate) fn take_error(&self) -> Option<BridgeError> {
        self.pending_error.lock().take()
    }

    /// Recovers the bridge error behind a script failure when the script
    /// error still carries its message.
    pub(crate) fn surface_error(&self, error: &EvalAltResult) -> BridgeError {
        let message = error.to_string();
        match self.take_error() {
            Some(stashed) if message.contains(&stashed.to_string()) => stashed,
            _ => BridgeError::evaluation(message),
        }
    }

    fn build_scope(&self) -> (Scope<'static>, HashSet<String>) {
        let bindings = self.bindings.read().clone();
        let mut scope = Scope::new();
        let mut injected = HashSet::new();
        if let Some(runtime) = self.runtime() {
            for (name, value) in runtime.variables() {
                if bindings.contains_key(&name) || name == BRIDGE_VAR {
                    continue;
                }
                scope.push_dynamic(name.clone(), to_script_value(&value));
                injected.insert(name);
            }
        }
        for (name, value) in bindings {
            scope.push_dynamic(name, value);
        }
        scope.push(BRIDGE_VAR, ScriptBridge::new(self.runtime.clone()));
        (scope, injected)
    }

    /// Keeps top-level script variables. A name the script handed to the
    /// scenario through `karate.set` stays with the scenario.
    fn absorb_scope(&self, scope: &Scope<'_>, injected: &HashSet<String>) {
        let published = self
            .runtime()
            .map(|runtime| runtime.variables())
            .unwrap_or_default();
        let mut bindings = self.bindings.write();
        for (name, _constant, value) in scope.iter_raw() {
            if name == BRIDGE_VAR || injected.contains(name) {
                continue;
            }
            if published.contains_key(name) && !bindings.contains_key(name) {
                continue;
            }
            bindings.insert(name.to_string(), value.clone());
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        debug!(target: "sb::context", "dropped execution context {}", self.id);
    }
}

pub(crate) fn shared_engine() -> Arc<Engine> {
    Arc::clone(ENGINE.get_or_init(|| Arc::new(build_engine())))
}

fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.on_print(|text| info!(target: "sb::script", "{}", text));
    engine.on_debug(|text, source, position| {
        debug!(target: "sb::script", "{} ({}) {}", text, source.unwrap_or("script"), position)
    });
    engine.register_fn(SOURCE_TAG_FN, record_function_source);
    value_bridge::register_types(&mut engine);
    bridge::register(&mut engine);
    engine
}

fn record_function_source(text: ImmutableString, fn_ptr: FnPtr) -> FnPtr {
    if let Some(context) = ExecutionContext::current() {
        context.record_source(fn_ptr.fn_name(), &text);
    }
    fn_ptr
}

#[cfg(test)]
mod context_tests {
    use super::*;
    use rhai::INT;

    #[test]
    fn bindings_persist_between_evaluations() {
        let context = ExecutionContext::new();
        context.evaluate("let a = 40;").expect("declare");
        let value = context.evaluate("a + 2").expect("read back");
        assert_eq!(value.as_int().expect("int"), 42 as INT);
        assert_eq!(context.binding_names(), vec!["a".to_string()]);
    }

    #[test]
    fn functions_join_the_context_library() {
        let context = ExecutionContext::new();
        context
            .evaluate("fn double(x) { x * 2 }")
            .expect("define function");
        let value = context.evaluate("double(21)").expect("call function");
        assert_eq!(value.as_int().expect("int"), 42 as INT);
    }

    #[test]
    fn syntax_errors_become_evaluation_errors() {
        let context = ExecutionContext::new();
        let error = context.evaluate("let = ;").expect_err("bad syntax");
        assert_eq!(error.code(), "BRIDGE_EVAL_ERROR");
    }

    #[test]
    fn closures_record_their_text_when_created() {
        let context = ExecutionContext::new();
        let value = context
            .evaluate("let add = |x| |y| x + y; add.call(1)")
            .expect("curried");
        let fn_ptr = value.cast::<FnPtr>();
        assert_eq!(
            context.source_of(fn_ptr.fn_name()).as_deref(),
            Some("|y| x + y")
        );
    }

    #[test]
    fn syntax_errors_point_at_the_written_program() {
        let context = ExecutionContext::new();
        let error = context.evaluate("let f = |x| x + ;").expect_err("bad syntax");
        assert!(!error.to_string().contains(SOURCE_TAG_FN), "{}", error);
    }

    #[test]
    fn closed_context_rejects_evaluation() {
        let context = ExecutionContext::new();
        context.close();
        assert!(context.evaluate("1").is_err());
    }

    #[test]
    fn current_context_is_scoped_to_the_guard() {
        let context = ExecutionContext::new();
        assert!(ExecutionContext::current().is_none());
        {
            let _entered = context.enter();
            let current = ExecutionContext::current().expect("entered");
            assert_eq!(current.id(), context.id());
        }
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn stringify_skips_functions_in_maps() {
        let context = ExecutionContext::new();
        let value = context
            .evaluate("#{ a: 1, f: |x| x, list: [1, |y| y] }")
            .expect("map literal");
        let json = context.stringify(&value).expect("stringify");
        assert_eq!(json, "{\"a\":1,\"list\":[1,null]}");
    }
}
