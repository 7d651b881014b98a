use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult, FnPtr, AST};
use sb_core::{BridgeError, FunctionRef, HostFunction, HostValue};
use tracing::{debug, error, warn};

use crate::context::ExecutionContext;
use crate::scenario::ScenarioRuntime;
use crate::value_bridge::{to_host_value_in, to_script_value};

/// A script callable that has crossed into host space.
///
/// The handle keeps its context alive and runs every invocation inside it.
/// [`copy`](Self::copy) rebuilds the callable from its recorded text in a
/// fresh context so it can be handed to code running on other threads.
#[derive(Clone)]
pub struct FunctionHandle {
    source: Arc<str>,
    recorded: bool,
    fn_ptr: FnPtr,
    lib: Arc<AST>,
    context: Arc<ExecutionContext>,
    arity: Arc<AtomicUsize>,
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("source", &self.source)
            .field("context", &self.context.id())
            .finish()
    }
}

impl FunctionHandle {
    /// Wraps `fn_ptr` with the text the context recorded when the function
    /// value was created. Without one the handle shows `Fn("<name>")` and
    /// cannot be copied.
    pub(crate) fn capture(context: &Arc<ExecutionContext>, fn_ptr: FnPtr) -> Self {
        let (source, recorded) = match context.source_of(fn_ptr.fn_name()) {
            Some(source) => (source, true),
            None => (Arc::from(format!("Fn(\"{}\")", fn_ptr.fn_name())), false),
        };
        Self {
            source,
            recorded,
            fn_ptr,
            lib: context.lib(),
            context: Arc::clone(context),
            arity: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    pub fn from_ref(function: &FunctionRef) -> Option<&FunctionHandle> {
        function.as_any().downcast_ref::<FunctionHandle>()
    }

    pub fn source_text(&self) -> &str {
        &self.source
    }

    pub fn fn_ptr(&self) -> &FnPtr {
        &self.fn_ptr
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn invoke(&self, arg: Option<HostValue>) -> Result<HostValue, BridgeError> {
        self.invoke_args(arg.into_iter().collect())
    }

    /// Calls the function with `args`. When it declares fewer parameters the
    /// trailing arguments are dropped.
    pub fn invoke_args(&self, args: Vec<HostValue>) -> Result<HostValue, BridgeError> {
        if self.context.is_closed() {
            return Err(self.failed(format!(
                "execution context {} is closed",
                self.context.id()
            )));
        }
        let _invocation = self.context.lock_invocation();
        let _entered = self.context.enter();
        let mut script_args = args.iter().map(to_script_value).collect::<Vec<_>>();
        script_args.truncate(self.arity.load(Ordering::Relaxed));
        let lib = self.context.lib();
        loop {
            match self
                .fn_ptr
                .call::<Dynamic>(self.context.engine(), &lib, script_args.clone())
            {
                Ok(value) => {
                    self.arity.store(script_args.len(), Ordering::Relaxed);
                    return to_host_value_in(&self.context, value);
                }
                Err(err) if !script_args.is_empty() && self.is_arity_mismatch(&err) => {
                    script_args.pop();
                }
                Err(err) => {
                    let message = match self.context.take_error() {
                        Some(stashed) if err.to_string().contains(&stashed.to_string()) => {
                            stashed.to_string()
                        }
                        _ => err.to_string(),
                    };
                    return Err(self.failed(message));
                }
            }
        }
    }

    /// Re-creates this function inside a new context seeded from `target`'s
    /// variables. Function-valued variables are rebuilt from their own text
    /// first, so the copy shares no script state with the original.
    pub fn copy(&self, target: &Arc<ScenarioRuntime>) -> Result<FunctionHandle, BridgeError> {
        if !self.recorded {
            return Err(BridgeError::invocation(
                "no source was recorded for this function, it cannot be copied",
                self.source.to_string(),
            ));
        }
        let context = ExecutionContext::for_scenario(target);
        context.merge_functions(&self.lib);
        for (name, value) in target.variables() {
            let HostValue::Function(function) = &value else {
                context.bind_host(name, &value);
                continue;
            };
            let Some(handle) = FunctionHandle::from_ref(function) else {
                context.bind_host(name, &value);
                continue;
            };
            context.merge_functions(&handle.lib);
            if !handle.recorded {
                warn!(
                    target: "sb::function",
                    "function variable '{}' has no recorded source, left out of the copy",
                    name
                );
                continue;
            }
            match context.evaluate(&handle.source) {
                Ok(rebuilt) => context.bind(name, rebuilt),
                Err(err) => warn!(
                    target: "sb::function",
                    "could not rebuild function variable '{}': {}",
                    name,
                    err
                ),
            }
        }
        debug!(target: "sb::function", "copying {} into context {}", self.source, context.id());
        let rebuilt = context.evaluate(&self.source)?;
        if !rebuilt.is::<FnPtr>() {
            return Err(BridgeError::NotCallable {
                type_name: rebuilt.type_name().to_string(),
            });
        }
        Ok(FunctionHandle::capture(&context, rebuilt.cast::<FnPtr>()))
    }

    fn is_arity_mismatch(&self, err: &EvalAltResult) -> bool {
        matches!(
            err,
            EvalAltResult::ErrorFunctionNotFound(signature, _)
                if signature.starts_with(self.fn_ptr.fn_name())
        )
    }

    fn failed(&self, message: String) -> BridgeError {
        error!(target: "sb::function", "function call failed: {}", message);
        error!(target: "sb::function", "failed function body: {}", self.source);
        BridgeError::invocation(message, self.source.to_string())
    }
}

impl HostFunction for FunctionHandle {
    fn source(&self) -> &str {
        &self.source
    }

    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, BridgeError> {
        self.invoke_args(args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
