//! Instrumented calls
//!
//! [`Client::wrap`](crate::Client::wrap) turns any [`Callable`] into a
//! [`Wrapped`] decorator that reports panics and then lets them continue.
//!
//! ```text
//! caller ──► Wrapped::call ──► wrap function args ──► inner.call
//!                 │                                      │
//!                 │◄──────────── panic ──────────────────┘
//!                 ├─► client.notify(error, params.arguments)
//!                 ├─► historian.ignore_next_uncaught() (no panic hook only)
//!                 └─► resume_unwind(original payload)
//! ```
//!
//! Nested wrapped calls report a panic once: the innermost wrapper reports,
//! outer wrappers recognise the same payload and only rethrow. The mark is
//! cleared whenever a wrapped call starts or returns normally, so a panic
//! caught between two wrappers never hides a later one.

use crate::client::{Client, Notification};
use crate::historian::{WrapScope, in_wrapped_call};
use crate::processor::CapturedError;
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

/// Something that can be called with dynamic arguments
pub trait Callable: Send + Sync {
    fn call(&self, args: Vec<Arg>) -> Value;

    /// The delegate this callable decorates, if it is a wrapper
    fn inner(&self) -> Option<&Arc<dyn Callable>> {
        None
    }

    /// Wrapper marker
    fn is_wrapped(&self) -> bool {
        self.inner().is_some()
    }
}

impl<F> Callable for F
where
    F: Fn(Vec<Arg>) -> Value + Send + Sync,
{
    fn call(&self, args: Vec<Arg>) -> Value {
        self(args)
    }
}

/// One argument of a dynamic call
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Func(Arc<dyn Callable>),
}

impl Arg {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Value + Send + Sync + 'static,
    {
        Arg::Func(Arc::new(f))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Func(_) => None,
        }
    }

    pub fn as_func(&self) -> Option<&Arc<dyn Callable>> {
        match self {
            Arg::Func(f) => Some(f),
            Arg::Value(_) => None,
        }
    }

    /// JSON form used in `params.arguments`
    fn describe(&self) -> Value {
        match self {
            Arg::Value(v) => v.clone(),
            Arg::Func(_) => Value::String("[function]".to_string()),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

macro_rules! arg_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(value: $t) -> Self {
                Arg::Value(Value::from(value))
            }
        })*
    };
}

arg_from!(&str, String, bool, i32, i64, u32, u64, f64);

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Func(c) => f
                .debug_tuple("Func")
                .field(&if c.is_wrapped() { "wrapped" } else { "plain" })
                .finish(),
        }
    }
}

thread_local! {
    /// Key of the panic payload already reported by an inner wrapper
    static REPORTED_PAYLOAD: Cell<Option<PayloadKey>> = const { Cell::new(None) };

    /// Panic captured by the panic hook while inside a wrapped call
    static HOOK_CAPTURE: RefCell<Option<CapturedError>> = const { RefCell::new(None) };
}

/// Hand the wrapper a panic captured at its raise site
pub(crate) fn stash_hook_capture(error: CapturedError) {
    HOOK_CAPTURE.with(|c| *c.borrow_mut() = Some(error));
}

fn take_hook_capture() -> Option<CapturedError> {
    HOOK_CAPTURE.with(|c| c.borrow_mut().take())
}

fn payload_addr(payload: &(dyn Any + Send)) -> usize {
    payload as *const (dyn Any + Send) as *const () as usize
}

/// Heap address and message hash of a panic payload
type PayloadKey = (usize, u64);

fn payload_key(payload: &(dyn Any + Send)) -> PayloadKey {
    let mut hasher = DefaultHasher::new();
    CapturedError::from_panic(payload, None)
        .message_or_display()
        .hash(&mut hasher);
    (payload_addr(payload), hasher.finish())
}

fn clear_reported() {
    REPORTED_PAYLOAD.with(|r| r.set(None));
}

/// Mark a payload as reported, returning whether it already was
fn mark_reported(key: PayloadKey) -> bool {
    REPORTED_PAYLOAD.with(|r| r.replace(Some(key))) == Some(key)
}

/// Decorator that reports panics of its delegate
pub struct Wrapped {
    inner: Arc<dyn Callable>,
    client: Client,
}

impl Wrapped {
    pub(crate) fn new(client: Client, inner: Arc<dyn Callable>) -> Self {
        Self { inner, client }
    }

    fn report(&self, payload: &(dyn Any + Send), arguments: Value) {
        let error = take_hook_capture()
            .unwrap_or_else(|| CapturedError::from_panic(payload, None).with_current_backtrace());

        self.client
            .notify(Notification::from(error).with_param("arguments", arguments));

        // The installed hook never forwards wrapped panics, so there is no duplicate to drop
        let historian = self.client.historian();
        if !historian.panic_hook_installed() {
            historian.ignore_next_uncaught();
        }
    }
}

impl Callable for Wrapped {
    fn call(&self, args: Vec<Arg>) -> Value {
        let arguments = Value::Array(args.iter().map(Arg::describe).collect());
        let args = args
            .into_iter()
            .map(|arg| match arg {
                Arg::Func(f) => Arg::Func(self.client.wrap(f)),
                other => other,
            })
            .collect();

        clear_reported();
        let scope = WrapScope::enter();
        let result = catch_unwind(AssertUnwindSafe(|| self.inner.call(args)));
        drop(scope);

        match result {
            Ok(value) => {
                clear_reported();
                value
            }
            Err(payload) => {
                if mark_reported(payload_key(payload.as_ref())) {
                    // An inner wrapper reported this panic; drop a stale hook capture
                    take_hook_capture();
                } else {
                    self.report(payload.as_ref(), arguments);
                }

                if !in_wrapped_call() {
                    clear_reported();
                }
                resume_unwind(payload)
            }
        }
    }

    fn inner(&self) -> Option<&Arc<dyn Callable>> {
        Some(&self.inner)
    }
}

impl fmt::Debug for Wrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapped").finish_non_exhaustive()
    }
}
