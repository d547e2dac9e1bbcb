//! Response handles. Each queued request owns one; the connection drives
//! its callbacks in strict FIFO order as summaries arrive.

use crate::value::{Value, ValueMap};

/// Callbacks fired as a request completes. All methods default to no-ops so
/// implementors only override what they care about.
pub trait Response: Send {
    fn on_success(&mut self, _metadata: ValueMap) {}

    fn on_records(&mut self, _records: Vec<Vec<Value>>) {}

    fn on_failure(&mut self, _metadata: ValueMap) {}

    fn on_ignored(&mut self) {}
}

/// No callbacks at all; for requests whose outcome the caller does not
/// observe directly.
pub struct NoOpResponse;

impl Response for NoOpResponse {}

type SuccessFn = Box<dyn FnMut(ValueMap) + Send>;
type RecordsFn = Box<dyn FnMut(Vec<Vec<Value>>) + Send>;
type FailureFn = Box<dyn FnMut(ValueMap) + Send>;
type IgnoredFn = Box<dyn FnMut() + Send>;

/// Closure adapter for ad-hoc callers: attach only the callbacks needed.
#[derive(Default)]
pub struct Handlers {
    on_success: Option<SuccessFn>,
    on_records: Option<RecordsFn>,
    on_failure: Option<FailureFn>,
    on_ignored: Option<IgnoredFn>,
}

impl Handlers {
    #[inline]
    pub fn new() -> Handlers {
        Handlers::default()
    }

    pub fn on_success<F: FnMut(ValueMap) + Send + 'static>(mut self, f: F) -> Handlers {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_records<F: FnMut(Vec<Vec<Value>>) + Send + 'static>(mut self, f: F) -> Handlers {
        self.on_records = Some(Box::new(f));
        self
    }

    pub fn on_failure<F: FnMut(ValueMap) + Send + 'static>(mut self, f: F) -> Handlers {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn on_ignored<F: FnMut() + Send + 'static>(mut self, f: F) -> Handlers {
        self.on_ignored = Some(Box::new(f));
        self
    }
}

impl Response for Handlers {
    fn on_success(&mut self, metadata: ValueMap) {
        if let Some(f) = self.on_success.as_mut() {
            f(metadata)
        }
    }

    fn on_records(&mut self, records: Vec<Vec<Value>>) {
        if let Some(f) = self.on_records.as_mut() {
            f(records)
        }
    }

    fn on_failure(&mut self, metadata: ValueMap) {
        if let Some(f) = self.on_failure.as_mut() {
            f(metadata)
        }
    }

    fn on_ignored(&mut self) {
        if let Some(f) = self.on_ignored.as_mut() {
            f()
        }
    }
}
