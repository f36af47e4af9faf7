//! Requests and the handles callers wait on for their outcome.

use crate::error::RequestError;
use crate::framing::PacketDescriptor;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Outcome of a request: the matched response (`None` when no response was
/// expected) or the reason it failed.
pub type RequestResult = Result<Option<Vec<u8>>, RequestError>;

/// One command to send, optionally paired with a matcher for its response.
///
/// Requests compare by identity: two requests with the same bytes are
/// different requests.
#[derive(Clone)]
pub struct Request {
    id: Uuid,
    data: Vec<u8>,
    tag: Option<serde_json::Value>,
    timeout: Option<Duration>,
    response_descriptor: Option<PacketDescriptor>,
}

impl Request {
    /// A request that expects no response and never times out.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            data: data.into(),
            tag: None,
            timeout: None,
            response_descriptor: None,
        }
    }

    /// Wait for a response matching `descriptor`.
    pub fn with_response(mut self, descriptor: PacketDescriptor) -> Self {
        self.response_descriptor = Some(descriptor);
        self
    }

    /// Give up on the response after `timeout`. A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Attach an opaque correlation value.
    pub fn with_tag(mut self, tag: serde_json::Value) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn tag(&self) -> Option<&serde_json::Value> {
        self.tag.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn response_descriptor(&self) -> Option<&PacketDescriptor> {
        self.response_descriptor.as_ref()
    }

    pub fn expects_response(&self) -> bool {
        self.response_descriptor.is_some()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("tag", &self.tag)
            .field("timeout", &self.timeout)
            .field(
                "response_descriptor",
                &self.response_descriptor.as_ref().map(PacketDescriptor::id),
            )
            .finish()
    }
}

/// Single-assignment slot shared between the worker and a waiting caller.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    settled: AtomicBool,
    result: Mutex<Option<RequestResult>>,
    ready: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `result` unless something already did. Returns whether this
    /// call won.
    pub(crate) fn settle(&self, result: RequestResult) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.ready.notify_all();
        true
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Option<RequestResult> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return slot.clone();
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }
}

/// Handle to a submitted request.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    request: Request,
    completion: Arc<Completion>,
}

impl ResponseHandle {
    pub(crate) fn new(request: Request, completion: Arc<Completion>) -> Self {
        Self {
            request,
            completion,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Whether the request has reached a terminal outcome.
    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }

    /// Block until the request settles.
    pub fn wait(&self) -> RequestResult {
        self.completion
            .wait_until(None)
            .unwrap_or(Err(RequestError::PortClosed))
    }

    /// Block for at most `timeout`. Returns `None` if the request is still
    /// outstanding; it keeps running either way.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestResult> {
        self.completion.wait_until(Some(Instant::now() + timeout))
    }
}
