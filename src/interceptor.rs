use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{BoxFuture, FutureExt};

use crate::transport::TransportResponse;
use crate::util::lock_unpoisoned;
use crate::{CourierError, RequestDescriptor, Result};

type RequestFn =
    dyn Fn(RequestDescriptor) -> BoxFuture<'static, Result<RequestDescriptor>> + Send + Sync;
type ResponseFn =
    dyn Fn(TransportResponse) -> BoxFuture<'static, Result<TransportResponse>> + Send + Sync;
type ErrorFn = dyn Fn(CourierError) -> BoxFuture<'static, CourierError> + Send + Sync;

/// Which chain an interceptor was registered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterceptorKind {
    Request,
    Response,
    Error,
}

struct Chain<F: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<F>)>>,
}

impl<F: ?Sized> Default for Chain<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Chain<F> {
    fn push(&self, id: u64, interceptor: Arc<F>) {
        lock_unpoisoned(&self.entries).push((id, interceptor));
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        lock_unpoisoned(&self.entries)
            .iter()
            .any(|(entry, _)| *entry == id)
    }

    fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    fn snapshot(&self) -> Vec<(u64, Arc<F>)> {
        lock_unpoisoned(&self.entries).clone()
    }
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    request: Chain<RequestFn>,
    response: Chain<ResponseFn>,
    error: Chain<ErrorFn>,
}

impl Registry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Three insertion-ordered interceptor chains shared by every clone of a
/// client.
///
/// Chains may be mutated while requests are running. A chain walk starts
/// from a snapshot, and each entry is re-checked right before it runs, so
/// any walk that reaches an interceptor after [`InterceptorHandle::remove`]
/// returned skips it. A call that already passed that check on another
/// thread when `remove` ran still completes.
#[derive(Clone, Default)]
pub struct Interceptors {
    registry: Arc<Registry>,
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.registry.request.len())
            .field("response", &self.registry.response.len())
            .field("error", &self.registry.error.len())
            .finish()
    }
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request interceptor. It may rewrite or replace the descriptor.
    pub fn add_request<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestDescriptor>> + Send + 'static,
    {
        let id = self.registry.next_id();
        let interceptor: Arc<RequestFn> = Arc::new(move |request| interceptor(request).boxed());
        self.registry.request.push(id, interceptor);
        self.handle(id, InterceptorKind::Request)
    }

    /// Adds a response interceptor, run on the raw response before the
    /// status is validated.
    pub fn add_response<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(TransportResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TransportResponse>> + Send + 'static,
    {
        let id = self.registry.next_id();
        let interceptor: Arc<ResponseFn> =
            Arc::new(move |response| interceptor(response).boxed());
        self.registry.response.push(id, interceptor);
        self.handle(id, InterceptorKind::Response)
    }

    /// Adds an error interceptor, run once on the terminal error of a
    /// request. It can replace the error but never clear it.
    pub fn add_error<F, Fut>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(CourierError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierError> + Send + 'static,
    {
        let id = self.registry.next_id();
        let interceptor: Arc<ErrorFn> = Arc::new(move |error| interceptor(error).boxed());
        self.registry.error.push(id, interceptor);
        self.handle(id, InterceptorKind::Error)
    }

    /// Empties all three chains.
    pub fn clear(&self) {
        self.registry.request.clear();
        self.registry.response.clear();
        self.registry.error.clear();
    }

    pub fn len(&self, kind: InterceptorKind) -> usize {
        match kind {
            InterceptorKind::Request => self.registry.request.len(),
            InterceptorKind::Response => self.registry.response.len(),
            InterceptorKind::Error => self.registry.error.len(),
        }
    }

    pub(crate) async fn apply_request(
        &self,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor> {
        let chain = &self.registry.request;
        for (id, interceptor) in chain.snapshot() {
            if chain.contains(id) {
                request = interceptor(request).await?;
            }
        }
        Ok(request)
    }

    pub(crate) async fn apply_response(
        &self,
        mut response: TransportResponse,
    ) -> Result<TransportResponse> {
        let chain = &self.registry.response;
        for (id, interceptor) in chain.snapshot() {
            if chain.contains(id) {
                response = interceptor(response).await?;
            }
        }
        Ok(response)
    }

    pub(crate) async fn apply_error(&self, mut error: CourierError) -> CourierError {
        let chain = &self.registry.error;
        for (id, interceptor) in chain.snapshot() {
            if chain.contains(id) {
                error = interceptor(error).await;
            }
        }
        error
    }

    fn handle(&self, id: u64, kind: InterceptorKind) -> InterceptorHandle {
        InterceptorHandle {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
        }
    }
}

/// Capability returned on registration; removes exactly that interceptor.
#[derive(Clone)]
pub struct InterceptorHandle {
    id: u64,
    kind: InterceptorKind,
    registry: Weak<Registry>,
}

impl fmt::Debug for InterceptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl InterceptorHandle {
    pub fn kind(&self) -> InterceptorKind {
        self.kind
    }

    /// Removes the interceptor. Returns `false` if it was already gone.
    pub fn remove(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        match self.kind {
            InterceptorKind::Request => registry.request.remove(self.id),
            InterceptorKind::Response => registry.response.remove(self.id),
            InterceptorKind::Error => registry.error.remove(self.id),
        }
    }
}
