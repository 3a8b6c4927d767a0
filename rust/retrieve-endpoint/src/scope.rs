//! Transaction-scoped cleanup of execution states.
//!
//! A [`ResourceScope`] stands for a transaction (or subtransaction, via
//! [`ResourceScope::child`]). Every sender declared in it registers its
//! execution state here; a clean teardown removes it again. Whatever is
//! still registered when the scope aborts, or when its last handle is
//! dropped, is force-aborted: slot freed, queue abandoned, token released.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::registry::{EndpointRegistry, SessionContext};
use crate::sender::ExecState;
use crate::wait::Interrupt;

/// Owner of the live execution states of one transaction.
#[derive(Clone)]
pub struct ResourceScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    registry: EndpointRegistry,
    session: SessionContext,
    states: Mutex<Vec<Arc<ExecState>>>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

/// Non-owning handle senders keep on their scope.
#[derive(Clone)]
pub(crate) struct WeakScope(Weak<ScopeInner>);

impl ResourceScope {
    pub fn new(registry: &EndpointRegistry, session: SessionContext) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                registry: registry.clone(),
                session,
                states: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Nested scope; aborted along with this one.
    pub fn child(&self) -> Self {
        let child = Self::new(&self.inner.registry, self.inner.session);
        let mut children = self.inner.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    /// Execution states registered here and in live children.
    pub fn live_states(&self) -> usize {
        self.inner.live_states()
    }

    /// The cursor was closed or the transaction committed: let every sender
    /// leave its close wait.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Force-abort every registered state, children first.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub(crate) fn register(&self, state: Arc<ExecState>) {
        tracing::trace!(endpoint = state.name(), "execution state registered");
        self.inner.states.lock().push(state);
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope(Arc::downgrade(&self.inner))
    }
}

impl ScopeInner {
    fn children(&self) -> Vec<Arc<ScopeInner>> {
        self.children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn live_states(&self) -> usize {
        self.states.lock().len() + self.children().iter().map(|c| c.live_states()).sum::<usize>()
    }

    fn close(&self) {
        for child in self.children() {
            child.close();
        }
        let states = self.states.lock().clone();
        for state in states {
            state.raise(Interrupt::Closed);
        }
    }

    fn abort(&self) {
        for child in self.children() {
            child.abort();
        }
        let states = std::mem::take(&mut *self.states.lock());
        let mut aborted = 0;
        for state in &states {
            if state.abort(Interrupt::Aborted) {
                aborted += 1;
            }
        }
        self.registry.end_session(&self.session);
        if !states.is_empty() {
            tracing::info!(
                session_id = self.session.session_id,
                aborted,
                "scope aborted"
            );
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let live = self.states.get_mut().len();
        if live > 0 {
            tracing::warn!(session_id = self.session.session_id, live, "scope dropped with live endpoints");
            self.abort();
        }
    }
}

impl WeakScope {
    pub(crate) fn deregister(&self, state: &Arc<ExecState>) {
        if let Some(scope) = self.0.upgrade() {
            let mut states = scope.states.lock();
            let before = states.len();
            states.retain(|s| !Arc::ptr_eq(s, state));
            if states.len() != before {
                tracing::trace!(endpoint = state.name(), "execution state deregistered");
            }
        }
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScope")
            .field("session", &self.inner.session)
            .field("states", &*self.inner.states.lock())
            .finish()
    }
}
