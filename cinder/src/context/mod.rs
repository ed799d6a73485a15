//! Task-scoped trace context propagation.
//!
//! A [`Context`] is the stack of currently open segments and subsegments for
//! one unit of concurrent work. The thread-local current context tracks the
//! unit being polled right now; forking a child unit of work is an explicit
//! [`Context::current`] snapshot handed to the child future via
//! [`FutureContextExt::with_context`], which re-installs it on every poll.
//!
//! Snapshots share the underlying entities by reference but own their stack
//! storage, so two sibling branches can both see the segment that was open
//! at the fork point while their pushes and pops stay invisible to each
//! other.

use crate::cinder_warn;
use crate::trace::Entity;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;


mod future_ext;

pub use future_ext::{FutureContextExt, StreamContextExt, WithContext};

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// The stack of open trace entities for one unit of concurrent work.
///
/// Cloning a `Context` is the fork operation: the clone shares every entity
/// by reference but owns its stack storage, so mutations made by one unit of
/// work never show up in another.
#[derive(Clone, Debug, Default)]
pub struct Context {
    entities: Vec<Arc<Entity>>,
}

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a snapshot of the calling unit of work's context.
    ///
    /// This is the fork primitive: hand the snapshot to a child future via
    /// [`FutureContextExt::with_context`] when spawning or gathering. A
    /// caller that never began tracing gets an empty snapshot, which is not
    /// an error — the child simply traces nothing.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context returning its value.
    ///
    /// Avoids the clone of [`Context::current`] when read access suffices.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow().current_cx))
    }

    /// Entity at the top of this snapshot's stack, if any.
    pub fn top(&self) -> Option<&Arc<Entity>> {
        self.entities.last()
    }

    /// Entity at the bottom of this snapshot's stack — the root segment of
    /// the traced unit of work, when one is open.
    pub fn root(&self) -> Option<&Arc<Entity>> {
        self.entities.first()
    }

    /// True when no entity is open in this snapshot.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of open entities in this snapshot.
    pub fn depth(&self) -> usize {
        self.entities.len()
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous current
    /// context, discarding any mutations; [`ContextGuard::detach`] returns
    /// the mutated context instead, which is how [`WithContext`] carries a
    /// task's stack across polls.
    pub fn attach(self) -> ContextGuard {
        let cx_pos = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos,
            _marker: PhantomData,
        }
    }

    /// Entity currently open at the top of the calling task's stack.
    pub(crate) fn active_entity() -> Option<Arc<Entity>> {
        Self::map_current(|cx| cx.entities.last().cloned())
    }

    /// Pushes an entity onto the calling task's stack.
    pub(crate) fn push_active(entity: Arc<Entity>) {
        CURRENT_CONTEXT.with(|cx| cx.borrow_mut().current_cx.entities.push(entity));
    }

    /// Pops the top entity off the calling task's stack.
    pub(crate) fn pop_active() -> Option<Arc<Entity>> {
        CURRENT_CONTEXT.with(|cx| cx.borrow_mut().current_cx.entities.pop())
    }

    /// Removes `entity` (and anything pushed above it) from the calling
    /// task's stack. No-op when the entity is not on this task's stack,
    /// which happens when a capture scope is dropped outside the task that
    /// opened it.
    pub(crate) fn unwind_active(entity: &Arc<Entity>) {
        CURRENT_CONTEXT.with(|cx| {
            let entities = &mut cx.borrow_mut().current_cx.entities;
            if let Some(idx) = entities.iter().rposition(|e| Arc::ptr_eq(e, entity)) {
                if entities.len() - idx > 1 {
                    cinder_warn!(
                        name: "Context.UnwindSkippedEntities",
                        skipped = entities.len() - idx - 1
                    );
                }
                entities.truncate(idx);
            }
        });
    }
}

/// A guard that resets the current context to the prior context when dropped.
pub struct ContextGuard {
    // Position of the attached context in the thread's stack, used to pop it.
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals.
    _marker: PhantomData<*const ()>,
}

impl ContextGuard {
    /// Restores the previous context and returns the attached one, including
    /// any mutations made while it was current.
    pub fn detach(self) -> Context {
        let pos = self.cx_pos;
        std::mem::forget(self);
        CURRENT_CONTEXT
            .with(|cx| cx.borrow_mut().pop_id(pos))
            .unwrap_or_default()
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("cx_pos", &self.cx_pos)
            .finish()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let pos = self.cx_pos;
        if pos > ContextStack::BASE_POS && pos < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|cx| {
                let _ = cx.borrow_mut().pop_id(pos);
            });
        }
    }
}

/// A stack for keeping track of the [`Context`] instances that have been
/// attached to a thread.
///
/// Contexts are popped by position so that [`ContextGuard`]s may be dropped
/// out of order; only when the top of the stack is popped is the previous
/// context actually restored. Positions stay valid because the stack is
/// thread-local and guards cannot move to other threads.
struct ContextStack {
    /// The context that is current on this thread, and the top of the stack.
    /// Always present; an empty [`Context`] when nothing was attached.
    current_cx: Context,
    /// The other contexts that have been attached to the thread.
    stack: Vec<Option<Context>>,
    /// Ensure this type is !Send as it relies on thread locals.
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // The next id is the length of the stack, plus one since the top of
        // the stack lives in `current_cx`.
        let next_id = self.stack.len() + 1;
        if next_id < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_id as u16
        } else {
            cinder_warn!(
                name: "Context.AttachFailed",
                message = "too many attached contexts, the current context remains unchanged"
            );
            ContextStack::MAX_POS
        }
    }

    #[inline(always)]
    fn pop_id(&mut self, pos: u16) -> Option<Context> {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // The empty base context cannot be popped and the overflow
            // position is invalid.
            return None;
        }
        let len: u16 = self.stack.len() as u16;
        if pos == len {
            // Top of the stack: shrink past any out of order pops, then
            // restore the previous context and hand the detached one back.
            let detached = std::mem::take(&mut self.current_cx);
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
            Some(detached)
        } else {
            if pos > len {
                cinder_warn!(
                    name: "Context.PopOutOfBounds",
                    position = pos,
                    stack_length = len
                );
                return None;
            }
            // Out of order pop: clear the entry so the eventual top pop
            // skips it.
            self.stack[pos as usize].take();
            None
        }
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
