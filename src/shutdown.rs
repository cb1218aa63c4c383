//! Idempotent shutdown coordination.

use std::{cell::Cell, rc::Rc};

/// A one-shot latch shared between everything that can trigger teardown.
///
/// The first `begin` wins; repeated signals (say, a second Ctrl-C while the
/// first teardown is draining) observe `false` and do nothing.
#[derive(Clone, Default)]
pub struct ShutdownGuard {
    begun: Rc<Cell<bool>>,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        ShutdownGuard::default()
    }

    /// Claims the shutdown. Returns `true` only for the first caller.
    pub fn begin(&self) -> bool {
        !self.begun.replace(true)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.begun.get()
    }
}
