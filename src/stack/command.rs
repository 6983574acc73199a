use std::rc::Weak;

use futures::FutureExt;

use crate::error::Result;
use crate::events::SubscriptionId;

use super::{StackInner, try_remove};

/// Bindable "back" action: attempt to remove the topmost entry.
///
/// Disabled while the stack is empty and while a previous attempt is still
/// waiting on an async veto. Clones share that in-flight state.
#[derive(Clone)]
pub struct RemoveTopViewModelCommand {
    stack: Weak<StackInner>,
}

impl RemoveTopViewModelCommand {
    pub(crate) fn new(stack: Weak<StackInner>) -> Self {
        Self { stack }
    }

    pub fn can_execute(&self) -> bool {
        self.stack
            .upgrade()
            .map(|inner| inner.command_can_execute())
            .unwrap_or(false)
    }

    pub fn is_in_flight(&self) -> bool {
        self.stack
            .upgrade()
            .map(|inner| inner.command_in_flight())
            .unwrap_or(false)
    }

    /// Start a removal attempt. Does nothing when the command is disabled.
    pub fn execute(&self) -> Result<()> {
        let Some(inner) = self.stack.upgrade() else {
            return Ok(());
        };
        if !inner.command_can_execute() {
            return Ok(());
        }
        let Some(top) = inner.top_service() else {
            return Ok(());
        };

        inner.set_command_in_flight(true);
        let stack = self.stack.clone();
        let attempt = async move {
            let result = try_remove(stack.clone(), top).await;
            if let Some(inner) = stack.upgrade() {
                inner.set_command_in_flight(false);
            }
            result.map(|_| ())
        }
        .boxed_local();

        match inner.drive(attempt) {
            Ok(_) => Ok(()),
            Err(err) => {
                // The attempt never reached the spawner; make sure the flag is cleared.
                if inner.command_in_flight() {
                    inner.set_command_in_flight(false);
                }
                Err(err)
            }
        }
    }

    /// Notified with the new value whenever `can_execute` flips.
    pub fn on_can_execute_changed(
        &self,
        listener: impl Fn(&bool) + 'static,
    ) -> Option<SubscriptionId> {
        self.stack
            .upgrade()
            .map(|inner| inner.can_execute_changed().subscribe(listener))
    }

    pub fn remove_can_execute_listener(&self, id: SubscriptionId) -> bool {
        self.stack
            .upgrade()
            .map(|inner| inner.can_execute_changed().unsubscribe(id))
            .unwrap_or(false)
    }
}
