use std::any::{Any, TypeId};
use std::rc::Rc;

use crate::error::Result;

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
    fn any_type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn any_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// One unit of interactive state placed on a [`ViewModelStack`](crate::ViewModelStack).
///
/// View-models are shared as `Rc<dyn ViewModel>` and only ever borrowed
/// immutably by the stack; keep mutable state in cells.
pub trait ViewModel: AsAny {
    /// Release resources once the entry has been removed from the stack.
    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

impl dyn ViewModel {
    pub fn view_model_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }

    pub fn view_model_name(&self) -> &'static str {
        self.any_type_name()
    }

    pub fn is<T: ViewModel>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: ViewModel>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_rc<T: ViewModel>(self: Rc<Self>) -> Option<Rc<T>> {
        self.as_any_rc().downcast::<T>().ok()
    }
}
