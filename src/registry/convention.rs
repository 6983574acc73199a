use std::any::TypeId;
use std::collections::HashMap;

use super::core::ViewType;

/// Structured form of a Rust type path: module segments plus the bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub module: Vec<String>,
    pub name: String,
}

impl TypeDescriptor {
    /// Split `std::any::type_name` output. Generic arguments are dropped.
    pub fn parse(type_name: &str) -> Self {
        let base = type_name.split('<').next().unwrap_or(type_name);
        let mut segments: Vec<String> = base.split("::").map(str::to_string).collect();
        let name = segments.pop().unwrap_or_default();
        Self {
            module: segments,
            name,
        }
    }

    pub fn of<T: 'static>() -> Self {
        Self::parse(std::any::type_name::<T>())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the last module segment equal to `from` with `to`.
    pub fn with_module_segment(mut self, from: &str, to: &str) -> Self {
        if let Some(segment) = self.module.iter_mut().rev().find(|s| s.as_str() == from) {
            *segment = to.to_string();
        }
        self
    }

    pub fn path(&self) -> String {
        let mut parts = self.module.clone();
        parts.push(self.name.clone());
        parts.join("::")
    }
}

/// Resolves the view type for a view-model type.
pub trait ViewLocator {
    fn locate(&self, view_model: TypeId, descriptor: &TypeDescriptor) -> Option<ViewType>;
}

type Convention = Box<dyn Fn(&TypeDescriptor) -> Option<TypeDescriptor>>;

/// Locates views by deriving a view descriptor from the view-model's
/// descriptor and looking it up among registered view types.
pub struct ConventionLocator {
    convention: Convention,
    views: HashMap<TypeDescriptor, ViewType>,
}

impl ConventionLocator {
    pub fn new(convention: impl Fn(&TypeDescriptor) -> Option<TypeDescriptor> + 'static) -> Self {
        Self {
            convention: Box::new(convention),
            views: HashMap::new(),
        }
    }

    /// `FooViewModel` → `FooView` in the same module.
    pub fn suffix(view_model_suffix: &'static str, view_suffix: &'static str) -> Self {
        Self::new(move |descriptor| {
            let stem = descriptor.name.strip_suffix(view_model_suffix)?;
            Some(
                descriptor
                    .clone()
                    .with_name(format!("{stem}{view_suffix}")),
            )
        })
    }

    pub fn register_view<V: 'static>(&mut self) -> &mut Self {
        let view = ViewType::of::<V>();
        self.views.insert(view.descriptor(), view);
        self
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

impl ViewLocator for ConventionLocator {
    fn locate(&self, _view_model: TypeId, descriptor: &TypeDescriptor) -> Option<ViewType> {
        let target = (self.convention)(descriptor)?;
        self.views.get(&target).copied()
    }
}
