use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Result, StackError};
use crate::stack::ServiceHandle;
use crate::view_model::ViewModel;

use super::convention::{TypeDescriptor, ViewLocator};

pub(crate) type ErasedFactory =
    Rc<dyn Fn(ServiceHandle, Box<dyn Any>) -> Result<Rc<dyn ViewModel>>>;

/// Identifier of the visual type that renders a view-model.
#[derive(Clone, Copy)]
pub struct ViewType {
    id: TypeId,
    name: &'static str,
}

impl ViewType {
    pub fn of<V: 'static>() -> Self {
        Self {
            id: TypeId::of::<V>(),
            name: std::any::type_name::<V>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::parse(self.name)
    }

    pub fn is<V: 'static>(&self) -> bool {
        self.id == TypeId::of::<V>()
    }
}

impl PartialEq for ViewType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ViewType {}

impl fmt::Debug for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ViewType").field(&self.name).finish()
    }
}

struct Mapping {
    factory: ErasedFactory,
    view_model: TypeId,
    view: ViewType,
    registered: u64,
}

/// Explicit parameters → (factory, view) table. Last registration wins, both
/// per parameters type and for the view a view-model type resolves to.
#[derive(Default)]
pub struct TypeMappingRegistry {
    mappings: HashMap<TypeId, Mapping>,
    views: HashMap<TypeId, ViewType>,
    registrations: u64,
}

impl TypeMappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map<P, VM, V, F>(&mut self, factory: F)
    where
        P: 'static,
        VM: ViewModel,
        V: 'static,
        F: Fn(ServiceHandle, P) -> Result<VM> + 'static,
    {
        let erased: ErasedFactory = Rc::new(
            move |service: ServiceHandle, params: Box<dyn Any>| -> Result<Rc<dyn ViewModel>> {
                let params = params.downcast::<P>().map_err(|_| StackError::Unmapped {
                    type_name: std::any::type_name::<P>(),
                })?;
                let view_model = factory(service, *params)?;
                Ok(Rc::new(view_model))
            },
        );

        self.registrations += 1;
        let mapping = Mapping {
            factory: erased,
            view_model: TypeId::of::<VM>(),
            view: ViewType::of::<V>(),
            registered: self.registrations,
        };
        self.views.insert(mapping.view_model, mapping.view);

        if let Some(previous) = self.mappings.insert(TypeId::of::<P>(), mapping) {
            if previous.view_model != TypeId::of::<VM>() {
                self.rebuild_view(previous.view_model);
            }
        }
    }

    /// Point `view_model` at the view of its most recent remaining mapping.
    fn rebuild_view(&mut self, view_model: TypeId) {
        let latest = self
            .mappings
            .values()
            .filter(|mapping| mapping.view_model == view_model)
            .max_by_key(|mapping| mapping.registered)
            .map(|mapping| mapping.view);
        match latest {
            Some(view) => self.views.insert(view_model, view),
            None => self.views.remove(&view_model),
        };
    }

    pub(crate) fn factory_for(&self, params: TypeId) -> Option<ErasedFactory> {
        self.mappings
            .get(&params)
            .map(|mapping| Rc::clone(&mapping.factory))
    }

    pub fn is_mapped<P: 'static>(&self) -> bool {
        self.mappings.contains_key(&TypeId::of::<P>())
    }

    pub fn view_type_for(&self, view_model: TypeId) -> Option<ViewType> {
        self.views.get(&view_model).copied()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl ViewLocator for TypeMappingRegistry {
    fn locate(&self, view_model: TypeId, _descriptor: &TypeDescriptor) -> Option<ViewType> {
        self.view_type_for(view_model)
    }
}
