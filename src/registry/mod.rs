//! Type-mapping registry: parameters type → view-model factory + view type.
//!
//! The rendering layer asks "which view renders this view-model?" through
//! [`ViewLocator`]; the registry answers for explicit mappings and an optional
//! [`ConventionLocator`] covers types that follow a naming scheme.

mod convention;
mod core;

pub use convention::{ConventionLocator, TypeDescriptor, ViewLocator};
pub use self::core::{TypeMappingRegistry, ViewType};
pub(crate) use self::core::ErasedFactory;
