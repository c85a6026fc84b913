//! Values handed from a supply-data node to its consumers.

use crate::CapabilityError;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased provider object (a model client, a memory store, a tool...).
///
/// Clones share the same underlying object, so identity survives caching.
#[derive(Clone)]
pub struct Capability {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Capability {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Result<Arc<T>, CapabilityError> {
        Arc::clone(&self.inner)
            .downcast::<T>()
            .map_err(|_| CapabilityError::Downcast {
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// True when both handles point at the same provider object.
    pub fn ptr_eq(&self, other: &Capability) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability").field("type", &self.type_name).finish()
    }
}

/// What a supplier hands back: one provider, or a set of them (a toolkit).
#[derive(Debug, Clone)]
pub enum SuppliedData {
    Single(Capability),
    Collection(Vec<Capability>),
}

impl SuppliedData {
    pub fn single<T: Any + Send + Sync>(value: T) -> Self {
        SuppliedData::Single(Capability::new(value))
    }

    /// Every provider in this value, collections expanded in order.
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            SuppliedData::Single(capability) => vec![capability.clone()],
            SuppliedData::Collection(items) => items.clone(),
        }
    }

    pub fn as_single(&self) -> Option<&Capability> {
        match self {
            SuppliedData::Single(capability) => Some(capability),
            SuppliedData::Collection(_) => None,
        }
    }

    /// Identity comparison, element-wise for collections.
    pub fn ptr_eq(&self, other: &SuppliedData) -> bool {
        match (self, other) {
            (SuppliedData::Single(a), SuppliedData::Single(b)) => a.ptr_eq(b),
            (SuppliedData::Collection(a), SuppliedData::Collection(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ptr_eq(y))
            }
            _ => false,
        }
    }
}

/// Routine run once when the run that constructed the capability ends.
pub type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Result of a `supply_data` hook.
pub struct SupplyResponse {
    pub data: SuppliedData,
    pub close: Option<CloseFn>,
}

impl SupplyResponse {
    pub fn new(data: SuppliedData) -> Self {
        Self { data, close: None }
    }

    pub fn single<T: Any + Send + Sync>(value: T) -> Self {
        Self::new(SuppliedData::single(value))
    }

    pub fn with_close<F>(mut self, close: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.close = Some(Box::new(close));
        self
    }
}

impl fmt::Debug for SupplyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupplyResponse")
            .field("data", &self.data)
            .field("close", &self.close.is_some())
            .finish()
    }
}
