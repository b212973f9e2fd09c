// src/host/mod.rs
// Browser facilities the runtime depends on, behind swappable traits

pub mod dom;
pub mod loader;
pub mod location;
pub mod storage;

pub use dom::{Dom, ElementId, ResourceKind, VirtualDom, WrapperElements};
pub use loader::{HttpResourceLoader, ResourceLoadError, ResourceLoader};
pub use location::Location;
pub use storage::{MemoryStorage, Storage};

use std::sync::Arc;

/// Keys the embedding page forwards to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Other,
}

/// Everything the runtime needs from the page it runs in
#[derive(Clone)]
pub struct HostEnvironment {
    pub dom: Arc<dyn Dom>,
    pub loader: Arc<dyn ResourceLoader>,
    pub location: Arc<Location>,
    pub session_storage: Arc<dyn Storage>,
    pub local_storage: Arc<dyn Storage>,
}
