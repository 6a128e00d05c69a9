//! # Adapter Registry
//!
//! Maps an ERP type to its adapter implementation. Types can be disabled at
//! runtime (e.g. while a vendor API is known broken); resolving a disabled or
//! unregistered type fails permanently with `UNSUPPORTED_ERP_TYPE`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::ErpAdapter;
use crate::error::{Result, SyncError};
use crate::models::{Connection, ErpType};

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<ErpType, Arc<dyn ErpAdapter>>>,
    disabled: RwLock<HashSet<ErpType>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the type it reports; replaces any previous one
    pub fn register(&self, adapter: Arc<dyn ErpAdapter>) {
        let erp_type = adapter.erp_type();
        let replaced = self.adapters.write().insert(erp_type, adapter).is_some();
        info!(erp_type = %erp_type, replaced = replaced, "🔌 ERP adapter registered");
    }

    pub fn disable(&self, erp_type: ErpType) {
        self.disabled.write().insert(erp_type);
        debug!(erp_type = %erp_type, "ERP adapter disabled");
    }

    pub fn enable(&self, erp_type: ErpType) {
        self.disabled.write().remove(&erp_type);
        debug!(erp_type = %erp_type, "ERP adapter enabled");
    }

    pub fn registered_types(&self) -> Vec<ErpType> {
        let mut types: Vec<_> = self.adapters.read().keys().copied().collect();
        types.sort_by_key(|erp_type| erp_type.as_str());
        types
    }

    /// Select the adapter for a connection
    pub fn resolve(&self, connection: &Connection) -> Result<Arc<dyn ErpAdapter>> {
        if self.disabled.read().contains(&connection.erp_type) {
            return Err(SyncError::UnsupportedErpType(format!(
                "{} (disabled)",
                connection.erp_type
            )));
        }
        self.adapters
            .read()
            .get(&connection.erp_type)
            .cloned()
            .ok_or_else(|| SyncError::UnsupportedErpType(connection.erp_type.to_string()))
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("registered", &self.registered_types())
            .field("disabled", &self.disabled.read().len())
            .finish()
    }
}
