//! Inventory cache warm-up.
//!
//! The engine owns the [`InventoryCache`] that Smart Function lookups read.
//! [`InventoryWarmer`] fills it from the resolutions the identity resolver
//! reports, fetching objects it does not hold yet.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::api::InventoryApi;
use crate::identity::{object_id, InventoryCache, Resolution, ResolutionHook};

/// Fills an [`InventoryCache`] from identity resolutions.
pub struct InventoryWarmer {
    objects: Arc<InventoryCache>,
    inventory: Arc<dyn InventoryApi>,
}

impl InventoryWarmer {
    pub fn new(objects: Arc<InventoryCache>, inventory: Arc<dyn InventoryApi>) -> Self {
        Self { objects, inventory }
    }

    async fn fetch_missing(&self, id: &str) {
        if self.objects.get(id).is_some() {
            return;
        }
        match self.inventory.get_managed_object(id).await {
            Ok(Some(object)) => {
                self.objects.insert(object);
            }
            Ok(None) => {}
            Err(e) => debug!(id = %id, error = %e, "Could not fetch managed object"),
        }
    }
}

#[async_trait]
impl ResolutionHook for InventoryWarmer {
    async fn on_resolution(&self, resolution: Resolution) {
        match resolution {
            Resolution::Found {
                external_id,
                id_type,
                id,
            } => {
                self.objects.register(&external_id, &id_type, &id);
                self.fetch_missing(&id).await;
            }
            Resolution::Created {
                external_id,
                id_type,
                object,
            } => {
                if let Some(id) = object_id(&object) {
                    self.objects.register(&external_id, &id_type, &id);
                    self.objects.insert(object);
                }
            }
            Resolution::Registered {
                external_id,
                id_type,
                id,
            } => self.objects.register(&external_id, &id_type, &id),
            Resolution::Fetched(object) => {
                self.objects.insert(object);
            }
        }
    }
}
