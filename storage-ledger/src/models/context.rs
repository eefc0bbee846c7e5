//! Request context threaded through every ledger operation.

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

/// The warehouse a request acts on, who is acting, and what "today" is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseContext {
    pub warehouse_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub today: NaiveDate,
}

impl WarehouseContext {
    /// Context for the current UTC date.
    pub fn new(warehouse_id: Uuid) -> Self {
        Self {
            warehouse_id,
            actor_id: None,
            today: Utc::now().date_naive(),
        }
    }

    /// Context pinned to a fixed date.
    pub fn on(warehouse_id: Uuid, today: NaiveDate) -> Self {
        Self {
            warehouse_id,
            actor_id: None,
            today,
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}
