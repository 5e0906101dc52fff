//! Explicit caller identity.

use serde::{Deserialize, Serialize};

use crate::id::{TenantId, UserId};

/// Who is calling, and on behalf of which tenant.
///
/// Every ledger operation takes one of these instead of reading ambient
/// "current user" state. `user_id` ends up as `recorded_by` on audit rows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl LedgerContext {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }
}
