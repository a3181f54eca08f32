//! C12 — library authorization. `effective_permission` resolves a
//! principal's access level against owner / explicit grant / public-read
//! fallback; every public entry point here fails closed (spec §4.8: "any
//! internal error is logged and treated as `None`").

use std::sync::Arc;

use uuid::Uuid;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::model::PermissionKind;
use knowbase_core::ports::LibraryStore;

pub struct LibraryAuthorizer {
    store: Arc<dyn LibraryStore>,
}

impl LibraryAuthorizer {
    pub fn new(store: Arc<dyn LibraryStore>) -> Self {
        Self { store }
    }

    /// Spec §4.8 step order: owner → missing library → explicit grant →
    /// public fallback → none. Never returns `Err`; any store failure is
    /// logged and folded into `PermissionKind::None`.
    pub fn effective_permission(&self, user_id: Uuid, library_id: Uuid) -> PermissionKind {
        match self.try_effective_permission(user_id, library_id) {
            Ok(kind) => kind,
            Err(error) => {
                tracing::error!(%error, %user_id, %library_id, "authorization check failed, denying access");
                PermissionKind::None
            }
        }
    }

    fn try_effective_permission(&self, user_id: Uuid, library_id: Uuid) -> KbResult<PermissionKind> {
        let Some(library) = self.store.get_library(library_id)? else {
            return Ok(PermissionKind::None);
        };

        if library.owner_id == user_id {
            return Ok(PermissionKind::Admin);
        }

        if let Some(permission) = self.store.get_permission(library_id, user_id)? {
            return Ok(permission.kind);
        }

        if library.is_public {
            return Ok(PermissionKind::Read);
        }

        Ok(PermissionKind::None)
    }

    pub fn has_permission(&self, user_id: Uuid, library_id: Uuid, required: PermissionKind) -> bool {
        self.effective_permission(user_id, library_id) >= required
    }

    pub fn validate_access(
        &self,
        user_id: Uuid,
        library_id: Uuid,
        required: PermissionKind,
        action: &str,
    ) -> KbResult<()> {
        if self.has_permission(user_id, library_id, required) {
            Ok(())
        } else {
            tracing::warn!(%user_id, %library_id, action, "access denied");
            Err(KbError::unauthorized(action))
        }
    }
}
