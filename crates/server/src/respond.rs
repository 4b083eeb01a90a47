use callback_proto::ResponseToAgent;
use callback_store::{Store, SystemId};
use tracing::debug;

use crate::error::CallbackResult;

/// Picks the body sent back to an agent.
///
/// Every endpoint has a natural reply. Only `NOP` is negotiable: when the
/// agent has a pending task, that task's stored command goes out instead and
/// is marked delivered.
#[derive(Clone)]
pub struct ResponseOrchestrator {
    store: Store,
}

impl ResponseOrchestrator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn respond(
        &self,
        system: SystemId,
        natural: ResponseToAgent,
        now: i64,
    ) -> CallbackResult<String> {
        if natural.is_nop() {
            if let Some(body) = self.store.next_pending(system, now).await? {
                debug!(%system, "delivering pending task");
                return Ok(body);
            }
        }
        Ok(natural.encode()?)
    }
}
