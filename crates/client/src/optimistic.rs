//! Generic optimistic-mutation coordinator.
//!
//! Every create/update/delete command follows the same shape: apply a
//! tentative local change immediately, issue the request, then reconcile —
//! commit the authoritative result on success, restore the prior snapshot
//! on failure. The scope is checked before every reconciling store write
//! so nothing lands after the owner has been torn down.

use std::future::Future;

use crate::commands::CommandError;
use crate::scope::Scope;

/// Run one optimistic mutation.
///
/// `apply` performs the tentative store change and returns whatever is
/// needed to undo it (a prior snapshot, a temporary id, ...). On success
/// `commit` reconciles the store with the server's result; on failure
/// `rollback` restores the snapshot. The server result is handed back to
/// the caller on success.
pub async fn mutate<Snap, Out, Fut>(
    scope: &Scope,
    apply: impl FnOnce() -> Snap,
    request: Fut,
    commit: impl FnOnce(&Out),
    rollback: impl FnOnce(Snap),
) -> Result<Out, CommandError>
where
    Fut: Future<Output = Result<Out, CommandError>>,
{
    if scope.is_closed() {
        return Err(CommandError::Cancelled);
    }
    let prior = apply();
    match request.await {
        Ok(out) => {
            if scope.is_closed() {
                return Err(CommandError::Cancelled);
            }
            commit(&out);
            Ok(out)
        }
        Err(err) => {
            if !scope.is_closed() {
                rollback(prior);
            }
            Err(err)
        }
    }
}
