//! Session introspection.

use jamroom_shared::SessionInfo;

use crate::scope::Scope;
use crate::store::{SessionPatch, StatePatch};

use super::{CommandError, Commands};

impl Commands {
    /// Fetch the current session. Returns `None` when the call was
    /// debounced away.
    pub async fn fetch_session(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<SessionInfo>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "session.fetch",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<SessionInfo>("/api/session").await }
            },
            |info| {
                StatePatch::Session(SessionPatch {
                    session: Some(Some(info.clone())),
                    error: Some(None),
                })
            },
            |msg| {
                StatePatch::Session(SessionPatch {
                    error: Some(Some(format!("Failed to fetch session: {msg}"))),
                    ..Default::default()
                })
            },
        )
        .await
    }
}
