//! Chat commands.
//!
//! Sends are optimistic: the message appears immediately under a temporary
//! id with `is_temp` set, then is replaced in place by the server's
//! message (matched by the temporary id, which doubles as the idempotency
//! key). A failed send removes the tentative message entirely.

use chrono::Utc;
use uuid::Uuid;

use jamroom_shared::{ChatMessage, CreateMessageRequest};

use crate::optimistic;
use crate::scope::Scope;
use crate::store::{ChatPatch, StatePatch, StoredChatMessage};

use super::{CommandError, Commands};

fn chat_error(msg: String) -> StatePatch {
    StatePatch::Chat(ChatPatch {
        error: Some(Some(msg)),
        ..Default::default()
    })
}

impl Commands {
    /// Send a chat message.
    pub async fn send_message(
        &self,
        scope: &Scope,
        body: impl Into<String>,
    ) -> Result<ChatMessage, CommandError> {
        let body = body.into();
        let temp_id = Uuid::new_v4().to_string();
        let store = self.store().clone();
        let api = self.api().clone();

        let author = {
            let session = store.snapshot().session;
            session
                .session
                .as_ref()
                .and_then(|s| s.display_name.clone().or_else(|| s.user_id.clone()))
                .unwrap_or_else(|| "anonymous".to_string())
        };

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let temp_id = temp_id.clone();
                let body = body.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.chat.messages.clone();
                        let mut chat = state.chat.clone();
                        chat.insert_message(StoredChatMessage {
                            id: temp_id,
                            author,
                            body,
                            sent_at: Utc::now(),
                            is_temp: true,
                        });
                        StatePatch::Chat(ChatPatch {
                            messages: Some(chat.messages),
                            ..Default::default()
                        })
                    });
                    prior
                }
            },
            {
                let temp_id = temp_id.clone();
                self.retrier().action(scope, "chat.send", move || {
                    let api = api.clone();
                    let request = CreateMessageRequest {
                        body: body.clone(),
                        idempotency_key: Some(temp_id.clone()),
                    };
                    async move {
                        api.post_json::<_, ChatMessage>("/api/chat/messages", &request)
                            .await
                    }
                })
            },
            {
                let store = store.clone();
                let temp_id = temp_id.clone();
                move |message: &ChatMessage| {
                    store.apply_with(|state| {
                        let mut chat = state.chat.clone();
                        chat.messages.retain(|m| m.id != temp_id);
                        chat.insert_message(StoredChatMessage::from(message.clone()));
                        StatePatch::Chat(ChatPatch {
                            messages: Some(chat.messages),
                            error: Some(None),
                            ..Default::default()
                        })
                    });
                }
            },
            move |prior| {
                store.apply(StatePatch::Chat(ChatPatch {
                    messages: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                chat_error(format!("Failed to send message: {msg}"))
            });
        }
        result
    }

    /// Fetch the chat history. Returns `None` when the call was debounced
    /// away.
    pub async fn fetch_chat_history(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<Vec<ChatMessage>>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "chat.fetch",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<Vec<ChatMessage>>("/api/chat/messages").await }
            },
            |messages| {
                let mut chat = crate::store::ChatDomain::default();
                chat.set_history(
                    messages
                        .iter()
                        .cloned()
                        .map(StoredChatMessage::from)
                        .collect(),
                );
                StatePatch::Chat(ChatPatch {
                    messages: Some(chat.messages),
                    loaded: Some(true),
                    error: Some(None),
                })
            },
            |msg| chat_error(format!("Failed to fetch chat history: {msg}")),
        )
        .await
    }

    /// Clear the chat history for everyone.
    pub async fn clear_chat(&self, scope: &Scope) -> Result<(), CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.chat.messages.clone();
                        StatePatch::Chat(ChatPatch {
                            messages: Some(Vec::new()),
                            ..Default::default()
                        })
                    });
                    prior
                }
            },
            self.retrier().action(scope, "chat.clear", move || {
                let api = api.clone();
                async move { api.delete("/api/chat/messages").await }
            }),
            |_: &()| {},
            move |prior| {
                store.apply(StatePatch::Chat(ChatPatch {
                    messages: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                chat_error(format!("Failed to clear chat: {msg}"))
            });
        }
        result
    }
}
