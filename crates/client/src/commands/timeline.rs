//! Timeline clip commands.
//!
//! Clip mutations are optimistic: the tentative entry (or edit) is visible
//! immediately and reconciled against the server's response. The timeline
//! must never end up empty — deleting the sole remaining clip creates a
//! fresh default one once the deletion commits.

use tracing::warn;
use uuid::Uuid;

use jamroom_shared::{Clip, CreateClipRequest, ReorderClipsRequest, UpdateClipRequest};

use crate::optimistic;
use crate::scope::Scope;
use crate::store::{StatePatch, StoredClip, TimelinePatch};

use super::{CommandError, Commands};

const DEFAULT_CLIP_NAME: &str = "Clip 1";
const DEFAULT_CLIP_LENGTH: f64 = 16.0;

fn timeline_error(msg: String) -> StatePatch {
    StatePatch::Timeline(TimelinePatch {
        error: Some(Some(msg)),
        ..Default::default()
    })
}

fn clips_patch(clips: Vec<StoredClip>) -> StatePatch {
    StatePatch::Timeline(TimelinePatch {
        clips: Some(clips),
        error: Some(None),
        ..Default::default()
    })
}

fn sorted(mut clips: Vec<StoredClip>) -> Vec<StoredClip> {
    clips.sort_by_key(|c| c.order);
    clips
}

impl Commands {
    /// Fetch the authoritative clip list. Returns `None` when the call was
    /// debounced away.
    pub async fn fetch_clips(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<Vec<Clip>>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "timeline.fetch",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<Vec<Clip>>("/api/timeline/clips").await }
            },
            |clips| {
                let stored = sorted(clips.iter().cloned().map(StoredClip::from).collect());
                StatePatch::Timeline(TimelinePatch {
                    clips: Some(stored),
                    loaded: Some(true),
                    error: Some(None),
                })
            },
            |msg| timeline_error(format!("Failed to fetch clips: {msg}")),
        )
        .await
    }

    /// Create a clip. The tentative entry appears immediately under a
    /// temporary id and is replaced in place by the server's clip.
    pub async fn create_clip(
        &self,
        scope: &Scope,
        name: impl Into<String>,
        start_beat: f64,
        length_beats: f64,
    ) -> Result<Clip, CommandError> {
        let name = name.into();
        let temp_id = Uuid::new_v4().to_string();
        let store = self.store().clone();
        let api = self.api().clone();

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let temp_id = temp_id.clone();
                let name = name.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.timeline.clips.clone();
                        let next_order = state
                            .timeline
                            .clips
                            .iter()
                            .map(|c| c.order + 1)
                            .max()
                            .unwrap_or(0);
                        let mut clips = state.timeline.clips.clone();
                        clips.push(StoredClip {
                            id: temp_id,
                            name,
                            start_beat,
                            length_beats,
                            order: next_order,
                            is_temp: true,
                        });
                        clips_patch(clips)
                    });
                    prior
                }
            },
            {
                let temp_id = temp_id.clone();
                self.retrier().action(scope, "timeline.create", move || {
                    let api = api.clone();
                    let body = CreateClipRequest {
                        name: name.clone(),
                        start_beat,
                        length_beats,
                        idempotency_key: Some(temp_id.clone()),
                    };
                    async move { api.post_json::<_, Clip>("/api/timeline/clips", &body).await }
                })
            },
            {
                let store = store.clone();
                let temp_id = temp_id.clone();
                move |clip: &Clip| {
                    store.apply_with(|state| {
                        let mut clips = state.timeline.clips.clone();
                        match clips.iter().position(|c| c.id == temp_id) {
                            Some(slot) => clips[slot] = StoredClip::from(clip.clone()),
                            // The temp entry can already be gone if a push
                            // replaced the whole list; fall back to insert.
                            None => {
                                if !clips.iter().any(|c| c.id == clip.id) {
                                    clips.push(StoredClip::from(clip.clone()));
                                }
                            }
                        }
                        clips_patch(sorted(clips))
                    });
                }
            },
            move |prior| {
                store.apply(StatePatch::Timeline(TimelinePatch {
                    clips: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                timeline_error(format!("Failed to create clip: {msg}"))
            });
        }
        result
    }

    /// Edit a clip in place; the authoritative response overwrites the
    /// optimistic edit.
    pub async fn update_clip(
        &self,
        scope: &Scope,
        clip_id: &str,
        update: UpdateClipRequest,
    ) -> Result<Clip, CommandError> {
        let clip_id = clip_id.to_string();
        let store = self.store().clone();
        let api = self.api().clone();

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let clip_id = clip_id.clone();
                let update = update.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.timeline.clips.clone();
                        let mut clips = state.timeline.clips.clone();
                        if let Some(clip) = clips.iter_mut().find(|c| c.id == clip_id) {
                            if let Some(name) = &update.name {
                                clip.name = name.clone();
                            }
                            if let Some(start) = update.start_beat {
                                clip.start_beat = start;
                            }
                            if let Some(length) = update.length_beats {
                                clip.length_beats = length;
                            }
                        }
                        clips_patch(clips)
                    });
                    prior
                }
            },
            {
                let clip_id = clip_id.clone();
                self.retrier().action(scope, "timeline.update", move || {
                    let api = api.clone();
                    let path = format!("/api/timeline/clips/{clip_id}");
                    let body = update.clone();
                    async move { api.put_json::<_, Clip>(&path, &body).await }
                })
            },
            {
                let store = store.clone();
                move |clip: &Clip| {
                    store.apply_with(|state| {
                        let mut clips = state.timeline.clips.clone();
                        if let Some(slot) = clips.iter_mut().find(|c| c.id == clip.id) {
                            *slot = StoredClip::from(clip.clone());
                        }
                        clips_patch(sorted(clips))
                    });
                }
            },
            move |prior| {
                store.apply(StatePatch::Timeline(TimelinePatch {
                    clips: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                timeline_error(format!("Failed to update clip: {msg}"))
            });
        }
        result
    }

    /// Delete a clip. If it was the last one, a default clip is created
    /// after the deletion commits so the timeline never goes empty.
    pub async fn delete_clip(&self, scope: &Scope, clip_id: &str) -> Result<(), CommandError> {
        let clip_id = clip_id.to_string();
        let store = self.store().clone();
        let api = self.api().clone();

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let clip_id = clip_id.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.timeline.clips.clone();
                        let clips = state
                            .timeline
                            .clips
                            .iter()
                            .filter(|c| c.id != clip_id)
                            .cloned()
                            .collect();
                        clips_patch(clips)
                    });
                    prior
                }
            },
            {
                let clip_id = clip_id.clone();
                self.retrier().action(scope, "timeline.delete", move || {
                    let api = api.clone();
                    let path = format!("/api/timeline/clips/{clip_id}");
                    async move { api.delete(&path).await }
                })
            },
            |_: &()| {},
            move |prior| {
                store.apply(StatePatch::Timeline(TimelinePatch {
                    clips: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;

        match &result {
            Ok(()) => {
                if !scope.is_closed() && self.store().snapshot().timeline.clips.is_empty() {
                    // The deletion itself succeeded; a failed default
                    // creation surfaces through the domain error only.
                    if let Err(err) = self
                        .create_clip(scope, DEFAULT_CLIP_NAME, 0.0, DEFAULT_CLIP_LENGTH)
                        .await
                    {
                        warn!(error = %err, "failed to create the default clip");
                    }
                }
            }
            Err(err) => {
                self.record_error(scope, err, |msg| {
                    timeline_error(format!("Failed to delete clip: {msg}"))
                });
            }
        }
        result
    }

    /// Reorder clips to match `clip_ids`; ids not listed keep their
    /// current relative order after the listed ones.
    pub async fn reorder_clips(
        &self,
        scope: &Scope,
        clip_ids: Vec<String>,
    ) -> Result<(), CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let clip_ids = clip_ids.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.timeline.clips.clone();
                        let mut clips = state.timeline.clips.clone();
                        for clip in clips.iter_mut() {
                            let listed = clip_ids.iter().position(|id| *id == clip.id);
                            clip.order = match listed {
                                Some(pos) => pos as u32,
                                None => clip_ids.len() as u32 + clip.order,
                            };
                        }
                        clips_patch(sorted(clips))
                    });
                    prior
                }
            },
            self.retrier().action(scope, "timeline.reorder", move || {
                let api = api.clone();
                let body = ReorderClipsRequest {
                    clip_ids: clip_ids.clone(),
                };
                async move {
                    api.put_json::<_, serde_json::Value>("/api/timeline/clips/order", &body)
                        .await
                        .map(|_| ())
                }
            }),
            |_: &()| {},
            move |prior| {
                store.apply(StatePatch::Timeline(TimelinePatch {
                    clips: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                timeline_error(format!("Failed to reorder clips: {msg}"))
            });
        }
        result
    }
}
