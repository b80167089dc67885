//! Transport control commands: query, playback mutations, and the poll
//! loop that runs while playback is active.

use serde_json::json;
use tracing::debug;

use jamroom_shared::{
    LoopRegion, SetBpmRequest, SetLoopRequest, SetPlayheadRequest, TimeSignature, TransportState,
};

use crate::optimistic;
use crate::scope::Scope;
use crate::store::{StatePatch, TransportPatch};

use super::{CommandError, Commands};

fn transport_error(msg: String) -> StatePatch {
    StatePatch::Transport(TransportPatch {
        error: Some(Some(msg)),
        ..Default::default()
    })
}

fn authoritative(state: &TransportState) -> StatePatch {
    StatePatch::Transport(TransportPatch {
        error: Some(None),
        ..TransportPatch::from_state(state)
    })
}

impl Commands {
    /// Fetch the authoritative transport state. Returns `None` when the
    /// call was debounced away.
    pub async fn fetch_transport(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<TransportState>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "transport.fetch",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<TransportState>("/api/transport").await }
            },
            authoritative,
            |msg| transport_error(format!("Failed to fetch transport state: {msg}")),
        )
        .await
    }

    /// Unauthenticated transport state for anonymous sessions.
    pub async fn fetch_public_transport(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<TransportState>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "transport.fetch_public",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<TransportState>("/api/public/transport").await }
            },
            authoritative,
            |msg| transport_error(format!("Failed to fetch transport state: {msg}")),
        )
        .await
    }

    pub async fn play(&self, scope: &Scope) -> Result<TransportState, CommandError> {
        self.set_playing(scope, "transport.play", "/api/transport/play", true)
            .await
    }

    pub async fn stop(&self, scope: &Scope) -> Result<TransportState, CommandError> {
        self.set_playing(scope, "transport.stop", "/api/transport/stop", false)
            .await
    }

    async fn set_playing(
        &self,
        scope: &Scope,
        op: &'static str,
        path: &'static str,
        playing: bool,
    ) -> Result<TransportState, CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();
        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let prior = store.snapshot().transport.is_playing;
                    store.apply(StatePatch::Transport(TransportPatch {
                        is_playing: Some(playing),
                        ..Default::default()
                    }));
                    prior
                }
            },
            self.retrier().action(scope, op, move || {
                let api = api.clone();
                async move {
                    api.post_json::<_, TransportState>(path, &json!({})).await
                }
            }),
            {
                let store = store.clone();
                move |state: &TransportState| {
                    store.apply(authoritative(state));
                }
            },
            move |prior| {
                store.apply(StatePatch::Transport(TransportPatch {
                    is_playing: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                transport_error(format!("Failed to update playback: {msg}"))
            });
        }
        result
    }

    pub async fn set_playhead(
        &self,
        scope: &Scope,
        position_beats: f64,
    ) -> Result<TransportState, CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();
        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let prior = store.snapshot().transport.position_beats;
                    store.apply(StatePatch::Transport(TransportPatch {
                        position_beats: Some(position_beats),
                        ..Default::default()
                    }));
                    prior
                }
            },
            self.retrier().action(scope, "transport.set_playhead", move || {
                let api = api.clone();
                async move {
                    api.put_json::<_, TransportState>(
                        "/api/transport/playhead",
                        &SetPlayheadRequest { position_beats },
                    )
                    .await
                }
            }),
            {
                let store = store.clone();
                move |state: &TransportState| {
                    store.apply(authoritative(state));
                }
            },
            move |prior| {
                store.apply(StatePatch::Transport(TransportPatch {
                    position_beats: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                transport_error(format!("Failed to move playhead: {msg}"))
            });
        }
        result
    }

    pub async fn set_bpm(&self, scope: &Scope, bpm: f64) -> Result<TransportState, CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();
        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let prior = store.snapshot().transport.bpm;
                    store.apply(StatePatch::Transport(TransportPatch {
                        bpm: Some(bpm),
                        ..Default::default()
                    }));
                    prior
                }
            },
            self.retrier().action(scope, "transport.set_bpm", move || {
                let api = api.clone();
                async move {
                    api.put_json::<_, TransportState>("/api/transport/bpm", &SetBpmRequest { bpm })
                        .await
                }
            }),
            {
                let store = store.clone();
                move |state: &TransportState| {
                    store.apply(authoritative(state));
                }
            },
            move |prior| {
                store.apply(StatePatch::Transport(TransportPatch {
                    bpm: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                transport_error(format!("Failed to set BPM: {msg}"))
            });
        }
        result
    }

    pub async fn set_time_signature(
        &self,
        scope: &Scope,
        time_signature: TimeSignature,
    ) -> Result<TransportState, CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();
        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let prior = store.snapshot().transport.time_signature;
                    store.apply(StatePatch::Transport(TransportPatch {
                        time_signature: Some(time_signature),
                        ..Default::default()
                    }));
                    prior
                }
            },
            self.retrier()
                .action(scope, "transport.set_time_signature", move || {
                    let api = api.clone();
                    async move {
                        api.put_json::<_, TransportState>(
                            "/api/transport/time-signature",
                            &time_signature,
                        )
                        .await
                    }
                }),
            {
                let store = store.clone();
                move |state: &TransportState| {
                    store.apply(authoritative(state));
                }
            },
            move |prior| {
                store.apply(StatePatch::Transport(TransportPatch {
                    time_signature: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                transport_error(format!("Failed to set time signature: {msg}"))
            });
        }
        result
    }

    /// Toggle looping and/or move the loop region.
    pub async fn set_loop(
        &self,
        scope: &Scope,
        enabled: bool,
        region: Option<LoopRegion>,
    ) -> Result<TransportState, CommandError> {
        let store = self.store().clone();
        let api = self.api().clone();
        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                move || {
                    let transport = store.snapshot().transport;
                    let prior = (transport.loop_enabled, transport.loop_region);
                    store.apply(StatePatch::Transport(TransportPatch {
                        loop_enabled: Some(enabled),
                        loop_region: Some(region),
                        ..Default::default()
                    }));
                    prior
                }
            },
            self.retrier().action(scope, "transport.set_loop", move || {
                let api = api.clone();
                async move {
                    api.put_json::<_, TransportState>(
                        "/api/transport/loop",
                        &SetLoopRequest { enabled, region },
                    )
                    .await
                }
            }),
            {
                let store = store.clone();
                move |state: &TransportState| {
                    store.apply(authoritative(state));
                }
            },
            move |(prior_enabled, prior_region)| {
                store.apply(StatePatch::Transport(TransportPatch {
                    loop_enabled: Some(prior_enabled),
                    loop_region: Some(prior_region),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                transport_error(format!("Failed to update loop: {msg}"))
            });
        }
        result
    }

    /// Re-fetch transport state on a fixed interval while playback is
    /// active, to catch server-driven changes not delivered via push.
    /// Exits as soon as playback stops or the scope closes; the owner of
    /// the play state restarts it when playback resumes.
    pub fn spawn_transport_poll(&self, scope: &Scope) -> tokio::task::JoinHandle<()> {
        let commands = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let interval = commands.retrier().policy.poll_interval;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if scope.is_closed() {
                    break;
                }
                if !commands.store().snapshot().transport.is_playing {
                    debug!("playback stopped; transport poll exiting");
                    break;
                }
                // Surfaced errors land in the domain; the poll keeps its
                // cadence until it latches terminal.
                let _ = commands.fetch_transport(&scope, false).await;
            }
        })
    }
}
