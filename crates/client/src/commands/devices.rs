//! Device commands: list, connect/disconnect, scan, and message
//! forwarding.

use serde_json::json;

use jamroom_shared::{Device, SendDeviceMessageRequest};

use crate::optimistic;
use crate::scope::Scope;
use crate::store::{DevicesPatch, StatePatch};

use super::{CommandError, Commands};

fn devices_error(msg: String) -> StatePatch {
    StatePatch::Devices(DevicesPatch {
        error: Some(Some(msg)),
        ..Default::default()
    })
}

impl Commands {
    /// Fetch the device list. Returns `None` when the call was debounced
    /// away.
    pub async fn fetch_devices(
        &self,
        scope: &Scope,
        force: bool,
    ) -> Result<Option<Vec<Device>>, CommandError> {
        let api = self.api().clone();
        self.fetch_into(
            scope,
            "devices.fetch",
            force,
            move || {
                let api = api.clone();
                async move { api.get_json::<Vec<Device>>("/api/devices").await }
            },
            |devices| {
                StatePatch::Devices(DevicesPatch {
                    devices: Some(devices.clone()),
                    error: Some(None),
                    ..Default::default()
                })
            },
            |msg| devices_error(format!("Failed to fetch devices: {msg}")),
        )
        .await
    }

    pub async fn connect_device(
        &self,
        scope: &Scope,
        device_id: &str,
    ) -> Result<Device, CommandError> {
        self.set_device_connected(scope, device_id, true).await
    }

    pub async fn disconnect_device(
        &self,
        scope: &Scope,
        device_id: &str,
    ) -> Result<Device, CommandError> {
        self.set_device_connected(scope, device_id, false).await
    }

    async fn set_device_connected(
        &self,
        scope: &Scope,
        device_id: &str,
        connected: bool,
    ) -> Result<Device, CommandError> {
        let device_id = device_id.to_string();
        let store = self.store().clone();
        let api = self.api().clone();
        let op: &'static str = if connected {
            "devices.connect"
        } else {
            "devices.disconnect"
        };

        let result = optimistic::mutate(
            scope,
            {
                let store = store.clone();
                let device_id = device_id.clone();
                move || {
                    let mut prior = Vec::new();
                    store.apply_with(|state| {
                        prior = state.devices.devices.clone();
                        let mut devices = state.devices.devices.clone();
                        if let Some(device) = devices.iter_mut().find(|d| d.id == device_id) {
                            device.connected = connected;
                        }
                        StatePatch::Devices(DevicesPatch {
                            devices: Some(devices),
                            ..Default::default()
                        })
                    });
                    prior
                }
            },
            {
                let device_id = device_id.clone();
                self.retrier().action(scope, op, move || {
                    let api = api.clone();
                    let verb = if connected { "connect" } else { "disconnect" };
                    let path = format!("/api/devices/{device_id}/{verb}");
                    async move { api.post_json::<_, Device>(&path, &json!({})).await }
                })
            },
            {
                let store = store.clone();
                move |device: &Device| {
                    store.apply_with(|state| {
                        let mut devices = state.devices.devices.clone();
                        if let Some(slot) = devices.iter_mut().find(|d| d.id == device.id) {
                            *slot = device.clone();
                        }
                        StatePatch::Devices(DevicesPatch {
                            devices: Some(devices),
                            error: Some(None),
                            ..Default::default()
                        })
                    });
                }
            },
            move |prior| {
                store.apply(StatePatch::Devices(DevicesPatch {
                    devices: Some(prior),
                    ..Default::default()
                }));
            },
        )
        .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                devices_error(format!("Failed to update device: {msg}"))
            });
        }
        result
    }

    /// Ask the server to rescan for devices; replaces the list with the
    /// scan result. Not optimistic — there is nothing to tentatively show.
    pub async fn scan_devices(&self, scope: &Scope) -> Result<Vec<Device>, CommandError> {
        if scope.is_closed() {
            return Err(CommandError::Cancelled);
        }
        self.store().apply(StatePatch::Devices(DevicesPatch {
            scanning: Some(true),
            ..Default::default()
        }));

        let api = self.api().clone();
        let result = self
            .retrier()
            .action(scope, "devices.scan", move || {
                let api = api.clone();
                async move {
                    api.post_json::<_, Vec<Device>>("/api/devices/scan", &json!({}))
                        .await
                }
            })
            .await;

        if scope.is_closed() {
            return Err(CommandError::Cancelled);
        }
        match &result {
            Ok(devices) => {
                self.store().apply(StatePatch::Devices(DevicesPatch {
                    devices: Some(devices.clone()),
                    scanning: Some(false),
                    error: Some(None),
                }));
            }
            Err(err) => {
                self.store().apply(StatePatch::Devices(DevicesPatch {
                    scanning: Some(false),
                    ..Default::default()
                }));
                self.record_error(scope, err, |msg| {
                    devices_error(format!("Failed to scan devices: {msg}"))
                });
            }
        }
        result
    }

    /// Forward an opaque message to a device. No local state changes.
    pub async fn send_device_message(
        &self,
        scope: &Scope,
        device_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), CommandError> {
        let api = self.api().clone();
        let path = format!("/api/devices/{device_id}/message");
        let result = self
            .retrier()
            .action(scope, "devices.send_message", move || {
                let api = api.clone();
                let path = path.clone();
                let body = SendDeviceMessageRequest {
                    payload: payload.clone(),
                };
                async move {
                    api.post_json::<_, serde_json::Value>(&path, &body)
                        .await
                        .map(|_| ())
                }
            })
            .await;
        if let Err(err) = &result {
            self.record_error(scope, err, |msg| {
                devices_error(format!("Failed to send device message: {msg}"))
            });
        }
        result
    }
}
