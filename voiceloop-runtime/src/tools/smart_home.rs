use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolUpdate};

use super::{object_schema, optional_str, required_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Bulb,
    Plug,
    Strip,
    Dimmer,
}

impl DeviceKind {
    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Bulb => "bulb",
            DeviceKind::Plug => "plug",
            DeviceKind::Strip => "strip",
            DeviceKind::Dimmer => "dimmer",
        }
    }

    fn dimmable(self) -> bool {
        matches!(self, DeviceKind::Bulb | DeviceKind::Dimmer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmartDevice {
    pub ip: String,
    pub alias: String,
    pub model: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub is_on: bool,
    pub brightness: Option<u8>,
    pub color: Option<String>,
    pub has_color: bool,
    pub has_brightness: bool,
}

impl SmartDevice {
    fn matches(&self, target: &str) -> bool {
        let t = target.trim();
        self.ip == t || self.alias.eq_ignore_ascii_case(t)
    }

    fn summary(&self) -> String {
        let state = if self.is_on { "ON" } else { "OFF" };
        format!(
            "{} (IP: {}, Type: {}) [{state}]",
            self.alias,
            self.ip,
            self.kind.label()
        )
    }
}

/// Lights and plugs on the local network. `target` is an IP or an alias.
///
/// Control methods return `false` when no device matches or the device
/// lacks the capability.
#[async_trait]
pub trait SmartHome: Send + Sync {
    async fn devices(&self) -> anyhow::Result<Vec<SmartDevice>>;
    async fn turn_on(&self, target: &str) -> anyhow::Result<bool>;
    async fn turn_off(&self, target: &str) -> anyhow::Result<bool>;
    async fn set_brightness(&self, target: &str, brightness: u8) -> anyhow::Result<bool>;
    async fn set_color(&self, target: &str, color: &str) -> anyhow::Result<bool>;
}

/// An office bulb and a living-room plug, kept in memory.
pub struct SimulatedSmartHome {
    devices: Mutex<Vec<SmartDevice>>,
}

impl SimulatedSmartHome {
    pub fn new() -> Self {
        let device = |ip: &str, alias: &str, model: &str, kind: DeviceKind| SmartDevice {
            ip: ip.into(),
            alias: alias.into(),
            model: model.into(),
            kind,
            is_on: false,
            brightness: kind.dimmable().then_some(100),
            color: None,
            has_color: kind == DeviceKind::Bulb,
            has_brightness: kind.dimmable(),
        };
        Self {
            devices: Mutex::new(vec![
                device("192.168.1.50", "Office Light", "Mock Bulb", DeviceKind::Bulb),
                device("192.168.1.51", "Living Room Plug", "Mock Plug", DeviceKind::Plug),
            ]),
        }
    }

    fn update(&self, target: &str, f: impl FnOnce(&mut SmartDevice) -> bool) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        match devices.iter_mut().find(|d| d.matches(target)) {
            Some(d) => f(d),
            None => false,
        }
    }
}

impl Default for SimulatedSmartHome {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmartHome for SimulatedSmartHome {
    async fn devices(&self) -> anyhow::Result<Vec<SmartDevice>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn turn_on(&self, target: &str) -> anyhow::Result<bool> {
        Ok(self.update(target, |d| {
            d.is_on = true;
            true
        }))
    }

    async fn turn_off(&self, target: &str) -> anyhow::Result<bool> {
        Ok(self.update(target, |d| {
            d.is_on = false;
            true
        }))
    }

    async fn set_brightness(&self, target: &str, brightness: u8) -> anyhow::Result<bool> {
        Ok(self.update(target, |d| {
            if !d.has_brightness {
                return false;
            }
            d.brightness = Some(brightness.min(100));
            true
        }))
    }

    async fn set_color(&self, target: &str, color: &str) -> anyhow::Result<bool> {
        Ok(self.update(target, |d| {
            if !d.has_color {
                return false;
            }
            d.color = Some(color.to_string());
            true
        }))
    }
}

async fn publish_devices(home: &dyn SmartHome, ctx: &ToolContext) {
    match home.devices().await {
        Ok(devices) => match serde_json::to_value(&devices) {
            Ok(v) => ctx.progress(ToolUpdate::Data(v)),
            Err(e) => log::warn!("failed to encode device list: {e}"),
        },
        Err(e) => log::warn!("failed to refresh device list: {e:#}"),
    }
}

pub struct ListSmartDevices {
    home: Arc<dyn SmartHome>,
}

impl ListSmartDevices {
    pub fn new(home: Arc<dyn SmartHome>) -> Self {
        Self { home }
    }
}

#[async_trait]
impl ToolHandler for ListSmartDevices {
    fn name(&self) -> &str {
        "list_smart_devices"
    }

    fn description(&self) -> &str {
        "Lists all available smart home devices (lights, plugs, etc.) on the network."
    }

    async fn invoke(&self, _args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let devices = self.home.devices().await?;
        if let Ok(v) = serde_json::to_value(&devices) {
            ctx.progress(ToolUpdate::Data(v));
        }
        if devices.is_empty() {
            return Ok("No devices found in cache.".into());
        }
        let lines: Vec<String> = devices.iter().map(SmartDevice::summary).collect();
        Ok(format!("Found Devices (Cached):\n{}", lines.join("\n")))
    }
}

pub struct ControlLight {
    home: Arc<dyn SmartHome>,
}

impl ControlLight {
    pub fn new(home: Arc<dyn SmartHome>) -> Self {
        Self { home }
    }
}

#[async_trait]
impl ToolHandler for ControlLight {
    fn name(&self) -> &str {
        "control_light"
    }

    fn description(&self) -> &str {
        "Controls a smart light device."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[
                (
                    "target",
                    "STRING",
                    "The IP address of the device to control. Always prefer the IP address over the alias for reliability.",
                ),
                (
                    "action",
                    "STRING",
                    "The action to perform: 'turn_on', 'turn_off', or 'set'.",
                ),
                ("brightness", "INTEGER", "Optional brightness level (0-100)."),
                (
                    "color",
                    "STRING",
                    "Optional color name (e.g., 'red', 'cool white') or 'warm'.",
                ),
            ],
            &["target", "action"],
        )
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let target = required_str(args, "target")?;
        let action = required_str(args, "action")?;
        let brightness = args
            .get("brightness")
            .and_then(Value::as_i64)
            .map(|b| b.clamp(0, 100) as u8);
        let color = optional_str(args, "color");

        let (success, mut msg) = match action {
            "turn_on" => {
                let ok = self.home.turn_on(target).await?;
                (ok, format!("Turned ON '{target}'."))
            }
            "turn_off" => {
                let ok = self.home.turn_off(target).await?;
                (ok, format!("Turned OFF '{target}'."))
            }
            "set" => (true, format!("Updated '{target}':")),
            _ => (false, String::new()),
        };
        if !success {
            let failed = format!("Action '{action}' on '{target}' failed.");
            ctx.report_error(&failed);
            return Ok(failed);
        }

        let mut changed = action != "set";
        if let Some(b) = brightness {
            if self.home.set_brightness(target, b).await? {
                msg.push_str(&format!(" Set brightness to {b}."));
                changed = true;
            }
        }
        if let Some(c) = color {
            if self.home.set_color(target, c).await? {
                msg.push_str(&format!(" Set color to {c}."));
                changed = true;
            }
        }
        if !changed {
            let failed = format!("Action '{action}' on '{target}' failed.");
            ctx.report_error(&failed);
            return Ok(failed);
        }

        publish_devices(self.home.as_ref(), ctx).await;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::Harness;
    use serde_json::json;

    #[tokio::test]
    async fn lists_simulated_devices() {
        let h = Harness::new();
        let out = ListSmartDevices::new(Arc::new(SimulatedSmartHome::new()))
            .invoke(&json!({}), &h.ctx("list_smart_devices"))
            .await
            .unwrap();
        assert_eq!(
            out,
            "Found Devices (Cached):\n\
             Office Light (IP: 192.168.1.50, Type: bulb) [OFF]\n\
             Living Room Plug (IP: 192.168.1.51, Type: plug) [OFF]"
        );
        let updates = h.sink.updates.lock().unwrap();
        let (_, ToolUpdate::Data(list)) = &updates[0] else {
            panic!("expected device data");
        };
        assert_eq!(list[0]["type"], "bulb");
        assert_eq!(list[1]["brightness"], Value::Null);
    }

    #[tokio::test]
    async fn turn_on_with_brightness_updates_device() {
        let h = Harness::new();
        let home = Arc::new(SimulatedSmartHome::new());
        let tool = ControlLight::new(home.clone());

        let out = tool
            .invoke(
                &json!({"target": "192.168.1.50", "action": "turn_on", "brightness": 40}),
                &h.ctx("control_light"),
            )
            .await
            .unwrap();
        assert_eq!(out, "Turned ON '192.168.1.50'. Set brightness to 40.");

        let devices = home.devices().await.unwrap();
        assert!(devices[0].is_on);
        assert_eq!(devices[0].brightness, Some(40));
        assert_eq!(h.sink.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_color_by_alias() {
        let h = Harness::new();
        let home = Arc::new(SimulatedSmartHome::new());
        let out = ControlLight::new(home.clone())
            .invoke(
                &json!({"target": "office light", "action": "set", "color": "warm"}),
                &h.ctx("control_light"),
            )
            .await
            .unwrap();
        assert_eq!(out, "Updated 'office light': Set color to warm.");
        assert_eq!(home.devices().await.unwrap()[0].color.as_deref(), Some("warm"));
    }

    #[tokio::test]
    async fn unknown_target_reports_failure() {
        let h = Harness::new();
        let tool = ControlLight::new(Arc::new(SimulatedSmartHome::new()));
        let out = tool
            .invoke(
                &json!({"target": "10.0.0.9", "action": "turn_off"}),
                &h.ctx("control_light"),
            )
            .await
            .unwrap();
        assert_eq!(out, "Action 'turn_off' on '10.0.0.9' failed.");
        assert_eq!(*h.sink.errors.lock().unwrap(), vec![out]);

        // A plug cannot be dimmed, so a bare brightness "set" changes nothing.
        let out = tool
            .invoke(
                &json!({"target": "192.168.1.51", "action": "set", "brightness": 10}),
                &h.ctx("control_light"),
            )
            .await
            .unwrap();
        assert_eq!(out, "Action 'set' on '192.168.1.51' failed.");
    }
}
