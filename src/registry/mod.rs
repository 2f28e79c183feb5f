//! Device Registry
//!
//! Process-wide, in-memory index of the physical devices attached to this
//! node, keyed by `{kind, name}`. Coordination modules read current signal
//! values and stage command writes here; the plug-and-play adapter flushes
//! board state in on ingress and drains staged commands out on its command
//! tick. Reads of absent devices or signals warn and return 0 rather than
//! failing, so a missing device degrades an actuation into a skip.

use crate::types::{DeviceId, DeviceKind};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// One registered device: declared state signals with current values, plus
/// declared command signals with staged writes.
#[derive(Debug, Clone)]
pub struct Device {
    state: BTreeMap<String, f64>,
    command_decl: HashSet<String>,
    staged: BTreeMap<String, f64>,
}

impl Device {
    fn new(state_signals: &[String], command_signals: &[String]) -> Self {
        Self {
            state: state_signals.iter().map(|s| (s.clone(), 0.0)).collect(),
            command_decl: command_signals.iter().cloned().collect(),
            staged: BTreeMap::new(),
        }
    }
}

/// The process-wide registry. Writers all run on the cooperative loop; the
/// map is still concurrency-safe so a parallel deployment stays legal.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with its declared signals. State signals start at 0.
    pub fn register(&self, id: DeviceId, state_signals: &[String], command_signals: &[String]) {
        debug!(device = %id, "device registered");
        self.devices.insert(id, Device::new(state_signals, command_signals));
    }

    pub fn unregister(&self, id: &DeviceId) {
        if self.devices.remove(id).is_some() {
            debug!(device = %id, "device unregistered");
        }
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// All registered devices of one kind, in name order.
    pub fn devices_of(&self, kind: DeviceKind) -> Vec<DeviceId> {
        let mut out: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|e| e.key().kind == kind)
            .map(|e| e.key().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn count_of(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|e| e.key().kind == kind).count()
    }

    /// Sum of `signal` across every device of `kind`. An empty set sums to 0.
    pub fn net_value(&self, kind: DeviceKind, signal: &str) -> f64 {
        self.devices
            .iter()
            .filter(|e| e.key().kind == kind)
            .map(|e| match e.value().state.get(signal) {
                Some(v) => *v,
                None => {
                    warn!(device = %e.key(), signal, "read of undeclared signal, using 0");
                    0.0
                }
            })
            .sum()
    }

    /// Current value of one signal. Absent device or signal reads as 0.
    pub fn get(&self, id: &DeviceId, signal: &str) -> f64 {
        match self.devices.get(id) {
            Some(dev) => match dev.state.get(signal) {
                Some(v) => *v,
                None => {
                    warn!(device = %id, signal, "read of undeclared signal, using 0");
                    0.0
                }
            },
            None => {
                warn!(device = %id, signal, "read of unregistered device, using 0");
                0.0
            }
        }
    }

    /// Stage a command write, flushed to hardware on the owning adapter's
    /// next command tick. Writes to absent devices or undeclared command
    /// signals are dropped with a warning.
    pub fn set(&self, id: &DeviceId, signal: &str, value: f64) {
        match self.devices.get_mut(id) {
            Some(mut dev) => {
                if dev.command_decl.contains(signal) {
                    dev.staged.insert(signal.to_string(), value);
                } else {
                    warn!(device = %id, signal, "write to undeclared command signal dropped");
                }
            }
            None => warn!(device = %id, signal, "write to unregistered device dropped"),
        }
    }

    /// Overwrite a state signal from board ingress.
    pub fn apply_state(&self, id: &DeviceId, signal: &str, value: f64) {
        match self.devices.get_mut(id) {
            Some(mut dev) => {
                dev.state.insert(signal.to_string(), value);
            }
            None => warn!(device = %id, signal, "state for unregistered device dropped"),
        }
    }

    /// Drain the staged commands for one device, in signal order.
    pub fn take_commands(&self, id: &DeviceId) -> Vec<(String, f64)> {
        match self.devices.get_mut(id) {
            Some(mut dev) => std::mem::take(&mut dev.staged).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn net_value_sums_across_kind() {
        let reg = DeviceRegistry::new();
        reg.register(DeviceId::new(DeviceKind::Load, "l1"), &sig(&["powerLevel"]), &[]);
        reg.register(DeviceId::new(DeviceKind::Load, "l2"), &sig(&["powerLevel"]), &[]);
        reg.register(DeviceId::new(DeviceKind::Drer, "solar"), &sig(&["powerLevel"]), &[]);

        reg.apply_state(&DeviceId::new(DeviceKind::Load, "l1"), "powerLevel", 2.5);
        reg.apply_state(&DeviceId::new(DeviceKind::Load, "l2"), "powerLevel", 1.5);
        reg.apply_state(&DeviceId::new(DeviceKind::Drer, "solar"), "powerLevel", 9.0);

        assert_eq!(reg.net_value(DeviceKind::Load, "powerLevel"), 4.0);
        assert_eq!(reg.net_value(DeviceKind::Drer, "powerLevel"), 9.0);
        // Empty set sums to zero.
        assert_eq!(reg.net_value(DeviceKind::Grid, "powerLevel"), 0.0);
    }

    #[test]
    fn absent_reads_return_zero() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::new(DeviceKind::Sst, "sst1");
        assert_eq!(reg.get(&id, "level"), 0.0);

        reg.register(id.clone(), &sig(&["level"]), &sig(&["level"]));
        assert_eq!(reg.get(&id, "voltage"), 0.0);
    }

    #[test]
    fn set_stages_until_drained() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::new(DeviceKind::Sst, "sst1");
        reg.register(id.clone(), &sig(&["level"]), &sig(&["level"]));

        reg.set(&id, "level", 3.0);
        reg.set(&id, "level", 4.0);
        let drained = reg.take_commands(&id);
        assert_eq!(drained, vec![("level".to_string(), 4.0)]);
        assert!(reg.take_commands(&id).is_empty());
    }

    #[test]
    fn undeclared_command_write_is_dropped() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::new(DeviceKind::Desd, "bat");
        reg.register(id.clone(), &sig(&["powerLevel"]), &sig(&["onOffSwitch"]));

        reg.set(&id, "powerLevel", 1.0);
        assert!(reg.take_commands(&id).is_empty());

        reg.set(&DeviceId::new(DeviceKind::Desd, "ghost"), "onOffSwitch", 1.0);
        assert!(reg.take_commands(&DeviceId::new(DeviceKind::Desd, "ghost")).is_empty());
    }

    #[test]
    fn unregister_forgets_device() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::new(DeviceKind::Load, "l1");
        reg.register(id.clone(), &sig(&["powerLevel"]), &[]);
        assert_eq!(reg.count_of(DeviceKind::Load), 1);

        reg.unregister(&id);
        assert_eq!(reg.count_of(DeviceKind::Load), 0);
        assert!(reg.devices_of(DeviceKind::Load).is_empty());
    }
}
