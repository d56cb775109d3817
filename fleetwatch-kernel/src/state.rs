use crate::capabilities::DisplayStateSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Last externally reported boolean flags per node (`display_on`, ...).
///
/// Filled by the MQTT listener and the HTTP API, read by the watchdog
/// through [`DisplayStateSource`].
#[derive(Clone, Default)]
pub struct DisplayStateStore {
    flags: Shared<HashMap<String, HashMap<String, bool>>>,
}

impl DisplayStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(&self, node: &str, key: &str, value: bool) {
        self.flags
            .lock()
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

impl DisplayStateSource for DisplayStateStore {
    fn get_bool(&self, node: &str, key: &str, default: bool) -> bool {
        self.flags
            .lock()
            .get(node)
            .and_then(|flags| flags.get(key).copied())
            .unwrap_or(default)
    }
}
