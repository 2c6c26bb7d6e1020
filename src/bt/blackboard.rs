//! Shared run-time state for one armed tree.
//!
//! Every node reads/writes named ports against this blackboard rather than
//! holding direct references to sibling nodes, mirroring `BT::Blackboard`'s
//! role in the original controller (ports are declared per-node in the
//! C++; here they are a flat string-keyed map since this crate does not
//! reimplement the BT engine's static port typing — only its runtime
//! effect).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Entries are addressed by the `{Name}` convention used throughout the
/// node library's input/output ports (e.g. `{Uuid}`, `{SelectedAsset}`).
#[derive(Default)]
pub struct Blackboard {
    entries: RwLock<HashMap<String, Value>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.entries
            .write()
            .expect("blackboard mutex poisoned")
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .expect("blackboard mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Write the equipment map (`asset name -> AAS shell id`), built during
    /// `STARTING` from the process AAS's `RequiredCapabilities` submodel.
    pub fn set_equipment_map(&self, map: HashMap<String, String>) {
        self.set(
            "__equipment_map",
            serde_json::to_value(map).expect("string map is always serialisable"),
        );
    }

    pub fn equipment_map(&self) -> HashMap<String, String> {
        self.get("__equipment_map")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn shell_id_for(&self, asset_name: &str) -> Option<String> {
        self.equipment_map().get(asset_name).cloned()
    }

    /// Install a product-id queue (e.g. `{ProductIDs}`) shared by the queue
    /// decorators (§4.5.5) and its batch size under `{BatchSize}`.
    pub fn set_queue(&self, key: &str, items: Vec<String>) {
        self.set("__batch_size", items.len() as i64);
        self.set(key, items);
    }

    pub fn queue_len(&self, key: &str) -> usize {
        self.get(key)
            .and_then(|v| v.as_array().map(|a| a.len()))
            .unwrap_or(0)
    }

    pub fn batch_size(&self) -> i64 {
        self.get("__batch_size").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// Pop the front element of a string queue, read-modify-write under the
    /// single blackboard lock.
    pub fn pop_queue_front(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write().expect("blackboard mutex poisoned");
        let value = entries.get_mut(key)?;
        let array = value.as_array_mut()?;
        if array.is_empty() {
            return None;
        }
        let front = array.remove(0);
        front.as_str().map(str::to_string)
    }

    /// Write the station-name -> integer-position table consulted by
    /// `MoveToPosition` (§4.5.1).
    pub fn set_station_table(&self, table: HashMap<String, i64>) {
        self.set(
            "__station_table",
            serde_json::to_value(table).expect("int map is always serialisable"),
        );
    }

    pub fn station_position(&self, station: &str) -> Option<i64> {
        self.get("__station_table")
            .and_then(|v| v.get(station).cloned())
            .and_then(|v| v.as_i64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let bb = Blackboard::new();
        bb.set("Uuid", "abc-123");
        assert_eq!(bb.get_str("Uuid"), Some("abc-123".to_string()));
    }

    #[test]
    fn missing_key_is_none() {
        let bb = Blackboard::new();
        assert_eq!(bb.get("Missing"), None);
    }

    #[test]
    fn equipment_map_roundtrips() {
        let bb = Blackboard::new();
        let mut map = HashMap::new();
        map.insert("press-1".to_string(), "https://aas/press-1".to_string());
        bb.set_equipment_map(map);
        assert_eq!(
            bb.shell_id_for("press-1"),
            Some("https://aas/press-1".to_string())
        );
        assert_eq!(bb.shell_id_for("missing"), None);
    }

    #[test]
    fn queue_pops_front_and_tracks_batch_size() {
        let bb = Blackboard::new();
        bb.set_queue("ProductIDs", vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(bb.batch_size(), 2);
        assert_eq!(bb.queue_len("ProductIDs"), 2);
        assert_eq!(bb.pop_queue_front("ProductIDs"), Some("p1".to_string()));
        assert_eq!(bb.queue_len("ProductIDs"), 1);
        assert_eq!(bb.pop_queue_front("ProductIDs"), Some("p2".to_string()));
        assert_eq!(bb.pop_queue_front("ProductIDs"), None);
    }

    #[test]
    fn station_table_roundtrips() {
        let bb = Blackboard::new();
        let mut table = HashMap::new();
        table.insert("loading-bay".to_string(), 3i64);
        bb.set_station_table(table);
        assert_eq!(bb.station_position("loading-bay"), Some(3));
        assert_eq!(bb.station_position("missing"), None);
    }
}
