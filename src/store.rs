//! Persistent key-value store for subscribers and runtime settings.
//!
//! A single JSON document addressed with dotted keys (`bot.subscribers`).
//! Every write is flushed to disk and atomically renamed into place before
//! it returns, so a reload always sees the last completed write.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KEY_SERIALS: &str = "sn";
pub const KEY_SUBSCRIBERS: &str = "bot.subscribers";
pub const KEY_INFERENCE_ACTIVATED: &str = "inference.activated.status";
pub const KEY_INFERENCE_THRESHOLD: &str = "inference.threshold";

/// Notification destination (a chat id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subscriber(String);

impl Subscriber {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the dispatcher reads the current subscriber list from.
pub trait SubscriberSource: Send + Sync {
    fn subscribers(&self) -> Result<Vec<Subscriber>>;
}

impl SubscriberSource for Vec<Subscriber> {
    fn subscribers(&self) -> Result<Vec<Subscriber>> {
        Ok(self.clone())
    }
}

pub struct JsonStore {
    path: PathBuf,
    document: Mutex<Value>,
}

impl JsonStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Value::Object(Map::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow!("invalid store file {}: {}", path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => {
                return Err(anyhow!("failed to read store file {}: {}", path.display(), e))
            }
        };
        if !document.is_object() {
            return Err(anyhow!(
                "store file {} must contain a JSON object",
                path.display()
            ));
        }
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_nested(&self, key: &str) -> Option<Value> {
        let document = self.lock();
        let mut node = &*document;
        for part in key.split('.') {
            node = node.as_object()?.get(part)?;
        }
        Some(node.clone())
    }

    /// Set a value, creating intermediate objects as needed.
    pub fn set_nested(&self, key: &str, value: Value) -> Result<()> {
        self.update(|document| {
            let mut parts: Vec<&str> = key.split('.').collect();
            let leaf = parts
                .pop()
                .filter(|leaf| !leaf.is_empty())
                .ok_or_else(|| anyhow!("empty store key"))?;
            let mut node = document;
            for part in parts {
                let object = node
                    .as_object_mut()
                    .ok_or_else(|| anyhow!("store key {} crosses a non-object value", key))?;
                node = object
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
            }
            node.as_object_mut()
                .ok_or_else(|| anyhow!("store key {} crosses a non-object value", key))?
                .insert(leaf.to_string(), value);
            Ok(())
        })
    }

    /// Apply a change and persist it. The in-memory document only changes
    /// once the write succeeded.
    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let mut document = self.lock();
        let mut next = document.clone();
        change(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next).context("serialize store")?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("failed to persist store {}", self.path.display()))?;
        *document = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    /// Device serials that may register as subscribers.
    pub fn serials(&self) -> Vec<String> {
        match self.get_nested(KEY_SERIALS) {
            Some(Value::Array(values)) => values.iter().filter_map(value_to_id).collect(),
            Some(value) => value_to_id(&value).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn subscriber_list(&self) -> Vec<Subscriber> {
        match self.get_nested(KEY_SUBSCRIBERS) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(value_to_id)
                .map(Subscriber::new)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_subscriber(&self, subscriber: &Subscriber) -> bool {
        self.subscriber_list().contains(subscriber)
    }

    /// Returns `false` if already subscribed.
    pub fn add_subscriber(&self, subscriber: &Subscriber) -> Result<bool> {
        let mut subscribers = self.subscriber_list();
        if subscribers.contains(subscriber) {
            return Ok(false);
        }
        subscribers.push(subscriber.clone());
        self.set_nested(KEY_SUBSCRIBERS, serde_json::to_value(&subscribers)?)?;
        Ok(true)
    }

    /// Returns `false` if not subscribed.
    pub fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<bool> {
        let mut subscribers = self.subscriber_list();
        let before = subscribers.len();
        subscribers.retain(|s| s != subscriber);
        if subscribers.len() == before {
            return Ok(false);
        }
        self.set_nested(KEY_SUBSCRIBERS, serde_json::to_value(&subscribers)?)?;
        Ok(true)
    }

    pub fn inference_activated(&self) -> Option<bool> {
        self.get_nested(KEY_INFERENCE_ACTIVATED)
            .and_then(|v| v.as_bool())
    }

    pub fn set_inference_activated(&self, activated: bool) -> Result<()> {
        self.set_nested(KEY_INFERENCE_ACTIVATED, Value::Bool(activated))
    }

    pub fn inference_threshold(&self) -> Option<f32> {
        self.get_nested(KEY_INFERENCE_THRESHOLD)
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
    }

    pub fn set_inference_threshold(&self, threshold: f32) -> Result<()> {
        let value = serde_json::Number::from_f64(threshold as f64)
            .ok_or_else(|| anyhow!("threshold {} is not a finite number", threshold))?;
        self.set_nested(KEY_INFERENCE_THRESHOLD, Value::Number(value))
    }
}

impl SubscriberSource for JsonStore {
    fn subscribers(&self) -> Result<Vec<Subscriber>> {
        Ok(self.subscriber_list())
    }
}

/// Chat ids arrive as numbers from the bot API and as strings from hand
/// edited files.
fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_round_trip_through_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("memory.json");

        let store = JsonStore::open(&path)?;
        assert!(store.get_nested("inference.threshold").is_none());
        store.set_nested("inference.activated.status", json!(false))?;
        store.set_inference_threshold(0.65)?;

        let reloaded = JsonStore::open(&path)?;
        assert_eq!(reloaded.inference_activated(), Some(false));
        let threshold = reloaded.inference_threshold().unwrap();
        assert!((threshold - 0.65).abs() < 1e-6);
        assert_eq!(
            reloaded.get_nested("inference.activated"),
            Some(json!({ "status": false }))
        );
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn subscribers_are_deduplicated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path().join("memory.json"))?;
        let alice = Subscriber::new("1001");

        assert!(store.add_subscriber(&alice)?);
        assert!(!store.add_subscriber(&alice)?);
        assert!(store.is_subscriber(&alice));
        assert_eq!(store.subscribers()?, vec![alice.clone()]);

        assert!(store.remove_subscriber(&alice)?);
        assert!(!store.remove_subscriber(&alice)?);
        assert!(store.subscriber_list().is_empty());
        Ok(())
    }

    #[test]
    fn reads_numeric_ids_and_single_serial() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("memory.json");
        fs::write(
            &path,
            r#"{"sn": "SN-42", "bot": {"subscribers": [12345, "678"]}}"#,
        )?;

        let store = JsonStore::open(&path)?;
        assert_eq!(store.serials(), vec!["SN-42".to_string()]);
        assert_eq!(
            store.subscriber_list(),
            vec![Subscriber::new("12345"), Subscriber::new("678")]
        );
        Ok(())
    }

    #[test]
    fn rejects_non_object_documents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("memory.json");
        fs::write(&path, "[1, 2, 3]")?;
        assert!(JsonStore::open(&path).is_err());
        Ok(())
    }
}
