use log::{debug, error};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Deterministic string-keyed map that committed log entries are applied to.
///
/// The map is rebuilt by replaying the log on every restart. The JSON mirror
/// written after each mutation is an inspection aid only and is never read
/// back, so it carries no correctness weight.
pub struct KeyValueStore {
    node_id: String,
    db_path: PathBuf,
    data: Mutex<HashMap<String, String>>,
}

impl KeyValueStore {
    pub fn new(data_dir: &Path, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            db_path: data_dir.join(format!("node_{}_db.json", node_id)),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    /// Copy of the whole map, for tests and status inspection.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.lock().unwrap().clone()
    }

    /// Interpret one committed command and return the client-visible result.
    ///
    /// Grammar: `SET <key> <value>`, `GET <key>`, `DELETE <key>`. The verb is
    /// case-insensitive, any run of whitespace separates tokens, and a SET
    /// value keeps everything after the key, spaces included.
    pub fn apply_command(&self, command: &str) -> String {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return "ERROR: Empty command".to_string();
        }

        let (verb, rest) = split_token(trimmed);
        let verb = verb.to_uppercase();
        let (key, value) = match rest {
            Some(rest) => {
                let (key, value) = split_token(rest);
                (Some(key), value)
            }
            None => (None, None),
        };

        match verb.as_str() {
            "SET" => {
                let (key, value) = match (key, value) {
                    (Some(k), Some(v)) => (k, v),
                    _ => return "ERROR: SET requires key and value".to_string(),
                };
                self.set(key, value);
                format!("OK: SET {}={}", key, value)
            }
            "GET" => {
                let key = match key {
                    Some(k) => k,
                    None => return "ERROR: GET requires key".to_string(),
                };
                match self.get(key) {
                    Some(value) => format!("OK: {}", value),
                    None => format!("ERROR: Key '{}' not found", key),
                }
            }
            "DELETE" => {
                let key = match key {
                    Some(k) => k,
                    None => return "ERROR: DELETE requires key".to_string(),
                };
                if self.delete(key) {
                    format!("OK: Deleted {}", key)
                } else {
                    format!("ERROR: Key '{}' not found", key)
                }
            }
            _ => format!("ERROR: Unknown command '{}'", verb),
        }
    }

    fn set(&self, key: &str, value: &str) {
        let mirror = {
            let mut data = self.data.lock().unwrap();
            data.insert(key.to_string(), value.to_string());
            data.clone()
        };
        debug!("[{}] SET {}={}", self.node_id, key, value);
        self.write_mirror(&mirror);
    }

    fn delete(&self, key: &str) -> bool {
        let (existed, mirror) = {
            let mut data = self.data.lock().unwrap();
            let existed = data.remove(key).is_some();
            (existed, data.clone())
        };
        if existed {
            debug!("[{}] DELETE {}", self.node_id, key);
            self.write_mirror(&mirror);
        }
        existed
    }

    // Best-effort: a failed mirror write loses nothing, the log is the truth.
    fn write_mirror(&self, data: &HashMap<String, String>) {
        let write = || -> std::io::Result<()> {
            if let Some(dir) = self.db_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let json = serde_json::to_vec_pretty(data)?;
            std::fs::write(&self.db_path, json)
        };
        if let Err(e) = write() {
            error!(
                "[{}] failed to mirror db to {}: {}",
                self.node_id,
                self.db_path.display(),
                e
            );
        }
    }
}

/// Split off the leading whitespace-separated token. The remainder drops the
/// separating run but keeps its own internal spacing, so chaining this twice
/// gives verb, key, and an as-written value tail.
fn split_token(input: &str) -> (&str, Option<&str>) {
    let mut parts = input.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let tail = parts
        .next()
        .map(str::trim_start)
        .filter(|tail| !tail.is_empty());
    (head, tail)
}
