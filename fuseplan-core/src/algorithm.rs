use std::{
    collections::BTreeMap,
    fmt::Display,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Minimal identity of a built plan: enough to rebuild it for the same graph
/// without running heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
    pub engine_id: i64,
    #[serde(with = "knob_list")]
    pub knobs: BTreeMap<i64, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_size: Option<u64>,
}

impl AlgorithmDescriptor {
    pub fn new(engine_id: i64, knobs: impl IntoIterator<Item = (i64, i64)>) -> Self {
        Self {
            engine_id,
            knobs: knobs.into_iter().collect(),
            workspace_size: None,
        }
    }

    pub fn with_workspace(mut self, bytes: u64) -> Self {
        self.workspace_size = Some(bytes);
        self
    }

    /// Identity ignoring the workspace size.
    pub fn same_engine(&self, other: &Self) -> bool {
        self.engine_id == other.engine_id && self.knobs == other.knobs
    }
}

impl Display for AlgorithmDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "eng{}{{", self.engine_id)?;
        for (i, (k, v)) in self.knobs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "k{k}={v}")?;
        }
        f.write_str("}")?;
        if let Some(ws) = self.workspace_size {
            write!(f, " ws={ws}")?;
        }
        Ok(())
    }
}

/// Knobs persist as an ordered `[[id, value], ..]` list.
mod knob_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(knobs: &BTreeMap<i64, i64>, s: S) -> Result<S::Ok, S::Error> {
        let list: Vec<(i64, i64)> = knobs.iter().map(|(k, v)| (*k, *v)).collect();
        list.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<i64, i64>, D::Error> {
        let list = Vec::<(i64, i64)>::deserialize(d)?;
        Ok(list.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAlgorithm {
    pub updated_unix: u64,
    /// Measured run time in seconds; lower wins.
    pub score: f64,
    pub descriptor: AlgorithmDescriptor,
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fingerprint → best known descriptor, persisted as a JSON file.
#[derive(Debug, Clone)]
pub struct AlgorithmStore {
    path: PathBuf,
}

impl AlgorithmStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<cache dir>/fuseplan/algorithms.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("fuseplan").join("algorithms.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries. A missing or unreadable file is an empty store.
    pub fn load(&self) -> BTreeMap<String, StoredAlgorithm> {
        let mut buf = String::new();
        match File::open(&self.path).and_then(|mut f| f.read_to_string(&mut buf)) {
            Ok(_) => match serde_json::from_str(&buf) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %self.path.display(), "ignoring malformed algorithm store: {e}");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<AlgorithmDescriptor> {
        self.load().remove(fingerprint).map(|e| e.descriptor)
    }

    /// Store `descriptor` unless a faster one is already recorded. Returns
    /// whether the store changed.
    pub fn record(
        &self,
        fingerprint: &str,
        descriptor: &AlgorithmDescriptor,
        score: f64,
    ) -> Result<bool> {
        let mut store = self.load();
        let replace = match store.get(fingerprint) {
            None => true,
            Some(prev) => score < prev.score,
        };
        if !replace {
            return Ok(false);
        }
        store.insert(
            fingerprint.to_string(),
            StoredAlgorithm {
                updated_unix: now_unix(),
                score,
                descriptor: descriptor.clone(),
            },
        );
        self.save(&store)?;
        debug!(%descriptor, score, "recorded algorithm");
        Ok(true)
    }

    fn save(&self, store: &BTreeMap<String, StoredAlgorithm>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut f = File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(store)?.as_bytes())?;
        f.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}
