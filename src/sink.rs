//!
//! src/sink.rs  Andrew Belles  Oct 7th, 2025
//!
//! Archives every fetched chart payload as zstd compressed json so a run
//! can be replayed or audited after its rows are retired
//!

use std::{fs, path::{Path, PathBuf}};
use serde_json::Value;

use crate::errors::EtlError;
use crate::types::{RawPlaylist, RunId};

pub struct DiskZstdSink {
    root: PathBuf,
    level: i32
}

impl DiskZstdSink {
    pub fn new(root: impl AsRef<Path>, level: i32) -> Self {
        Self { root: root.as_ref().to_path_buf(), level: level.clamp(0, 21) }
    }

    /// `{root}/raw/{service}/{genre}/{run_id}.json.zst`
    pub fn write_playlist(&self, run: &RunId, raw: &RawPlaylist) -> Result<PathBuf, EtlError> {
        let mut doc = serde_json::json!({
            "run_id": run.as_str(),
            "service": raw.service.as_str(),
            "genre": raw.genre.as_str(),
            "meta": raw.meta,
            "payload": raw.payload
        });
        Self::prune(&mut doc);

        let rpath = Self::rel_path(raw, Self::sanitize_key(run.as_str()));
        self.write_json(&rpath, &doc)
    }

    fn write_json(&self, rpath: &Path, json: &Value) -> Result<PathBuf, EtlError> {
        let path = self.root.join(rpath);
        let parent = path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent).map_err(|e|
            EtlError::Io(std::io::Error::new(
                e.kind(), format!("create dir {}: {e}", parent.display())
            ))
        )?;

        let temp = tempfile::NamedTempFile::new_in(&parent)?;
        {
            let mut enc = zstd::stream::write::Encoder::new(temp.as_file(), self.level)?;
            serde_json::to_writer(&mut enc, json)?;
            enc.finish()?;
        }

        temp.persist(&path).map_err(|e| EtlError::Io(e.error))?;
        Ok(path)
    }

    pub fn read_json(path: &Path) -> Result<Value, EtlError> {
        let file = fs::File::open(path)?;
        let dec = zstd::stream::read::Decoder::new(file)?;
        Ok(serde_json::from_reader(dec)?)
    }

    fn rel_path(raw: &RawPlaylist, sanitized_run: String) -> PathBuf {
        PathBuf::from("raw")
            .join(raw.service.as_str())
            .join(raw.genre.as_str())
            .join(format!("{sanitized_run}.json.zst"))
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Drops empty values so archives only hold what was actually scraped
    fn prune(v: &mut Value) {
        match v {
            Value::Object(map) => {
                map.retain(|_, val| !matches!(val, Value::Null));
                for val in map.values_mut() {
                    Self::prune(val);
                }
            }
            Value::Array(arr) => {
                for element in arr {
                    Self::prune(element);
                }
            }
            _ => {}
        }
    }
}
