use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

/// One preset voice from the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceEntry {
    /// Piper `.onnx.json` config, absolute or relative to the catalog file.
    pub config: String,
    pub speaker_id: Option<i64>,
    pub display_name: Option<String>,
    pub gender: Option<String>,
    pub quality: Option<String>,
}

impl VoiceEntry {
    fn from_config(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            speaker_id: None,
            display_name: None,
            gender: None,
            quality: None,
        }
    }
}

/// Preset name -> voice, loaded from `voices.json`.
///
/// Two layouts are accepted:
///
/// ```json
/// { "default_voice": "amy", "voices": { "amy": { "config": "en/amy.onnx.json", "display_name": "Amy" } } }
/// ```
///
/// or a flat map whose values are either a config path or an entry object:
///
/// ```json
/// { "amy": "en/amy.onnx.json", "lessac": { "config": "en/lessac.onnx.json" } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VoiceCatalog {
    entries: BTreeMap<String, VoiceEntry>,
    default_voice: Option<String>,
    base_dir: Option<PathBuf>,
}

impl VoiceCatalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("Failed to load {}", path.display()))?;
        let mut catalog =
            Self::from_json_str(&text).with_context(|| format!("{} is not a valid voice map", path.display()))?;
        catalog.base_dir = path.parent().map(Path::to_path_buf);
        Ok(catalog)
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let json: serde_json::Value = serde_json::from_str(text).context("voice map is not valid JSON")?;
        let obj = json
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("voice map must be a JSON object"))?;

        if let Some(voices) = obj.get("voices") {
            let voices = voices
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("'voices' must be an object"))?;
            let default_voice = obj.get("default_voice").and_then(|x| x.as_str()).map(str::to_string);
            let entries = parse_entries(voices)?;
            if let Some(default) = &default_voice {
                if !entries.contains_key(default) {
                    anyhow::bail!("default_voice '{}' is not listed in 'voices'", default);
                }
            }
            return Ok(Self {
                entries,
                default_voice,
                base_dir: None,
            });
        }

        Ok(Self {
            entries: parse_entries(obj)?,
            default_voice: None,
            base_dir: None,
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&VoiceEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VoiceEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared default, or the first preset by name.
    pub fn default_voice(&self) -> Option<&str> {
        self.default_voice
            .as_deref()
            .or_else(|| self.entries.keys().next().map(String::as_str))
    }

    /// Config path for a preset, resolved against the catalog's directory.
    pub fn config_path(&self, name: &str) -> Option<PathBuf> {
        let entry = self.entries.get(name)?;
        let config = PathBuf::from(&entry.config);
        match &self.base_dir {
            Some(base) if config.is_relative() => Some(base.join(config)),
            _ => Some(config),
        }
    }
}

fn parse_entries(obj: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<BTreeMap<String, VoiceEntry>> {
    let mut entries = BTreeMap::new();
    for (name, value) in obj {
        let entry = match value {
            serde_json::Value::String(config) => VoiceEntry::from_config(config.clone()),
            serde_json::Value::Object(o) => {
                let config = o
                    .get("config")
                    .and_then(|x| x.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing 'config' for voice {}", name))?;
                let text = |key: &str| o.get(key).and_then(|x| x.as_str()).map(str::to_string);
                VoiceEntry {
                    config: config.to_string(),
                    speaker_id: o.get("speaker_id").and_then(|x| x.as_i64()),
                    display_name: text("display_name"),
                    gender: text("gender"),
                    quality: text("quality"),
                }
            }
            _ => anyhow::bail!("invalid entry for voice {} (expected string or object)", name),
        };
        entries.insert(name.clone(), entry);
    }
    Ok(entries)
}
