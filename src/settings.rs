//! Process-wide settings and per-recording options.
//!
//! Settings are modelled as one canonical struct. The persisted form is
//! key-per-setting; the legacy alias keys (`format` for `audio_format`,
//! `quality` for `audio_quality`) are mapped onto the canonical fields on
//! read and written back alongside them, so round-trips preserve both.
//! Unknown keys survive read/write cycles verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const QUALITY_MIN_KBPS: u32 = 64;
pub const QUALITY_MAX_KBPS: u32 = 320;
pub const QUALITY_STEP_KBPS: u32 = 32;
pub const SPLIT_INTERVAL_MIN: u32 = 1;
pub const SPLIT_INTERVAL_MAX: u32 = 120;

/// Container the encoder produces. `Unknown` appears only in synthetic
/// metadata produced when a session could not be finalized cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Compressed,
    Unknown,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Compressed => "compressed",
            AudioFormat::Unknown => "unknown",
        }
    }

    /// Export file extension. The compressed container is ADTS AAC.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Compressed => "aac",
            AudioFormat::Unknown => "bin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wav" => Some(AudioFormat::Wav),
            "compressed" => Some(AudioFormat::Compressed),
            "unknown" => Some(AudioFormat::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }
}

/// Options for one recording session, derived from [`Settings`] or supplied
/// by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingOptions {
    pub format: AudioFormat,
    pub quality_kbps: u32,
    /// Time-based split trigger. `None` disables it.
    pub split_interval_minutes: Option<u32>,
    /// Size-based split trigger. `None` disables it.
    pub split_size_mb: Option<u64>,
    /// `None` selects the default input device.
    pub input_device_id: Option<String>,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Settings::default().recording_options()
    }
}

impl RecordingOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.format == AudioFormat::Unknown {
            return Err("recording format must be wav or compressed".into());
        }
        if !(QUALITY_MIN_KBPS..=QUALITY_MAX_KBPS).contains(&self.quality_kbps)
            || self.quality_kbps % QUALITY_STEP_KBPS != 0
        {
            return Err(format!(
                "quality must be {QUALITY_MIN_KBPS}-{QUALITY_MAX_KBPS} kbps in steps of {QUALITY_STEP_KBPS}"
            ));
        }
        if let Some(minutes) = self.split_interval_minutes {
            if !(SPLIT_INTERVAL_MIN..=SPLIT_INTERVAL_MAX).contains(&minutes) {
                return Err(format!(
                    "split interval must be {SPLIT_INTERVAL_MIN}-{SPLIT_INTERVAL_MAX} minutes"
                ));
            }
        }
        if let Some(mb) = self.split_size_mb {
            if mb < 1 {
                return Err("split size must be at least 1 MB".into());
            }
        }
        Ok(())
    }
}

/// The full settings snapshot with every key resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub theme: Theme,
    pub audio_format: AudioFormat,
    pub audio_quality: u32,
    pub auto_split_enabled: bool,
    pub split_interval_minutes: u32,
    pub split_size_mb: u64,
    pub storage_location: String,
    pub input_device_id: String,
    /// Keys this version does not recognize, preserved for forward
    /// compatibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            audio_format: AudioFormat::Wav,
            audio_quality: 320,
            auto_split_enabled: true,
            split_interval_minutes: 30,
            split_size_mb: 500,
            storage_location: "TavernTapes_Recordings".to_string(),
            input_device_id: "default".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

const CANONICAL_FORMAT: &str = "audio_format";
const ALIAS_FORMAT: &str = "format";
const CANONICAL_QUALITY: &str = "audio_quality";
const ALIAS_QUALITY: &str = "quality";

/// Keys the canonical struct absorbs; everything else lands in `extra`.
const RECOGNIZED_KEYS: &[&str] = &[
    "theme",
    CANONICAL_FORMAT,
    ALIAS_FORMAT,
    CANONICAL_QUALITY,
    ALIAS_QUALITY,
    "auto_split_enabled",
    "split_interval_minutes",
    "split_size_mb",
    "storage_location",
    "input_device_id",
];

impl Settings {
    /// Build a snapshot from persisted key/value pairs. Missing keys resolve
    /// to defaults; malformed values fall back to defaults as well rather
    /// than failing the whole read.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut map: BTreeMap<String, Value> = entries.into_iter().collect();
        let mut settings = Settings::default();

        if let Some(theme) = map.get("theme").and_then(Value::as_str).and_then(Theme::parse) {
            settings.theme = theme;
        }
        // Canonical key wins over its alias when both are present.
        let format = map
            .get(CANONICAL_FORMAT)
            .or_else(|| map.get(ALIAS_FORMAT))
            .and_then(Value::as_str)
            .and_then(AudioFormat::parse);
        if let Some(format @ (AudioFormat::Wav | AudioFormat::Compressed)) = format {
            settings.audio_format = format;
        }
        let quality = map
            .get(CANONICAL_QUALITY)
            .or_else(|| map.get(ALIAS_QUALITY))
            .and_then(Value::as_u64);
        if let Some(kbps) = quality {
            let kbps = kbps as u32;
            if (QUALITY_MIN_KBPS..=QUALITY_MAX_KBPS).contains(&kbps)
                && kbps % QUALITY_STEP_KBPS == 0
            {
                settings.audio_quality = kbps;
            }
        }
        if let Some(enabled) = map.get("auto_split_enabled").and_then(Value::as_bool) {
            settings.auto_split_enabled = enabled;
        }
        if let Some(minutes) = map.get("split_interval_minutes").and_then(Value::as_u64) {
            let minutes = minutes as u32;
            if (SPLIT_INTERVAL_MIN..=SPLIT_INTERVAL_MAX).contains(&minutes) {
                settings.split_interval_minutes = minutes;
            }
        }
        if let Some(mb) = map.get("split_size_mb").and_then(Value::as_u64) {
            if mb >= 1 {
                settings.split_size_mb = mb;
            }
        }
        if let Some(location) = map.get("storage_location").and_then(Value::as_str) {
            if !location.is_empty() {
                settings.storage_location = location.to_string();
            }
        }
        if let Some(device) = map.get("input_device_id").and_then(Value::as_str) {
            if !device.is_empty() {
                settings.input_device_id = device.to_string();
            }
        }

        for key in RECOGNIZED_KEYS {
            map.remove(*key);
        }
        settings.extra = map;
        settings
    }

    /// Persisted form: canonical keys, their legacy aliases, and unknown
    /// keys verbatim.
    pub fn to_entries(&self) -> Vec<(String, Value)> {
        let mut entries = vec![
            ("theme".to_string(), Value::from(self.theme.as_str())),
            (
                CANONICAL_FORMAT.to_string(),
                Value::from(self.audio_format.as_str()),
            ),
            (
                ALIAS_FORMAT.to_string(),
                Value::from(self.audio_format.as_str()),
            ),
            (
                CANONICAL_QUALITY.to_string(),
                Value::from(self.audio_quality),
            ),
            (ALIAS_QUALITY.to_string(), Value::from(self.audio_quality)),
            (
                "auto_split_enabled".to_string(),
                Value::from(self.auto_split_enabled),
            ),
            (
                "split_interval_minutes".to_string(),
                Value::from(self.split_interval_minutes),
            ),
            ("split_size_mb".to_string(), Value::from(self.split_size_mb)),
            (
                "storage_location".to_string(),
                Value::from(self.storage_location.as_str()),
            ),
            (
                "input_device_id".to_string(),
                Value::from(self.input_device_id.as_str()),
            ),
        ];
        for (key, value) in &self.extra {
            entries.push((key.clone(), value.clone()));
        }
        entries
    }

    /// Map a single incoming key/value write onto the canonical keys it
    /// touches. Alias keys fan out to both spellings.
    pub fn keys_for_write(key: &str) -> Vec<&'static str> {
        match key {
            ALIAS_FORMAT | CANONICAL_FORMAT => vec![CANONICAL_FORMAT, ALIAS_FORMAT],
            ALIAS_QUALITY | CANONICAL_QUALITY => vec![CANONICAL_QUALITY, ALIAS_QUALITY],
            "theme" => vec!["theme"],
            "auto_split_enabled" => vec!["auto_split_enabled"],
            "split_interval_minutes" => vec!["split_interval_minutes"],
            "split_size_mb" => vec!["split_size_mb"],
            "storage_location" => vec!["storage_location"],
            "input_device_id" => vec!["input_device_id"],
            _ => vec![],
        }
    }

    /// Options for the next recording, honoring the auto-split toggle.
    pub fn recording_options(&self) -> RecordingOptions {
        RecordingOptions {
            format: self.audio_format,
            quality_kbps: self.audio_quality,
            split_interval_minutes: if self.auto_split_enabled {
                Some(self.split_interval_minutes)
            } else {
                None
            },
            split_size_mb: if self.auto_split_enabled {
                Some(self.split_size_mb)
            } else {
                None
            },
            input_device_id: if self.input_device_id == "default" {
                None
            } else {
                Some(self.input_device_id.clone())
            },
        }
    }
}
