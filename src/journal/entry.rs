//! The append-log entry: one completed job serialized as one JSON line.
//!
//! Field names are English snake_case. Older log files used localized key
//! names; those are accepted as aliases on read so archived days replay
//! through the same code path.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

use crate::backend::files::IMAGE_URL_PREFIX;
use crate::scheduler::job::{hour_bucket, is_hour_bucket, UNKNOWN_ID};

/// Quality labels accepted in a record.
pub const QUALITY_LABELS: &[&str] = &["360p", "720p", "1080p", "1K", "2K", "4K", "HD"];

fn ratio_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\d{1,3}:\d{1,3}$").ok())
        .as_ref()
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash used to deduplicate records: SHA-256 of the trimmed line.
pub fn content_hash(line: &str) -> String {
    sha256_hex(line.trim().as_bytes())
}

fn unknown_id() -> String {
    UNKNOWN_ID.to_string()
}

fn default_ratio() -> String {
    "16:9".to_string()
}

fn default_quality() -> String {
    "1K".to_string()
}

fn default_count() -> u32 {
    1
}

/// Accepts a seed written either as a JSON string or as a number.
fn seed_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seed {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match Seed::deserialize(deserializer)? {
        Seed::Text(s) => s.trim().to_string(),
        Seed::Unsigned(n) => n.to_string(),
        Seed::Signed(n) => n.to_string(),
    })
}

/// One generated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedItem {
    #[serde(alias = "随机种子", deserialize_with = "seed_string")]
    pub seed: String,
    #[serde(alias = "热度值", default)]
    pub temperature: f64,
    #[serde(alias = "top值", default)]
    pub top_p: f64,
    #[serde(alias = "相对url路径", default)]
    pub relative_url: String,
    #[serde(alias = "存储绝对路径", default)]
    pub absolute_path: String,
}

impl GeneratedItem {
    fn check(&self, idx: usize) -> Result<(), String> {
        let url = self.relative_url.trim();
        if !url.starts_with(IMAGE_URL_PREFIX) || !(url.ends_with("/raw") || url.ends_with("/thumb"))
        {
            return Err(format!("item {}: malformed relative_url '{}'", idx, url));
        }
        if !Path::new(self.absolute_path.trim()).is_absolute() {
            return Err(format!(
                "item {}: absolute_path '{}' is not absolute",
                idx, self.absolute_path
            ));
        }
        Ok(())
    }
}

/// A completed job as written to the append log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Missing on lines written before job ids were logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(alias = "用户ID", default = "unknown_id")]
    pub user_id: String,
    #[serde(alias = "SessionID", default = "unknown_id")]
    pub session_id: String,
    /// `YYYYMMDDHH` UTC bucket.
    #[serde(alias = "创建时间", default)]
    pub created_at: String,
    #[serde(alias = "通用基础提示词", default)]
    pub base_prompt: String,
    #[serde(alias = "分类描述提示词", default)]
    pub category_prompt: String,
    #[serde(alias = "优化后正向提示词", default)]
    pub refined_positive: String,
    #[serde(alias = "优化后反向提示词", default)]
    pub refined_negative: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive_zh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_zh: Option<String>,
    #[serde(alias = "比例", default = "default_ratio")]
    pub aspect_ratio: String,
    #[serde(alias = "画质", default = "default_quality")]
    pub quality: String,
    #[serde(alias = "数量", default = "default_count")]
    pub count: u32,
    #[serde(alias = "模型名称", default)]
    pub model_name: String,
    #[serde(alias = "生成记录", default)]
    pub items: Vec<GeneratedItem>,
}

impl RecordEntry {
    /// Parses one log line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Serializes to a single line terminated by `\n`.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Fills defaults: unknown ids become `-1`, a malformed creation bucket
    /// is replaced with the bucket for `now`, blank ratio/quality get their
    /// defaults and surrounding whitespace is trimmed.
    pub fn normalize(mut self, now: DateTime<Utc>) -> Self {
        if self.user_id.trim().is_empty() {
            self.user_id = unknown_id();
        }
        if self.session_id.trim().is_empty() {
            self.session_id = unknown_id();
        }
        if !is_hour_bucket(self.created_at.trim()) {
            self.created_at = hour_bucket(now);
        }
        if self.aspect_ratio.trim().is_empty() {
            self.aspect_ratio = default_ratio();
        }
        if self.quality.trim().is_empty() {
            self.quality = default_quality();
        }
        self.user_id = self.user_id.trim().to_string();
        self.session_id = self.session_id.trim().to_string();
        self.created_at = self.created_at.trim().to_string();
        self.aspect_ratio = self.aspect_ratio.trim().to_string();
        self.quality = self.quality.trim().to_string();
        for item in &mut self.items {
            item.relative_url = item.relative_url.trim().to_string();
            item.absolute_path = item.absolute_path.trim().to_string();
        }
        self
    }

    /// Checks the field constraints a well-formed entry satisfies.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("base_prompt", &self.base_prompt),
            ("category_prompt", &self.category_prompt),
            ("refined_positive", &self.refined_positive),
            ("model_name", &self.model_name),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }
        if let Some(re) = ratio_pattern() {
            if !re.is_match(self.aspect_ratio.trim()) {
                return Err(format!("malformed aspect_ratio '{}'", self.aspect_ratio));
            }
        }
        if !QUALITY_LABELS.contains(&self.quality.trim()) {
            return Err(format!("unknown quality '{}'", self.quality));
        }
        if self.count == 0 {
            return Err("count must be at least 1".to_string());
        }
        for (idx, item) in self.items.iter().enumerate() {
            item.check(idx)?;
        }
        Ok(())
    }
}
