//! Represents a single uploaded build of a mobile application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Longest identifier accepted for `bundle_id` / `upload_id`.
const MAX_IDENTIFIER_LEN: usize = 255;

/// Mobile platform a build targets.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// Filename used for the stored binary.
    pub fn binary_file_name(self) -> &'static str {
        match self {
            Platform::Android => "app.apk",
            Platform::Ios => "app.ipa",
        }
    }

    /// MIME type served on download.
    pub fn content_type(self) -> &'static str {
        match self {
            Platform::Android => "application/vnd.android.package-archive",
            Platform::Ios => "application/octet-stream",
        }
    }

    /// Infer the platform from an uploaded file name (`.apk` / `.ipa`).
    /// The extension match ignores ASCII case.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".apk") {
            Some(Platform::Android)
        } else if lower.ends_with(".ipa") {
            Some(Platform::Ios)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("unknown platform `{other}`")),
        }
    }
}

/// Metadata for one uploaded build.
///
/// A record is written once by `save_upload` and never mutated afterwards.
/// Ordering between builds of the same app is by `created_at` only;
/// `version` and `build_number` are free-form strings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BuildRecord {
    /// Unique identifier of this upload. Keys the stored binary.
    pub upload_id: String,

    /// Application identity (e.g. `com.example.app`).
    pub bundle_id: String,

    pub version: String,

    pub build_number: String,

    /// Display name of the application.
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Size of the binary in bytes, measured at upload time.
    pub file_size: i64,

    /// Upload timestamp; the only ordering key.
    pub created_at: DateTime<Utc>,

    pub platform: Platform,
}

impl BuildRecord {
    /// Check that the record can be persisted.
    ///
    /// Identifiers become path components on disk, so they must be a single
    /// safe segment. Names starting with `.` or `_` are reserved for temp
    /// files and the index directory.
    pub fn validate(&self) -> Result<(), String> {
        validate_identifier("bundle_id", &self.bundle_id)?;
        validate_identifier("upload_id", &self.upload_id)?;
        for (field, value) in [
            ("version", &self.version),
            ("build_number", &self.build_number),
            ("title", &self.title),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        if self.file_size < 0 {
            return Err(format!("file_size must not be negative ({})", self.file_size));
        }
        Ok(())
    }

    /// Newest-first comparison with a deterministic tie-break on `upload_id`.
    pub fn newest_first(a: &BuildRecord, b: &BuildRecord) -> std::cmp::Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.upload_id.cmp(&a.upload_id))
    }
}

/// Validate a value that will be used as a single filesystem path segment.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(format!(
            "{field} must be at most {MAX_IDENTIFIER_LEN} bytes"
        ));
    }
    if value.starts_with('.') || value.starts_with('_') {
        return Err(format!("{field} must not start with `.` or `_`"));
    }
    if value
        .chars()
        .any(|c| c.is_control() || c == '/' || c == '\\')
    {
        return Err(format!("{field} contains an illegal character"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> BuildRecord {
        BuildRecord {
            upload_id: "u1".into(),
            bundle_id: "com.example.app".into(),
            version: "1.0.0".into(),
            build_number: "42".into(),
            title: "Example".into(),
            icon: None,
            description: Some("first build".into()),
            file_size: 10,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            platform: Platform::Android,
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(record().validate().is_ok());
    }

    #[test]
    fn test_rejects_path_like_identifiers() {
        for bad in ["", "..", ".hidden", "_indexes", "a/b", "a\\b", "a\0b"] {
            let mut r = record();
            r.bundle_id = bad.to_string();
            assert!(r.validate().is_err(), "bundle_id {bad:?} should be rejected");
        }
        let mut r = record();
        r.upload_id = "x".repeat(256);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_version_and_negative_size() {
        let mut r = record();
        r.build_number = "  ".into();
        assert!(r.validate().is_err());

        let mut r = record();
        r.file_size = -1;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["platform"], "android");
        assert_eq!(json["bundle_id"], "com.example.app");
        assert!(json.get("icon").is_none());
        assert_eq!(json["description"], "first build");
    }

    #[test]
    fn test_platform_from_file_name() {
        assert_eq!(Platform::from_file_name("App.APK"), Some(Platform::Android));
        assert_eq!(Platform::from_file_name("build.ipa"), Some(Platform::Ios));
        assert_eq!(Platform::from_file_name("notes.zip"), None);
        assert_eq!(Platform::from_file_name("app.apk.zip"), None);
        assert_eq!(Platform::Ios.binary_file_name(), "app.ipa");
    }

    #[test]
    fn test_newest_first_breaks_ties_by_upload_id() {
        let a = record();
        let mut b = record();
        b.upload_id = "u2".into();
        let mut list = vec![a.clone(), b.clone()];
        list.sort_by(BuildRecord::newest_first);
        assert_eq!(list[0].upload_id, "u2");

        let mut c = record();
        c.upload_id = "u0".into();
        c.created_at += chrono::Duration::seconds(1);
        list.push(c);
        list.sort_by(BuildRecord::newest_first);
        assert_eq!(list[0].upload_id, "u0");
    }
}
