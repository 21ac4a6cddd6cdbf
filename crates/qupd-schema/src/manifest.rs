//! Release manifest parsing and validation.
//!
//! The release pipeline publishes a flat YAML document next to the update
//! asset:
//!
//! ```text
//! version: 1.4.0
//! asset_name: update.qupd
//! asset_size: 48213
//! asset_sha256: 3f1c...
//! required_main_hash: 9ab0...   # optional
//! created_at: 2025-01-01T00:00:00.000Z
//! ```
//!
//! Every field is checked before anything is downloaded. Any deviation is a
//! hard failure naming the offending field.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use semver::Version;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::hash::Sha256Digest;

/// Errors produced while validating a manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The document is not parseable YAML.
    #[error("manifest is not valid YAML: {0}")]
    Syntax(String),

    /// The document parsed, but is not a key/value mapping.
    #[error("manifest must be a mapping of fields")]
    NotAMapping,

    /// A required field is absent or empty.
    #[error("manifest field `{0}` is missing")]
    Missing(&'static str),

    /// A field is present but fails validation.
    #[error("manifest field `{field}` is invalid: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ManifestError {
    /// The field this error refers to, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Missing(field) | Self::InvalidField { field, .. } => Some(*field),
            Self::Syntax(_) | Self::NotAMapping => None,
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// A validated release manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseManifest {
    /// Version string as published. Always semver-coercible.
    pub version: String,
    /// File name of the update asset.
    pub asset_name: String,
    /// Exact size of the asset in bytes.
    pub asset_size: u64,
    /// SHA-256 of the asset bytes.
    pub asset_sha256: Sha256Digest,
    /// Main-process hash the host must match, if any.
    pub required_main_hash: Option<Sha256Digest>,
    /// When the release was built.
    pub created_at: DateTime<Utc>,
}

impl ReleaseManifest {
    /// Parse raw manifest text and validate every field.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] naming the first field that fails.
    pub fn parse_and_validate(raw: &str) -> Result<Self, ManifestError> {
        let doc: Value =
            serde_yaml::from_str(raw).map_err(|e| ManifestError::Syntax(e.to_string()))?;
        let Value::Mapping(map) = doc else {
            return Err(ManifestError::NotAMapping);
        };

        let version = required(&map, "version")?;
        if coerce_version(&version).is_none() {
            return Err(ManifestError::invalid(
                "version",
                format!("'{version}' is not a semantic version"),
            ));
        }

        let asset_name = required(&map, "asset_name")?;
        validate_file_name(&asset_name)?;

        let asset_size = parse_size(&required(&map, "asset_size")?)?;

        let asset_sha256 = parse_digest("asset_sha256", &required(&map, "asset_sha256")?)?;

        let required_main_hash = match scalar(&map, "required_main_hash")? {
            Some(s) => Some(parse_digest("required_main_hash", &s)?),
            None => None,
        };

        let created_at = parse_timestamp(&required(&map, "created_at")?)
            .ok_or_else(|| ManifestError::invalid("created_at", "not a recognisable timestamp"))?;

        Ok(Self {
            version,
            asset_name,
            asset_size,
            asset_sha256,
            required_main_hash,
            created_at,
        })
    }

    /// The manifest version coerced to semver.
    pub fn semver(&self) -> Version {
        // Checked during validation.
        coerce_version(&self.version).unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// `created_at` as ISO-8601 with millisecond precision.
    pub fn created_at_iso(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Render the manifest back to the flat YAML document the pipeline publishes.
    ///
    /// String fields are quoted so that values such as `1.10` or an all-digit
    /// digest are not read back as numbers.
    pub fn render(&self) -> String {
        let mut out = format!(
            "version: {:?}\nasset_name: {:?}\nasset_size: {}\nasset_sha256: \"{}\"\n",
            self.version, self.asset_name, self.asset_size, self.asset_sha256
        );
        if let Some(hash) = &self.required_main_hash {
            out.push_str(&format!("required_main_hash: \"{hash}\"\n"));
        }
        out.push_str(&format!("created_at: {}\n", self.created_at_iso()));
        out
    }
}

/// Loosely coerce a version string to semver.
///
/// Finds the first run of `major[.minor[.patch]]` digits anywhere in the
/// input, so `v1.2`, `release-3` and `1.2.3-beta` coerce to `1.2.0`, `3.0.0`
/// and `1.2.3` respectively. Pre-release and build suffixes are dropped.
pub fn coerce_version(input: &str) -> Option<Version> {
    static COERCE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d{1,16})(?:\.(\d{1,16}))?(?:\.(\d{1,16}))?").unwrap());

    let caps = COERCE.captures(input)?;
    let part = |i: usize| -> Option<u64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

/// Parse a timestamp as RFC 3339, a naive date-time (taken as UTC), or a bare date.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn scalar(map: &Mapping, field: &'static str) -> Result<Option<String>, ManifestError> {
    let text = match map.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => return Err(ManifestError::invalid(field, "expected a scalar value")),
    };
    Ok((!text.is_empty()).then_some(text))
}

fn required(map: &Mapping, field: &'static str) -> Result<String, ManifestError> {
    scalar(map, field)?.ok_or(ManifestError::Missing(field))
}

fn validate_file_name(name: &str) -> Result<(), ManifestError> {
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ManifestError::invalid(
            "asset_name",
            format!("'{name}' is not a plain file name"),
        ));
    }
    Ok(())
}

fn parse_size(raw: &str) -> Result<u64, ManifestError> {
    let size = raw.parse::<u64>().ok().or_else(|| {
        // Accept integral floats like `1024.0`; reject fractions and non-finite values.
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0 && *f >= 0.0 && *f < u64::MAX as f64)
            .map(|f| f as u64)
    });
    match size {
        Some(n) if n > 0 => Ok(n),
        _ => Err(ManifestError::invalid(
            "asset_size",
            format!("'{raw}' is not a positive byte count"),
        )),
    }
}

fn parse_digest(field: &'static str, raw: &str) -> Result<Sha256Digest, ManifestError> {
    Sha256Digest::new(raw).map_err(|e| ManifestError::invalid(field, e.to_string()))
}
