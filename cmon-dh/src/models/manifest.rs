//! Detector manifest
//!
//! Declarative metadata shipped as `manifest.json` at the root of every
//! detector package.

use crate::error::{DetectorError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Entry point used when the manifest does not name one
pub const DEFAULT_ENTRY_POINT: &str = "detector.py";

/// Semantic version `X.Y.Z`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectorVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl DetectorVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for DetectorVersion {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(DetectorError::Configuration(format!(
                "Invalid version '{}': expected X.Y.Z",
                s
            )));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(DetectorError::Configuration(format!(
                    "Invalid version '{}': components must be non-negative integers",
                    s
                )));
            }
            *slot = part.parse().map_err(|_| {
                DetectorError::Configuration(format!("Invalid version '{}': component too large", s))
            })?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for DetectorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for DetectorVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DetectorVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Container settings requested by the manifest
///
/// Resource limits are optional and unset by default: detectors run heavy
/// CV/ML workloads and are only constrained when they ask to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default)]
    pub gpu_enabled: bool,
    /// Memory limit in engine notation (`512m`, `4g`)
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// CPU quota in cores (`1.5`)
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub pids_limit: Option<u32>,
    /// Capabilities re-added after dropping all (opt-in)
    #[serde(default)]
    pub extra_capabilities: Vec<String>,
}

fn default_base_image() -> String {
    "python:3.11-slim".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            gpu_enabled: false,
            memory_limit: None,
            cpu_limit: None,
            pids_limit: None,
            extra_capabilities: Vec::new(),
        }
    }
}

/// Type of a detector configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }
}

/// Validation rule for one configuration field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Allowed values for string fields
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Configuration schema: field name -> validation rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ConfigSchema {
    /// Validate a detector configuration and fill in defaults
    ///
    /// Unknown keys are rejected so typos surface at enable time instead of
    /// being silently ignored inside the container.
    pub fn resolve(&self, config: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut problems = Vec::new();

        for key in config.keys() {
            if !self.fields.contains_key(key) {
                problems.push(format!("unknown field '{}'", key));
            }
        }

        let mut resolved = Map::new();
        for (name, spec) in &self.fields {
            let value = match config.get(name).or(spec.default.as_ref()) {
                Some(value) => value,
                None => {
                    if spec.required {
                        problems.push(format!("missing required field '{}'", name));
                    }
                    continue;
                }
            };

            if let Err(problem) = check_field(name, spec, value) {
                problems.push(problem);
                continue;
            }
            resolved.insert(name.clone(), value.clone());
        }

        if problems.is_empty() {
            Ok(resolved)
        } else {
            Err(DetectorError::Validation(format!(
                "Invalid detector configuration: {}",
                problems.join("; ")
            )))
        }
    }
}

fn check_field(name: &str, spec: &FieldSpec, value: &Value) -> std::result::Result<(), String> {
    let type_ok = match spec.field_type {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
    };
    if !type_ok {
        return Err(format!(
            "field '{}' must be of type {}",
            name,
            spec.field_type.as_str()
        ));
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = spec.min {
            if number < min {
                return Err(format!("field '{}' must be >= {}", name, min));
            }
        }
        if let Some(max) = spec.max {
            if number > max {
                return Err(format!("field '{}' must be <= {}", name, max));
            }
        }
    }

    if let (Some(choices), Some(text)) = (&spec.choices, value.as_str()) {
        if !choices.iter().any(|c| c == text) {
            return Err(format!(
                "field '{}' must be one of [{}]",
                name,
                choices.join(", ")
            ));
        }
    }

    Ok(())
}

/// Detector manifest (`manifest.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorManifest {
    pub name: String,
    pub version: DetectorVersion,
    pub description: String,
    pub author: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Source file the container runs
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub schema: ConfigSchema,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

impl DetectorManifest {
    /// Parse and validate manifest JSON
    ///
    /// Required fields (name, version, description, author) must be present
    /// and non-empty, the name restricted to ASCII alphanumerics, `_` and `-`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DetectorError::Configuration(format!("manifest.json is not valid JSON: {}", e)))?;

        let missing: Vec<&str> = ["name", "version", "description", "author"]
            .into_iter()
            .filter(|field| {
                value
                    .get(*field)
                    .and_then(Value::as_str)
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect();
        if !missing.is_empty() {
            return Err(DetectorError::Configuration(format!(
                "manifest.json missing required fields: {}",
                missing.join(", ")
            )));
        }

        let manifest: DetectorManifest = serde_json::from_value(value)
            .map_err(|e| DetectorError::Configuration(format!("Invalid manifest.json: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks beyond what serde enforces
    pub fn validate(&self) -> Result<()> {
        validate_detector_name(&self.name)?;

        let entry = std::path::Path::new(&self.entry_point);
        if self.entry_point.trim().is_empty()
            || entry.is_absolute()
            || entry.components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(DetectorError::Configuration(format!(
                "Invalid entry_point '{}': must be a relative path inside the package",
                self.entry_point
            )));
        }

        if let Some(cpus) = self.docker.cpu_limit {
            if !(cpus.is_finite() && cpus > 0.0) {
                return Err(DetectorError::Configuration(format!(
                    "Invalid docker.cpu_limit {}: must be a positive number of cores",
                    cpus
                )));
            }
        }
        if self.docker.pids_limit == Some(0) {
            return Err(DetectorError::Configuration(
                "Invalid docker.pids_limit 0: must be positive".to_string(),
            ));
        }
        if let Some(memory) = &self.docker.memory_limit {
            if !is_memory_quantity(memory) {
                return Err(DetectorError::Configuration(format!(
                    "Invalid docker.memory_limit '{}': expected e.g. 512m or 4g",
                    memory
                )));
            }
        }
        Ok(())
    }

    /// Image reference for this manifest under `prefix`
    pub fn image_ref(&self, prefix: &str) -> String {
        format!("{}/{}:{}", prefix, self.name.to_ascii_lowercase(), self.version)
    }
}

/// Detector names: ASCII alphanumerics plus `_` and `-`, 1..=64 characters
pub fn validate_detector_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DetectorError::Configuration(format!(
            "Invalid detector name '{}': only letters, digits, '_' and '-' are allowed",
            name
        )))
    }
}

fn is_memory_quantity(raw: &str) -> bool {
    let raw = raw.trim().to_ascii_lowercase();
    let digits = raw.trim_end_matches(['b', 'k', 'm', 'g']);
    let suffix_len = raw.len() - digits.len();
    !digits.is_empty() && suffix_len <= 1 && digits.chars().all(|c| c.is_ascii_digit())
}
