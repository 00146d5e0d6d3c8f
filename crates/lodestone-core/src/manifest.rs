//! Configurable manifest model.
//!
//! A manifest is an ordered map of sections, each holding an ordered map of
//! typed settings. Backends describe their settings with a
//! [`ConfigurableManifest`]; the same shape with every value cleared is the
//! [`SetupManifest`] a caller fills in before an instance exists.
//!
//! Updates are validated in a fixed order: section, setting, mutability,
//! then the value against its declared [`ConfigurableValueType`].

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A typed setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ConfigurableValue {
    String(String),
    Integer(i32),
    UnsignedInteger(u32),
    Float(f32),
    Boolean(bool),
    Enum(String),
}

impl ConfigurableValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigurableValue::String(_) => "String",
            ConfigurableValue::Integer(_) => "Integer",
            ConfigurableValue::UnsignedInteger(_) => "UnsignedInteger",
            ConfigurableValue::Float(_) => "Float",
            ConfigurableValue::Boolean(_) => "Boolean",
            ConfigurableValue::Enum(_) => "Enum",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigurableValue::String(s) | ConfigurableValue::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigurableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ConfigurableValue::UnsignedInteger(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigurableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurableValue::String(s) | ConfigurableValue::Enum(s) => f.write_str(s),
            ConfigurableValue::Integer(n) => write!(f, "{n}"),
            ConfigurableValue::UnsignedInteger(n) => write!(f, "{n}"),
            ConfigurableValue::Float(n) => write!(f, "{n}"),
            ConfigurableValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// The declared type of a setting, with its constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConfigurableValueType {
    String { regex: Option<String> },
    Integer { min: Option<i32>, max: Option<i32> },
    UnsignedInteger { min: Option<u32>, max: Option<u32> },
    Float { min: Option<f32>, max: Option<f32> },
    Boolean,
    Enum { options: Vec<String> },
}

impl ConfigurableValueType {
    /// Check `value` against this type. Mismatches are `InvalidInput`.
    pub fn validate(&self, value: &ConfigurableValue) -> Result<()> {
        match (self, value) {
            (ConfigurableValueType::String { regex }, ConfigurableValue::String(s)) => {
                if let Some(pattern) = regex {
                    let re = Regex::new(pattern).map_err(|e| {
                        Error::handler_fault(format!("manifest declares an invalid regex: {e}"))
                    })?;
                    if !re.is_match(s) {
                        return Err(Error::invalid_input(format!(
                            "value {s:?} does not match pattern {pattern:?}"
                        )));
                    }
                }
                Ok(())
            }
            (ConfigurableValueType::Integer { min, max }, ConfigurableValue::Integer(n)) => {
                check_range(*n, *min, *max)
            }
            (
                ConfigurableValueType::UnsignedInteger { min, max },
                ConfigurableValue::UnsignedInteger(n),
            ) => check_range(*n, *min, *max),
            (ConfigurableValueType::Float { min, max }, ConfigurableValue::Float(n)) => {
                if !n.is_finite() {
                    return Err(Error::invalid_input("float value must be finite"));
                }
                check_range(*n, *min, *max)
            }
            (ConfigurableValueType::Boolean, ConfigurableValue::Boolean(_)) => Ok(()),
            (ConfigurableValueType::Enum { options }, ConfigurableValue::Enum(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(Error::invalid_input(format!(
                        "{s:?} is not one of {options:?}"
                    )))
                }
            }
            (expected, got) => Err(Error::invalid_input(format!(
                "expected a {} value, got {}",
                expected.type_name(),
                got.type_name()
            ))),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ConfigurableValueType::String { .. } => "String",
            ConfigurableValueType::Integer { .. } => "Integer",
            ConfigurableValueType::UnsignedInteger { .. } => "UnsignedInteger",
            ConfigurableValueType::Float { .. } => "Float",
            ConfigurableValueType::Boolean => "Boolean",
            ConfigurableValueType::Enum { .. } => "Enum",
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    n: T,
    min: Option<T>,
    max: Option<T>,
) -> Result<()> {
    if let Some(min) = min {
        if n < min {
            return Err(Error::invalid_input(format!("{n} is below the minimum {min}")));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(Error::invalid_input(format!("{n} is above the maximum {max}")));
        }
    }
    Ok(())
}

// ── Settings ──────────────────────────────────────────────────────

/// One typed setting.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingManifest {
    pub setting_id: String,
    pub name: String,
    pub description: String,
    pub value: Option<ConfigurableValue>,
    pub value_type: ConfigurableValueType,
    pub default_value: Option<ConfigurableValue>,
    pub is_secret: bool,
    pub is_required: bool,
    pub is_mutable: bool,
}

impl SettingManifest {
    /// A mutable, optional, non-secret setting with no value.
    pub fn new(
        setting_id: &str,
        name: &str,
        description: &str,
        value_type: ConfigurableValueType,
    ) -> Self {
        Self {
            setting_id: setting_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            value: None,
            value_type,
            default_value: None,
            is_secret: false,
            is_required: false,
            is_mutable: true,
        }
    }

    pub fn with_value(self, value: ConfigurableValue) -> Self {
        Self {
            value: Some(value),
            ..self
        }
    }

    pub fn with_default(self, default_value: ConfigurableValue) -> Self {
        Self {
            default_value: Some(default_value),
            ..self
        }
    }

    pub fn secret(self) -> Self {
        Self {
            is_secret: true,
            ..self
        }
    }

    pub fn required(self) -> Self {
        Self {
            is_required: true,
            ..self
        }
    }

    pub fn immutable(self) -> Self {
        Self {
            is_mutable: false,
            ..self
        }
    }

    /// Current value, falling back to the default.
    pub fn effective_value(&self) -> Option<&ConfigurableValue> {
        self.value.as_ref().or(self.default_value.as_ref())
    }

    /// Copy with secret values removed, for anything leaving the host.
    pub fn redacted(&self) -> Self {
        if !self.is_secret {
            return self.clone();
        }
        Self {
            value: None,
            default_value: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for SettingManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = self.redacted();
        f.debug_struct("SettingManifest")
            .field("setting_id", &self.setting_id)
            .field("name", &self.name)
            .field("value", &redacted.value)
            .field("value_type", &self.value_type)
            .field("default_value", &redacted.default_value)
            .field("is_secret", &self.is_secret)
            .field("is_required", &self.is_required)
            .field("is_mutable", &self.is_mutable)
            .finish()
    }
}

/// A named group of settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionManifest {
    pub section_id: String,
    pub name: String,
    pub description: String,
    pub settings: IndexMap<String, SettingManifest>,
}

impl SectionManifest {
    pub fn new(section_id: &str, name: &str, description: &str) -> Self {
        Self {
            section_id: section_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            settings: IndexMap::new(),
        }
    }

    pub fn with_setting(mut self, setting: SettingManifest) -> Self {
        self.settings.insert(setting.setting_id.clone(), setting);
        self
    }
}

// ── Manifests ─────────────────────────────────────────────────────

/// The live settings of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurableManifest {
    pub setting_sections: IndexMap<String, SectionManifest>,
}

impl ConfigurableManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, section: SectionManifest) -> Self {
        self.setting_sections
            .insert(section.section_id.clone(), section);
        self
    }

    pub fn setting(&self, section_id: &str, setting_id: &str) -> Result<&SettingManifest> {
        let section = self
            .setting_sections
            .get(section_id)
            .ok_or_else(|| Error::not_found(format!("section {section_id:?} not found")))?;
        section.settings.get(setting_id).ok_or_else(|| {
            Error::not_found(format!(
                "setting {setting_id:?} not found in section {section_id:?}"
            ))
        })
    }

    /// Effective value of a setting, if the setting exists and has one.
    pub fn value(&self, section_id: &str, setting_id: &str) -> Option<&ConfigurableValue> {
        self.setting(section_id, setting_id)
            .ok()
            .and_then(|s| s.effective_value())
    }

    /// Run every update check without applying anything.
    pub fn validate_update(
        &self,
        section_id: &str,
        setting_id: &str,
        new_value: &ConfigurableValue,
    ) -> Result<()> {
        let setting = self.setting(section_id, setting_id)?;
        if !setting.is_mutable {
            return Err(Error::permission_denied(format!(
                "setting {section_id}.{setting_id} is immutable"
            )));
        }
        setting.value_type.validate(new_value)
    }

    /// Validate and replace the current value of one setting.
    pub fn update(
        &mut self,
        section_id: &str,
        setting_id: &str,
        new_value: ConfigurableValue,
    ) -> Result<()> {
        self.validate_update(section_id, setting_id, &new_value)?;
        if let Some(setting) = self
            .setting_sections
            .get_mut(section_id)
            .and_then(|s| s.settings.get_mut(setting_id))
        {
            setting.value = Some(new_value);
        }
        Ok(())
    }

    /// Copy with every secret value removed.
    pub fn redacted(&self) -> Self {
        let setting_sections = self
            .setting_sections
            .iter()
            .map(|(id, section)| {
                let settings = section
                    .settings
                    .iter()
                    .map(|(sid, s)| (sid.clone(), s.redacted()))
                    .collect();
                (
                    id.clone(),
                    SectionManifest {
                        settings,
                        ..section.clone()
                    },
                )
            })
            .collect();
        Self { setting_sections }
    }

    /// The same settings with every current value cleared.
    pub fn to_setup_manifest(&self) -> SetupManifest {
        let mut setting_sections = self.setting_sections.clone();
        for section in setting_sections.values_mut() {
            for setting in section.settings.values_mut() {
                setting.value = None;
            }
        }
        SetupManifest { setting_sections }
    }
}

/// Caller-provided values for creating an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupValue {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub port: u32,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub restart_on_crash: bool,
    /// section id → setting id → value.
    #[serde(default)]
    pub setting_sections: IndexMap<String, IndexMap<String, ConfigurableValue>>,
}

/// Settings a backend needs before an instance exists. All values are empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupManifest {
    pub setting_sections: IndexMap<String, SectionManifest>,
}

impl SetupManifest {
    /// Check a setup value: known settings only, types match, required present.
    pub fn validate(&self, setup: &SetupValue) -> Result<()> {
        if setup.name.trim().is_empty() {
            return Err(Error::invalid_input("instance name must not be empty"));
        }
        if setup.port == 0 || setup.port > u16::MAX as u32 {
            return Err(Error::invalid_input(format!(
                "port {} is outside 1..=65535",
                setup.port
            )));
        }

        for (section_id, values) in &setup.setting_sections {
            let section = self.setting_sections.get(section_id).ok_or_else(|| {
                Error::invalid_input(format!("unknown setup section {section_id:?}"))
            })?;
            for (setting_id, value) in values {
                let setting = section.settings.get(setting_id).ok_or_else(|| {
                    Error::invalid_input(format!(
                        "unknown setup setting {section_id}.{setting_id}"
                    ))
                })?;
                setting.value_type.validate(value).map_err(|e| {
                    Error::invalid_input(format!("{section_id}.{setting_id}: {}", e.message))
                })?;
            }
        }

        for section in self.setting_sections.values() {
            for setting in section.settings.values() {
                if !setting.is_required || setting.default_value.is_some() {
                    continue;
                }
                let provided = setup
                    .setting_sections
                    .get(&section.section_id)
                    .is_some_and(|v| v.contains_key(&setting.setting_id));
                if !provided {
                    return Err(Error::invalid_input(format!(
                        "required setting {}.{} is missing",
                        section.section_id, setting.setting_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate `setup` and produce the initial live manifest.
    pub fn apply(&self, setup: &SetupValue) -> Result<ConfigurableManifest> {
        self.validate(setup)?;
        let mut setting_sections = self.setting_sections.clone();
        for (section_id, section) in setting_sections.iter_mut() {
            for (setting_id, setting) in section.settings.iter_mut() {
                setting.value = setup
                    .setting_sections
                    .get(section_id)
                    .and_then(|v| v.get(setting_id))
                    .cloned()
                    .or_else(|| setting.default_value.clone());
            }
        }
        Ok(ConfigurableManifest { setting_sections })
    }
}
