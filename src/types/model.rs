use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A Gemini model identifier.
///
/// This can be a predefined model or a custom string for models that are newer than this crate
/// or only available to some projects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Model {
    /// Known model versions
    Known(KnownModel),

    /// Custom model identifier
    Custom(String),
}

/// Known Gemini models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownModel {
    /// Gemini 2.5 Flash
    #[serde(rename = "gemini-2.5-flash")]
    Gemini25Flash,

    /// Gemini 2.5 Flash-Lite
    #[serde(rename = "gemini-2.5-flash-lite")]
    Gemini25FlashLite,

    /// Gemini 2.5 Pro
    #[serde(rename = "gemini-2.5-pro")]
    Gemini25Pro,

    /// Gemini 2.0 Flash
    #[serde(rename = "gemini-2.0-flash")]
    Gemini20Flash,
}

impl KnownModel {
    /// The identifier used in request paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownModel::Gemini25Flash => "gemini-2.5-flash",
            KnownModel::Gemini25FlashLite => "gemini-2.5-flash-lite",
            KnownModel::Gemini25Pro => "gemini-2.5-pro",
            KnownModel::Gemini20Flash => "gemini-2.0-flash",
        }
    }

    /// All known models.
    pub fn all() -> [KnownModel; 4] {
        [
            KnownModel::Gemini25Flash,
            KnownModel::Gemini25FlashLite,
            KnownModel::Gemini25Pro,
            KnownModel::Gemini20Flash,
        ]
    }
}

impl Model {
    /// The identifier used in request paths.
    pub fn as_str(&self) -> &str {
        match self {
            Model::Known(known) => known.as_str(),
            Model::Custom(custom) => custom,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for KnownModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnownModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("models/").unwrap_or(s);
        KnownModel::all()
            .into_iter()
            .find(|known| known.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown model: {s}"), Some("model".into())))
    }
}

impl From<KnownModel> for Model {
    fn from(model: KnownModel) -> Self {
        Model::Known(model)
    }
}

impl From<String> for Model {
    fn from(model: String) -> Self {
        match model.parse::<KnownModel>() {
            Ok(known) => Model::Known(known),
            Err(_) => Model::Custom(model),
        }
    }
}

impl From<&str> for Model {
    fn from(model: &str) -> Self {
        Model::from(model.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_serialization() {
        let model = Model::Known(KnownModel::Gemini25Flash);
        let json = serde_json::to_string(&model).unwrap();
        assert_eq!(json, r#""gemini-2.5-flash""#);
    }

    #[test]
    fn model_deserialization() {
        let model: Model = serde_json::from_str(r#""gemini-2.5-pro""#).unwrap();
        assert_eq!(model, Model::Known(KnownModel::Gemini25Pro));

        let model: Model = serde_json::from_str(r#""gemini-exp-1206""#).unwrap();
        assert_eq!(model, Model::Custom("gemini-exp-1206".to_string()));
    }

    #[test]
    fn from_str_recognizes_known_models() {
        assert_eq!(
            Model::from("gemini-2.5-flash"),
            Model::Known(KnownModel::Gemini25Flash)
        );
        assert_eq!(
            Model::from("models/gemini-2.0-flash"),
            Model::Known(KnownModel::Gemini20Flash)
        );
        assert_eq!(
            Model::from("tuned-model-7"),
            Model::Custom("tuned-model-7".to_string())
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            Model::Known(KnownModel::Gemini25FlashLite).to_string(),
            "gemini-2.5-flash-lite"
        );
        assert_eq!(Model::Custom("custom".to_string()).to_string(), "custom");
    }
}
