use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{RefineError, Result};

/// A configured option value
///
/// Values are untagged so they read naturally from TOML and JSON: `true`, `12`, `0.5` or
/// `"central"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::Bool(value) => write!(f, "{}", value),
            OptionValue::Int(value) => write!(f, "{}", value),
            OptionValue::Float(value) => write!(f, "{}", value),
            OptionValue::Text(value) => write!(f, "{}", value),
        }
    }
}

/// The type, admissible values and default of an option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionKind {
    /// An integer within `[min, max]`
    Int { min: i64, max: i64, default: i64 },
    /// A float within `[min, max]`
    Float { min: f64, max: f64, default: f64 },
    /// A boolean switch
    Flag { default: bool },
    /// One of a fixed set of names
    Choice {
        choices: &'static [&'static str],
        default: &'static str,
    },
}

/// Declaration of a single configurable option of a refinement method
///
/// Options are declared once per method as `static` tables and describe themselves to the host
/// (label, description, admissible values). A method instance receives a validated
/// [MethodOptions] built from these declarations and the persisted overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineMethodOption {
    /// Key used in configuration files
    pub name: &'static str,
    /// Short label for display
    pub label: &'static str,
    pub description: &'static str,
    pub kind: OptionKind,
}

impl RefineMethodOption {
    pub fn default_value(&self) -> OptionValue {
        match self.kind {
            OptionKind::Int { default, .. } => OptionValue::Int(default),
            OptionKind::Float { default, .. } => OptionValue::Float(default),
            OptionKind::Flag { default } => OptionValue::Bool(default),
            OptionKind::Choice { default, .. } => OptionValue::Text(default.to_string()),
        }
    }

    /// Validate `value` against this declaration
    ///
    /// Numbers are clamped into range and coerced between integer and float where that is
    /// lossless enough to be unsurprising; anything else is rejected.
    pub fn validate(&self, value: &OptionValue) -> Result<OptionValue> {
        let invalid = |reason: String| RefineError::InvalidOption {
            name: self.name.to_string(),
            reason,
        };
        match (self.kind, value) {
            (OptionKind::Int { min, max, .. }, OptionValue::Int(v)) => {
                Ok(OptionValue::Int(self.clamped(*v, min, max)))
            }
            (OptionKind::Int { min, max, .. }, OptionValue::Float(v)) if v.fract() == 0.0 => {
                Ok(OptionValue::Int(self.clamped(*v as i64, min, max)))
            }
            (OptionKind::Float { min, max, .. }, OptionValue::Float(v)) if v.is_finite() => {
                Ok(OptionValue::Float(self.clamped(*v, min, max)))
            }
            (OptionKind::Float { min, max, .. }, OptionValue::Int(v)) => {
                Ok(OptionValue::Float(self.clamped(*v as f64, min, max)))
            }
            (OptionKind::Flag { .. }, OptionValue::Bool(v)) => Ok(OptionValue::Bool(*v)),
            (OptionKind::Choice { choices, .. }, OptionValue::Text(v)) => {
                match choices.iter().find(|c| c.eq_ignore_ascii_case(v)) {
                    Some(choice) => Ok(OptionValue::Text(choice.to_string())),
                    None => Err(invalid(format!(
                        "'{}' is not one of {:?}",
                        v, choices
                    ))),
                }
            }
            (kind, value) => Err(invalid(format!(
                "value {} does not match {:?}",
                value, kind
            ))),
        }
    }

    fn clamped<T: PartialOrd + Copy + std::fmt::Display>(&self, value: T, min: T, max: T) -> T {
        let clamped = if value < min {
            min
        } else if value > max {
            max
        } else {
            value
        };
        if value < min || value > max {
            tracing::warn!(
                "Option '{}' = {} is out of range [{}, {}], using {}",
                self.name,
                value,
                min,
                max,
                clamped
            );
        }
        clamped
    }
}

/// Validated option values of one method instance
///
/// Built once when the method is constructed and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MethodOptions {
    values: BTreeMap<String, OptionValue>,
}

impl MethodOptions {
    /// Start from the declared defaults and apply `overrides`
    ///
    /// Keys that are not declared in `declared` are ignored, so configurations saved by other
    /// versions of a method still load.
    pub fn new(
        declared: &[RefineMethodOption],
        overrides: &HashMap<String, OptionValue>,
    ) -> Result<Self> {
        let mut values = BTreeMap::new();
        for option in declared {
            let value = match overrides.get(option.name) {
                Some(value) => option.validate(value)?,
                None => option.default_value(),
            };
            values.insert(option.name.to_string(), value);
        }
        for key in overrides.keys() {
            if !declared.iter().any(|option| option.name == key) {
                tracing::warn!("Ignoring unknown option '{}'", key);
            }
        }
        Ok(MethodOptions { values })
    }

    /// Only the declared defaults
    pub fn defaults(declared: &[RefineMethodOption]) -> Self {
        MethodOptions {
            values: declared
                .iter()
                .map(|option| (option.name.to_string(), option.default_value()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.values.iter()
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.values.get(name) {
            Some(OptionValue::Int(value)) => Ok(*value),
            other => Err(self.missing(name, "an integer", other)),
        }
    }

    /// An integer option that is declared with a non-negative range
    pub fn count(&self, name: &str) -> Result<usize> {
        let value = self.int(name)?;
        usize::try_from(value).map_err(|_| RefineError::InvalidOption {
            name: name.to_string(),
            reason: format!("{} is negative", value),
        })
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        match self.values.get(name) {
            Some(OptionValue::Float(value)) => Ok(*value),
            other => Err(self.missing(name, "a float", other)),
        }
    }

    pub fn flag(&self, name: &str) -> Result<bool> {
        match self.values.get(name) {
            Some(OptionValue::Bool(value)) => Ok(*value),
            other => Err(self.missing(name, "a flag", other)),
        }
    }

    pub fn choice(&self, name: &str) -> Result<&str> {
        match self.values.get(name) {
            Some(OptionValue::Text(value)) => Ok(value.as_str()),
            other => Err(self.missing(name, "a choice", other)),
        }
    }

    fn missing(&self, name: &str, expected: &str, found: Option<&OptionValue>) -> RefineError {
        RefineError::InvalidOption {
            name: name.to_string(),
            reason: match found {
                Some(value) => format!("expected {}, found {}", expected, value),
                None => "option is not declared".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static OPTIONS: &[RefineMethodOption] = &[
        RefineMethodOption {
            name: "ngen",
            label: "Generations",
            description: "Maximum number of generations",
            kind: OptionKind::Int {
                min: 1,
                max: 1000,
                default: 100,
            },
        },
        RefineMethodOption {
            name: "tol",
            label: "Tolerance",
            description: "Stagnation tolerance",
            kind: OptionKind::Float {
                min: 0.0,
                max: 1.0,
                default: 0.01,
            },
        },
        RefineMethodOption {
            name: "scheme",
            label: "Scheme",
            description: "Finite difference scheme",
            kind: OptionKind::Choice {
                choices: &["forward", "central"],
                default: "forward",
            },
        },
    ];

    #[test]
    fn test_defaults() {
        let options = MethodOptions::new(OPTIONS, &HashMap::new()).unwrap();
        assert_eq!(options.count("ngen").unwrap(), 100);
        assert_eq!(options.float("tol").unwrap(), 0.01);
        assert_eq!(options.choice("scheme").unwrap(), "forward");
        assert_eq!(options, MethodOptions::defaults(OPTIONS));
    }

    #[test]
    fn test_overrides_are_clamped_and_coerced() {
        let overrides = HashMap::from([
            ("ngen".to_string(), OptionValue::Int(5000)),
            ("tol".to_string(), OptionValue::Int(0)),
            ("scheme".to_string(), OptionValue::Text("Central".to_string())),
        ]);
        let options = MethodOptions::new(OPTIONS, &overrides).unwrap();
        assert_eq!(options.count("ngen").unwrap(), 1000);
        assert_eq!(options.float("tol").unwrap(), 0.0);
        assert_eq!(options.choice("scheme").unwrap(), "central");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let overrides = HashMap::from([("removed_option".to_string(), OptionValue::Bool(true))]);
        let options = MethodOptions::new(OPTIONS, &overrides).unwrap();
        assert!(options.get("removed_option").is_none());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let overrides = HashMap::from([("ngen".to_string(), OptionValue::Bool(true))]);
        assert!(matches!(
            MethodOptions::new(OPTIONS, &overrides),
            Err(RefineError::InvalidOption { .. })
        ));

        let overrides = HashMap::from([("scheme".to_string(), OptionValue::Text("backward".into()))]);
        assert!(MethodOptions::new(OPTIONS, &overrides).is_err());
    }

    #[test]
    fn test_getter_type_mismatch() {
        let options = MethodOptions::defaults(OPTIONS);
        assert!(options.float("ngen").is_err());
        assert!(options.int("missing").is_err());
    }

    #[test]
    fn test_values_deserialize_untagged() {
        let values: HashMap<String, OptionValue> =
            serde_json::from_str(r#"{"a": true, "b": 3, "c": 0.5, "d": "central"}"#).unwrap();
        assert_eq!(values["a"], OptionValue::Bool(true));
        assert_eq!(values["b"], OptionValue::Int(3));
        assert_eq!(values["c"], OptionValue::Float(0.5));
        assert_eq!(values["d"], OptionValue::Text("central".into()));
    }
}
