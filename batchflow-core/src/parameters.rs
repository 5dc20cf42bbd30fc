//! Job parameters and their validation.

use crate::error::{BatchError, BatchResult};
use batchflow_context::LinkedMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Typed value of a job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl ParameterValue {
    fn key_fragment(&self) -> String {
        match self {
            ParameterValue::String(v) => format!("string:{v}"),
            ParameterValue::Long(v) => format!("long:{v}"),
            // bit pattern keeps the key stable for NaN and -0.0
            ParameterValue::Double(v) => format!("double:{:016x}", v.to_bits()),
            ParameterValue::Date(v) => format!("date:{}", v.timestamp_millis()),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(v) => write!(f, "{v}"),
            ParameterValue::Long(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Date(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    /// Identifying parameters take part in job instance identity.
    pub identifying: bool,
}

impl JobParameter {
    pub fn new(value: ParameterValue, identifying: bool) -> Self {
        Self { value, identifying }
    }
}

/// Immutable, ordered set of parameters for one job run.
///
/// Two parameter sets are equal when their identifying entries are equal,
/// regardless of insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: LinkedMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::new()
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match &self.parameters.get(key)?.value {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key)?.value {
            ParameterValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key)?.value {
            ParameterValue::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.parameters.get(key)?.value {
            ParameterValue::Date(v) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.parameters.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters.iter()
    }

    /// Parameters that identify the job instance.
    pub fn identifying(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters.iter().filter(|(_, p)| p.identifying)
    }

    /// Canonical string built from the identifying parameters, sorted by key.
    /// Used as the instance key by repositories.
    pub fn identifying_key(&self) -> String {
        let mut entries: Vec<_> = self
            .identifying()
            .map(|(k, p)| format!("{k}={}", p.value.key_fragment()))
            .collect();
        entries.sort();
        entries.join(";")
    }
}

impl PartialEq for JobParameters {
    fn eq(&self, other: &Self) -> bool {
        self.identifying_key() == other.identifying_key()
    }
}

impl Eq for JobParameters {}

impl Hash for JobParameters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifying_key().hash(state);
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, param)) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={}", param.value)?;
        }
        write!(f, "}}")
    }
}

/// Builder for [`JobParameters`].
#[derive(Debug, Default)]
pub struct JobParametersBuilder {
    parameters: LinkedMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters(parameters: &JobParameters) -> Self {
        Self {
            parameters: parameters.parameters.clone(),
        }
    }

    pub fn string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, ParameterValue::String(value.into()), true)
    }

    pub fn long(self, key: impl Into<String>, value: i64) -> Self {
        self.add(key, ParameterValue::Long(value), true)
    }

    pub fn double(self, key: impl Into<String>, value: f64) -> Self {
        self.add(key, ParameterValue::Double(value), true)
    }

    pub fn date(self, key: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.add(key, ParameterValue::Date(value), true)
    }

    pub fn add(
        mut self,
        key: impl Into<String>,
        value: ParameterValue,
        identifying: bool,
    ) -> Self {
        self.parameters
            .insert(key.into(), JobParameter::new(value, identifying));
        self
    }

    /// Adds a parameter that does not take part in instance identity.
    pub fn non_identifying(self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.add(key, value, false)
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

/// Checks parameters before any execution state is created.
pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, parameters: &JobParameters) -> BatchResult<()>;
}

/// Validates required keys and, when optional keys are declared, rejects any
/// key that is neither required nor optional.
#[derive(Debug, Clone, Default)]
pub struct DefaultJobParametersValidator {
    pub required_keys: BTreeSet<String>,
    pub optional_keys: BTreeSet<String>,
}

impl DefaultJobParametersValidator {
    pub fn new<R, O>(required: R, optional: O) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            required_keys: required.into_iter().map(Into::into).collect(),
            optional_keys: optional.into_iter().map(Into::into).collect(),
        }
    }

    /// Set required keys
    pub fn required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Set optional keys
    pub fn optional<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_keys.extend(keys.into_iter().map(Into::into));
        self
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> BatchResult<()> {
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|key| !parameters.contains_key(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BatchError::InvalidJobParameters(format!(
                "missing required keys: {missing:?}"
            )));
        }

        if !self.optional_keys.is_empty() {
            let unexpected: Vec<&str> = parameters
                .keys()
                .filter(|key| {
                    !self.required_keys.contains(*key) && !self.optional_keys.contains(*key)
                })
                .map(String::as_str)
                .collect();
            if !unexpected.is_empty() {
                return Err(BatchError::InvalidJobParameters(format!(
                    "keys not declared as required or optional: {unexpected:?}"
                )));
            }
        }
        Ok(())
    }
}
