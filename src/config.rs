//! Parameter provider abstraction.
//!
//! File-format adapters live outside this crate; the solver core only sees
//! this small lookup interface when applying initial conditions or
//! reconfiguring a model.

use crate::config_error;
use crate::error::ChromsolError;
use std::collections::HashMap;

/// A value stored by a parameter provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Scalar(f64),
    Array(Vec<f64>),
    Int(i64),
    Text(String),
}

/// Read access to named configuration parameters.
pub trait ParameterProvider {
    fn exists(&self, name: &str) -> bool;
    fn get_f64(&self, name: &str) -> Result<f64, ChromsolError>;
    fn get_f64_array(&self, name: &str) -> Result<Vec<f64>, ChromsolError>;
    fn get_int(&self, name: &str) -> Result<i64, ChromsolError>;
}

/// In-memory provider backed by a hash map. Used by tests and the command
/// line wrapper after deserializing the input file.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    values: HashMap<String, ParameterValue>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) -> &mut Self {
        self.values
            .insert(name.to_string(), ParameterValue::Scalar(value));
        self
    }

    pub fn set_array(&mut self, name: &str, value: &[f64]) -> &mut Self {
        self.values
            .insert(name.to_string(), ParameterValue::Array(value.to_vec()));
        self
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.values
            .insert(name.to_string(), ParameterValue::Int(value));
        self
    }
}

impl ParameterProvider for InMemoryProvider {
    fn exists(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn get_f64(&self, name: &str) -> Result<f64, ChromsolError> {
        match self.values.get(name) {
            Some(ParameterValue::Scalar(v)) => Ok(*v),
            Some(ParameterValue::Int(v)) => Ok(*v as f64),
            Some(_) => Err(config_error!(WrongType {
                name: name.to_string(),
            })),
            None => Err(config_error!(MissingParameter, name.to_string())),
        }
    }

    fn get_f64_array(&self, name: &str) -> Result<Vec<f64>, ChromsolError> {
        match self.values.get(name) {
            Some(ParameterValue::Array(v)) => Ok(v.clone()),
            Some(ParameterValue::Scalar(v)) => Ok(vec![*v]),
            Some(_) => Err(config_error!(WrongType {
                name: name.to_string(),
            })),
            None => Err(config_error!(MissingParameter, name.to_string())),
        }
    }

    fn get_int(&self, name: &str) -> Result<i64, ChromsolError> {
        match self.values.get(name) {
            Some(ParameterValue::Int(v)) => Ok(*v),
            Some(_) => Err(config_error!(WrongType {
                name: name.to_string(),
            })),
            None => Err(config_error!(MissingParameter, name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;

    #[test]
    fn test_lookup_and_missing() {
        let mut p = InMemoryProvider::new();
        p.set_scalar("COL_LENGTH", 0.1).set_array("INIT_C", &[1.0, 0.5]);
        assert!(p.exists("COL_LENGTH"));
        assert_eq!(p.get_f64("COL_LENGTH").unwrap(), 0.1);
        assert_eq!(p.get_f64_array("INIT_C").unwrap(), vec![1.0, 0.5]);
        assert!(p.get_f64("NPAR").is_err());
        assert!(!p.exists("NPAR"));
    }

    #[test]
    fn test_wrong_type_reported() {
        let mut p = InMemoryProvider::new();
        p.set_array("INIT_C", &[1.0]);
        assert!(matches!(
            p.get_f64("INIT_C"),
            Err(ChromsolError::ConfigurationError(
                ConfigurationError::WrongType { .. }
            ))
        ));
    }
}
