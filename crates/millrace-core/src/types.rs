use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::EngineError;

/// A variable value in the engine's internal representation
///
/// This is a wrapper around a JSON value with helper methods for working
/// with the value in different shapes. Conversion to and from the wire
/// representation of a variable is governed by its [`DataType`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypedValue {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl TypedValue {
    /// Create a new value from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null value
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to view the value as a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to view the value as a number
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Try to view the value as a boolean
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    /// Try to view the value as an array
    #[inline]
    pub fn as_array(&self) -> Option<&Vec<serde_json::Value>> {
        self.value.as_array()
    }

    /// Try to convert the value to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a value from anything serializable
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Create a text value
    #[inline]
    pub fn from_string(s: &str) -> Self {
        Self::new(serde_json::Value::String(s.to_string()))
    }

    /// Create a boolean value
    #[inline]
    pub fn from_bool(b: bool) -> Self {
        Self::new(serde_json::Value::Bool(b))
    }
}

/// Data type of a variable definition
///
/// Governs the wire representation of a variable value at the persistence
/// boundary. Concrete stores serialize the validated JSON shape as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    /// A string
    Text,
    /// A JSON number
    Number,
    /// A boolean
    Boolean,
    /// Any JSON value
    Json,
    /// A homogeneous list of the given element type
    List(Box<DataType>),
}

impl DataType {
    /// Validate a value against this data type. Null is always acceptable
    /// (an unset variable).
    pub fn check(&self, value: &TypedValue) -> Result<(), EngineError> {
        if value.is_null() {
            return Ok(());
        }
        let ok = match self {
            DataType::Text => value.as_value().is_string(),
            DataType::Number => value.as_value().is_number(),
            DataType::Boolean => value.as_value().is_boolean(),
            DataType::Json => true,
            DataType::List(element) => match value.as_array() {
                Some(items) => {
                    for item in items {
                        element.check(&TypedValue::new(item.clone()))?;
                    }
                    true
                }
                None => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::SerializationError(format!(
                "value {} does not match data type {:?}",
                value.as_value(),
                self
            )))
        }
    }

    /// Convert a value to its wire representation
    pub fn to_wire(&self, value: &TypedValue) -> Result<serde_json::Value, EngineError> {
        self.check(value)?;
        Ok(value.as_value().clone())
    }

    /// Convert a wire representation back into an engine value
    pub fn from_wire(&self, value: serde_json::Value) -> Result<TypedValue, EngineError> {
        let value = TypedValue::new(value);
        self.check(&value)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_value_views() {
        let value = TypedValue::new(json!("hello"));
        assert_eq!(value.as_str(), Some("hello"));
        assert!(!value.is_null());

        let value = TypedValue::new(json!(4.5));
        assert_eq!(value.as_f64(), Some(4.5));

        assert!(TypedValue::null().is_null());
        assert_eq!(TypedValue::from_bool(true).as_bool(), Some(true));
    }

    #[test]
    fn test_data_type_check() {
        assert!(DataType::Text.check(&TypedValue::from_string("a")).is_ok());
        assert!(DataType::Text.check(&TypedValue::new(json!(1))).is_err());
        assert!(DataType::Number.check(&TypedValue::new(json!(1))).is_ok());
        assert!(DataType::Boolean.check(&TypedValue::from_bool(false)).is_ok());
        assert!(DataType::Json.check(&TypedValue::new(json!({"k": 1}))).is_ok());

        // Null is always acceptable
        assert!(DataType::Number.check(&TypedValue::null()).is_ok());
    }

    #[test]
    fn test_data_type_list() {
        let list = DataType::List(Box::new(DataType::Text));
        assert!(list.check(&TypedValue::new(json!(["a", "b"]))).is_ok());
        assert!(list.check(&TypedValue::new(json!(["a", 1]))).is_err());
        assert!(list.check(&TypedValue::new(json!("not a list"))).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let data_type = DataType::List(Box::new(DataType::Number));
        let value = TypedValue::new(json!([1, 2, 3]));

        let wire = data_type.to_wire(&value).unwrap();
        let back = data_type.from_wire(wire).unwrap();
        assert_eq!(back, value);
    }
}
