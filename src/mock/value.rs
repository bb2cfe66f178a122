// src/mock/value.rs
//! Value system of the mock runtime: doubles only, string-keyed records

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    Undefined,
    Boolean(bool),
    Number(f64),
    Text(String),
    List(Vec<MockValue>),
    Record(Vec<(String, MockValue)>),
}

impl MockValue {
    pub fn text(s: impl Into<String>) -> Self {
        MockValue::Text(s.into())
    }

    /// Convert a JSON literal. Every JSON number becomes a double.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => MockValue::Undefined,
            serde_json::Value::Bool(b) => MockValue::Boolean(*b),
            serde_json::Value::Number(n) => MockValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => MockValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                MockValue::List(items.iter().map(MockValue::from_json).collect())
            }
            serde_json::Value::Object(map) => MockValue::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), MockValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for MockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockValue::Undefined => write!(f, "undefined"),
            MockValue::Boolean(b) => write!(f, "{}", b),
            MockValue::Number(n) => write!(f, "{}", n),
            MockValue::Text(s) => write!(f, "{:?}", s),
            MockValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            MockValue::Record(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
