use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::BridgeError;
use crate::xml::XmlDocument;

/// Anything invokable that can live inside a [`HostValue`].
///
/// The runtime crate provides the concrete implementation (a script callable
/// plus the source text it was built from); the trait keeps this crate free of
/// any scripting engine.
pub trait HostFunction: Send + Sync + fmt::Debug {
    fn source(&self) -> &str;
    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, BridgeError>;
    fn as_any(&self) -> &dyn Any;
}

pub type FunctionRef = Arc<dyn HostFunction>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(value) => value,
            Self::Float(value) => value as i64,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => match serde_json::Number::from_f64(*value) {
                Some(number) => write!(f, "{}", number),
                None => write!(f, "{}", value),
            },
        }
    }
}

/// Ordered list storage shared between the host and every script-side view of it.
#[derive(Clone, Default)]
pub struct HostList(Arc<RwLock<Vec<HostValue>>>);

impl HostList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(values: Vec<HostValue>) -> Self {
        Self(Arc::new(RwLock::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<HostValue> {
        self.0.read().get(index).cloned()
    }

    /// Writing past the end pads the gap with nulls.
    pub fn set(&self, index: usize, value: HostValue) {
        let mut values = self.0.write();
        if index >= values.len() {
            values.resize(index + 1, HostValue::Null);
        }
        values[index] = value;
    }

    pub fn push(&self, value: HostValue) {
        self.0.write().push(value);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = HostValue>) {
        self.0.write().extend(items);
    }

    pub fn remove(&self, index: usize) -> Option<HostValue> {
        let mut values = self.0.write();
        (index < values.len()).then(|| values.remove(index))
    }

    pub fn snapshot(&self) -> Vec<HostValue> {
        self.0.read().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.read().iter()).finish()
    }
}

impl PartialEq for HostList {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0.read() == *other.0.read()
    }
}

impl FromIterator<HostValue> for HostList {
    fn from_iter<T: IntoIterator<Item = HostValue>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

/// Insertion-ordered map storage shared between the host and script-side views.
#[derive(Clone, Default)]
pub struct HostMap(Arc<RwLock<IndexMap<String, HostValue>>>);

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: IndexMap<String, HostValue>) -> Self {
        Self(Arc::new(RwLock::new(entries)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    pub fn insert(&self, key: impl Into<String>, value: HostValue) -> Option<HostValue> {
        self.0.write().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<HostValue> {
        self.0.write().shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<HostValue> {
        self.0.read().values().cloned().collect()
    }

    pub fn snapshot(&self) -> IndexMap<String, HostValue> {
        self.0.read().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.read().iter()).finish()
    }
}

impl PartialEq for HostMap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0.read() == *other.0.read()
    }
}

impl<K: Into<String>> FromIterator<(K, HostValue)> for HostMap {
    fn from_iter<T: IntoIterator<Item = (K, HostValue)>>(iter: T) -> Self {
        Self::from_entries(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Json(serde_json::Value),
    Xml(XmlDocument),
}

/// A host object the bridge knows nothing about; compared and passed by identity.
#[derive(Clone)]
pub struct OpaqueRef {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl OpaqueRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.type_name)
    }
}

#[derive(Debug, Clone, Default)]
pub enum HostValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    Sequence(HostList),
    Mapping(HostMap),
    Document(Document),
    Binary(Vec<u8>),
    Function(FunctionRef),
    Opaque(OpaqueRef),
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Sequence(a), Self::Sequence(b)) => a == b,
            (Self::Mapping(a), Self::Mapping(b)) => a == b,
            (Self::Document(a), Self::Document(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => {
                Arc::ptr_eq(a, b) || a.source() == b.source()
            }
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl HostValue {
    pub fn int(value: i64) -> Self {
        Self::Number(Number::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Number(Number::Float(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn list(values: Vec<HostValue>) -> Self {
        Self::Sequence(HostList::from_vec(values))
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        Self::Mapping(entries.into_iter().collect())
    }

    pub fn function(function: FunctionRef) -> Self {
        Self::Function(function)
    }

    /// Type names as scripts see them through `typeOf`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::Sequence(_) => "list",
            Self::Mapping(_) => "map",
            Self::Document(Document::Json(_)) => "json",
            Self::Document(Document::Xml(_)) => "xml",
            Self::Binary(_) => "bytes",
            Self::Function(_) => "function",
            Self::Opaque(_) => "other",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_map_or_list(&self) -> bool {
        matches!(self, Self::Sequence(_) | Self::Mapping(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&HostList> {
        match self {
            Self::Sequence(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HostMap> {
        match self {
            Self::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Deep copy: collections get fresh storage, everything else is cloned.
    pub fn detached(&self) -> Self {
        match self {
            Self::Sequence(list) => {
                Self::list(list.snapshot().iter().map(Self::detached).collect())
            }
            Self::Mapping(map) => Self::Mapping(
                map.snapshot()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.detached()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Plain text rendering: strings unquoted, collections as compact JSON,
    /// XML as markup.
    pub fn to_display_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.clone(),
            Self::Document(Document::Xml(xml)) => xml.to_xml_string(),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Function(function) => function.source().to_string(),
            Self::Opaque(opaque) => format!("[{}]", opaque.type_name()),
            other => other.to_json().to_string(),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(values: Vec<HostValue>) -> Self {
        Self::list(values)
    }
}
