use std::fmt;
use std::sync::Arc;
use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

pub type Dict<K = Arc<str>, V = Value> = BTreeMap<K, V>;

/// A metadata value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(Arc<str>),
    Array(Arc<Vec<Value>>),
    Dict(Arc<Dict>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(&**s),
            _ => None
        }
    }

    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v.as_slice()),
            _ => None
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
        }
    }
}

macro_rules! impl_from_primitive {
    ($($T:ty),+ => $E:ident::$kind:ident) => {
        $(
            impl From<$T> for $E {
                fn from(value: $T) -> Self {
                    $E::$kind(value.into())
                }
            }
        )+
    };
}

impl_from_primitive!(bool => Value::Bool);
impl_from_primitive!(&str => Value::String);
impl_from_primitive!(String => Value::String);
impl_from_primitive!(Arc<str> => Value::String);
impl_from_primitive!(Arc<Vec<Value>> => Value::Array);
impl_from_primitive!(Arc<Dict> => Value::Dict);
impl_from_primitive!(u8, u16, u32, i8, i16, i32, i64 => Value::Int);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::from(value as u64)
    }
}

impl<T> From<Vec<T>> for Value where Value: From<T> {
    fn from(value: Vec<T>) -> Self {
        value.into_iter().map(Value::from).collect()
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Value::Array(Arc::new(iter.into_iter().collect()))
    }
}

macro_rules! impl_try_from_value {
    ($($T:ty => |$v:ident| $conv:expr),+ $(,)?) => {
        $(
            impl TryFrom<Value> for $T {
                type Error = Value;

                fn try_from($v: Value) -> Result<Self, Value> {
                    $conv
                }
            }
        )+
    };
}

impl_try_from_value! {
    bool => |v| match v { Value::Bool(b) => Ok(b), v => Err(v) },
    i64 => |v| match v { Value::Int(n) => Ok(n), v => Err(v) },
    Arc<str> => |v| match v { Value::String(s) => Ok(s), v => Err(v) },
    Arc<Vec<Value>> => |v| match v { Value::Array(a) => Ok(a), v => Err(v) },
}

/// A statically typed metadata key. Declare with [`define_meta_key!`].
pub trait MetaKey: 'static {
    const KEY: &'static str;

    type Value: TryFrom<Value> + Into<Value> + fmt::Debug;
}

#[macro_export]
macro_rules! define_meta_key {
    ($($(#[$attr:meta])* $v:vis $T:ident : $key:literal => $V:ty),+ $(,)?) => {
        $(
            $(#[$attr])*
            $v struct $T;

            impl $crate::meta::MetaKey for $T {
                const KEY: &'static str = $key;
                type Value = $V;
            }
        )+
    }
}

define_meta_key! {
    /// The source-relative path the asset was read from.
    pub Origin : "origin" => Arc<str>,
    /// Names of the stages applied so far, in order.
    pub Stages : "stages" => Arc<Vec<Value>>,
}

/// An immutable metadata map. Writes return a new map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    map: Arc<Dict>,
}

impl Metadata {
    #[inline(always)]
    pub fn new() -> Self {
        Metadata::default()
    }

    #[inline(always)]
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn get<K: MetaKey>(&self, _: K) -> Option<Result<K::Value, Value>> {
        let value = self.get_raw(K::KEY)?.clone();
        Some(value.clone().try_into().map_err(|_| value))
    }

    #[inline(always)]
    pub fn contains<K: MetaKey>(&self, _: K) -> bool {
        self.map.contains_key(K::KEY)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn with_raw<K, V>(&self, key: K, value: V) -> Metadata
        where K: Into<Arc<str>>, V: Into<Value>
    {
        let mut map = self.map.clone();
        Arc::make_mut(&mut map).insert(key.into(), value.into());
        Metadata { map }
    }

    pub fn with<K: MetaKey, V: Into<K::Value>>(&self, _: K, value: V) -> Metadata {
        self.with_raw(K::KEY, value.into().into())
    }

    /// Appends `value` to the array stored at `K`, creating it if needed.
    pub fn with_pushed<K, V>(&self, key: K, value: V) -> Metadata
        where K: MetaKey<Value = Arc<Vec<Value>>>, V: Into<Value>
    {
        let mut items = match self.get(key) {
            Some(Ok(items)) => (*items).clone(),
            _ => vec![],
        };

        items.push(value.into());
        self.with_raw(K::KEY, Value::Array(Arc::new(items)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Value)> {
        self.map.iter()
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#?}", self.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_leave_the_original_untouched() {
        let base = Metadata::new().with(Origin, Arc::<str>::from("styles.scss"));
        let next = base.with_pushed(Stages, "sass").with_pushed(Stages, "minify-css");

        assert!(!base.contains(Stages));
        assert_eq!(base.get(Origin), Some(Ok("styles.scss".into())));

        let stages = next.get(Stages).unwrap().unwrap();
        let names: Vec<_> = stages.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(names, ["sass", "minify-css"]);
    }

    define_meta_key! {
        /// Set once an asset has been minified.
        #[derive(Debug, Clone, Copy)]
        Minified : "minified" => bool,
    }

    #[test]
    fn keys_carry_docs_and_attributes() {
        let meta = Metadata::new().with(Minified, true);
        assert_eq!(meta.get(Minified), Some(Ok(true)));
        assert_eq!(format!("{:?}", Minified), "Minified");
        assert_eq!(<Minified as MetaKey>::KEY, "minified");
    }

    #[test]
    fn mistyped_values_are_returned() {
        let meta = Metadata::new().with_raw("origin", 7i64);
        assert_eq!(meta.get(Origin), Some(Err(Value::Int(7))));
    }
}
