//! OVSDB atoms and datums with their JSON notation (RFC 7047 §5.1)

use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{IdlError, Result};

/// A single OVSDB value
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
    /// Reference to a row inserted earlier in the same transaction
    NamedUuid(String),
}

impl Atom {
    /// Decode an atom from its JSON notation
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(Atom::Boolean(*b)),
            Value::String(s) => Ok(Atom::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Atom::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Atom::Real(f))
                } else {
                    Err(IdlError::invalid_datum(format!("number out of range: {}", n)))
                }
            }
            Value::Array(pair) if pair.len() == 2 => {
                let text = pair[1]
                    .as_str()
                    .ok_or_else(|| IdlError::invalid_datum(format!("bad atom: {}", value)))?;
                match pair[0].as_str() {
                    Some("uuid") => Uuid::parse_str(text)
                        .map(Atom::Uuid)
                        .map_err(|e| IdlError::invalid_datum(format!("bad uuid {}: {}", text, e))),
                    Some("named-uuid") => Ok(Atom::NamedUuid(text.to_string())),
                    _ => Err(IdlError::invalid_datum(format!("bad atom: {}", value))),
                }
            }
            _ => Err(IdlError::invalid_datum(format!("bad atom: {}", value))),
        }
    }

    /// Encode the atom in JSON notation
    pub fn to_json(&self) -> Value {
        match self {
            Atom::Integer(i) => json!(i),
            Atom::Real(f) => json!(f),
            Atom::Boolean(b) => json!(b),
            Atom::String(s) => json!(s),
            Atom::Uuid(u) => json!(["uuid", u.to_string()]),
            Atom::NamedUuid(n) => json!(["named-uuid", n]),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Atom::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Atom::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Atom::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Integer(i) => write!(f, "{}", i),
            Atom::Real(r) => write!(f, "{}", r),
            Atom::Boolean(b) => write!(f, "{}", b),
            Atom::String(s) => write!(f, "{:?}", s),
            Atom::Uuid(u) => write!(f, "{}", u),
            Atom::NamedUuid(n) => write!(f, "@{}", n),
        }
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::String(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom::String(s)
    }
}

impl From<i64> for Atom {
    fn from(i: i64) -> Self {
        Atom::Integer(i)
    }
}

impl From<bool> for Atom {
    fn from(b: bool) -> Self {
        Atom::Boolean(b)
    }
}

impl From<Uuid> for Atom {
    fn from(u: Uuid) -> Self {
        Atom::Uuid(u)
    }
}

/// A column value: a set of atoms or a map between atoms.
///
/// Scalars are one-element sets and optional values are sets of zero or
/// one element. Equality ignores element order.
#[derive(Debug, Clone)]
pub enum Datum {
    Set(Vec<Atom>),
    Map(Vec<(Atom, Atom)>),
}

impl Datum {
    pub fn empty_set() -> Self {
        Datum::Set(Vec::new())
    }

    pub fn empty_map() -> Self {
        Datum::Map(Vec::new())
    }

    /// A one-element set
    pub fn scalar(atom: impl Into<Atom>) -> Self {
        Datum::Set(vec![atom.into()])
    }

    /// A set of row references
    pub fn uuid_set(uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Datum::Set(uuids.into_iter().map(Atom::Uuid).collect())
    }

    /// A string-to-string map
    pub fn string_map<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Datum::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (Atom::String(k.into()), Atom::String(v.into())))
                .collect(),
        )
    }

    /// Decode a datum from its JSON notation
    pub fn from_json(value: &Value) -> Result<Self> {
        if let Some(arr) = value.as_array() {
            if arr.len() == 2 {
                match arr[0].as_str() {
                    Some("set") => {
                        let elems = arr[1]
                            .as_array()
                            .ok_or_else(|| IdlError::invalid_datum(format!("bad set: {}", value)))?;
                        let atoms = elems.iter().map(Atom::from_json).collect::<Result<_>>()?;
                        return Ok(Datum::Set(atoms));
                    }
                    Some("map") => {
                        let elems = arr[1]
                            .as_array()
                            .ok_or_else(|| IdlError::invalid_datum(format!("bad map: {}", value)))?;
                        let mut pairs = Vec::with_capacity(elems.len());
                        for pair in elems {
                            match pair.as_array() {
                                Some(kv) if kv.len() == 2 => {
                                    pairs.push((Atom::from_json(&kv[0])?, Atom::from_json(&kv[1])?));
                                }
                                _ => {
                                    return Err(IdlError::invalid_datum(format!(
                                        "bad map pair: {}",
                                        pair
                                    )))
                                }
                            }
                        }
                        return Ok(Datum::Map(pairs));
                    }
                    _ => {}
                }
            }
        }

        Ok(Datum::Set(vec![Atom::from_json(value)?]))
    }

    /// Encode the datum in JSON notation
    pub fn to_json(&self) -> Value {
        match self {
            Datum::Set(atoms) if atoms.len() == 1 => atoms[0].to_json(),
            Datum::Set(atoms) => {
                json!(["set", atoms.iter().map(Atom::to_json).collect::<Vec<_>>()])
            }
            Datum::Map(pairs) => json!([
                "map",
                pairs
                    .iter()
                    .map(|(k, v)| json!([k.to_json(), v.to_json()]))
                    .collect::<Vec<_>>()
            ]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Datum::Set(atoms) => atoms.len(),
            Datum::Map(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Datum::Map(_))
    }

    /// The single atom of a one-element set
    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Datum::Set(atoms) if atoms.len() == 1 => atoms.first(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_atom().and_then(Atom::as_str)
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        self.as_atom().and_then(Atom::as_uuid)
    }

    /// Set elements (map keys for a map)
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Datum::Set(atoms) => atoms.iter().collect(),
            Datum::Map(pairs) => pairs.iter().map(|(k, _)| k).collect(),
        }
    }

    /// Row references held by a set
    pub fn uuids(&self) -> Vec<Uuid> {
        match self {
            Datum::Set(atoms) => atoms.iter().filter_map(Atom::as_uuid).collect(),
            Datum::Map(_) => Vec::new(),
        }
    }

    /// Lookup in a map datum
    pub fn get(&self, key: &Atom) -> Option<&Atom> {
        match self {
            Datum::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            Datum::Set(_) => None,
        }
    }

    /// Set membership (map keys for a map)
    pub fn contains(&self, atom: &Atom) -> bool {
        match self {
            Datum::Set(atoms) => atoms.contains(atom),
            Datum::Map(pairs) => pairs.iter().any(|(k, _)| k == atom),
        }
    }

    /// Add an element to a set, ignoring duplicates
    pub fn insert(&mut self, atom: Atom) -> Result<()> {
        match self {
            Datum::Set(atoms) => {
                if !atoms.contains(&atom) {
                    atoms.push(atom);
                }
                Ok(())
            }
            Datum::Map(_) => Err(IdlError::invalid_datum("cannot insert a bare atom into a map")),
        }
    }

    /// Remove an element from a set (a key from a map)
    pub fn remove(&mut self, atom: &Atom) {
        match self {
            Datum::Set(atoms) => atoms.retain(|a| a != atom),
            Datum::Map(pairs) => pairs.retain(|(k, _)| k != atom),
        }
    }

    /// Rewrite every atom, keys and values alike
    pub fn map_atoms(&self, f: impl Fn(&Atom) -> Atom) -> Datum {
        match self {
            Datum::Set(atoms) => Datum::Set(atoms.iter().map(&f).collect()),
            Datum::Map(pairs) => Datum::Map(pairs.iter().map(|(k, v)| (f(k), f(v))).collect()),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Set(a), Datum::Set(b)) => {
                a.len() == b.len() && a.iter().all(|x| b.contains(x))
            }
            (Datum::Map(a), Datum::Map(b)) => {
                a.len() == b.len() && a.iter().all(|pair| b.contains(pair))
            }
            // An empty map and an empty set are both "no value"
            (Datum::Set(a), Datum::Map(b)) | (Datum::Map(b), Datum::Set(a)) => {
                a.is_empty() && b.is_empty()
            }
        }
    }
}

impl From<Atom> for Datum {
    fn from(atom: Atom) -> Self {
        Datum::Set(vec![atom])
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::scalar(s)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::scalar(s)
    }
}

impl From<i64> for Datum {
    fn from(i: i64) -> Self {
        Datum::scalar(i)
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::scalar(b)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Set(atoms) if atoms.len() == 1 => write!(f, "{}", atoms[0]),
            Datum::Set(atoms) => {
                let parts: Vec<String> = atoms.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Datum::Map(pairs) => {
                let parts: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}
