//! Database schema parsing and the schema handle used to pick what to replicate

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

use crate::datum::{Atom, Datum};
use crate::error::{IdlError, Result};

/// Atomic types of RFC 7047 §3.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl AtomicType {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "integer" => Ok(AtomicType::Integer),
            "real" => Ok(AtomicType::Real),
            "boolean" => Ok(AtomicType::Boolean),
            "string" => Ok(AtomicType::String),
            "uuid" => Ok(AtomicType::Uuid),
            other => Err(IdlError::schema(format!("unknown atomic type: {}", other))),
        }
    }

    /// Whether an atom may be stored in a column of this type
    pub fn accepts(&self, atom: &Atom) -> bool {
        matches!(
            (self, atom),
            (AtomicType::Integer, Atom::Integer(_))
                | (AtomicType::Real, Atom::Real(_))
                | (AtomicType::Real, Atom::Integer(_))
                | (AtomicType::Boolean, Atom::Boolean(_))
                | (AtomicType::String, Atom::String(_))
                | (AtomicType::Uuid, Atom::Uuid(_))
                | (AtomicType::Uuid, Atom::NamedUuid(_))
        )
    }
}

/// Key or value type of a column
#[derive(Debug, Clone)]
pub struct BaseType {
    pub atomic: AtomicType,
    pub ref_table: Option<String>,
    pub enum_values: Option<Vec<Atom>>,
}

impl BaseType {
    fn from_json(value: &Value) -> Result<Self> {
        if let Some(name) = value.as_str() {
            return Ok(Self {
                atomic: AtomicType::parse(name)?,
                ref_table: None,
                enum_values: None,
            });
        }

        let obj = value
            .as_object()
            .ok_or_else(|| IdlError::schema(format!("bad base type: {}", value)))?;
        let atomic = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| IdlError::schema(format!("base type without type: {}", value)))?;
        let enum_values = match obj.get("enum") {
            Some(e) => Some(
                Datum::from_json(e)?
                    .atoms()
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };

        Ok(Self {
            atomic: AtomicType::parse(atomic)?,
            ref_table: obj
                .get("refTable")
                .and_then(Value::as_str)
                .map(str::to_string),
            enum_values,
        })
    }

    fn check(&self, atom: &Atom) -> Result<()> {
        if !self.atomic.accepts(atom) {
            return Err(IdlError::invalid_datum(format!(
                "{} is not of type {:?}",
                atom, self.atomic
            )));
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(atom) {
                return Err(IdlError::invalid_datum(format!(
                    "{} is not one of the allowed values",
                    atom
                )));
            }
        }
        Ok(())
    }
}

/// Column type: key type, optional value type (maps), cardinality bounds
#[derive(Debug, Clone)]
pub struct ColumnType {
    pub key: BaseType,
    pub value: Option<BaseType>,
    pub min: usize,
    /// `None` means "unlimited"
    pub max: Option<usize>,
}

impl ColumnType {
    pub fn from_json(value: &Value) -> Result<Self> {
        if value.is_string() {
            return Ok(Self {
                key: BaseType::from_json(value)?,
                value: None,
                min: 1,
                max: Some(1),
            });
        }

        let obj = value
            .as_object()
            .ok_or_else(|| IdlError::schema(format!("bad column type: {}", value)))?;
        let key = BaseType::from_json(
            obj.get("key")
                .ok_or_else(|| IdlError::schema(format!("column type without key: {}", value)))?,
        )?;
        let val = obj.get("value").map(BaseType::from_json).transpose()?;
        let min = obj.get("min").and_then(Value::as_u64).unwrap_or(1) as usize;
        let max = match obj.get("max") {
            None => Some(1),
            Some(Value::String(s)) if s == "unlimited" => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| IdlError::schema(format!("bad max: {}", v)))?
                    as usize,
            ),
        };

        Ok(Self {
            key,
            value: val,
            min,
            max,
        })
    }

    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }

    /// Table referenced by the key type, if any
    pub fn ref_table(&self) -> Option<&str> {
        self.key.ref_table.as_deref()
    }

    /// Value of a freshly inserted row that does not set this column
    pub fn default_datum(&self) -> Datum {
        if self.is_map() {
            return Datum::empty_map();
        }
        if self.min == 0 {
            return Datum::empty_set();
        }
        let atom = match self.key.enum_values.as_ref().and_then(|e| e.first()) {
            Some(first) => first.clone(),
            None => match self.key.atomic {
                AtomicType::Integer => Atom::Integer(0),
                AtomicType::Real => Atom::Real(0.0),
                AtomicType::Boolean => Atom::Boolean(false),
                AtomicType::String => Atom::String(String::new()),
                AtomicType::Uuid => Atom::Uuid(uuid::Uuid::nil()),
            },
        };
        Datum::Set(vec![atom])
    }

    /// Validate a datum against this type
    pub fn check(&self, datum: &Datum) -> Result<()> {
        match (datum, &self.value) {
            (Datum::Map(pairs), Some(value_type)) => {
                for (k, v) in pairs {
                    self.key.check(k)?;
                    value_type.check(v)?;
                }
            }
            (Datum::Map(pairs), None) if !pairs.is_empty() => {
                return Err(IdlError::invalid_datum("map given for a set column"));
            }
            (Datum::Set(atoms), Some(_)) if !atoms.is_empty() => {
                return Err(IdlError::invalid_datum("set given for a map column"));
            }
            (Datum::Set(atoms), None) => {
                for atom in atoms {
                    self.key.check(atom)?;
                }
            }
            _ => {}
        }

        let n = datum.len();
        if n < self.min || self.max.is_some_and(|max| n > max) {
            return Err(IdlError::invalid_datum(format!(
                "{} elements outside bounds [{}, {}]",
                n,
                self.min,
                self.max.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub mutable: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSchema>,
    pub is_root: bool,
    pub max_rows: Option<usize>,
    pub indexes: Vec<Vec<String>>,
}

impl TableSchema {
    fn from_json(name: &str, value: &Value) -> Result<Self> {
        let cols = value
            .get("columns")
            .and_then(Value::as_object)
            .ok_or_else(|| IdlError::schema(format!("table {} has no columns", name)))?;

        let mut columns = BTreeMap::new();
        for (col_name, def) in cols {
            let column_type = ColumnType::from_json(
                def.get("type")
                    .ok_or_else(|| IdlError::schema(format!("{}.{} has no type", name, col_name)))?,
            )?;
            columns.insert(
                col_name.clone(),
                ColumnSchema {
                    name: col_name.clone(),
                    column_type,
                    mutable: def.get("mutable").and_then(Value::as_bool).unwrap_or(true),
                },
            );
        }

        let indexes = value
            .get("indexes")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_array)
                    .map(|cols| {
                        cols.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            columns,
            is_root: value.get("isRoot").and_then(Value::as_bool).unwrap_or(false),
            max_rows: value.get("maxRows").and_then(Value::as_u64).map(|n| n as usize),
            indexes,
        })
    }

    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        self.columns.get(name).ok_or_else(|| IdlError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }
}

/// A parsed `.ovsschema` document
#[derive(Debug, Clone)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: String,
    pub tables: BTreeMap<String, TableSchema>,
    raw: Value,
}

impl DatabaseSchema {
    pub fn from_json(raw: Value) -> Result<Self> {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| IdlError::schema("schema has no name"))?
            .to_string();
        let version = raw
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("0.0.0")
            .to_string();
        let defs = raw
            .get("tables")
            .and_then(Value::as_object)
            .ok_or_else(|| IdlError::schema("schema has no tables"))?;

        let mut tables = BTreeMap::new();
        for (table_name, def) in defs {
            tables.insert(table_name.clone(), TableSchema::from_json(table_name, def)?);
        }

        Ok(Self {
            name,
            version,
            tables,
            raw,
        })
    }

    pub fn from_file(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref();
        let text = std::fs::read_to_string(location).map_err(|e| {
            IdlError::schema(format!("cannot read {}: {}", location.display(), e))
        })?;
        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| IdlError::schema(format!("cannot parse {}: {}", location.display(), e)))?;
        Self::from_json(raw)
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| IdlError::UnknownTable(name.to_string()))
    }

    /// The document this schema was parsed from
    pub fn to_json(&self) -> &Value {
        &self.raw
    }
}

/// Schema handle: a loaded schema plus the tables and columns to replicate
#[derive(Debug, Clone)]
pub struct SchemaHelper {
    schema: DatabaseSchema,
    /// table -> columns (`None` = all columns)
    selection: BTreeMap<String, Option<BTreeSet<String>>>,
    all: bool,
}

impl SchemaHelper {
    pub fn new(schema: DatabaseSchema) -> Self {
        Self {
            schema,
            selection: BTreeMap::new(),
            all: false,
        }
    }

    pub fn from_file(location: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(DatabaseSchema::from_file(location)?))
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    /// Replicate every table and column
    pub fn register_all(&mut self) {
        self.all = true;
    }

    /// Replicate every column of one table
    pub fn register_table(&mut self, table: &str) -> Result<()> {
        self.schema.table(table)?;
        self.selection.insert(table.to_string(), None);
        Ok(())
    }

    /// Replicate some columns of one table
    pub fn register_columns(&mut self, table: &str, columns: &[&str]) -> Result<()> {
        let table_schema = self.schema.table(table)?;
        for column in columns {
            table_schema.column(column)?;
        }

        let entry = self
            .selection
            .entry(table.to_string())
            .or_insert_with(|| Some(BTreeSet::new()));
        if let Some(selected) = entry {
            selected.extend(columns.iter().map(|c| c.to_string()));
        }
        Ok(())
    }

    /// The schema restricted to what was registered
    pub fn idl_schema(&self) -> Result<DatabaseSchema> {
        if self.all {
            return Ok(self.schema.clone());
        }
        if self.selection.is_empty() {
            return Err(IdlError::schema("no tables registered"));
        }

        let mut schema = self.schema.clone();
        schema.tables.retain(|name, _| self.selection.contains_key(name));
        for (name, selected) in &self.selection {
            if let (Some(columns), Some(table)) = (selected, schema.tables.get_mut(name)) {
                table.columns.retain(|c, _| columns.contains(c));
            }
        }

        debug!(
            "Replicating {} of {} tables",
            schema.tables.len(),
            self.schema.tables.len()
        );
        Ok(schema)
    }
}
