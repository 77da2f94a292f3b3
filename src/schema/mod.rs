//! Field schemas and the columnar row sets built over them.
//!
//! A [`Schema`] is an ordered list of named, typed fields; a [`Frame`] is a
//! growable row set storing one tightly-packed buffer per field. Frames are
//! the currency of the whole crate: the history table stores one, generator
//! and simulator output travel as them, and dispatch ships history slices as
//! them. Array-valued fields are fixed-width records stored flat, so every
//! column is a single contiguous allocation.

#[cfg(test)]
mod tests;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The element type of one field.
///
/// Array dtypes carry their fixed per-row width; rows of differing lengths
/// cannot share a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int,
    Float,
    Str,
    FloatArr(usize),
    IntArr(usize),
}

impl Display for DType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Str => write!(f, "str"),
            Self::FloatArr(w) => write!(f, "float[{}]", w),
            Self::IntArr(w) => write!(f, "int[{}]", w),
        }
    }
}

/// One cell of a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FloatArr(Vec<f64>),
    IntArr(Vec<i64>),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::Int,
            Self::Float(_) => DType::Float,
            Self::Str(_) => DType::Str,
            Self::FloatArr(v) => DType::FloatArr(v.len()),
            Self::IntArr(v) => DType::IntArr(v.len()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A named, typed field declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub dtype: DType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug)]
pub enum SchemaError {
    /// The same field declared twice with different dtypes.
    Conflict {
        name: String,
        first: DType,
        second: DType,
    },
    UnknownField(String),
    DTypeMismatch {
        field: String,
        expected: DType,
        got: DType,
    },
    RowOutOfRange {
        row: usize,
        len: usize,
    },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                name,
                first,
                second,
            } => write!(
                f,
                "field '{}' declared with incompatible dtypes {} and {}",
                name, first, second
            ),
            Self::UnknownField(name) => write!(f, "unknown field '{}'", name),
            Self::DTypeMismatch {
                field,
                expected,
                got,
            } => write!(
                f,
                "field '{}' expects dtype {}, got {}",
                field, expected, got
            ),
            Self::RowOutOfRange { row, len } => {
                write!(f, "row {} out of range for {} rows", row, len)
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// An ordered set of field declarations with by-name lookup.
///
/// Duplicate declarations with the same dtype collapse to one field;
/// duplicates with differing dtypes are rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldDef>", into = "Vec<FieldDef>")]
pub struct Schema {
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn new(declared: Vec<FieldDef>) -> Result<Self, SchemaError> {
        let mut schema = Self {
            fields: Vec::with_capacity(declared.len()),
            by_name: HashMap::with_capacity(declared.len()),
        };
        for field in declared {
            schema.merge_field(field)?;
        }
        Ok(schema)
    }

    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Union of several declaration lists, in order of first appearance.
    pub fn union(parts: &[&[FieldDef]]) -> Result<Self, SchemaError> {
        let mut schema = Self::empty();
        for part in parts {
            for field in part.iter() {
                schema.merge_field(field.clone())?;
            }
        }
        Ok(schema)
    }

    fn merge_field(&mut self, field: FieldDef) -> Result<(), SchemaError> {
        if let Some(&pos) = self.by_name.get(&field.name) {
            let existing = &self.fields[pos];
            if existing.dtype != field.dtype {
                return Err(SchemaError::Conflict {
                    name: field.name,
                    first: existing.dtype,
                    second: field.dtype,
                });
            }
            return Ok(());
        }
        self.by_name.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.by_name.get(name).map(|&pos| &self.fields[pos])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Sub-schema containing `names`, in the order given.
    pub fn project(&self, names: &[String]) -> Result<Schema, SchemaError> {
        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            let field = self
                .field(name)
                .ok_or_else(|| SchemaError::UnknownField(name.clone()))?;
            fields.push(field.clone());
        }
        Schema::new(fields)
    }

    /// True if every field of `self` appears in `other` with the same dtype.
    pub fn compatible_subset_of(&self, other: &Schema) -> bool {
        self.fields
            .iter()
            .all(|f| other.field(&f.name).map(|g| g.dtype == f.dtype) == Some(true))
    }
}

impl TryFrom<Vec<FieldDef>> for Schema {
    type Error = SchemaError;

    fn try_from(fields: Vec<FieldDef>) -> Result<Self, Self::Error> {
        Schema::new(fields)
    }
}

impl From<Schema> for Vec<FieldDef> {
    fn from(schema: Schema) -> Self {
        schema.fields
    }
}

/// One tightly-packed column buffer.
///
/// Array columns store `width` elements per row in a single flat buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
    FloatArr { width: usize, data: Vec<f64> },
    IntArr { width: usize, data: Vec<i64> },
}

impl Column {
    pub fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(Vec::new()),
            DType::Int => Self::Int(Vec::new()),
            DType::Float => Self::Float(Vec::new()),
            DType::Str => Self::Str(Vec::new()),
            DType::FloatArr(width) => Self::FloatArr {
                width,
                data: Vec::new(),
            },
            DType::IntArr(width) => Self::IntArr {
                width,
                data: Vec::new(),
            },
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::Int,
            Self::Float(_) => DType::Float,
            Self::Str(_) => DType::Str,
            Self::FloatArr { width, .. } => DType::FloatArr(*width),
            Self::IntArr { width, .. } => DType::IntArr(*width),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Str(v) => v.len(),
            Self::FloatArr { width, data } => data.len() / (*width).max(1),
            Self::IntArr { width, data } => data.len() / (*width).max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one row holding the dtype's default: `false`, `0`, `NaN`, the
    /// empty string, or an all-default record.
    pub fn push_default(&mut self) {
        match self {
            Self::Bool(v) => v.push(false),
            Self::Int(v) => v.push(0),
            Self::Float(v) => v.push(f64::NAN),
            Self::Str(v) => v.push(String::new()),
            Self::FloatArr { width, data } => data.extend(std::iter::repeat(f64::NAN).take(*width)),
            Self::IntArr { width, data } => data.extend(std::iter::repeat(0).take(*width)),
        }
    }

    pub fn get(&self, row: usize) -> Value {
        match self {
            Self::Bool(v) => Value::Bool(v[row]),
            Self::Int(v) => Value::Int(v[row]),
            Self::Float(v) => Value::Float(v[row]),
            Self::Str(v) => Value::Str(v[row].clone()),
            Self::FloatArr { width, data } => {
                Value::FloatArr(data[row * width..(row + 1) * width].to_vec())
            }
            Self::IntArr { width, data } => {
                Value::IntArr(data[row * width..(row + 1) * width].to_vec())
            }
        }
    }

    pub fn set(&mut self, row: usize, value: &Value) -> Result<(), SchemaError> {
        let mismatch = |col: &Column| SchemaError::DTypeMismatch {
            field: String::new(),
            expected: col.dtype(),
            got: value.dtype(),
        };
        match (&mut *self, value) {
            (Self::Bool(v), Value::Bool(x)) => v[row] = *x,
            (Self::Int(v), Value::Int(x)) => v[row] = *x,
            (Self::Float(v), Value::Float(x)) => v[row] = *x,
            (Self::Str(v), Value::Str(x)) => v[row] = x.clone(),
            (Self::FloatArr { width, data }, Value::FloatArr(x)) if x.len() == *width => {
                data[row * *width..(row + 1) * *width].copy_from_slice(x);
            }
            (Self::IntArr { width, data }, Value::IntArr(x)) if x.len() == *width => {
                data[row * *width..(row + 1) * *width].copy_from_slice(x);
            }
            (col, _) => return Err(mismatch(col)),
        }
        Ok(())
    }
}

/// A columnar row set over a fixed schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    schema: Schema,
    columns: Vec<Column>,
    rows: usize,
}

impl Frame {
    pub fn new(schema: Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Column::for_dtype(f.dtype))
            .collect();
        Self {
            schema,
            columns,
            rows: 0,
        }
    }

    /// Build a frame from per-row cell lists, one cell per schema field.
    pub fn from_rows(schema: Schema, rows: Vec<Vec<Value>>) -> Result<Self, SchemaError> {
        let mut frame = Frame::new(schema);
        for row in rows {
            let at = frame.push_default_row();
            for (pos, value) in row.iter().enumerate() {
                let name = frame.schema.fields()[pos].name.clone();
                frame.set(&name, at, value)?;
            }
        }
        Ok(frame)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Append one default-initialized row and return its index.
    pub fn push_default_row(&mut self) -> usize {
        for column in &mut self.columns {
            column.push_default();
        }
        self.rows += 1;
        self.rows - 1
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.position(name).map(|pos| &self.columns[pos])
    }

    pub fn get(&self, name: &str, row: usize) -> Result<Value, SchemaError> {
        let pos = self
            .schema
            .position(name)
            .ok_or_else(|| SchemaError::UnknownField(name.to_string()))?;
        if row >= self.rows {
            return Err(SchemaError::RowOutOfRange {
                row,
                len: self.rows,
            });
        }
        Ok(self.columns[pos].get(row))
    }

    pub fn set(&mut self, name: &str, row: usize, value: &Value) -> Result<(), SchemaError> {
        let pos = self
            .schema
            .position(name)
            .ok_or_else(|| SchemaError::UnknownField(name.to_string()))?;
        if row >= self.rows {
            return Err(SchemaError::RowOutOfRange {
                row,
                len: self.rows,
            });
        }
        self.columns[pos].set(row, value).map_err(|err| match err {
            SchemaError::DTypeMismatch { expected, got, .. } => SchemaError::DTypeMismatch {
                field: name.to_string(),
                expected,
                got,
            },
            other => other,
        })
    }

    /// Copy the named fields of `rows` into a fresh frame, in the order
    /// given.
    pub fn slice(&self, names: &[String], rows: &[usize]) -> Result<Frame, SchemaError> {
        let schema = self.schema.project(names)?;
        let mut out = Frame::new(schema);
        for &row in rows {
            if row >= self.rows {
                return Err(SchemaError::RowOutOfRange {
                    row,
                    len: self.rows,
                });
            }
            let at = out.push_default_row();
            for name in names {
                let value = self.columns[self.schema.position(name).unwrap()].get(row);
                out.set(name, at, &value)?;
            }
        }
        Ok(out)
    }
}
