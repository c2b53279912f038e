//! Translation of predicates and query options into SQLite SQL.
//!
//! Records are stored one row per record with an `id` column, a JSON
//! `payload` column and a JSON `sort_keys` column; fields are read with
//! `json_extract`. Every leaf translates to an expression that yields 0 or 1,
//! never NULL, so that `NOT`, `AND` and `OR` keep the two-valued semantics of
//! [`QueryPredicate::evaluate`].
//!
//! Date, Time and DateTime fields are compared and sorted on their
//! [`FieldValue::sort_key`] in `sort_keys`, since their ISO text does not
//! order by instant once offsets or fractional seconds differ.

use crate::predicate::{GroupType, QueryOperator, QueryPredicate};
use crate::query::{QueryOptions, SortOrder};
use crate::schema::{FieldType, ModelSchema, ID_FIELD};
use crate::{error::Result, Error, FieldValue};
use std::fmt::Write;

/// Column holding the JSON object built by [`sort_keys`].
pub const SORT_KEYS_COLUMN: &str = "sort_keys";

/// Sort keys of every temporal field present in a stored `row`, by field
/// name. Rows that are not objects have no keys.
pub fn sort_keys(schema: &ModelSchema, row: &serde_json::Value) -> Result<serde_json::Value> {
    let mut keys = serde_json::Map::new();
    let Some(obj) = row.as_object() else {
        return Ok(serde_json::Value::Object(keys));
    };
    for def in schema.fields.iter().filter(|def| def.field_type.is_temporal()) {
        let Some(raw) = obj.get(&def.name) else {
            continue;
        };
        if let Some(key) = FieldValue::from_json(&def.name, raw, &def.field_type)?.sort_key() {
            keys.insert(def.name.clone(), serde_json::Value::String(key));
        }
    }
    Ok(serde_json::Value::Object(keys))
}

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlBinding {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlBinding {
    /// Binding for a field value as `json_extract` would return it.
    pub fn from_value(value: &FieldValue) -> Self {
        match value {
            FieldValue::Null => SqlBinding::Null,
            FieldValue::Bool(b) => SqlBinding::Integer(i64::from(*b)),
            FieldValue::Int(i) => SqlBinding::Integer(*i),
            FieldValue::Float(f) => SqlBinding::Real(*f),
            FieldValue::Timestamp(ts) => SqlBinding::Integer(ts.seconds()),
            FieldValue::String(s) => SqlBinding::Text(s.clone()),
            FieldValue::Date(d) => SqlBinding::Text(d.format()),
            FieldValue::Time(t) => SqlBinding::Text(t.format()),
            FieldValue::DateTime(dt) => SqlBinding::Text(dt.format()),
            FieldValue::List(_) | FieldValue::Json(_) => SqlBinding::Text(value.to_json().to_string()),
        }
    }
}

/// A WHERE clause with positional bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    clause: String,
    bindings: Vec<SqlBinding>,
}

impl SqlPredicate {
    /// Translate `predicate`, validating it against `schema` first.
    pub fn new(predicate: &QueryPredicate, schema: &ModelSchema) -> Result<Self> {
        predicate.validate(schema)?;
        let mut out = SqlPredicate {
            clause: String::new(),
            bindings: Vec::new(),
        };
        out.clause = out.translate(predicate, schema)?;
        Ok(out)
    }

    pub fn clause(&self) -> &str {
        &self.clause
    }

    pub fn bindings(&self) -> &[SqlBinding] {
        &self.bindings
    }

    fn bind(&mut self, value: &FieldValue) -> &'static str {
        self.bindings.push(SqlBinding::from_value(value));
        "?"
    }

    /// Bind an operand compared against the column of a field of `field_type`.
    fn bind_operand(&mut self, value: &FieldValue, field_type: &FieldType) -> &'static str {
        match value.sort_key() {
            Some(key) if field_type.is_temporal() => {
                self.bindings.push(SqlBinding::Text(key));
                "?"
            }
            _ => self.bind(value),
        }
    }

    fn translate(&mut self, predicate: &QueryPredicate, schema: &ModelSchema) -> Result<String> {
        if predicate.is_match_all() {
            return Ok("1 = 1".to_string());
        }
        if predicate.is_match_none() {
            return Ok("1 = 0".to_string());
        }
        match predicate {
            QueryPredicate::Operation(op) => {
                let def = schema.require_field(&op.field)?;
                let field_type = &def.field_type;
                let column = column(&op.field, field_type);
                let is_list = matches!(field_type, FieldType::List(_));
                Ok(match &op.operator {
                    QueryOperator::Equal { value } if value.is_null() => {
                        format!("{} IS NULL", column)
                    }
                    QueryOperator::NotEqual { value } if value.is_null() => {
                        format!("{} IS NOT NULL", column)
                    }
                    QueryOperator::Equal { value } => {
                        format!("IFNULL({} = {}, 0)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::NotEqual { value } => {
                        format!("IFNULL({} <> {}, 1)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::LessThan { value } => {
                        format!("IFNULL({} < {}, 0)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::LessOrEqual { value } => {
                        format!("IFNULL({} <= {}, 0)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::GreaterThan { value } => {
                        format!("IFNULL({} > {}, 0)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::GreaterOrEqual { value } => {
                        format!("IFNULL({} >= {}, 0)", column, self.bind_operand(value, field_type))
                    }
                    QueryOperator::Between { start, end } => {
                        let start = self.bind_operand(start, field_type);
                        let end = self.bind_operand(end, field_type);
                        format!("IFNULL({} BETWEEN {} AND {}, 0)", column, start, end)
                    }
                    QueryOperator::Contains { value } if is_list => {
                        list_membership(&op.field, self.bind(value))
                    }
                    QueryOperator::NotContains { value } if is_list => format!(
                        "({} IS NOT NULL AND NOT {})",
                        column,
                        list_membership(&op.field, self.bind(value))
                    ),
                    QueryOperator::Contains { value } => {
                        format!("IFNULL(instr({}, {}) > 0, 0)", column, self.bind(value))
                    }
                    QueryOperator::NotContains { value } => {
                        format!("IFNULL(instr({}, {}) = 0, 0)", column, self.bind(value))
                    }
                    QueryOperator::BeginsWith { value } => {
                        format!("IFNULL(instr({}, {}) = 1, 0)", column, self.bind(value))
                    }
                })
            }
            QueryPredicate::Group(group) => match group.group_type {
                GroupType::Not => {
                    let inner = group.predicates.first().ok_or_else(|| {
                        Error::MalformedPredicate("NOT group needs exactly one child".into())
                    })?;
                    Ok(format!("NOT ({})", self.translate(inner, schema)?))
                }
                GroupType::And | GroupType::Or => {
                    let joiner = if group.group_type == GroupType::And {
                        " AND "
                    } else {
                        " OR "
                    };
                    let parts = group
                        .predicates
                        .iter()
                        .map(|p| self.translate(p, schema))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(format!("({})", parts.join(joiner)))
                }
            },
        }
    }
}

/// Column expression for a field of `field_type`.
pub fn column(field: &str, field_type: &FieldType) -> String {
    if field == ID_FIELD {
        ID_FIELD.to_string()
    } else if field_type.is_temporal() {
        format!("json_extract({}, {})", SORT_KEYS_COLUMN, json_path(field))
    } else {
        format!("json_extract(payload, {})", json_path(field))
    }
}

/// `'$."field"'` as an SQL string literal.
fn json_path(field: &str) -> String {
    format!("'$.\"{}\"'", field.replace('\'', "''"))
}

fn list_membership(field: &str, placeholder: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM json_each(payload, {}) WHERE json_each.value = {})",
        json_path(field),
        placeholder
    )
}

/// A complete SELECT over a model table, with WHERE, ORDER BY and LIMIT.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub bindings: Vec<SqlBinding>,
}

impl SqlQuery {
    /// `SELECT payload FROM "<table>"` filtered and ordered by `options`.
    /// Ties are broken by id, matching [`QueryOptions::apply`].
    pub fn select(table: &str, schema: &ModelSchema, options: &QueryOptions) -> Result<Self> {
        options.validate(schema)?;
        let predicate = SqlPredicate::new(&options.predicate, schema)?;
        let mut sql = format!(
            "SELECT payload FROM {} WHERE {}",
            quote_identifier(table),
            predicate.clause()
        );
        let mut bindings = predicate.bindings;

        sql.push_str(" ORDER BY ");
        for key in &options.sort {
            let direction = match key.order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            let field_type = &schema.require_field(&key.field)?.field_type;
            let _ = write!(sql, "{} {}, ", column(&key.field, field_type), direction);
        }
        sql.push_str("id ASC");

        if let Some(page) = options.page {
            sql.push_str(" LIMIT ? OFFSET ?");
            bindings.push(SqlBinding::Integer(i64::from(page.limit)));
            bindings.push(SqlBinding::Integer(
                i64::try_from(page.offset()).unwrap_or(i64::MAX),
            ));
        }
        Ok(Self { sql, bindings })
    }
}

/// Double-quote an identifier for SQLite.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
