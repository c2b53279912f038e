//! Query predicates: immutable boolean expression trees over record fields.
//!
//! Leaves compare one field against operand values; groups combine children
//! with AND, OR or NOT. An empty AND group is the "match all" predicate.
//!
//! ```rust
//! use harbor_engine::{field, QueryPredicate};
//!
//! let open = field("status").eq("open");
//! let urgent = field("priority").ge(3);
//! let p = open.clone().and(urgent.clone());
//!
//! assert_eq!(p, QueryPredicate::and_group(vec![open, urgent]).unwrap());
//! assert!(QueryPredicate::all().is_match_all());
//! ```

use crate::record::{FieldFinder, FieldRef};
use crate::schema::{FieldType, ModelSchema};
use crate::{error::Result, Error, FieldValue, Model};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison applied by a leaf predicate, with its operand(s).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOperator {
    Equal { value: FieldValue },
    NotEqual { value: FieldValue },
    LessThan { value: FieldValue },
    LessOrEqual { value: FieldValue },
    GreaterThan { value: FieldValue },
    GreaterOrEqual { value: FieldValue },
    Between { start: FieldValue, end: FieldValue },
    Contains { value: FieldValue },
    NotContains { value: FieldValue },
    BeginsWith { value: FieldValue },
}

impl QueryOperator {
    /// Upper-case operator name.
    pub fn name(&self) -> &'static str {
        match self {
            QueryOperator::Equal { .. } => "EQUAL",
            QueryOperator::NotEqual { .. } => "NOT_EQUAL",
            QueryOperator::LessThan { .. } => "LESS_THAN",
            QueryOperator::LessOrEqual { .. } => "LESS_OR_EQUAL",
            QueryOperator::GreaterThan { .. } => "GREATER_THAN",
            QueryOperator::GreaterOrEqual { .. } => "GREATER_OR_EQUAL",
            QueryOperator::Between { .. } => "BETWEEN",
            QueryOperator::Contains { .. } => "CONTAINS",
            QueryOperator::NotContains { .. } => "NOT_CONTAINS",
            QueryOperator::BeginsWith { .. } => "BEGINS_WITH",
        }
    }

    /// Every operand carried by the operator, in order.
    pub fn operands(&self) -> Vec<&FieldValue> {
        match self {
            QueryOperator::Between { start, end } => vec![start, end],
            QueryOperator::Equal { value }
            | QueryOperator::NotEqual { value }
            | QueryOperator::LessThan { value }
            | QueryOperator::LessOrEqual { value }
            | QueryOperator::GreaterThan { value }
            | QueryOperator::GreaterOrEqual { value }
            | QueryOperator::Contains { value }
            | QueryOperator::NotContains { value }
            | QueryOperator::BeginsWith { value } => vec![value],
        }
    }

    /// Apply the operator to a stored value.
    ///
    /// Returns `None` when the stored value and the operand cannot be
    /// compared.
    pub fn apply(&self, stored: &FieldValue) -> Option<bool> {
        use QueryOperator::*;
        if stored.is_null() {
            return Some(match self {
                Equal { value } => value.is_null(),
                NotEqual { value } => !value.is_null(),
                _ => false,
            });
        }
        let ordered = |value: &FieldValue, accept: fn(Ordering) -> bool| {
            stored.compare(value).map(accept)
        };
        match self {
            Equal { value } => stored.matches(value),
            NotEqual { value } => stored.matches(value).map(|m| !m),
            LessThan { value } => ordered(value, |o| o == Ordering::Less),
            LessOrEqual { value } => ordered(value, |o| o != Ordering::Greater),
            GreaterThan { value } => ordered(value, |o| o == Ordering::Greater),
            GreaterOrEqual { value } => ordered(value, |o| o != Ordering::Less),
            Between { start, end } => {
                let lower = stored.compare(start)?;
                let upper = stored.compare(end)?;
                Some(lower != Ordering::Less && upper != Ordering::Greater)
            }
            Contains { value } => stored.contains(value),
            NotContains { value } => stored.contains(value).map(|c| !c),
            BeginsWith { value } => stored.begins_with(value),
        }
    }

    /// Check that the operand types make sense for a field of `field_type`.
    fn check_operands(&self, field: &str, field_type: &FieldType) -> Result<()> {
        use QueryOperator::*;
        let malformed = |reason: &str| {
            Err(Error::MalformedPredicate(format!(
                "{} on field '{}' of type {}: {}",
                self.name(),
                field,
                field_type,
                reason
            )))
        };
        let comparable = |value: &FieldValue| {
            value.conforms_to(field_type)
                || matches!((field_type, value), (FieldType::Timestamp, FieldValue::Int(_)))
        };
        match self {
            Equal { value } | NotEqual { value } => {
                if !comparable(value) {
                    return malformed(&format!("operand {} is not comparable", value));
                }
            }
            LessThan { value }
            | LessOrEqual { value }
            | GreaterThan { value }
            | GreaterOrEqual { value } => {
                if !field_type.is_ordered() {
                    return malformed("field is not ordered");
                }
                if value.is_null() || !comparable(value) {
                    return malformed(&format!("operand {} is not comparable", value));
                }
            }
            Between { start, end } => {
                if !field_type.is_ordered() {
                    return malformed("field is not ordered");
                }
                if start.is_null() || end.is_null() || !comparable(start) || !comparable(end) {
                    return malformed("bounds must be non-null values of the field's type");
                }
            }
            Contains { value } | NotContains { value } => match field_type {
                FieldType::List(inner) => {
                    if value.is_null() || !value.conforms_to(inner) {
                        return malformed(&format!("{} is not a list element", value));
                    }
                }
                FieldType::String | FieldType::Id | FieldType::Enum(_) => {
                    if value.as_str().is_none() {
                        return malformed("operand must be a string");
                    }
                }
                _ => return malformed("field is neither a string nor a list"),
            },
            BeginsWith { value } => match field_type {
                FieldType::String | FieldType::Id | FieldType::Enum(_) if value.as_str().is_some() => {}
                _ => return malformed("prefix match needs a string field and operand"),
            },
        }
        Ok(())
    }
}

/// A leaf predicate: one field compared by one operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryPredicateOperation {
    pub field: String,
    pub operator: QueryOperator,
}

/// Boolean combinator for predicate groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupType {
    And,
    Or,
    Not,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupType::And => write!(f, "AND"),
            GroupType::Or => write!(f, "OR"),
            GroupType::Not => write!(f, "NOT"),
        }
    }
}

/// A group of predicates joined by one combinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryPredicateGroup {
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub predicates: Vec<QueryPredicate>,
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryPredicate {
    Operation(QueryPredicateOperation),
    Group(QueryPredicateGroup),
}

impl Default for QueryPredicate {
    fn default() -> Self {
        QueryPredicate::all()
    }
}

impl QueryPredicate {
    /// The predicate that matches every record: an empty AND group.
    pub fn all() -> Self {
        QueryPredicate::Group(QueryPredicateGroup {
            group_type: GroupType::And,
            predicates: Vec::new(),
        })
    }

    /// The predicate that matches no record.
    pub fn none() -> Self {
        QueryPredicate::all().negate()
    }

    pub fn is_match_all(&self) -> bool {
        matches!(
            self,
            QueryPredicate::Group(QueryPredicateGroup { group_type: GroupType::And, predicates })
                if predicates.is_empty()
        )
    }

    pub fn is_match_none(&self) -> bool {
        match self {
            QueryPredicate::Group(QueryPredicateGroup {
                group_type: GroupType::Not,
                predicates,
            }) => predicates.len() == 1 && predicates[0].is_match_all(),
            _ => false,
        }
    }

    /// Build a leaf predicate.
    pub fn operation(field: impl Into<String>, operator: QueryOperator) -> Self {
        QueryPredicate::Operation(QueryPredicateOperation {
            field: field.into(),
            operator,
        })
    }

    /// AND of one or more predicates.
    pub fn and_group(predicates: Vec<QueryPredicate>) -> Result<Self> {
        Self::group(GroupType::And, predicates)
    }

    /// OR of one or more predicates.
    pub fn or_group(predicates: Vec<QueryPredicate>) -> Result<Self> {
        Self::group(GroupType::Or, predicates)
    }

    /// Build a group, enforcing arity: NOT takes exactly one child, AND and
    /// OR at least one. Use [`QueryPredicate::all`] for the empty AND.
    pub fn group(group_type: GroupType, predicates: Vec<QueryPredicate>) -> Result<Self> {
        let group = QueryPredicateGroup {
            group_type,
            predicates,
        };
        group.check_arity()?;
        Ok(QueryPredicate::Group(group))
    }

    /// `self AND other`, as a new group wrapping both sides.
    pub fn and(self, other: QueryPredicate) -> Self {
        QueryPredicate::Group(QueryPredicateGroup {
            group_type: GroupType::And,
            predicates: vec![self, other],
        })
    }

    /// `self OR other`, as a new group wrapping both sides.
    pub fn or(self, other: QueryPredicate) -> Self {
        QueryPredicate::Group(QueryPredicateGroup {
            group_type: GroupType::Or,
            predicates: vec![self, other],
        })
    }

    /// `NOT self`.
    pub fn negate(self) -> Self {
        QueryPredicate::Group(QueryPredicateGroup {
            group_type: GroupType::Not,
            predicates: vec![self],
        })
    }

    /// Check that every referenced field exists in `schema`, operands fit
    /// the field types, and groups have legal arity.
    pub fn validate(&self, schema: &ModelSchema) -> Result<()> {
        match self {
            QueryPredicate::Operation(op) => {
                let def = schema
                    .field(&op.field)
                    .ok_or_else(|| unknown_field(schema, &op.field))?;
                if !def.is_stored() {
                    return Err(Error::MalformedPredicate(format!(
                        "{}.{} is a hasMany relation and cannot be filtered on",
                        schema.name, op.field
                    )));
                }
                op.operator.check_operands(&op.field, &def.field_type)
            }
            QueryPredicate::Group(group) => {
                if !self.is_match_all() {
                    group.check_arity()?;
                }
                group.predicates.iter().try_for_each(|p| p.validate(schema))
            }
        }
    }

    /// Evaluate against `model`.
    ///
    /// AND stops at the first false child and OR at the first true one. An
    /// unknown field or a stored value that cannot be compared with the
    /// operand is reported as `MalformedPredicate`.
    pub fn evaluate(&self, schema: &ModelSchema, model: &Model) -> Result<bool> {
        self.evaluate_with(&FieldFinder::new(schema), model)
    }

    fn evaluate_with(&self, finder: &FieldFinder<'_>, model: &Model) -> Result<bool> {
        match self {
            QueryPredicate::Operation(op) => {
                let stored = finder.find(model, &op.field).map_err(|err| match err {
                    Error::FieldNotFound { model, field } => Error::MalformedPredicate(format!(
                        "field '{}' does not exist on model {}",
                        field, model
                    )),
                    other => other,
                })?;
                let result = match stored {
                    FieldRef::Id(id) => op.operator.apply(&FieldValue::String(id.to_string())),
                    FieldRef::Value(value) => op.operator.apply(value),
                };
                result.ok_or_else(|| {
                    Error::MalformedPredicate(format!(
                        "cannot apply {} to {}.{} holding {}",
                        op.operator.name(),
                        model.model_name(),
                        op.field,
                        match stored {
                            FieldRef::Id(_) => "ID",
                            FieldRef::Value(v) => v.type_name(),
                        }
                    ))
                })
            }
            QueryPredicate::Group(group) => match group.group_type {
                GroupType::And => {
                    for p in &group.predicates {
                        if !p.evaluate_with(finder, model)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                GroupType::Or => {
                    group.check_arity()?;
                    for p in &group.predicates {
                        if p.evaluate_with(finder, model)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                GroupType::Not => {
                    group.check_arity()?;
                    Ok(!group.predicates[0].evaluate_with(finder, model)?)
                }
            },
        }
    }

    /// Names of every field referenced by the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryPredicate::Operation(op) => out.push(&op.field),
            QueryPredicate::Group(group) => {
                for p in &group.predicates {
                    p.collect_fields(out);
                }
            }
        }
    }
}

impl QueryPredicateGroup {
    fn check_arity(&self) -> Result<()> {
        match self.group_type {
            GroupType::Not if self.predicates.len() != 1 => Err(Error::MalformedPredicate(
                format!("NOT group needs exactly one child, got {}", self.predicates.len()),
            )),
            GroupType::And | GroupType::Or if self.predicates.is_empty() => Err(
                Error::MalformedPredicate(format!("{} group needs at least one child", self.group_type)),
            ),
            _ => Ok(()),
        }
    }
}

fn unknown_field(schema: &ModelSchema, field: &str) -> Error {
    Error::MalformedPredicate(format!(
        "field '{}' does not exist on model {}",
        field, schema.name
    ))
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use QueryOperator::*;
        match self {
            Equal { value } => write!(f, "= {}", value),
            NotEqual { value } => write!(f, "!= {}", value),
            LessThan { value } => write!(f, "< {}", value),
            LessOrEqual { value } => write!(f, "<= {}", value),
            GreaterThan { value } => write!(f, "> {}", value),
            GreaterOrEqual { value } => write!(f, ">= {}", value),
            Between { start, end } => write!(f, "BETWEEN {} AND {}", start, end),
            Contains { value } => write!(f, "CONTAINS {}", value),
            NotContains { value } => write!(f, "NOT CONTAINS {}", value),
            BeginsWith { value } => write!(f, "BEGINS WITH {}", value),
        }
    }
}

impl fmt::Display for QueryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryPredicate::Operation(op) => write!(f, "{} {}", op.field, op.operator),
            _ if self.is_match_all() => write!(f, "ALL"),
            QueryPredicate::Group(group) => match group.group_type {
                GroupType::Not => match group.predicates.first() {
                    Some(inner) => write!(f, "NOT ({})", inner),
                    None => write!(f, "NOT ()"),
                },
                joiner => {
                    write!(f, "(")?;
                    for (i, p) in group.predicates.iter().enumerate() {
                        if i > 0 {
                            write!(f, " {} ", joiner)?;
                        }
                        write!(f, "{}", p)?;
                    }
                    write!(f, ")")
                }
            },
        }
    }
}

/// Entry point for building leaf predicates on a named field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryField {
    name: String,
}

/// Shorthand for [`QueryField::new`].
pub fn field(name: impl Into<String>) -> QueryField {
    QueryField::new(name)
}

impl QueryField {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn op(&self, operator: QueryOperator) -> QueryPredicate {
        QueryPredicate::operation(self.name.clone(), operator)
    }

    pub fn eq(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Equal { value: value.into() })
    }

    pub fn ne(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::NotEqual { value: value.into() })
    }

    pub fn lt(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::LessThan { value: value.into() })
    }

    pub fn le(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::LessOrEqual { value: value.into() })
    }

    pub fn gt(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::GreaterThan { value: value.into() })
    }

    pub fn ge(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::GreaterOrEqual { value: value.into() })
    }

    pub fn between(
        &self,
        start: impl Into<FieldValue>,
        end: impl Into<FieldValue>,
    ) -> QueryPredicate {
        self.op(QueryOperator::Between {
            start: start.into(),
            end: end.into(),
        })
    }

    pub fn contains(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Contains { value: value.into() })
    }

    pub fn not_contains(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::NotContains { value: value.into() })
    }

    pub fn begins_with(&self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::BeginsWith { value: value.into() })
    }
}
