//! Query options: predicate, sort order and pagination.

use crate::record::FieldFinder;
use crate::schema::ModelSchema;
use crate::{error::Result, Error, Model, QueryPredicate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default number of records per page.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySortBy {
    pub field: String,
    pub order: SortOrder,
}

impl QuerySortBy {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A page of results: `limit` records starting at `page * limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn first_page() -> Self {
        Self::starting_at(0)
    }

    /// The single first matching record.
    pub fn first_result() -> Self {
        Self { page: 0, limit: 1 }
    }

    pub fn starting_at(page: u32) -> Self {
        Self {
            page,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }
}

/// Everything a query needs besides the model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub predicate: QueryPredicate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<QuerySortBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Page>,
}

impl QueryOptions {
    /// Every record, unsorted, unpaginated.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(predicate: QueryPredicate) -> Self {
        Self {
            predicate,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: QuerySortBy) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn paginated(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    /// Validate the predicate and sort keys against `schema`.
    pub fn validate(&self, schema: &ModelSchema) -> Result<()> {
        self.predicate.validate(schema)?;
        for key in &self.sort {
            match schema.field(&key.field) {
                Some(def) if def.is_stored() => {}
                _ => {
                    return Err(Error::MalformedPredicate(format!(
                        "cannot sort {} by unknown field '{}'",
                        schema.name, key.field
                    )))
                }
            }
        }
        Ok(())
    }

    /// Filter, sort and paginate `models` in memory.
    ///
    /// Without sort keys, records come back ordered by id.
    pub fn apply<I>(&self, schema: &ModelSchema, models: I) -> Result<Vec<Model>>
    where
        I: IntoIterator<Item = Model>,
    {
        let mut matched = Vec::new();
        for model in models {
            if self.predicate.evaluate(schema, &model)? {
                matched.push(model);
            }
        }
        sort_models(schema, &self.sort, &mut matched);
        Ok(match self.page {
            Some(page) => {
                let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
                matched
                    .into_iter()
                    .skip(offset)
                    .take(page.limit as usize)
                    .collect()
            }
            None => matched,
        })
    }
}

/// Order two records by `sort`, falling back to id. Null values sort before
/// everything else in ascending order.
pub fn compare_models(schema: &ModelSchema, sort: &[QuerySortBy], a: &Model, b: &Model) -> Ordering {
    let finder = FieldFinder::new(schema);
    for key in sort {
        let (Ok(left), Ok(right)) = (finder.find(a, &key.field), finder.find(b, &key.field)) else {
            continue;
        };
        let (left, right) = (left.to_value(), right.to_value());
        let ord = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => left.compare(&right).unwrap_or(Ordering::Equal),
        };
        let ord = match key.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id().cmp(b.id())
}

/// Sort records in place by `sort`.
pub fn sort_models(schema: &ModelSchema, sort: &[QuerySortBy], models: &mut [Model]) {
    models.sort_by(|a, b| compare_models(schema, sort, a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::field;
    use crate::schema::{FieldDef, FieldType};

    fn schema() -> ModelSchema {
        ModelSchema::new(
            "Todo",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("priority", FieldType::Int),
            ],
        )
    }

    fn todo(n: u8, title: &str, priority: Option<i64>) -> Model {
        Model::builder("Todo")
            .id(format!("00000000-0000-4000-8000-0000000000{:02}", n))
            .set("title", title)
            .set("priority", priority)
            .build()
            .unwrap()
    }

    fn todos() -> Vec<Model> {
        vec![
            todo(3, "c", Some(2)),
            todo(1, "a", None),
            todo(2, "b", Some(5)),
            todo(4, "d", Some(2)),
        ]
    }

    fn titles(models: &[Model]) -> Vec<String> {
        models
            .iter()
            .map(|m| m.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn defaults_to_id_order() {
        let result = QueryOptions::all().apply(&schema(), todos()).unwrap();
        assert_eq!(titles(&result), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn sort_with_nulls_first_and_tiebreak() {
        let options = QueryOptions::all().sorted_by(QuerySortBy::ascending("priority"));
        let result = options.apply(&schema(), todos()).unwrap();
        assert_eq!(titles(&result), vec!["a", "c", "d", "b"]);

        let options = QueryOptions::all()
            .sorted_by(QuerySortBy::descending("priority"))
            .sorted_by(QuerySortBy::descending("title"));
        let result = options.apply(&schema(), todos()).unwrap();
        assert_eq!(titles(&result), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn filter_then_paginate() {
        let options = QueryOptions::matches(field("priority").ge(2))
            .sorted_by(QuerySortBy::ascending("title"))
            .paginated(Page::starting_at(1).with_limit(2));
        let result = options.apply(&schema(), todos()).unwrap();
        assert_eq!(titles(&result), vec!["d"]);

        let first = QueryOptions::all()
            .paginated(Page::first_result())
            .apply(&schema(), todos())
            .unwrap();
        assert_eq!(titles(&first), vec!["a"]);
    }

    #[test]
    fn page_offsets() {
        assert_eq!(Page::first_page().limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(Page::starting_at(3).with_limit(20).offset(), 60);
    }

    #[test]
    fn unknown_sort_field_rejected() {
        let options = QueryOptions::all().sorted_by(QuerySortBy::ascending("colour"));
        assert!(matches!(options.validate(&schema()), Err(Error::MalformedPredicate(_))));
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let options = QueryOptions::matches(field("title").eq("zzz"));
        assert!(options.apply(&schema(), todos()).unwrap().is_empty());
    }
}
