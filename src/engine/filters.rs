//! Catalog filters for database and schema listings
//!
//! Filters render to a SQL predicate fragment that adapters splice into their
//! catalog queries. Values are string-concatenated with single quotes doubled,
//! so only trusted names should be passed.

use serde::{Deserialize, Serialize};

/// Either an exact name or include/exclude lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    Exact(String),
    Lists {
        #[serde(default)]
        only: Vec<String>,
        #[serde(default)]
        ignore: Vec<String>,
    },
}

impl FilterSpec {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lists {
            only: names.into_iter().map(Into::into).collect(),
            ignore: Vec::new(),
        }
    }

    pub fn ignore<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lists {
            only: Vec::new(),
            ignore: names.into_iter().map(Into::into).collect(),
        }
    }

    /// In-memory check, for adapters that filter catalog rows client-side.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(value) => value == name,
            Self::Lists { only, ignore } => {
                (only.is_empty() || only.iter().any(|v| v == name))
                    && !ignore.iter().any(|v| v == name)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseFilter {
    #[serde(default)]
    pub database: Option<FilterSpec>,
}

impl DatabaseFilter {
    pub fn matches(&self, name: &str) -> bool {
        self.database.as_ref().map_or(true, |spec| spec.matches(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFilter {
    #[serde(default)]
    pub schema: Option<FilterSpec>,
}

impl SchemaFilter {
    pub fn matches(&self, name: &str) -> bool {
        self.schema.as_ref().map_or(true, |spec| spec.matches(name))
    }
}

pub fn build_database_filter(filter: &DatabaseFilter, field: &str) -> Option<String> {
    build_filter(filter.database.as_ref()?, field)
}

pub fn build_schema_filter(filter: &SchemaFilter, field: &str) -> Option<String> {
    build_filter(filter.schema.as_ref()?, field)
}

fn build_filter(spec: &FilterSpec, field: &str) -> Option<String> {
    match spec {
        FilterSpec::Exact(value) => Some(format!("{field} = {}", quote_literal(value))),
        FilterSpec::Lists { only, ignore } => {
            let mut clauses = Vec::new();
            if !only.is_empty() {
                clauses.push(format!("{field} IN ({})", literal_list(only)));
            }
            if !ignore.is_empty() {
                clauses.push(format!("{field} NOT IN ({})", literal_list(ignore)));
            }
            if clauses.is_empty() {
                None
            } else {
                Some(clauses.join(" AND "))
            }
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn literal_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote_literal(v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Append a rendered filter to a catalog query that already has a `WHERE`.
pub(crate) fn and_clause(clause: Option<String>) -> String {
    clause.map(|c| format!(" AND {c}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_name_renders_equality() {
        let filter = SchemaFilter {
            schema: Some(FilterSpec::Exact("public".into())),
        };
        assert_eq!(
            build_schema_filter(&filter, "schema_name").as_deref(),
            Some("schema_name = 'public'")
        );
    }

    #[test]
    fn only_list_renders_in_clause() {
        let filter = SchemaFilter {
            schema: Some(FilterSpec::only(["public", "ghost"])),
        };
        assert_eq!(
            build_schema_filter(&filter, "schema_name").as_deref(),
            Some("schema_name IN ('public','ghost')")
        );
    }

    #[test]
    fn only_and_ignore_are_joined() {
        let filter = DatabaseFilter {
            database: Some(FilterSpec::Lists {
                only: vec!["a".into()],
                ignore: vec!["b".into(), "c".into()],
            }),
        };
        assert_eq!(
            build_database_filter(&filter, "datname").as_deref(),
            Some("datname IN ('a') AND datname NOT IN ('b','c')")
        );
    }

    #[test]
    fn only_list_keeps_names_present_in_catalog() {
        let filter = SchemaFilter {
            schema: Some(FilterSpec::only(["public", "ghost"])),
        };

        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE schemata (schema_name TEXT); INSERT INTO schemata VALUES ('public');")
            .expect("catalog");
        let sql = format!(
            "SELECT schema_name FROM schemata WHERE 1 = 1{}",
            and_clause(build_schema_filter(&filter, "schema_name"))
        );
        let mut stmt = conn.prepare(&sql).expect("prepare");
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(names, vec!["public".to_string()]);

        let catalog = ["public"];
        let kept: Vec<&str> = catalog.into_iter().filter(|name| filter.matches(name)).collect();
        assert_eq!(kept, vec!["public"]);
    }

    #[test]
    fn empty_filter_renders_nothing() {
        assert_eq!(build_schema_filter(&SchemaFilter::default(), "s"), None);
        let filter = SchemaFilter {
            schema: Some(FilterSpec::Lists {
                only: vec![],
                ignore: vec![],
            }),
        };
        assert_eq!(build_schema_filter(&filter, "s"), None);
    }

    #[test]
    fn single_quotes_are_doubled() {
        let filter = DatabaseFilter {
            database: Some(FilterSpec::Exact("o'brien".into())),
        };
        assert_eq!(
            build_database_filter(&filter, "name").as_deref(),
            Some("name = 'o''brien'")
        );
    }

    #[test]
    fn deserializes_both_shapes() {
        let exact: FilterSpec = serde_json::from_str(r#""public""#).expect("exact");
        assert_eq!(exact, FilterSpec::Exact("public".into()));

        let lists: FilterSpec =
            serde_json::from_str(r#"{"ignore":["pg_catalog"]}"#).expect("lists");
        assert!(lists.matches("public"));
        assert!(!lists.matches("pg_catalog"));
    }
}
