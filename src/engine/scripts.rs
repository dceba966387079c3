//! DML script templates
//!
//! Builders for the select/insert/update/delete templates offered for a table.
//! They only format text: column names come from `list_table_columns()` and
//! quoting from the adapter's `wrap_identifier`. Values are left as `?`
//! placeholders and the row condition as `<condition>`.

use crate::engine::types::TableColumn;

/// `schema.table` when a schema is given, each part quoted with `wrap`.
pub fn qualified_table<W>(wrap: W, table: &str, schema: Option<&str>) -> String
where
    W: Fn(&str) -> String,
{
    match schema.filter(|s| !s.is_empty()) {
        Some(schema) => format!("{}.{}", wrap(schema), wrap(table)),
        None => wrap(table),
    }
}

fn column_list<W>(wrap: &W, columns: &[TableColumn]) -> String
where
    W: Fn(&str) -> String,
{
    if columns.is_empty() {
        return "*".to_string();
    }
    columns
        .iter()
        .map(|col| wrap(&col.column_name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn select_script<W>(wrap: W, table: &str, schema: Option<&str>, columns: &[TableColumn]) -> String
where
    W: Fn(&str) -> String,
{
    format!(
        "SELECT {} FROM {};",
        column_list(&wrap, columns),
        qualified_table(&wrap, table, schema)
    )
}

/// Empty when `columns` is empty: there is nothing to insert into.
pub fn insert_script<W>(wrap: W, table: &str, schema: Option<&str>, columns: &[TableColumn]) -> String
where
    W: Fn(&str) -> String,
{
    if columns.is_empty() {
        return String::new();
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {}\n ({})\n VALUES ({});",
        qualified_table(&wrap, table, schema),
        column_list(&wrap, columns),
        placeholders
    )
}

pub fn update_script<W>(wrap: W, table: &str, schema: Option<&str>, columns: &[TableColumn]) -> String
where
    W: Fn(&str) -> String,
{
    let assignments = columns
        .iter()
        .map(|col| format!("{}=?", wrap(&col.column_name)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {}\n SET {}\n WHERE <condition>;",
        qualified_table(&wrap, table, schema),
        assignments
    )
}

pub fn delete_script<W>(wrap: W, table: &str, schema: Option<&str>) -> String
where
    W: Fn(&str) -> String,
{
    format!(
        "DELETE FROM {} WHERE <condition>;",
        qualified_table(&wrap, table, schema)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::identifier::wrap_identifier;
    use crate::engine::types::EngineKind;

    fn pg(name: &str) -> String {
        wrap_identifier(EngineKind::Postgresql, name)
    }

    fn columns() -> Vec<TableColumn> {
        vec![TableColumn::new("id", "integer"), TableColumn::new("name", "text")]
    }

    #[test]
    fn select_lists_quoted_columns() {
        assert_eq!(
            select_script(pg, "users", Some("public"), &columns()),
            "SELECT \"id\", \"name\" FROM \"public\".\"users\";"
        );
        assert_eq!(select_script(pg, "users", None, &[]), "SELECT * FROM \"users\";");
    }

    #[test]
    fn insert_has_one_placeholder_per_column() {
        assert_eq!(
            insert_script(pg, "users", None, &columns()),
            "INSERT INTO \"users\"\n (\"id\", \"name\")\n VALUES (?, ?);"
        );
    }

    #[test]
    fn insert_without_columns_is_empty() {
        assert_eq!(insert_script(pg, "users", None, &[]), "");
    }

    #[test]
    fn update_and_delete_leave_condition_open() {
        let mysql = |name: &str| wrap_identifier(EngineKind::Mysql, name);
        assert_eq!(
            update_script(mysql, "users", None, &columns()),
            "UPDATE `users`\n SET `id`=?, `name`=?\n WHERE <condition>;"
        );
        assert_eq!(
            delete_script(mysql, "users", Some("app")),
            "DELETE FROM `app`.`users` WHERE <condition>;"
        );
    }
}
