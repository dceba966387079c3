//! Statement splitting and classification
//!
//! Batches are split on top-level semicolons using the sqlparser tokenizer, so
//! semicolons inside string literals, quoted identifiers and comments are left
//! alone. Each statement is classified from its leading keywords only; nothing
//! here builds an AST.

use serde::{Deserialize, Serialize};
use sqlparser::{
    dialect::{Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect},
    tokenizer::{Location, Token, TokenWithSpan, Tokenizer},
};

use crate::engine::types::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    Show,
    Explain,
    CreateDatabase,
    CreateSchema,
    CreateTable,
    CreateView,
    CreateIndex,
    CreateTrigger,
    CreateFunction,
    CreateProcedure,
    DropDatabase,
    DropSchema,
    DropTable,
    DropView,
    DropIndex,
    DropTrigger,
    DropFunction,
    DropProcedure,
    AlterDatabase,
    AlterSchema,
    AlterTable,
    AlterView,
    AlterIndex,
    AlterTrigger,
    AlterFunction,
    AlterProcedure,
    Unknown,
}

impl StatementKind {
    /// Statements whose primary purpose is to return a result set
    pub fn returns_rows(self) -> bool {
        matches!(self, Self::Select | Self::Show | Self::Explain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    MsSql,
    Sqlite,
    Generic,
}

impl SqlDialect {
    pub fn for_engine(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Postgresql | EngineKind::Redshift => Self::Postgres,
            EngineKind::Mysql | EngineKind::Mariadb => Self::MySql,
            EngineKind::Sqlserver => Self::MsSql,
            EngineKind::Sqlite => Self::Sqlite,
            EngineKind::Cassandra => Self::Generic,
        }
    }

    fn parser_dialect(self) -> Box<dyn Dialect> {
        match self {
            Self::Postgres => Box::new(PostgreSqlDialect {}),
            Self::MySql => Box::new(MySqlDialect {}),
            Self::MsSql => Box::new(MsSqlDialect {}),
            Self::Sqlite => Box::new(SQLiteDialect {}),
            Self::Generic => Box::new(GenericDialect {}),
        }
    }
}

/// One statement of a batch, with its original text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedStatement {
    pub text: String,
    pub kind: StatementKind,
}

/// Split `sql` into statements and classify each of them.
///
/// If the text cannot be tokenized (an unterminated quote, say) the whole text
/// is returned as a single unclassified statement and the driver reports the
/// actual error.
pub fn split_statements(dialect: SqlDialect, sql: &str) -> Vec<IdentifiedStatement> {
    let parser_dialect = dialect.parser_dialect();
    let tokens = match Tokenizer::new(&*parser_dialect, sql)
        .with_unescape(false)
        .tokenize_with_location()
    {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::debug!(error = %err, "Statement tokenization failed");
            return single_unknown(sql);
        }
    };

    let offsets = LineOffsets::new(sql);
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut current: Vec<&TokenWithSpan> = Vec::new();
    // BEGIN ... END nesting inside a trigger or routine body
    let mut depth = 0usize;

    for (idx, token) in tokens.iter().enumerate() {
        match keyword(&token.token).as_deref() {
            Some("BEGIN") if depth > 0 || is_routine_definition(&current) => depth += 1,
            Some("CASE") if depth > 0 => depth += 1,
            Some("END") if depth > 0 && !closes_control_flow(&tokens[idx + 1..]) => depth -= 1,
            _ => {}
        }

        if token.token == Token::SemiColon && depth == 0 {
            let end = offsets.byte_offset(sql, token.span.start);
            push_statement(&mut statements, &sql[start..end], &current);
            start = end + 1;
            current.clear();
        } else {
            current.push(token);
        }
    }
    if start <= sql.len() {
        push_statement(&mut statements, &sql[start..], &current);
    }

    statements
}

/// `CREATE [OR REPLACE] TRIGGER|FUNCTION|PROCEDURE ...`, whose body may hold
/// semicolons.
fn is_routine_definition(tokens: &[&TokenWithSpan]) -> bool {
    let mut words = tokens.iter().filter_map(|t| keyword(&t.token));
    if words.next().as_deref() != Some("CREATE") {
        return false;
    }
    words
        .take(6)
        .any(|kw| matches!(kw.as_str(), "TRIGGER" | "FUNCTION" | "PROCEDURE" | "PROC"))
}

/// `END IF`, `END LOOP`, ... close a control-flow statement, not a block.
fn closes_control_flow(rest: &[TokenWithSpan]) -> bool {
    rest.iter()
        .find(|t| !matches!(t.token, Token::Whitespace(_)))
        .and_then(|t| keyword(&t.token))
        .is_some_and(|kw| matches!(kw.as_str(), "IF" | "LOOP" | "WHILE" | "REPEAT"))
}

/// Classify a single statement.
pub fn identify(dialect: SqlDialect, sql: &str) -> StatementKind {
    split_statements(dialect, sql)
        .first()
        .map_or(StatementKind::Unknown, |s| s.kind)
}

fn single_unknown(sql: &str) -> Vec<IdentifiedStatement> {
    let text = sql.trim();
    if text.is_empty() {
        return Vec::new();
    }
    vec![IdentifiedStatement {
        text: text.to_string(),
        kind: StatementKind::Unknown,
    }]
}

fn push_statement(out: &mut Vec<IdentifiedStatement>, text: &str, tokens: &[&TokenWithSpan]) {
    let significant: Vec<&Token> = tokens
        .iter()
        .map(|t| &t.token)
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();
    if significant.is_empty() {
        return;
    }
    out.push(IdentifiedStatement {
        text: text.trim().to_string(),
        kind: classify(&significant),
    });
}

/// Upper-cased text of an unquoted word token.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
        _ => None,
    }
}

fn classify(tokens: &[&Token]) -> StatementKind {
    let Some(first) = tokens.first().and_then(|t| keyword(t)) else {
        return StatementKind::Unknown;
    };

    match first.as_str() {
        "SELECT" | "VALUES" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "TRUNCATE" => StatementKind::Truncate,
        "SHOW" | "DESCRIBE" | "DESC" | "PRAGMA" => StatementKind::Show,
        "EXPLAIN" => StatementKind::Explain,
        "WITH" => classify_cte(tokens),
        "CREATE" => classify_ddl(tokens, DdlVerb::Create),
        "DROP" => classify_ddl(tokens, DdlVerb::Drop),
        "ALTER" => classify_ddl(tokens, DdlVerb::Alter),
        _ => StatementKind::Unknown,
    }
}

/// The statement a `WITH` clause feeds: the first DML keyword at depth zero.
fn classify_cte(tokens: &[&Token]) -> StatementKind {
    let mut depth = 0i32;
    for token in tokens.iter().skip(1) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            _ if depth == 0 => match keyword(token).as_deref() {
                Some("SELECT") => return StatementKind::Select,
                Some("INSERT") => return StatementKind::Insert,
                Some("UPDATE") => return StatementKind::Update,
                Some("DELETE") => return StatementKind::Delete,
                _ => {}
            },
            _ => {}
        }
    }
    StatementKind::Unknown
}

#[derive(Clone, Copy)]
enum DdlVerb {
    Create,
    Drop,
    Alter,
}

fn classify_ddl(tokens: &[&Token], verb: DdlVerb) -> StatementKind {
    use StatementKind::*;

    // Skip modifiers such as OR REPLACE, TEMPORARY, UNIQUE, DEFINER=...
    let object = tokens.iter().skip(1).take(12).find_map(|t| {
        let kw = keyword(t)?;
        match kw.as_str() {
            "DATABASE" | "SCHEMA" | "KEYSPACE" | "TABLE" | "VIEW" | "INDEX" | "TRIGGER"
            | "FUNCTION" | "PROCEDURE" | "PROC" => Some(kw),
            _ => None,
        }
    });

    let Some(object) = object else {
        return Unknown;
    };

    match (verb, object.as_str()) {
        (DdlVerb::Create, "DATABASE" | "KEYSPACE") => CreateDatabase,
        (DdlVerb::Create, "SCHEMA") => CreateSchema,
        (DdlVerb::Create, "TABLE") => CreateTable,
        (DdlVerb::Create, "VIEW") => CreateView,
        (DdlVerb::Create, "INDEX") => CreateIndex,
        (DdlVerb::Create, "TRIGGER") => CreateTrigger,
        (DdlVerb::Create, "FUNCTION") => CreateFunction,
        (DdlVerb::Create, _) => CreateProcedure,
        (DdlVerb::Drop, "DATABASE" | "KEYSPACE") => DropDatabase,
        (DdlVerb::Drop, "SCHEMA") => DropSchema,
        (DdlVerb::Drop, "TABLE") => DropTable,
        (DdlVerb::Drop, "VIEW") => DropView,
        (DdlVerb::Drop, "INDEX") => DropIndex,
        (DdlVerb::Drop, "TRIGGER") => DropTrigger,
        (DdlVerb::Drop, "FUNCTION") => DropFunction,
        (DdlVerb::Drop, _) => DropProcedure,
        (DdlVerb::Alter, "DATABASE" | "KEYSPACE") => AlterDatabase,
        (DdlVerb::Alter, "SCHEMA") => AlterSchema,
        (DdlVerb::Alter, "TABLE") => AlterTable,
        (DdlVerb::Alter, "VIEW") => AlterView,
        (DdlVerb::Alter, "INDEX") => AlterIndex,
        (DdlVerb::Alter, "TRIGGER") => AlterTrigger,
        (DdlVerb::Alter, "FUNCTION") => AlterFunction,
        (DdlVerb::Alter, _) => AlterProcedure,
    }
}

/// Maps tokenizer locations (1-based line, 1-based char column) to byte offsets.
struct LineOffsets {
    starts: Vec<usize>,
}

impl LineOffsets {
    fn new(sql: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(sql.match_indices('\n').map(|(idx, _)| idx + 1));
        Self { starts }
    }

    fn byte_offset(&self, sql: &str, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&line_start) = self.starts.get(line) else {
            return sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);
        sql[line_start..]
            .char_indices()
            .nth(column)
            .map_or(sql.len(), |(idx, _)| line_start + idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_batch_and_classifies() {
        let statements = split_statements(
            SqlDialect::Postgres,
            "SELECT 1; INSERT INTO t VALUES (1);\nDELETE FROM t",
        );
        let kinds: Vec<_> = statements.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StatementKind::Select, StatementKind::Insert, StatementKind::Delete]
        );
        assert_eq!(statements[1].text, "INSERT INTO t VALUES (1)");
        assert_eq!(statements[2].text, "DELETE FROM t");
    }

    #[test]
    fn quoted_semicolons_stay_inside_statement() {
        let sql = "SELECT 'a;b', \"c;d\" FROM t -- x;y\n; UPDATE t SET v = 'é;'";
        let statements = split_statements(SqlDialect::Postgres, sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].text, "SELECT 'a;b', \"c;d\" FROM t -- x;y");
        assert_eq!(statements[1].kind, StatementKind::Update);
        assert_eq!(statements[1].text, "UPDATE t SET v = 'é;'");
    }

    #[test]
    fn empty_statements_are_dropped() {
        let statements = split_statements(SqlDialect::MySql, " ; SELECT 1;; ");
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].kind, StatementKind::Select);
        assert!(split_statements(SqlDialect::Generic, "  ").is_empty());
    }

    #[test]
    fn cte_resolves_to_main_statement() {
        assert_eq!(
            identify(
                SqlDialect::Postgres,
                "WITH x AS (SELECT 1) DELETE FROM t WHERE id IN (SELECT * FROM x)"
            ),
            StatementKind::Delete
        );
        assert_eq!(
            identify(SqlDialect::Sqlite, "WITH RECURSIVE c(x) AS (SELECT 1) SELECT * FROM c"),
            StatementKind::Select
        );
    }

    #[test]
    fn ddl_object_is_detected() {
        assert_eq!(
            identify(SqlDialect::Postgres, "CREATE OR REPLACE VIEW v AS SELECT 1"),
            StatementKind::CreateView
        );
        assert_eq!(
            identify(SqlDialect::Postgres, "CREATE UNIQUE INDEX i ON t (a)"),
            StatementKind::CreateIndex
        );
        assert_eq!(
            identify(SqlDialect::MySql, "DROP TABLE IF EXISTS t"),
            StatementKind::DropTable
        );
        assert_eq!(
            identify(SqlDialect::MsSql, "ALTER PROCEDURE p AS SELECT 1"),
            StatementKind::AlterProcedure
        );
        assert_eq!(identify(SqlDialect::Generic, "VACUUM"), StatementKind::Unknown);
    }

    #[test]
    fn trigger_body_stays_in_one_statement() {
        let sql = "CREATE TRIGGER tr AFTER INSERT ON a BEGIN\n  INSERT INTO b VALUES (NEW.v);\n  UPDATE c SET n = CASE WHEN n > 0 THEN n + 1 ELSE 1 END;\nEND;\nSELECT 1";
        let statements = split_statements(SqlDialect::Sqlite, sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].kind, StatementKind::CreateTrigger);
        assert!(statements[0].text.ends_with("END"));
        assert_eq!(statements[1].kind, StatementKind::Select);
    }

    #[test]
    fn procedure_control_flow_does_not_close_the_body() {
        let sql = "CREATE PROCEDURE p() BEGIN IF 1 THEN SELECT 1; END IF; SELECT 2; END; CALL p()";
        let statements = split_statements(SqlDialect::MySql, sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].kind, StatementKind::CreateProcedure);
        assert_eq!(statements[1].text, "CALL p()");
    }

    #[test]
    fn transaction_begin_still_splits() {
        let statements = split_statements(SqlDialect::Sqlite, "BEGIN; DELETE FROM t; COMMIT");
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[1].kind, StatementKind::Delete);
    }

    #[test]
    fn unterminated_quote_falls_back_to_whole_text() {
        let statements = split_statements(SqlDialect::Postgres, "SELECT 'oops; SELECT 2");
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].kind, StatementKind::Unknown);
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&StatementKind::CreateTable).expect("serialize");
        assert_eq!(json, "\"CREATE_TABLE\"");
        assert!(StatementKind::Select.returns_rows());
        assert!(!StatementKind::Insert.returns_rows());
    }
}
