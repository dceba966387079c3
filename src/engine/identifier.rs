//! Identifier quoting per engine

use crate::engine::types::EngineKind;

/// Quoting style used by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `"name"`, with `"` doubled
    Double,
    /// `` `name` ``, with the backtick doubled
    Backtick,
    /// `[name]`, with `]` doubled
    Bracket,
}

impl QuoteStyle {
    pub fn for_engine(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Mysql | EngineKind::Mariadb => Self::Backtick,
            EngineKind::Sqlserver => Self::Bracket,
            EngineKind::Postgresql
            | EngineKind::Redshift
            | EngineKind::Sqlite
            | EngineKind::Cassandra => Self::Double,
        }
    }

    fn quote(self, name: &str) -> String {
        match self {
            Self::Double => format!("\"{}\"", name.replace('"', "\"\"")),
            Self::Backtick => format!("`{}`", name.replace('`', "``")),
            Self::Bracket => format!("[{}]", name.replace(']', "]]")),
        }
    }
}

/// Quote `name` for `kind`.
///
/// `*` passes through unchanged. Engines with array columns keep a trailing
/// subscript such as `tags[1]` outside the quotes.
pub fn wrap_identifier(kind: EngineKind, name: &str) -> String {
    if name == "*" {
        return name.to_string();
    }

    let style = QuoteStyle::for_engine(kind);
    let keeps_subscript = matches!(
        kind,
        EngineKind::Postgresql | EngineKind::Redshift | EngineKind::Cassandra
    );

    if keeps_subscript {
        if let Some((base, subscript)) = split_subscript(name) {
            return format!("{}{}", style.quote(base), subscript);
        }
    }

    style.quote(name)
}

/// Split `col[12]` into `("col", "[12]")`.
fn split_subscript(name: &str) -> Option<(&str, &str)> {
    let stripped = name.strip_suffix(']')?;
    let open = stripped.rfind('[')?;
    let digits = &stripped[open + 1..];
    if open == 0 || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((&name[..open], &name[open..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_passes_through() {
        for kind in EngineKind::ALL {
            assert_eq!(wrap_identifier(kind, "*"), "*");
        }
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(
            wrap_identifier(EngineKind::Postgresql, "we\"ird"),
            "\"we\"\"ird\""
        );
        assert_eq!(wrap_identifier(EngineKind::Mysql, "a`b"), "`a``b`");
        assert_eq!(wrap_identifier(EngineKind::Sqlserver, "a]b"), "[a]]b]");
        assert_eq!(wrap_identifier(EngineKind::Sqlite, "users"), "\"users\"");
    }

    /// How the engine reads a quoted identifier back.
    fn unquote(style: QuoteStyle, quoted: &str) -> String {
        let (open, close) = match style {
            QuoteStyle::Double => ('"', '"'),
            QuoteStyle::Backtick => ('`', '`'),
            QuoteStyle::Bracket => ('[', ']'),
        };
        let inner = quoted
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
            .expect("quoted identifier");
        inner.replace(&format!("{close}{close}"), &close.to_string())
    }

    #[test]
    fn wrapping_twice_names_the_once_wrapped_identifier() {
        let cases = [
            (EngineKind::Postgresql, "a\"b", "\"\"\"a\"\"\"\"b\"\"\""),
            (EngineKind::Sqlite, "a\"b", "\"\"\"a\"\"\"\"b\"\"\""),
            (EngineKind::Cassandra, "a\"b", "\"\"\"a\"\"\"\"b\"\"\""),
            (EngineKind::Mysql, "a`b", "```a````b```"),
            (EngineKind::Sqlserver, "a]b", "[[a]]]]b]]]"),
        ];
        for (kind, name, twice) in cases {
            let style = QuoteStyle::for_engine(kind);
            let once = wrap_identifier(kind, name);
            assert_eq!(wrap_identifier(kind, &once), twice, "{kind}");
            assert_eq!(unquote(style, twice), once, "{kind}");
            assert_eq!(unquote(style, &once), name, "{kind}");
        }
    }

    #[test]
    fn array_subscript_stays_outside_quotes() {
        assert_eq!(
            wrap_identifier(EngineKind::Postgresql, "tags[1]"),
            "\"tags\"[1]"
        );
        assert_eq!(
            wrap_identifier(EngineKind::Cassandra, "items[20]"),
            "\"items\"[20]"
        );
        assert_eq!(
            wrap_identifier(EngineKind::Sqlite, "tags[1]"),
            "\"tags[1]\""
        );
        assert_eq!(
            wrap_identifier(EngineKind::Postgresql, "odd[x]"),
            "\"odd[x]\""
        );
    }
}
