//! Built-in engine adapters

pub mod cassandra;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;

use crate::engine::error::{EngineError, EngineResult};

/// Resource created by `connect()`, or `NoConnection` before it ran.
pub(crate) fn require_connection<T>(resource: Option<&T>) -> EngineResult<&T> {
    resource.ok_or(EngineError::NoConnection)
}

/// The `index`-th whitespace separated word of a version banner.
pub(crate) fn parse_version_word(banner: &str, index: usize) -> String {
    banner
        .split_whitespace()
        .nth(index)
        .map(|word| word.trim_end_matches(',').to_string())
        .unwrap_or_else(|| "0.0.0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_postgres_banner() {
        let banner = "PostgreSQL 16.2 on x86_64-pc-linux-gnu, compiled by gcc";
        assert_eq!(parse_version_word(banner, 1), "16.2");
        assert_eq!(parse_version_word("", 1), "0.0.0");
    }
}
