//! Regex-based SQL metadata extraction.
//!
//! Recovers the tables and columns a SQL string references, excluding table
//! aliases. This is pattern matching, not parsing: SQL the patterns were not
//! tuned against (subqueries, CTEs, computed expressions) may be
//! misidentified, and that is accepted behavior.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tables, columns, and query-type tag extracted from one SQL string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlMetadata {
    pub tables_used: Vec<String>,
    pub columns_used: Vec<String>,
    pub query_type: Vec<String>,
}

static FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)FROM\s+([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());
static JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)JOIN\s+([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());
static ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)FROM\s+([a-zA-Z_][a-zA-Z0-9_]*)\s+([a-zA-Z_][a-zA-Z0-9_]*)|JOIN\s+([a-zA-Z_][a-zA-Z0-9_]*)\s+([a-zA-Z_][a-zA-Z0-9_]*)",
    )
    .unwrap()
});
static QUALIFIED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\s*\.\s*([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());
static SELECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)SELECT\s+(.*?)\s+FROM").unwrap());
static AS_ALIAS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+AS\s+[a-zA-Z_][a-zA-Z0-9_]*").unwrap());
static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\b").unwrap());

/// Function names that can appear as the qualifier of a dotted reference
/// without naming a table.
const QUALIFIER_DENY_LIST: [&str; 5] = ["DATE", "FROM_UNIXTIME", "CAST", "LOWER", "SUM"];

/// Keywords and functions that show up as bare identifiers in SELECT lists.
const SELECT_DENY_LIST: [&str; 8] = [
    "DATE",
    "FROM_UNIXTIME",
    "CAST",
    "AS",
    "DOUBLE",
    "SUM",
    "LOWER",
    "TOTAL_VOLUME",
];

/// Extract table and column references from a SQL string, excluding aliases.
pub fn extract_sql_metadata(sql_query: &str) -> SqlMetadata {
    let mut tables: BTreeSet<String> = BTreeSet::new();
    let mut columns: BTreeSet<String> = BTreeSet::new();

    // Table names following FROM and JOIN keywords
    for caps in FROM_RE.captures_iter(sql_query) {
        tables.insert(caps[1].to_string());
    }
    for caps in JOIN_RE.captures_iter(sql_query) {
        tables.insert(caps[1].to_string());
    }

    // Aliases: the identifier trailing a FROM/JOIN table name
    let mut aliases: BTreeSet<String> = BTreeSet::new();
    for caps in ALIAS_RE.captures_iter(sql_query) {
        if let Some(alias) = caps.get(2) {
            aliases.insert(alias.as_str().to_string());
        }
        if let Some(alias) = caps.get(4) {
            aliases.insert(alias.as_str().to_string());
        }
    }

    // Dotted references: the column is always collected, the qualifier only
    // counts as a table when it is neither a known alias nor a function name
    for caps in QUALIFIED_RE.captures_iter(sql_query) {
        let qualifier = &caps[1];
        let column = &caps[2];
        if QUALIFIER_DENY_LIST.contains(&qualifier) {
            continue;
        }
        columns.insert(column.to_string());
        if !aliases.contains(qualifier) {
            tables.insert(qualifier.to_string());
        }
    }

    // Bare identifiers in the SELECT list, after stripping AS aliases and
    // dotted references
    if let Some(caps) = SELECT_RE.captures(sql_query) {
        let select_clause = AS_ALIAS_RE.replace_all(&caps[1], "");
        let select_clause = QUALIFIED_RE.replace_all(&select_clause, "");
        for caps in IDENT_RE.captures_iter(&select_clause) {
            let ident = &caps[1];
            if SELECT_DENY_LIST.contains(&ident.to_uppercase().as_str())
                || aliases.contains(ident)
            {
                continue;
            }
            columns.insert(ident.to_string());
        }
    }

    SqlMetadata {
        tables_used: tables.into_iter().collect(),
        columns_used: columns.into_iter().collect(),
        query_type: vec!["SELECT".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let meta = extract_sql_metadata("SELECT title, reps FROM sets");
        assert_eq!(meta.tables_used, vec!["sets"]);
        assert_eq!(meta.columns_used, vec!["reps", "title"]);
        assert_eq!(meta.query_type, vec!["SELECT"]);
    }

    #[test]
    fn test_aliases_excluded_from_tables_and_columns() {
        let sql = "SELECT w.name, SUM(s.weight_kg) AS total_volume \
                   FROM workouts w JOIN sets s ON s.workout_id = w.id \
                   WHERE LOWER(w.name) = 'push day'";
        let meta = extract_sql_metadata(sql);
        assert_eq!(meta.tables_used, vec!["sets", "workouts"]);
        assert_eq!(
            meta.columns_used,
            vec!["id", "name", "weight_kg", "workout_id"]
        );
        assert!(!meta.columns_used.contains(&"w".to_string()));
        assert!(!meta.columns_used.contains(&"s".to_string()));
        assert!(!meta.columns_used.contains(&"total_volume".to_string()));
    }

    #[test]
    fn test_function_qualifiers_are_not_tables() {
        let sql = "SELECT CAST(s.weight_kg AS DOUBLE) FROM sets s";
        let meta = extract_sql_metadata(sql);
        assert_eq!(meta.tables_used, vec!["sets"]);
        assert_eq!(meta.columns_used, vec!["weight_kg"]);
    }

    #[test]
    fn test_lowercase_keywords() {
        let meta = extract_sql_metadata("select name from workouts");
        assert_eq!(meta.tables_used, vec!["workouts"]);
        assert_eq!(meta.columns_used, vec!["name"]);
    }

    #[test]
    fn test_unqualified_table_reference_in_where() {
        let sql = "SELECT exercises.title FROM exercises WHERE exercises.muscle_group = 'chest'";
        let meta = extract_sql_metadata(sql);
        assert_eq!(meta.tables_used, vec!["exercises"]);
        assert_eq!(meta.columns_used, vec!["muscle_group", "title"]);
    }

    #[test]
    fn test_idempotent_on_same_input() {
        let sql = "SELECT w.name FROM workouts w JOIN exercises e ON e.workout_id = w.id";
        assert_eq!(extract_sql_metadata(sql), extract_sql_metadata(sql));
    }
}
