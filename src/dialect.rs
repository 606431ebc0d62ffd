//! Per-dialect SQL rendering. The compiler never formats dialect-sensitive
//! SQL itself: it goes through a [`DialectAdapter`] plus a table of
//! operator format templates, so adding a dialect never touches the
//! compiler.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::ast::{Operation, SortCondition};
use crate::error::{CompileError, CompileResult};
use crate::metadata::SqlType;

/// Substitutes `%s` placeholders of an operator template, left to right.
pub fn fill_template(template: &str, args: &[String]) -> String {
    let mut out = String::new();
    let mut parts = template.split("%s");
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    let mut args = args.iter();
    for part in parts {
        if let Some(arg) = args.next() {
            out.push_str(arg);
        }
        out.push_str(part);
    }
    out
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegexFlags {
    pub case_insensitive: bool,
    pub multi_line: bool,
    pub dot_all: bool,
}

/// Rendering capabilities of one SQL dialect. Defaults are SQL-99-flavoured;
/// a concrete dialect overrides what its DBMS spells differently. Optional
/// capabilities return `Option`/`Err` and surface as *unsupported operation*
/// when a query reaches for them.
pub trait DialectAdapter {
    fn quote(&self, name: &str) -> String {
        format!("\"{}\"", name)
    }

    /// `"table" "alias"`, as it appears in a FROM clause.
    fn table_alias(&self, table: &str, alias: &str) -> String {
        format!("{} {}", table, alias)
    }

    fn cast(&self, expr: &str, sql_type: SqlType) -> String {
        format!("CAST({} AS {})", expr, sql_type.sql_name())
    }

    /// A one-row table usable when a rule body has no data atom.
    fn dummy_table(&self) -> String {
        "SELECT 1".to_owned()
    }

    fn lexical_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn lexical_boolean(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_owned()
    }

    fn lexical_datetime(&self, value: &str) -> String {
        self.lexical_string(value)
    }

    fn str_concat(&self, parts: &[String]) -> String {
        format!("({})", parts.iter().join(" || "))
    }

    fn str_length(&self, expr: &str) -> String {
        format!("LENGTH({})", expr)
    }

    fn str_ucase(&self, expr: &str) -> String {
        format!("UPPER({})", expr)
    }

    fn str_lcase(&self, expr: &str) -> String {
        format!("LOWER({})", expr)
    }

    fn str_substr2(&self, expr: &str, start: &str) -> String {
        format!("SUBSTR({}, {})", expr, start)
    }

    fn str_substr3(&self, expr: &str, start: &str, length: &str) -> String {
        format!("SUBSTR({}, {}, {})", expr, start, length)
    }

    fn str_starts(&self, expr: &str, prefix: &str) -> String {
        format!("SUBSTR({}, 1, LENGTH({})) = {}", expr, prefix, prefix)
    }

    fn str_ends(&self, expr: &str, suffix: &str) -> String {
        format!(
            "SUBSTR({}, LENGTH({}) - LENGTH({}) + 1) = {}",
            expr, expr, suffix, suffix
        )
    }

    fn str_contains(&self, expr: &str, part: &str) -> String {
        format!("{} LIKE ('%' || {} || '%')", expr, part)
    }

    fn str_before(&self, expr: &str, mark: &str) -> String {
        format!("SUBSTR({}, 1, INSTR({}, {}) - 1)", expr, expr, mark)
    }

    fn str_after(&self, expr: &str, mark: &str) -> String {
        format!(
            "SUBSTR({}, INSTR({}, {}) + LENGTH({}))",
            expr, expr, mark, mark
        )
    }

    fn str_replace(&self, expr: &str, from: &str, to: &str) -> String {
        format!("REPLACE({}, {}, {})", expr, from, to)
    }

    /// Percent-encoding is dialect work; by default the value is passed
    /// through unchanged.
    fn str_encode_for_uri(&self, expr: &str) -> String {
        expr.to_owned()
    }

    fn date_part(&self, part: &str, expr: &str) -> String {
        format!("EXTRACT({} FROM {})", part, expr)
    }

    fn date_tz(&self, _expr: &str) -> CompileResult<String> {
        Err(CompileError::Unsupported("TZ".to_owned()))
    }

    fn hash_md5(&self, _expr: &str) -> CompileResult<String> {
        Err(CompileError::Unsupported("MD5".to_owned()))
    }

    fn hash_sha1(&self, _expr: &str) -> CompileResult<String> {
        Err(CompileError::Unsupported("SHA1".to_owned()))
    }

    fn hash_sha256(&self, _expr: &str) -> CompileResult<String> {
        Err(CompileError::Unsupported("SHA256".to_owned()))
    }

    fn hash_sha512(&self, _expr: &str) -> CompileResult<String> {
        Err(CompileError::Unsupported("SHA512".to_owned()))
    }

    fn regex(&self, expr: &str, pattern: &str, flags: RegexFlags) -> CompileResult<String> {
        let mut flag_str = String::new();
        if flags.case_insensitive {
            flag_str.push('i');
        }
        if flags.multi_line {
            flag_str.push('m');
        }
        if flags.dot_all {
            flag_str.push('s');
        }
        Ok(if flag_str.is_empty() {
            format!("REGEXP_LIKE({}, {})", expr, pattern)
        } else {
            format!("REGEXP_LIKE({}, {}, '{}')", expr, pattern, flag_str)
        })
    }

    fn ceil_template(&self) -> String {
        "CEIL(%s)".to_owned()
    }

    fn round_template(&self) -> String {
        "ROUND(%s)".to_owned()
    }

    fn now(&self) -> Option<String> {
        Some("CURRENT_TIMESTAMP".to_owned())
    }

    fn uuid(&self) -> Option<String> {
        None
    }

    fn str_uuid(&self) -> Option<String> {
        None
    }

    /// Pagination clause; -1 means unset on either side.
    fn slice(&self, limit: i64, offset: i64) -> String {
        match (limit < 0, offset < 0) {
            (true, true) => String::new(),
            (true, false) => format!("LIMIT -1 OFFSET {}", offset),
            (false, true) => format!("LIMIT {}", limit),
            (false, false) => format!("LIMIT {} OFFSET {}", limit, offset),
        }
    }

    fn order_by_and_slice(
        &self,
        conditions: &[SortCondition],
        view_name: &str,
        limit: i64,
        offset: i64,
    ) -> String {
        let order = conditions
            .iter()
            .map(|c| {
                let column = format!("{}.{}", self.quote(view_name), self.quote(&c.variable));
                if c.descending {
                    format!("{} DESC", column)
                } else {
                    column
                }
            })
            .join(", ");
        let mut clause = format!("ORDER BY {}", order);
        let slice = self.slice(limit, offset);
        if !slice.is_empty() {
            clause.push('\n');
            clause.push_str(&slice);
        }
        clause
    }

    /// Longest identifier the DBMS accepts, when limited.
    fn max_identifier_length(&self) -> Option<usize> {
        None
    }

    /// Builds a view name from its parts, truncated to the identifier limit
    /// and disambiguated against already-allocated names.
    fn name_view(&self, prefix: &str, intermediate: &str, suffix: &str, taken: &HashSet<String>) -> String {
        let raw = format!("{}{}{}", prefix, intermediate, suffix);
        self.disambiguate(raw, taken)
    }

    /// Same scheme for top-level column aliases.
    fn name_top_variable(&self, base: &str, suffix: &str, taken: &HashSet<String>) -> String {
        let raw = format!("{}{}", base, suffix);
        self.disambiguate(raw, taken)
    }

    fn disambiguate(&self, raw: String, taken: &HashSet<String>) -> String {
        let truncate = |s: &str| match self.max_identifier_length() {
            Some(max) if s.len() > max => s[..max].to_owned(),
            _ => s.to_owned(),
        };
        let candidate = truncate(&raw);
        if !taken.contains(&candidate) {
            return candidate;
        }
        for i in 0.. {
            let numbered = truncate(&format!("{}{}", raw, i));
            if !taken.contains(&numbered) {
                return numbered;
            }
        }
        unreachable!()
    }
}

/// SQL-99-flavoured dialect: the trait defaults, unchanged. The emitted SQL
/// is also what the in-memory SQLite of the test suite accepts.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericDialect;

impl DialectAdapter for GenericDialect {}

/// Operator format templates for the active dialect. Operators a dialect
/// cannot render are left out of the table, and looking them up fails with
/// an *unsupported operation* error.
pub fn build_operations(dialect: &dyn DialectAdapter) -> HashMap<Operation, String> {
    let mut table = HashMap::new();
    let mut put = |op: Operation, template: &str| {
        table.insert(op, template.to_owned());
    };

    put(Operation::Add, "%s + %s");
    put(Operation::Subtract, "%s - %s");
    put(Operation::Multiply, "%s * %s");
    put(Operation::Divide, "(1.0 * %s) / %s");
    put(Operation::Abs, "ABS(%s)");
    put(Operation::Floor, "FLOOR(%s)");
    put(Operation::Eq, "%s = %s");
    put(Operation::Neq, "%s <> %s");
    put(Operation::Gt, "%s > %s");
    put(Operation::Gte, "%s >= %s");
    put(Operation::Lt, "%s < %s");
    put(Operation::Lte, "%s <= %s");
    put(Operation::And, "%s AND %s");
    put(Operation::Or, "%s OR %s");
    put(Operation::Not, "NOT %s");
    put(Operation::IsNull, "%s IS NULL");
    put(Operation::IsNotNull, "%s IS NOT NULL");
    put(Operation::IsTrue, "%s IS TRUE");
    put(Operation::Like, "%s LIKE %s");

    table.insert(Operation::Ceil, dialect.ceil_template());
    table.insert(Operation::Round, dialect.round_template());
    if let Some(now) = dialect.now() {
        table.insert(Operation::Now, now);
    }
    if let Some(uuid) = dialect.uuid() {
        table.insert(Operation::Uuid, uuid);
    }
    if let Some(str_uuid) = dialect.str_uuid() {
        table.insert(Operation::StrUuid, str_uuid);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution_is_positional() {
        assert_eq!(
            fill_template("%s + %s", &["a".to_owned(), "b".to_owned()]),
            "a + b"
        );
        assert_eq!(fill_template("ABS(%s)", &["x".to_owned()]), "ABS(x)");
        assert_eq!(fill_template("CURRENT_TIMESTAMP", &[]), "CURRENT_TIMESTAMP");
    }

    #[test]
    fn view_names_avoid_collisions() {
        let dialect = GenericDialect;
        let mut taken = HashSet::new();
        let first = dialect.name_view("Q", "ans2", "View", &taken);
        assert_eq!(first, "Qans2View");
        taken.insert(first);
        let second = dialect.name_view("Q", "ans2", "View", &taken);
        assert_eq!(second, "Qans2View0");
    }

    #[test]
    fn slice_renders_each_combination() {
        let dialect = GenericDialect;
        assert_eq!(dialect.slice(-1, -1), "");
        assert_eq!(dialect.slice(10, -1), "LIMIT 10");
        assert_eq!(dialect.slice(-1, 5), "LIMIT -1 OFFSET 5");
        assert_eq!(dialect.slice(10, 5), "LIMIT 10 OFFSET 5");
    }
}
