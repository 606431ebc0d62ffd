//! The rule-to-SQL compiler. Predicates are compiled bottom-up: every
//! intensional predicate below the outermost one becomes a named derived
//! table (a view) unioning the SQL of its rules, and the outermost
//! predicate's rules are unioned and wrapped with the global query
//! modifiers.
//!
//! Compilation is a pure transformation: all query-dependent state lives in
//! per-call context values, so a generator can be cloned freely and one
//! instance per concurrent compilation is enough.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use tracing::debug;

use crate::analysis::{self, LanguageTag, ProgramAnalysis, TermType};
use crate::ast::{
    BodyAtom, ColType, Constant, Expression, FunctionSymbol, FunctionalTerm, Operation,
    PredicateName, Program, Rule, Term,
};
use crate::dialect::{build_operations, fill_template, DialectAdapter, GenericDialect, RegexFlags};
use crate::error::{CompileError, CompileResult};
use crate::metadata::{DatabaseMetadata, SqlType};
use crate::selfjoin;

const VIEW_PREFIX: &str = "Q";
const VIEW_SUFFIX: &str = "VIEW";
const VIEW_ANS_SUFFIX: &str = "View";
const TYPE_SUFFIX: &str = "QuestType";
const LANG_SUFFIX: &str = "Lang";
const OUTER_VIEW_NAME: &str = "SUB_QVIEW";
const INDENT: &str = "    ";

/// Percent encodings applied to template arguments when IRI-safe encoding
/// is on. `%` itself must come first: it is the innermost REPLACE.
const IRI_SAFE_ENCODINGS: &[(&str, &str)] = &[
    ("%", "%25"),
    (" ", "%20"),
    ("!", "%21"),
    ("\"", "%22"),
    ("#", "%23"),
    ("$", "%24"),
    ("&", "%26"),
    ("'", "%27"),
    ("(", "%28"),
    (")", "%29"),
    ("*", "%2A"),
    ("+", "%2B"),
    (",", "%2C"),
    ("/", "%2F"),
    (":", "%3A"),
    (";", "%3B"),
    ("=", "%3D"),
    ("?", "%3F"),
    ("@", "%40"),
    ("[", "%5B"),
    ("]", "%5D"),
];

#[derive(Clone, Copy, Debug, Default)]
pub struct GeneratorSettings {
    /// Deduplicate in post-processing instead of SQL. When on, DISTINCT
    /// programs still compile to plain SELECT and UNION ALL.
    pub distinct_post_processing: bool,
    /// Percent-encode template arguments with nested REPLACE calls.
    pub iri_safe_encoding: bool,
}

/// The compiled result: one SQL statement plus the caller's signature. Every
/// signature entry corresponds to three physical columns, named
/// `<entry>QuestType`, `<entry>Lang` and `<entry>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlQuery {
    pub sql: String,
    pub signature: Vec<String>,
}

/// A derived table synthesized for an intensional predicate: its name, its
/// 3-columns-per-position attribute list, and its defining SQL.
#[derive(Clone, Debug)]
pub struct ViewDefinition {
    pub name: String,
    pub attributes: Vec<String>,
    pub sql: String,
}

impl ViewDefinition {
    fn value_column(position: usize) -> String {
        format!("v{}", position)
    }

    fn type_column(position: usize) -> String {
        format!("v{}{}", position, TYPE_SUFFIX)
    }

    fn lang_column(position: usize) -> String {
        format!("v{}{}", position, LANG_SUFFIX)
    }
}

pub struct SqlGenerator<D: DialectAdapter = GenericDialect> {
    metadata: DatabaseMetadata,
    dialect: D,
    operations: HashMap<Operation, String>,
    settings: GeneratorSettings,
    replace_open: String,
    replace_close: String,
}

impl<D: DialectAdapter + Clone> Clone for SqlGenerator<D> {
    fn clone(&self) -> Self {
        SqlGenerator {
            metadata: self.metadata.clone(),
            dialect: self.dialect.clone(),
            operations: self.operations.clone(),
            settings: self.settings,
            replace_open: self.replace_open.clone(),
            replace_close: self.replace_close.clone(),
        }
    }
}

impl SqlGenerator<GenericDialect> {
    pub fn with_defaults(metadata: DatabaseMetadata) -> Self {
        SqlGenerator::new(metadata, GenericDialect, GeneratorSettings::default())
    }
}

impl<D: DialectAdapter> SqlGenerator<D> {
    pub fn new(metadata: DatabaseMetadata, dialect: D, settings: GeneratorSettings) -> Self {
        let operations = build_operations(&dialect);
        let (replace_open, replace_close) = if settings.iri_safe_encoding {
            let mut open = String::new();
            let mut close = String::new();
            for (raw, encoded) in IRI_SAFE_ENCODINGS {
                open.push_str("REPLACE(");
                close.push_str(&format!(", '{}', '{}')", raw, encoded));
            }
            (open, close)
        } else {
            (String::new(), String::new())
        };
        SqlGenerator {
            metadata,
            dialect,
            operations,
            settings,
            replace_open,
            replace_close,
        }
    }

    /// Compiles the whole program into one SQL statement projecting
    /// `signature`. The self-join normalizer runs first as a structural
    /// rewrite, then predicates are compiled bottom-up.
    pub fn generate(&self, program: &Program, signature: &[String]) -> CompileResult<SqlQuery> {
        let mut program = program.clone();
        selfjoin::normalize_left_joins(&mut program, &self.metadata);

        let analysis = analysis::analyze(&program, &self.metadata)?;
        let mut ctx = CompileCtx {
            analysis: &analysis,
            views: HashMap::new(),
            is_distinct: program.modifiers.distinct,
        };

        let root = analysis.root().to_owned();
        let root_rules = &analysis.rule_index[&root];
        let root_arity = root_rules[0].head.arity();
        if signature.len() != root_arity {
            return Err(CompileError::Unsupported(format!(
                "signature has {} names but {} projects {} positions",
                signature.len(),
                root,
                root_arity
            )));
        }

        let mut taken_view_names: HashSet<String> = HashSet::new();
        for pred in &analysis.bottom_up {
            if pred == &root || !analysis.is_intensional(pred) {
                continue;
            }
            let view = self.create_view(pred, &ctx, &mut taken_view_names)?;
            debug!(predicate = %pred, view = %view.name, "view synthesized");
            ctx.views.insert(pred.clone(), view);
        }

        let mut query_strings = Vec::with_capacity(root_rules.len());
        for (i, rule) in root_rules.iter().enumerate() {
            query_strings.push(self.compile_rule(rule, (&root, i), Some(signature), &ctx)?);
        }
        let unioned = self.union_of(query_strings, ctx.is_distinct);

        let modifiers = &program.modifiers;
        let sql = if !modifiers.order.is_empty() || modifiers.has_slice() {
            let modifier = if !modifiers.order.is_empty() {
                self.dialect.order_by_and_slice(
                    &modifiers.order,
                    OUTER_VIEW_NAME,
                    modifiers.limit,
                    modifiers.offset,
                )
            } else {
                self.dialect.slice(modifiers.limit, modifiers.offset)
            };
            format!(
                "SELECT *\nFROM (\n{}\n) {}\n{}\n",
                unioned, OUTER_VIEW_NAME, modifier
            )
        } else {
            unioned
        };
        debug!(sql = %sql, "query compiled");

        Ok(SqlQuery {
            sql,
            signature: signature.to_vec(),
        })
    }

    fn union_of(&self, queries: Vec<String>, is_distinct: bool) -> String {
        let keyword = if is_distinct && !self.settings.distinct_post_processing {
            "UNION"
        } else {
            "UNION ALL"
        };
        queries.join(&format!("\n{}\n", keyword))
    }

    /// Unions the SQL of every rule of an intensional predicate into a named
    /// view, consumed downstream like a base relation.
    fn create_view(
        &self,
        predicate: &str,
        ctx: &CompileCtx<'_>,
        taken_names: &mut HashSet<String>,
    ) -> CompileResult<ViewDefinition> {
        let rules = &ctx.analysis.rule_index[predicate];
        let mut head_arity = 0;
        let mut sqls = Vec::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            head_arity = rule.head.arity();
            sqls.push(self.compile_rule(rule, (predicate, i), None, ctx)?);
        }

        let union_view = if sqls.len() == 1 {
            sqls.pop().expect("a predicate always has a rule")
        } else {
            format!("({})", sqls.iter().join(")\n UNION ALL \n ("))
        };

        let name = self.dialect.name_view(
            VIEW_PREFIX,
            &escape_name(predicate),
            VIEW_ANS_SUFFIX,
            taken_names,
        );
        taken_names.insert(name.clone());

        let attributes = (0..head_arity)
            .flat_map(|i| {
                [
                    ViewDefinition::type_column(i),
                    ViewDefinition::lang_column(i),
                    ViewDefinition::value_column(i),
                ]
            })
            .collect();

        Ok(ViewDefinition {
            name,
            attributes,
            sql: union_view,
        })
    }

    /// Renders one rule into a single select-project-join block.
    fn compile_rule(
        &self,
        rule: &Rule,
        rule_key: (&str, usize),
        signature: Option<&[String]>,
        ctx: &CompileCtx<'_>,
    ) -> CompileResult<String> {
        let index = AliasIndex::build(rule, &ctx.views, &self.metadata, &self.dialect)?;
        let inner_distinct = ctx.is_distinct && !self.settings.distinct_post_processing;

        let select = self.select_clause(rule, rule_key, signature, inner_distinct, ctx, &index)?;
        let from = self.from_clause(&rule.body, &index)?;
        let where_clause = self.where_clause(&rule.body, &index)?;
        let group = self.group_by_clause(&rule.body, &index)?;
        let having = self.having_clause(&rule.body, &index)?;

        Ok(format!("{}{}{}{}{}", select, from, where_clause, group, having))
    }

    // ---- SELECT ----------------------------------------------------------

    fn select_clause(
        &self,
        rule: &Rule,
        rule_key: (&str, usize),
        signature: Option<&[String]>,
        distinct: bool,
        ctx: &CompileCtx<'_>,
        index: &AliasIndex,
    ) -> CompileResult<String> {
        let mut sb = String::from("SELECT ");
        if distinct {
            sb.push_str("DISTINCT ");
        }
        // A rule with an empty head is a boolean (ASK) query.
        if rule.head.terms.is_empty() {
            sb.push_str("'true' AS x");
            return Ok(sb);
        }

        let key = (rule_key.0.to_owned(), rule_key.1);
        let term_types = ctx.analysis.term_types.get(&key);
        let cast_types = ctx.analysis.cast_types.get(rule_key.0);

        let mut used_names: HashSet<String> = HashSet::new();
        let mut columns = Vec::with_capacity(rule.head.terms.len());
        for (hpos, term) in rule.head.terms.iter().enumerate() {
            let var_name = match signature {
                Some(names) => names[hpos].clone(),
                None => ViewDefinition::value_column(hpos),
            };
            let term_type = term_types.and_then(|ts| ts.get(hpos)).and_then(|t| t.clone());
            let cast_type = cast_types.and_then(|cs| cs.get(hpos)).copied();

            let type_column = self.type_column(term, &var_name, index, &mut used_names, &term_type)?;
            let lang_column = self.lang_column(term, &var_name, index, &mut used_names, &term_type)?;
            let main_column = self.main_column(term, &var_name, index, &mut used_names, cast_type)?;
            columns.push(format!("\n   {}, {}, {}", type_column, lang_column, main_column));
        }
        sb.push_str(&columns.iter().join(","));
        Ok(sb)
    }

    /// The literal type code of the projection, or a reference to the type
    /// column of the view the variable is bound through.
    fn type_column(
        &self,
        term: &Term,
        var_name: &str,
        index: &AliasIndex,
        used_names: &mut HashSet<String>,
        term_type: &Option<TermType>,
    ) -> CompileResult<String> {
        let alias = self
            .dialect
            .name_top_variable(var_name, TYPE_SUFFIX, used_names);
        used_names.insert(alias.clone());

        let type_expr = match term {
            Term::Variable(name) => {
                let refs = index.column_refs(name)?;
                refs.iter()
                    .find_map(|r| {
                        r.type_column
                            .as_ref()
                            .map(|c| self.qualified(&r.alias, c))
                    })
                    // An unconstrained variable defaults to an IRI.
                    .unwrap_or_else(|| ColType::Object.code().to_string())
            }
            _ => {
                let col_type = term_type
                    .as_ref()
                    .map(|t| t.col_type)
                    .unwrap_or(ColType::String);
                col_type.code().to_string()
            }
        };
        Ok(format!("{} AS {}", type_expr, self.dialect.quote(&alias)))
    }

    fn lang_column(
        &self,
        term: &Term,
        var_name: &str,
        index: &AliasIndex,
        used_names: &mut HashSet<String>,
        term_type: &Option<TermType>,
    ) -> CompileResult<String> {
        let alias = self
            .dialect
            .name_top_variable(var_name, LANG_SUFFIX, used_names);
        used_names.insert(alias.clone());

        let lang_expr = match term {
            Term::Variable(name) => {
                let refs = index.column_refs(name)?;
                refs.iter()
                    .find_map(|r| {
                        r.lang_column
                            .as_ref()
                            .map(|c| self.qualified(&r.alias, c))
                    })
                    .unwrap_or_else(|| "NULL".to_owned())
            }
            _ => match term_type {
                Some(t) if t.col_type == ColType::LangString => match &t.language {
                    Some(LanguageTag::Constant(tag)) => format!("'{}'", tag),
                    Some(LanguageTag::Variable(name)) => {
                        self.render_term(&Term::Variable(name.clone()), index, false)?
                    }
                    None => {
                        return Err(CompileError::Unsupported(
                            "language-tagged literal without a language tag".to_owned(),
                        ))
                    }
                },
                _ => "NULL".to_owned(),
            },
        };
        Ok(format!("{} AS {}", lang_expr, self.dialect.quote(&alias)))
    }

    fn main_column(
        &self,
        term: &Term,
        var_name: &str,
        index: &AliasIndex,
        used_names: &mut HashSet<String>,
        cast_type: Option<ColType>,
    ) -> CompileResult<String> {
        let alias = self.dialect.name_top_variable(var_name, "", used_names);
        used_names.insert(alias.clone());

        let rendered = match term {
            Term::Constant(c) => self.lexical_form(c),
            Term::Variable(_) => self.render_term(term, index, false)?,
            Term::Functional(f) => match &f.symbol {
                FunctionSymbol::Datatype(_) => {
                    let inner = f.terms.first().ok_or_else(|| {
                        CompileError::Unsupported("datatype atom without a value".to_owned())
                    })?;
                    self.render_term(inner, index, false)?
                }
                FunctionSymbol::UriTemplate | FunctionSymbol::BNodeTemplate => {
                    self.template_value(f, index)?
                }
                FunctionSymbol::Op(_) => self.render_term(term, index, false)?,
            },
        };

        // Literals, NULL and parenthesized expressions keep their own type;
        // everything else is cast to the position's unifying type.
        let already_typed =
            rendered.starts_with('\'') || rendered.starts_with('(') || rendered == "NULL";
        let main = match cast_type {
            Some(col_type) if !already_typed => self
                .dialect
                .cast(&rendered, SqlType::for_col_type(col_type)),
            _ => rendered,
        };
        Ok(format!("{} AS {}", main, self.dialect.quote(&alias)))
    }

    // ---- FROM ------------------------------------------------------------

    fn from_clause(&self, body: &[BodyAtom], index: &AliasIndex) -> CompileResult<String> {
        let definitions = self.table_definitions(body, index, &[], true, false, "")?;
        Ok(format!("\n FROM \n{}", definitions))
    }

    /// Renders a list of atoms as table definitions: a comma list at top
    /// level (or the dummy table when there is none), otherwise a
    /// JOIN/LEFT OUTER JOIN tree folded pairwise from the right, with
    /// algebra children parenthesized.
    fn table_definitions(
        &self,
        atoms: &[BodyAtom],
        index: &AliasIndex,
        path: &[usize],
        is_top_level: bool,
        is_left_join: bool,
        indent: &str,
    ) -> CompileResult<String> {
        let mut definitions: Vec<(String, bool)> = vec![];
        for (i, atom) in atoms.iter().enumerate() {
            let mut child_path = path.to_vec();
            child_path.push(i);
            if let Some(definition) =
                self.table_definition(atom, index, &child_path, &format!("{}{}", indent, INDENT))?
            {
                let is_algebra = matches!(atom, BodyAtom::Join(_) | BodyAtom::LeftJoin(_));
                definitions.push((definition, is_algebra));
            }
        }

        if is_top_level {
            if definitions.is_empty() {
                return Ok(format!("({}) tdummy", self.dialect.dummy_table()));
            }
            return Ok(definitions
                .iter()
                .map(|(d, _)| format!("{}{}", indent, d))
                .join(",\n"));
        }

        let keyword = if is_left_join { "LEFT OUTER JOIN" } else { "JOIN" };
        if definitions.is_empty() {
            return Err(CompileError::EmptyJoin);
        }
        if definitions.len() == 1 {
            return Ok(definitions.pop().expect("checked length").0);
        }

        // Fold pairwise from the right; each accumulated join is itself an
        // algebra operand and gets parenthesized.
        let (last, last_is_algebra) = definitions.pop().expect("checked length");
        let (second_last, _) = definitions.pop().expect("checked length");
        let right = if last_is_algebra {
            format!("({})", last)
        } else {
            last
        };
        let mut current = format!(
            "{}{}\n{}{}\n{}{}",
            indent, second_last, indent, keyword, indent, right
        );
        while let Some((definition, _)) = definitions.pop() {
            current = format!(
                "{}{}\n{}{}\n{}({})",
                indent, definition, indent, keyword, indent, current
            );
        }

        let conditions = self.conditions_string(atoms, index, path, true, indent)?;
        let on_clause = if conditions.is_empty() {
            "1 = 1".to_owned()
        } else {
            conditions
        };
        Ok(format!("{} ON\n{}\n{}", current, on_clause, indent))
    }

    fn table_definition(
        &self,
        atom: &BodyAtom,
        index: &AliasIndex,
        path: &[usize],
        indent: &str,
    ) -> CompileResult<Option<String>> {
        match atom {
            BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => Ok(None),
            BodyAtom::Join(children) => self
                .table_definitions(children, index, path, false, false, indent)
                .map(Some),
            BodyAtom::LeftJoin(children) => self
                .table_definitions(children, index, path, false, true, indent)
                .map(Some),
            BodyAtom::Data(_) => {
                let entry = index.entry(path)?;
                Ok(Some(entry.from_sql.clone()))
            }
        }
    }

    // ---- WHERE / ON ------------------------------------------------------

    fn where_clause(&self, body: &[BodyAtom], index: &AliasIndex) -> CompileResult<String> {
        let conditions = self.conditions_string(body, index, &[], true, "")?;
        if conditions.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("\nWHERE \n{}", conditions))
    }

    /// All conditions of one scope: shared-variable equalities, constant
    /// equalities of the scope's direct data atoms, and its direct boolean
    /// atoms. Usable as a WHERE or an ON body.
    fn conditions_string(
        &self,
        atoms: &[BodyAtom],
        index: &AliasIndex,
        path: &[usize],
        process_shared: bool,
        indent: &str,
    ) -> CompileResult<String> {
        let mut conditions: Vec<String> = vec![];

        if process_shared {
            for equality in self.shared_variable_equalities(atoms, index, path)? {
                if !conditions.contains(&equality) {
                    conditions.push(equality);
                }
            }
        }

        // Constant positions of the scope's direct data atoms.
        for (i, atom) in atoms.iter().enumerate() {
            let data = match atom {
                BodyAtom::Data(data) => data,
                _ => continue,
            };
            let mut child_path = path.to_vec();
            child_path.push(i);
            let entry = index.entry(&child_path)?;
            for (position, term) in data.terms.iter().enumerate() {
                if let Term::Constant(c) = term {
                    let column = entry.column(position)?;
                    let condition = format!(
                        "({} = {})",
                        self.qualified(&entry.alias, &column.column),
                        self.lexical_form(c)
                    );
                    if !conditions.contains(&condition) {
                        conditions.push(condition);
                    }
                }
            }
        }

        // Direct boolean atoms of the scope.
        for atom in atoms {
            if let BodyAtom::Operation(expression) = atom {
                let condition = self.render_condition(expression, index)?;
                if !conditions.contains(&condition) {
                    conditions.push(condition);
                }
            }
        }

        Ok(conditions
            .iter()
            .map(|c| format!("{}{}", indent, c))
            .join(" AND\n"))
    }

    /// One equality per additional occurrence of a variable in this scope,
    /// chained over consecutive references. A pair internal to a single
    /// algebra child is skipped: it already lives in that child's ON clause.
    fn shared_variable_equalities(
        &self,
        atoms: &[BodyAtom],
        index: &AliasIndex,
        path: &[usize],
    ) -> CompileResult<Vec<String>> {
        let mut var_order: Vec<String> = vec![];
        let mut refs: HashMap<String, Vec<(usize, String)>> = HashMap::new();
        let mut algebra_children: HashSet<usize> = HashSet::new();

        for (i, atom) in atoms.iter().enumerate() {
            if matches!(atom, BodyAtom::Join(_) | BodyAtom::LeftJoin(_)) {
                algebra_children.insert(i);
            }
            let mut child_path = path.to_vec();
            child_path.push(i);
            let mut collected: Vec<(String, String)> = vec![];
            self.collect_scope_refs(atom, child_path, index, &mut collected)?;
            for (var, column) in collected {
                if !refs.contains_key(&var) {
                    var_order.push(var.clone());
                }
                refs.entry(var).or_default().push((i, column));
            }
        }

        let mut equalities = vec![];
        for var in var_order {
            let references = &refs[&var];
            for pair in references.windows(2) {
                let (left_child, left_column) = &pair[0];
                let (right_child, right_column) = &pair[1];
                if left_child == right_child && algebra_children.contains(left_child) {
                    continue;
                }
                equalities.push(format!("({} = {})", left_column, right_column));
            }
        }
        Ok(equalities)
    }

    /// Column references visible from an enclosing scope. Everything below a
    /// nested left join's right side stays private to that join.
    fn collect_scope_refs(
        &self,
        atom: &BodyAtom,
        path: Vec<usize>,
        index: &AliasIndex,
        out: &mut Vec<(String, String)>,
    ) -> CompileResult<()> {
        match atom {
            BodyAtom::Data(data) => {
                let entry = index.entry(&path)?;
                for (position, term) in data.terms.iter().enumerate() {
                    if let Term::Variable(name) = term {
                        let column = entry.column(position)?;
                        out.push((name.clone(), self.qualified(&entry.alias, &column.column)));
                    }
                }
            }
            BodyAtom::Join(children) => {
                for (i, child) in children.iter().enumerate() {
                    let mut child_path = path.clone();
                    child_path.push(i);
                    self.collect_scope_refs(child, child_path, index, out)?;
                }
            }
            BodyAtom::LeftJoin(children) => {
                // Only the left child is visible outside the join.
                if let Some((i, left)) = children
                    .iter()
                    .enumerate()
                    .find(|(_, c)| !matches!(c, BodyAtom::Operation(_)))
                {
                    let mut child_path = path;
                    child_path.push(i);
                    self.collect_scope_refs(left, child_path, index, out)?;
                }
            }
            BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => {}
        }
        Ok(())
    }

    // ---- GROUP BY / HAVING ----------------------------------------------

    fn group_by_clause(&self, body: &[BodyAtom], index: &AliasIndex) -> CompileResult<String> {
        let mut group_vars = vec![];
        for atom in body {
            if let BodyAtom::Group(vars) = atom {
                group_vars.extend(vars.iter().cloned());
            }
        }
        if group_vars.is_empty() {
            return Ok(String::new());
        }

        let mut references = vec![];
        for var in &group_vars {
            for column_ref in index.column_refs(var)? {
                references.push(self.qualified(&column_ref.alias, &column_ref.column));
            }
        }
        Ok(format!(" GROUP BY {}", references.iter().join(" , ")))
    }

    fn having_clause(&self, body: &[BodyAtom], index: &AliasIndex) -> CompileResult<String> {
        let conditions = match body.iter().find_map(|atom| match atom {
            BodyAtom::Having(exprs) => Some(exprs),
            _ => None,
        }) {
            Some(exprs) if !exprs.is_empty() => exprs,
            _ => return Ok(String::new()),
        };

        let rendered: Vec<String> = conditions
            .iter()
            .map(|e| self.render_condition(e, index))
            .collect::<CompileResult<_>>()?;
        Ok(format!(" HAVING ( {} ) ", rendered.iter().join(" AND ")))
    }

    // ---- term and condition rendering -----------------------------------

    fn render_condition(&self, expression: &Expression, index: &AliasIndex) -> CompileResult<String> {
        self.render_operation(expression.op, &expression.terms, index, true)
    }

    /// SQL for a term: constants by lexical form, variables by their first
    /// column reference, functional terms through the operator table, the
    /// dialect, or template expansion.
    fn render_term(&self, term: &Term, index: &AliasIndex, brackets: bool) -> CompileResult<String> {
        match term {
            Term::Constant(c) => Ok(self.lexical_form(c)),
            Term::Variable(name) => {
                let refs = index.column_refs(name)?;
                let first = refs
                    .first()
                    .ok_or_else(|| CompileError::UnboundVariable(name.clone()))?;
                Ok(self.qualified(&first.alias, &first.column))
            }
            Term::Functional(f) => match &f.symbol {
                FunctionSymbol::Datatype(_) => {
                    let inner = f.terms.first().ok_or_else(|| {
                        CompileError::Unsupported("datatype atom without a value".to_owned())
                    })?;
                    self.render_term(inner, index, false)
                }
                FunctionSymbol::UriTemplate | FunctionSymbol::BNodeTemplate => {
                    self.template_value(f, index)
                }
                FunctionSymbol::Op(op) => self.render_operation(*op, &f.terms, index, brackets),
            },
        }
    }

    fn render_operation(
        &self,
        op: Operation,
        terms: &[Term],
        index: &AliasIndex,
        brackets: bool,
    ) -> CompileResult<String> {
        if let Some(template) = self.operations.get(&op) {
            // NOT and IS TRUE are specialized on the operand's SQL type.
            if template.contains("NOT %s") || template.contains("IS TRUE") {
                let operand = terms.first().ok_or_else(|| {
                    CompileError::Unsupported(format!("operator {:?} with no operand", op))
                })?;
                return if template.contains("NOT %s") {
                    self.render_negation(operand, index)
                } else {
                    self.render_truth_test(operand, index)
                };
            }
            return match terms.len() {
                0 => Ok(template.clone()),
                1 => {
                    let operand = self.render_term(&terms[0], index, true)?;
                    Ok(fill_template(template, &[operand]))
                }
                2 => {
                    let left = self.render_term(&terms[0], index, true)?;
                    let right = self.render_term(&terms[1], index, true)?;
                    let rendered = fill_template(template, &[left, right]);
                    Ok(if brackets {
                        format!("({})", rendered)
                    } else {
                        rendered
                    })
                }
                n => Err(CompileError::Unsupported(format!(
                    "operator {:?} with arity {}",
                    op, n
                ))),
            };
        }

        let arg = |i: usize| -> CompileResult<String> {
            let term = terms.get(i).ok_or_else(|| {
                CompileError::Unsupported(format!("operator {:?} with arity {}", op, terms.len()))
            })?;
            self.render_term(term, index, false)
        };

        match op {
            Operation::Regex => {
                let flags = match terms.get(2) {
                    Some(Term::Constant(Constant::Literal { value, .. })) => RegexFlags {
                        case_insensitive: value.contains('i'),
                        multi_line: value.contains('m'),
                        dot_all: value.contains('s'),
                    },
                    _ => RegexFlags::default(),
                };
                self.dialect.regex(&arg(0)?, &arg(1)?, flags)
            }
            Operation::Lang => match terms.first() {
                Some(Term::Variable(name)) => {
                    let refs = index.column_refs(name)?;
                    Ok(refs
                        .iter()
                        .find_map(|r| r.lang_column.as_ref().map(|c| self.qualified(&r.alias, c)))
                        .unwrap_or_else(|| "NULL".to_owned()))
                }
                _ => Err(CompileError::Unsupported(
                    "LANG over a non-variable term".to_owned(),
                )),
            },
            Operation::Str => {
                let rendered = arg(0)?;
                if self.is_string_col_type(&terms[0], index) {
                    Ok(rendered)
                } else {
                    Ok(self.dialect.cast(&rendered, SqlType::Varchar))
                }
            }
            Operation::Cast => {
                let target_is_string = match terms.get(1) {
                    Some(Term::Constant(Constant::Iri(iri))) => iri.ends_with("string"),
                    Some(Term::Constant(Constant::Literal { value, .. })) => {
                        value.ends_with("string")
                    }
                    _ => false,
                };
                if !target_is_string {
                    return Err(CompileError::Unsupported(
                        "CAST to a non-string datatype".to_owned(),
                    ));
                }
                let rendered = arg(0)?;
                if self.is_string_col_type(&terms[0], index) {
                    Ok(rendered)
                } else {
                    Ok(self.dialect.cast(&rendered, SqlType::Varchar))
                }
            }
            Operation::Replace => Ok(self.dialect.str_replace(&arg(0)?, &arg(1)?, &arg(2)?)),
            Operation::Concat => Ok(self.dialect.str_concat(&[arg(0)?, arg(1)?])),
            Operation::StrLen => Ok(self.dialect.str_length(&arg(0)?)),
            Operation::Ucase => Ok(self.dialect.str_ucase(&arg(0)?)),
            Operation::Lcase => Ok(self.dialect.str_lcase(&arg(0)?)),
            Operation::Substr2 => Ok(self.dialect.str_substr2(&arg(0)?, &arg(1)?)),
            Operation::Substr3 => Ok(self.dialect.str_substr3(&arg(0)?, &arg(1)?, &arg(2)?)),
            Operation::StrBefore => Ok(self.dialect.str_before(&arg(0)?, &arg(1)?)),
            Operation::StrAfter => Ok(self.dialect.str_after(&arg(0)?, &arg(1)?)),
            Operation::StrStarts => Ok(self.dialect.str_starts(&arg(0)?, &arg(1)?)),
            Operation::StrEnds => Ok(self.dialect.str_ends(&arg(0)?, &arg(1)?)),
            Operation::Contains => Ok(self.dialect.str_contains(&arg(0)?, &arg(1)?)),
            Operation::EncodeForUri => Ok(self.dialect.str_encode_for_uri(&arg(0)?)),
            Operation::Md5 => self.dialect.hash_md5(&arg(0)?),
            Operation::Sha1 => self.dialect.hash_sha1(&arg(0)?),
            Operation::Sha256 => self.dialect.hash_sha256(&arg(0)?),
            Operation::Sha512 => self.dialect.hash_sha512(&arg(0)?),
            Operation::Year => Ok(self.dialect.date_part("YEAR", &arg(0)?)),
            Operation::Month => Ok(self.dialect.date_part("MONTH", &arg(0)?)),
            Operation::Day => Ok(self.dialect.date_part("DAY", &arg(0)?)),
            Operation::Hours => Ok(self.dialect.date_part("HOUR", &arg(0)?)),
            Operation::Minutes => Ok(self.dialect.date_part("MINUTE", &arg(0)?)),
            Operation::Seconds => Ok(self.dialect.date_part("SECOND", &arg(0)?)),
            Operation::Tz => self.dialect.date_tz(&arg(0)?),
            Operation::Count => {
                if terms.is_empty() {
                    Ok("COUNT(*)".to_owned())
                } else {
                    Ok(format!("COUNT({})", arg(0)?))
                }
            }
            Operation::Sum => Ok(format!("SUM({})", arg(0)?)),
            Operation::Avg => Ok(format!("AVG({})", arg(0)?)),
            Operation::Min => Ok(format!("MIN({})", arg(0)?)),
            Operation::Max => Ok(format!("MAX({})", arg(0)?)),
            Operation::IfElseNull => Ok(format!(
                "CASE WHEN {} THEN {} ELSE NULL END",
                arg(0)?,
                arg(1)?
            )),
            other => Err(CompileError::Unsupported(format!("{:?}", other))),
        }
    }

    /// NOT over numerics compares against zero, over character data tests
    /// the length, and stays a plain NOT only for booleans and non-datatype
    /// functions.
    fn render_negation(&self, term: &Term, index: &AliasIndex) -> CompileResult<String> {
        if let Term::Functional(f) = term {
            if !matches!(f.symbol, FunctionSymbol::Datatype(_)) {
                let column = self.render_term(term, index, false)?;
                return Ok(format!("NOT {}", column));
            }
        }
        let column = self.render_term(term, index, false)?;
        let sql_type = self.term_sql_type(term, index);
        if sql_type.is_numeric() {
            Ok(format!("{} = 0", column))
        } else if sql_type == SqlType::Boolean {
            Ok(format!("NOT {}", column))
        } else if sql_type.is_character() {
            Ok(format!("NOT {} > 0", self.dialect.str_length(&column)))
        } else {
            Err(CompileError::Unsupported(format!(
                "NOT over a {:?} operand",
                sql_type
            )))
        }
    }

    fn render_truth_test(&self, term: &Term, index: &AliasIndex) -> CompileResult<String> {
        let column = self.render_term(term, index, false)?;
        let sql_type = self.term_sql_type(term, index);
        if sql_type.is_numeric() {
            Ok(format!("{} <> 0", column))
        } else if sql_type == SqlType::Boolean {
            Ok(column)
        } else if sql_type.is_character() {
            Ok(format!("{} > 0", self.dialect.str_length(&column)))
        } else {
            Err(CompileError::Unsupported(format!(
                "IS TRUE over a {:?} operand",
                sql_type
            )))
        }
    }

    /// SQL type of an operand: datatype wrappers and literals map through
    /// their RDF type, variables through the column they are bound to.
    fn term_sql_type(&self, term: &Term, index: &AliasIndex) -> SqlType {
        match term {
            Term::Functional(f) => match &f.symbol {
                FunctionSymbol::Datatype(col_type) => SqlType::for_col_type(*col_type),
                _ => SqlType::Varchar,
            },
            Term::Constant(Constant::Literal { datatype, .. }) => SqlType::for_col_type(*datatype),
            Term::Constant(_) => SqlType::Varchar,
            Term::Variable(name) => index
                .column_refs(name)
                .ok()
                .and_then(|refs| refs.first())
                .and_then(|r| r.sql_type)
                .unwrap_or(SqlType::Varchar),
        }
    }

    fn is_string_col_type(&self, term: &Term, index: &AliasIndex) -> bool {
        match term {
            Term::Functional(f) => match &f.symbol {
                FunctionSymbol::UriTemplate => true,
                FunctionSymbol::Op(Operation::Count) => false,
                _ if f.terms.len() == 1 => self.is_string_col_type(&f.terms[0], index),
                _ => false,
            },
            Term::Variable(name) => index
                .column_refs(name)
                .ok()
                .and_then(|refs| refs.first())
                .and_then(|r| r.sql_type)
                .map(|t| t.is_character())
                .unwrap_or(false),
            Term::Constant(_) => false,
        }
    }

    /// Expands a `{}` placeholder template into a string concatenation. Each
    /// argument is cast to character data when needed and percent-encoded
    /// when IRI-safe encoding is on.
    fn template_value(&self, f: &FunctionalTerm, index: &AliasIndex) -> CompileResult<String> {
        let first = f.terms.first().ok_or_else(|| {
            CompileError::Unsupported("template atom without a template".to_owned())
        })?;

        let template = match first {
            Term::Constant(Constant::Literal { value, .. }) => value.clone(),
            Term::Constant(Constant::BNode(name)) => name.clone(),
            Term::Constant(Constant::Iri(iri)) => {
                // A concrete IRI: nothing to expand.
                return Ok(self.dialect.lexical_string(iri));
            }
            Term::Variable(_) => return self.render_term(first, index, false),
            // A complex first argument is rendered as-is.
            Term::Functional(_) => return self.render_term(first, index, false),
            Term::Constant(Constant::Null) => {
                return Err(CompileError::Unsupported(
                    "NULL template in a template atom".to_owned(),
                ))
            }
        };

        let template = trim_quoted(&template);
        let split: Vec<&str> = template.split("{}").collect();
        let has_fixed_text = split.iter().any(|s| !s.is_empty());

        let mut parts: Vec<String> = vec![];
        if let Some(head) = split.first() {
            if !head.is_empty() {
                parts.push(self.dialect.lexical_string(head));
            }
        }
        for (term_index, term) in f.terms.iter().enumerate().skip(1) {
            let rendered = self.render_term(term, index, false)?;
            let rendered = if self.is_string_col_type(term, index) {
                rendered
            } else {
                self.dialect.cast(&rendered, SqlType::Varchar)
            };
            let rendered = if has_fixed_text {
                self.iri_safe(rendered)
            } else {
                rendered
            };
            parts.push(rendered);
            if let Some(tail) = split.get(term_index) {
                if !tail.is_empty() {
                    parts.push(self.dialect.lexical_string(tail));
                }
            }
        }

        if parts.len() == 1 {
            return Ok(parts.pop().expect("checked length"));
        }
        Ok(self.dialect.str_concat(&parts))
    }

    fn iri_safe(&self, expr: String) -> String {
        if self.settings.iri_safe_encoding {
            format!("{}{}{}", self.replace_open, expr, self.replace_close)
        } else {
            expr
        }
    }

    /// Valid SQL lexical form of a constant: strings and temporal values
    /// quoted, numerics bare, booleans through the dialect.
    fn lexical_form(&self, constant: &Constant) -> String {
        match constant {
            Constant::Iri(iri) => self.dialect.lexical_string(iri),
            Constant::BNode(name) => self.dialect.lexical_string(name),
            Constant::Null => "NULL".to_owned(),
            Constant::Literal {
                value, datatype, ..
            } => match datatype {
                ColType::Boolean => self
                    .dialect
                    .lexical_boolean(value == "true" || value == "1"),
                ColType::DateTime | ColType::Date | ColType::Time => {
                    self.dialect.lexical_datetime(value)
                }
                _ if datatype.is_numeric() => value.clone(),
                _ => self.dialect.lexical_string(value),
            },
        }
    }

    fn qualified(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", self.dialect.quote(alias), self.dialect.quote(column))
    }
}

/// A qualified column behind a variable occurrence or an atom position.
/// View-backed columns carry the companion type and lang column names.
#[derive(Clone, Debug)]
struct ColumnRef {
    alias: String,
    column: String,
    sql_type: Option<SqlType>,
    type_column: Option<String>,
    lang_column: Option<String>,
}

#[derive(Clone, Debug)]
struct AtomEntry {
    alias: String,
    from_sql: String,
    columns: Vec<ColumnRef>,
}

impl AtomEntry {
    fn column(&self, position: usize) -> CompileResult<&ColumnRef> {
        self.columns.get(position).ok_or_else(|| {
            CompileError::Unsupported(format!(
                "position {} outside the attributes of {}",
                position, self.alias
            ))
        })
    }
}

/// Per-rule mapping from data atoms (addressed by their path in the body
/// tree) to SQL aliases, and from variables to the qualified columns where
/// they occur. Built once per rule, consumed throughout its compilation.
struct AliasIndex {
    entries: HashMap<Vec<usize>, AtomEntry>,
    columns: HashMap<String, Vec<ColumnRef>>,
}

impl AliasIndex {
    fn build<D: DialectAdapter>(
        rule: &Rule,
        views: &HashMap<PredicateName, ViewDefinition>,
        metadata: &DatabaseMetadata,
        dialect: &D,
    ) -> CompileResult<AliasIndex> {
        let mut index = AliasIndex {
            entries: HashMap::new(),
            columns: HashMap::new(),
        };
        let mut taken_aliases: HashSet<String> = HashSet::new();
        let mut data_table_count = 0usize;
        for (i, atom) in rule.body.iter().enumerate() {
            index.visit(
                atom,
                vec![i],
                views,
                metadata,
                dialect,
                &mut taken_aliases,
                &mut data_table_count,
            )?;
        }
        Ok(index)
    }

    #[allow(clippy::too_many_arguments)]
    fn visit<D: DialectAdapter>(
        &mut self,
        atom: &BodyAtom,
        path: Vec<usize>,
        views: &HashMap<PredicateName, ViewDefinition>,
        metadata: &DatabaseMetadata,
        dialect: &D,
        taken_aliases: &mut HashSet<String>,
        data_table_count: &mut usize,
    ) -> CompileResult<()> {
        match atom {
            BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => Ok(()),
            BodyAtom::Join(children) | BodyAtom::LeftJoin(children) => {
                for (i, child) in children.iter().enumerate() {
                    let mut child_path = path.clone();
                    child_path.push(i);
                    self.visit(
                        child,
                        child_path,
                        views,
                        metadata,
                        dialect,
                        taken_aliases,
                        data_table_count,
                    )?;
                }
                Ok(())
            }
            BodyAtom::Data(data) => {
                let alias = dialect.name_view(
                    VIEW_PREFIX,
                    &escape_name(&data.predicate),
                    &format!("{}{}", VIEW_SUFFIX, data_table_count),
                    taken_aliases,
                );
                taken_aliases.insert(alias.clone());
                *data_table_count += 1;

                let entry = if let Some(view) = views.get(&data.predicate) {
                    let columns = (0..data.arity())
                        .map(|i| ColumnRef {
                            alias: alias.clone(),
                            column: ViewDefinition::value_column(i),
                            sql_type: None,
                            type_column: Some(ViewDefinition::type_column(i)),
                            lang_column: Some(ViewDefinition::lang_column(i)),
                        })
                        .collect();
                    AtomEntry {
                        alias: alias.clone(),
                        from_sql: format!("({}) {}", view.sql, dialect.quote(&alias)),
                        columns,
                    }
                } else if let Some(relation) = metadata.relation(&data.predicate) {
                    let columns = (0..data.arity())
                        .map(|i| {
                            relation
                                .attribute(i)
                                .map(|attribute| ColumnRef {
                                    alias: alias.clone(),
                                    column: attribute.name.clone(),
                                    sql_type: Some(attribute.sql_type),
                                    type_column: None,
                                    lang_column: None,
                                })
                                .ok_or_else(|| {
                                    CompileError::Unsupported(format!(
                                        "atom {} has more arguments than {} has attributes",
                                        data.predicate, relation.name
                                    ))
                                })
                        })
                        .collect::<CompileResult<Vec<_>>>()?;
                    AtomEntry {
                        alias: alias.clone(),
                        from_sql: dialect
                            .table_alias(&dialect.quote(&relation.name), &dialect.quote(&alias)),
                        columns,
                    }
                } else {
                    return Err(CompileError::UnknownPredicate(data.predicate.clone()));
                };

                for (position, term) in data.terms.iter().enumerate() {
                    if let Term::Variable(name) = term {
                        let column_ref = entry.column(position)?.clone();
                        self.columns.entry(name.clone()).or_default().push(column_ref);
                    }
                }
                self.entries.insert(path, entry);
                Ok(())
            }
        }
    }

    fn entry(&self, path: &[usize]) -> CompileResult<&AtomEntry> {
        self.entries
            .get(path)
            .ok_or_else(|| CompileError::EmptyJoin)
    }

    fn column_refs(&self, variable: &str) -> CompileResult<&Vec<ColumnRef>> {
        self.columns
            .get(variable)
            .filter(|refs| !refs.is_empty())
            .ok_or_else(|| CompileError::UnboundVariable(variable.to_owned()))
    }
}

/// Makes a predicate name safe for use inside an SQL identifier.
fn escape_name(name: &str) -> String {
    name.replace(['.', ':', '/', ' '], "_")
}

/// Strips one level of surrounding quotes, repeatedly.
fn trim_quoted(value: &str) -> String {
    let mut out = value;
    loop {
        let bytes = out.as_bytes();
        if bytes.len() >= 2
            && matches!(bytes[0], b'"' | b'`' | b'\'' | b'[')
            && matches!(bytes[bytes.len() - 1], b'"' | b'`' | b'\'' | b']')
        {
            out = &out[1..out.len() - 1];
        } else {
            return out.to_owned();
        }
    }
}

struct CompileCtx<'a> {
    analysis: &'a ProgramAnalysis,
    views: HashMap<PredicateName, ViewDefinition>,
    is_distinct: bool,
}
