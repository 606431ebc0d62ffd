use rusqlite::{types::ValueRef, Connection};

use crate::ast::{
    BodyAtom, ColType, Constant, DataAtom, Expression, FunctionSymbol, Operation, Program,
    QueryModifiers, Rule, SortCondition, Term,
};
use crate::compiler::{GeneratorSettings, SqlGenerator};
use crate::dialect::GenericDialect;
use crate::error::CompileError;
use crate::metadata::{DatabaseMetadata, RelationDefinition, SqlType};

fn metadata() -> DatabaseMetadata {
    let mut metadata = DatabaseMetadata::new();
    metadata.add_relation(
        RelationDefinition::new("teaches")
            .with_attribute("prof", SqlType::Varchar)
            .with_attribute("course", SqlType::Varchar),
    );
    metadata.add_relation(
        RelationDefinition::new("person")
            .with_attribute("id", SqlType::Integer)
            .with_attribute("first", SqlType::Varchar)
            .with_attribute("last", SqlType::Varchar)
            .with_unique_constraint("pk_person", vec![0]),
    );
    metadata.add_relation(
        RelationDefinition::new("email")
            .with_attribute("id", SqlType::Integer)
            .with_attribute("addr", SqlType::Varchar)
            .with_unique_constraint("pk_email", vec![0]),
    );
    metadata.add_relation(
        RelationDefinition::new("emp")
            .with_attribute("id", SqlType::Integer)
            .with_attribute("dept", SqlType::Integer)
            .with_attribute("name", SqlType::Varchar)
            .with_unique_constraint("pk_emp", vec![0])
            .with_foreign_key("fk_emp_dept", "dept", vec![(1, 0)]),
    );
    metadata.add_relation(
        RelationDefinition::new("dept")
            .with_attribute("id", SqlType::Integer)
            .with_attribute("name", SqlType::Varchar)
            .with_unique_constraint("pk_dept", vec![0]),
    );
    metadata
}

fn setup_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE teaches(prof, course);
        CREATE TABLE person(id, first, last);
        CREATE TABLE email(id, addr);
        CREATE TABLE emp(id, dept, name);
        CREATE TABLE dept(id, name);
        INSERT INTO teaches(prof, course) VALUES
            ('smith', 'calculus'),
            ('smith', 'logic'),
            ('jones', 'algebra')
        ;
        INSERT INTO person(id, first, last) VALUES
            (1, 'smith', 'smithson'),
            (2, 'alice', 'wonder')
        ;
        INSERT INTO email(id, addr) VALUES
            (1, 'smith@example.org')
        ;
        INSERT INTO emp(id, dept, name) VALUES
            (1, 10, 'sales'),
            (2, 20, 'bob')
        ;
        INSERT INTO dept(id, name) VALUES
            (10, 'sales'),
            (20, 'marketing')
        ;
        COMMIT;",
    )
    .unwrap();
    conn
}

fn generator() -> SqlGenerator {
    SqlGenerator::with_defaults(metadata())
}

fn run(conn: &Connection, sql: &str) -> Vec<Vec<String>> {
    println!("***** BEGIN SQL *****");
    println!("{}", sql);
    println!("***** END SQL *****");
    let mut stmt = conn.prepare(sql).unwrap();
    let column_count = stmt.column_count();
    let mut rows = stmt.query([]).unwrap();
    let mut result = vec![];
    while let Some(row) = rows.next().unwrap() {
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            record.push(match row.get_ref(i).unwrap() {
                ValueRef::Null => "NULL".to_owned(),
                ValueRef::Integer(x) => x.to_string(),
                ValueRef::Real(x) => x.to_string(),
                ValueRef::Text(s) => std::str::from_utf8(s).unwrap().to_owned(),
                value => panic!("unexpected value type {:?}", value),
            });
        }
        result.push(record);
    }
    result
}

/// Extracts the value column of every projected triple, dropping the type
/// and lang columns.
fn values(rows: &[Vec<String>]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| row.iter().skip(2).step_by(3).cloned().collect())
        .collect()
}

fn sorted(mut rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    rows.sort();
    rows
}

fn strings(items: &[&[&str]]) -> Vec<Vec<String>> {
    items
        .iter()
        .map(|row| row.iter().map(|s| s.to_string()).collect())
        .collect()
}

fn teaches_atom(prof: Term, course: Term) -> BodyAtom {
    BodyAtom::Data(DataAtom::new("teaches", vec![prof, course]))
}

fn ans_rule(name: &str, head: Vec<Term>, body: Vec<BodyAtom>) -> Rule {
    Rule::new(DataAtom::new(name, head), body)
}

#[test]
fn single_extensional_atom_compiles_without_where_or_join() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    assert!(!query.sql.contains("WHERE"));
    assert!(!query.sql.contains("JOIN"));
    assert!(query.sql.contains("AS \"xQuestType\""));
    assert!(query.sql.contains("NULL AS \"xLang\""));
    assert!(query.sql.contains("\"QteachesVIEW0\".\"prof\""));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["jones"], &["smith"], &["smith"]])
    );
    // An unconstrained variable projects the default object type code.
    assert!(rows.iter().all(|r| r[0] == "1" && r[1] == "NULL"));
}

#[test]
fn ground_arguments_become_where_equalities() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(
            Term::var("x"),
            Term::Constant(Constant::string("calculus")),
        )],
    )]);
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    assert!(!query.sql.contains("JOIN"));
    assert!(query
        .sql
        .contains("(\"QteachesVIEW0\".\"course\" = 'calculus')"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(sorted(values(&rows)), strings(&[&["smith"]]));
}

#[test]
fn shared_variables_in_a_flat_body_equate_in_where() {
    // person.first and teaches.prof share the variable f.
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("f"), Term::var("c")],
        vec![
            BodyAtom::Data(DataAtom::new(
                "person",
                vec![Term::var("p"), Term::var("f"), Term::var("l")],
            )),
            teaches_atom(Term::var("f"), Term::var("c")),
        ],
    )]);
    let query = generator()
        .generate(&program, &["f".to_owned(), "c".to_owned()])
        .unwrap();

    assert!(query.sql.contains("WHERE"));
    assert!(query
        .sql
        .contains("(\"QpersonVIEW0\".\"first\" = \"QteachesVIEW1\".\"prof\")"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["smith", "calculus"], &["smith", "logic"]])
    );
}

#[test]
fn duplicate_rules_union_all_into_equal_blocks() {
    let rule = ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    );
    let program = Program::new(vec![rule.clone(), rule]);
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    let blocks: Vec<&str> = query.sql.split("\nUNION ALL\n").collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0], blocks[1]);

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(rows.len(), 6);
}

#[test]
fn distinct_program_unions_and_deduplicates() {
    let rule = ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    );
    let modifiers = QueryModifiers {
        distinct: true,
        ..QueryModifiers::default()
    };
    let program = Program::with_modifiers(vec![rule.clone(), rule], modifiers);

    let query = generator().generate(&program, &["x".to_owned()]).unwrap();
    assert!(query.sql.contains("SELECT DISTINCT"));
    assert!(query.sql.contains("\nUNION\n"));
    assert!(!query.sql.contains("UNION ALL"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(sorted(values(&rows)), strings(&[&["jones"], &["smith"]]));
}

#[test]
fn distinct_post_processing_keeps_union_all() {
    let rule = ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    );
    let modifiers = QueryModifiers {
        distinct: true,
        ..QueryModifiers::default()
    };
    let program = Program::with_modifiers(vec![rule.clone(), rule], modifiers);

    let settings = GeneratorSettings {
        distinct_post_processing: true,
        ..GeneratorSettings::default()
    };
    let generator = SqlGenerator::new(metadata(), GenericDialect, settings);
    let query = generator.generate(&program, &["x".to_owned()]).unwrap();

    assert!(!query.sql.contains("SELECT DISTINCT"));
    assert!(query.sql.contains("UNION ALL"));
}

#[test]
fn incompatible_projected_types_are_a_typing_error() {
    let first = ans_rule(
        "ans1",
        vec![Term::typed(ColType::String, Term::var("x"))],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    );
    let mut second = first.clone();
    second.head.terms = vec![Term::typed(ColType::Integer, Term::var("x"))];

    let err = generator()
        .generate(&Program::new(vec![first, second]), &["x".to_owned()])
        .unwrap_err();
    assert!(matches!(err, CompileError::Typing { position: 0, .. }));
}

#[test]
fn intensional_predicate_is_materialized_as_a_view() -> anyhow::Result<()> {
    let program = Program::new(vec![
        ans_rule(
            "ans1",
            vec![Term::var("x")],
            vec![BodyAtom::Data(DataAtom::new("ans2", vec![Term::var("x")]))],
        ),
        ans_rule(
            "ans2",
            vec![Term::var("x")],
            vec![teaches_atom(Term::var("x"), Term::var("c"))],
        ),
    ]);
    let query = generator().generate(&program, &["x".to_owned()])?;

    // The view is inlined and its type column is consumed upward.
    assert!(query.sql.contains("\"Qans2VIEW0\".\"v0\""));
    assert!(query.sql.contains("\"Qans2VIEW0\".\"v0QuestType\""));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r[0] == "1"));
    Ok(())
}

#[test]
fn multi_rule_view_unions_with_parentheses() {
    let program = Program::new(vec![
        ans_rule(
            "ans1",
            vec![Term::var("x")],
            vec![BodyAtom::Data(DataAtom::new("ans2", vec![Term::var("x")]))],
        ),
        ans_rule(
            "ans2",
            vec![Term::var("x")],
            vec![teaches_atom(Term::var("x"), Term::var("c"))],
        ),
        ans_rule(
            "ans2",
            vec![Term::var("f")],
            vec![BodyAtom::Data(DataAtom::new(
                "person",
                vec![Term::var("p"), Term::var("f"), Term::var("l")],
            ))],
        ),
    ]);
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();
    assert!(query.sql.contains(")\n UNION ALL \n ("));
}

#[test]
fn left_join_renders_left_outer_join_with_on_scope() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("f"), Term::var("a")],
        vec![BodyAtom::LeftJoin(vec![
            BodyAtom::Data(DataAtom::new(
                "person",
                vec![Term::var("p"), Term::var("f"), Term::var("l")],
            )),
            BodyAtom::Data(DataAtom::new("email", vec![Term::var("p"), Term::var("a")])),
        ])],
    )]);
    let query = generator()
        .generate(&program, &["f".to_owned(), "a".to_owned()])
        .unwrap();

    assert!(query.sql.contains("LEFT OUTER JOIN"));
    assert!(query
        .sql
        .contains("(\"QpersonVIEW0\".\"id\" = \"QemailVIEW1\".\"id\")"));
    // The shared variable is scoped to the ON clause, not the WHERE.
    assert!(!query.sql.contains("WHERE"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["alice", "NULL"], &["smith", "smith@example.org"]])
    );
}

#[test]
fn inner_join_tree_renders_on_conditions() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x"), Term::var("c")],
        vec![BodyAtom::Join(vec![
            teaches_atom(Term::var("x"), Term::var("c")),
            BodyAtom::Data(DataAtom::new(
                "person",
                vec![Term::var("p"), Term::var("x"), Term::var("l")],
            )),
        ])],
    )]);
    let query = generator()
        .generate(&program, &["x".to_owned(), "c".to_owned()])
        .unwrap();

    assert!(query.sql.contains("JOIN"));
    assert!(query.sql.contains(" ON"));
    assert!(query
        .sql
        .contains("(\"QteachesVIEW0\".\"prof\" = \"QpersonVIEW1\".\"first\")"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["smith", "calculus"], &["smith", "logic"]])
    );
}

#[test]
fn self_join_normalizer_rewrites_conflicting_optional_join() -> anyhow::Result<()> {
    // The right side repeats the left variable n in a non-key position, so
    // the normalizer introduces a fresh variable plus an ON equality.
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("n"), Term::var("d")],
        vec![BodyAtom::LeftJoin(vec![
            BodyAtom::Data(DataAtom::new(
                "emp",
                vec![Term::var("e"), Term::var("d"), Term::var("n")],
            )),
            BodyAtom::Data(DataAtom::new("dept", vec![Term::var("d"), Term::var("n")])),
        ])],
    )]);
    let query = generator().generate(&program, &["n".to_owned(), "d".to_owned()])?;

    // The rewritten atom equates dept.name with emp.name in the ON clause.
    assert!(query
        .sql
        .contains("(\"QdeptVIEW1\".\"name\" = \"QempVIEW0\".\"name\")"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["bob", "20"], &["sales", "10"]])
    );
    Ok(())
}

#[test]
fn order_by_limit_offset_wrap_the_union() {
    let modifiers = QueryModifiers {
        order: vec![SortCondition {
            variable: "x".to_owned(),
            descending: true,
        }],
        limit: 2,
        ..QueryModifiers::default()
    };
    let program = Program::with_modifiers(
        vec![ans_rule(
            "ans1",
            vec![Term::var("x")],
            vec![teaches_atom(Term::var("x"), Term::var("c"))],
        )],
        modifiers,
    );
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    assert!(query.sql.starts_with("SELECT *\nFROM (\n"));
    assert!(query.sql.contains(") SUB_QVIEW"));
    assert!(query.sql.contains("ORDER BY \"SUB_QVIEW\".\"x\" DESC"));
    assert!(query.sql.contains("LIMIT 2"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(values(&rows), strings(&[&["smith"], &["smith"]]));
}

#[test]
fn limit_without_order_slices_the_union() {
    let modifiers = QueryModifiers {
        limit: 1,
        ..QueryModifiers::default()
    };
    let program = Program::with_modifiers(
        vec![ans_rule(
            "ans1",
            vec![Term::var("x")],
            vec![teaches_atom(Term::var("x"), Term::var("c"))],
        )],
        modifiers,
    );
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    assert!(!query.sql.contains("ORDER BY"));
    assert!(query.sql.contains("LIMIT 1"));
    assert_eq!(run(&setup_db(), &query.sql).len(), 1);
}

#[test]
fn group_by_marker_and_having_render_aggregates() {
    let count_courses = Term::functional(
        FunctionSymbol::Op(Operation::Count),
        vec![Term::var("c")],
    );
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("p"), count_courses.clone()],
        vec![
            teaches_atom(Term::var("p"), Term::var("c")),
            BodyAtom::Group(vec!["p".to_owned()]),
            BodyAtom::Having(vec![Expression::new(
                Operation::Gt,
                vec![
                    count_courses,
                    Term::Constant(Constant::typed("1", ColType::Integer)),
                ],
            )]),
        ],
    )]);
    let query = generator()
        .generate(&program, &["p".to_owned(), "n".to_owned()])
        .unwrap();

    assert!(query.sql.contains("GROUP BY \"QteachesVIEW0\".\"prof\""));
    assert!(query.sql.contains("HAVING"));
    assert!(query.sql.contains("COUNT(\"QteachesVIEW0\".\"course\")"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(sorted(values(&rows)), strings(&[&["smith", "2"]]));
}

#[test]
fn boolean_condition_renders_through_the_operator_table() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x"), Term::var("c")],
        vec![
            teaches_atom(Term::var("x"), Term::var("c")),
            BodyAtom::Operation(Expression::new(
                Operation::Neq,
                vec![Term::var("x"), Term::Constant(Constant::string("jones"))],
            )),
        ],
    )]);
    let query = generator()
        .generate(&program, &["x".to_owned(), "c".to_owned()])
        .unwrap();

    assert!(query.sql.contains("(\"QteachesVIEW0\".\"prof\" <> 'jones')"));
    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[&["smith", "calculus"], &["smith", "logic"]])
    );
}

#[test]
fn empty_body_selects_from_the_dummy_table() {
    let program = Program::new(vec![ans_rule("ans1", vec![], vec![])]);
    let query = generator().generate(&program, &[]).unwrap();

    assert!(query.sql.contains("(SELECT 1) tdummy"));
    assert!(query.sql.contains("'true' AS x"));
    assert_eq!(run(&setup_db(), &query.sql), strings(&[&["true"]]));
}

#[test]
fn uri_template_expands_to_concatenation() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::uri_template(
            "http://example.org/{}",
            vec![Term::var("x")],
        )],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let query = generator().generate(&program, &["x".to_owned()]).unwrap();

    assert!(query.sql.contains("'http://example.org/'"));
    assert!(query.sql.contains("||"));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(
        sorted(values(&rows)),
        strings(&[
            &["http://example.org/jones"],
            &["http://example.org/smith"],
            &["http://example.org/smith"],
        ])
    );
}

#[test]
fn iri_safe_encoding_wraps_template_arguments_in_replace() {
    let settings = GeneratorSettings {
        iri_safe_encoding: true,
        ..GeneratorSettings::default()
    };
    let generator = SqlGenerator::new(metadata(), GenericDialect, settings);
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::uri_template(
            "http://example.org/{}",
            vec![Term::var("x")],
        )],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let query = generator.generate(&program, &["x".to_owned()]).unwrap();

    assert!(query.sql.contains("REPLACE("));
    assert!(query.sql.contains("'%25'"));
}

#[test]
fn unbound_head_variable_is_an_internal_defect() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("missing")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let err = generator()
        .generate(&program, &["missing".to_owned()])
        .unwrap_err();
    assert!(matches!(err, CompileError::UnboundVariable(name) if name == "missing"));
}

#[test]
fn operator_without_dialect_rendering_is_unsupported() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::functional(
            FunctionSymbol::Op(Operation::Md5),
            vec![Term::var("x")],
        )],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let err = generator()
        .generate(&program, &["x".to_owned()])
        .unwrap_err();
    assert!(matches!(err, CompileError::Unsupported(_)));
}

#[test]
fn unknown_predicate_is_rejected() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![BodyAtom::Data(DataAtom::new(
            "nowhere",
            vec![Term::var("x")],
        ))],
    )]);
    let err = generator()
        .generate(&program, &["x".to_owned()])
        .unwrap_err();
    assert!(matches!(err, CompileError::UnknownPredicate(name) if name == "nowhere"));
}

#[test]
fn signature_must_match_the_projection_arity() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::var("x")],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let err = generator().generate(&program, &[]).unwrap_err();
    assert!(matches!(err, CompileError::Unsupported(_)));
}

#[test]
fn typed_literal_projects_its_type_code_and_language() {
    let program = Program::new(vec![ans_rule(
        "ans1",
        vec![Term::Constant(Constant::lang_string("hello", "en"))],
        vec![teaches_atom(Term::var("x"), Term::var("c"))],
    )]);
    let query = generator()
        .generate(&program, &["greeting".to_owned()])
        .unwrap();

    assert!(query.sql.contains(&format!(
        "{} AS \"greetingQuestType\"",
        ColType::LangString.code()
    )));
    assert!(query.sql.contains("'en' AS \"greetingLang\""));
    assert!(query.sql.contains("'hello' AS \"greeting\""));

    let rows = run(&setup_db(), &query.sql);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][1], "en");
    assert_eq!(rows[0][2], "hello");
}
