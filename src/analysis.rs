//! Dependency and type analysis over a rule program: bottom-up predicate
//! ordering, extensional/intensional classification, per-rule head term
//! typing and the unifying cast type of every projected position.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::ast::{
    BodyAtom, ColType, Constant, FunctionSymbol, PredicateName, Program, Rule, Term, VariableName,
};
use crate::error::{CompileError, CompileResult};
use crate::metadata::DatabaseMetadata;

/// Where the language tag of a LangString projection comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LanguageTag {
    Constant(String),
    Variable(VariableName),
}

/// Statically inferred RDF type of one head term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermType {
    pub col_type: ColType,
    pub language: Option<LanguageTag>,
}

impl TermType {
    fn plain(col_type: ColType) -> Self {
        TermType {
            col_type,
            language: None,
        }
    }
}

/// Identifies one rule: defining predicate plus position among its rules.
pub type RuleKey = (PredicateName, usize);

#[derive(Clone, Debug)]
pub struct ProgramAnalysis {
    /// All predicates, dependencies before dependents, the outermost
    /// predicate last. Extensional predicates come first.
    pub bottom_up: Vec<PredicateName>,
    pub extensional: HashSet<PredicateName>,
    /// Defining rules per intensional predicate, in program order.
    pub rule_index: HashMap<PredicateName, Vec<Rule>>,
    /// Inferred type of every head term of every rule (None for plain
    /// variables, whose type is only known at SELECT rendering time).
    pub term_types: HashMap<RuleKey, Vec<Option<TermType>>>,
    /// Unifying SQL-side cast type per head position of each intensional
    /// predicate.
    pub cast_types: HashMap<PredicateName, Vec<ColType>>,
}

impl ProgramAnalysis {
    pub fn is_intensional(&self, predicate: &str) -> bool {
        self.rule_index.contains_key(predicate)
    }

    /// The designated outermost predicate.
    pub fn root(&self) -> &str {
        self.bottom_up.last().expect("analysis of empty program")
    }
}

pub fn analyze(program: &Program, metadata: &DatabaseMetadata) -> CompileResult<ProgramAnalysis> {
    if program.rules.is_empty() {
        return Err(CompileError::UnknownPredicate("<empty program>".to_owned()));
    }

    let mut rule_index: HashMap<PredicateName, Vec<Rule>> = HashMap::new();
    let mut first_seen: Vec<PredicateName> = vec![];
    for rule in &program.rules {
        let entry = rule_index.entry(rule.head.predicate.clone()).or_default();
        if entry.is_empty() {
            first_seen.push(rule.head.predicate.clone());
        }
        entry.push(rule.clone());
    }

    // The first rule defines the outermost predicate; everything else is
    // ordered below it.
    let root = program.rules[0].head.predicate.clone();

    let mut extensional_order: Vec<PredicateName> = vec![];
    let mut extensional: HashSet<PredicateName> = HashSet::new();
    let mut edges: HashMap<PredicateName, Vec<PredicateName>> = HashMap::new();
    for pred in &first_seen {
        let mut referenced = vec![];
        for rule in &rule_index[pred] {
            for atom in &rule.body {
                collect_referenced(atom, &mut referenced);
            }
        }
        for dep in &referenced {
            if !rule_index.contains_key(dep) && extensional.insert(dep.clone()) {
                extensional_order.push(dep.clone());
            }
        }
        edges.insert(pred.clone(), referenced);
    }

    let intensional_order = topological_order(&first_seen, &edges, &rule_index, &root)?;

    let mut bottom_up = extensional_order;
    bottom_up.extend(intensional_order);
    debug!(order = ?bottom_up, "predicates ordered bottom-up");

    let mut term_types: HashMap<RuleKey, Vec<Option<TermType>>> = HashMap::new();
    for (pred, rules) in &rule_index {
        for (i, rule) in rules.iter().enumerate() {
            let types = rule.head.terms.iter().map(infer_term_type).collect();
            term_types.insert((pred.clone(), i), types);
        }
    }

    // Cast types are computed bottom-up so that a variable bound through an
    // already-typed predicate can reuse its position type.
    let mut cast_types: HashMap<PredicateName, Vec<ColType>> = HashMap::new();
    for pred in &bottom_up {
        let rules = match rule_index.get(pred) {
            Some(rules) => rules,
            None => continue,
        };
        let mut unified: Vec<ColType> = vec![];
        for (i, rule) in rules.iter().enumerate() {
            for (position, term) in rule.head.terms.iter().enumerate() {
                let proposed = proposed_cast_type(term, rule, &rule_index, &cast_types, metadata);
                if i == 0 {
                    unified.push(proposed);
                } else {
                    unified[position] =
                        unify_cast_types(unified[position], proposed).map_err(|(left, right)| {
                            CompileError::Typing {
                                predicate: pred.clone(),
                                position,
                                left: format!("{:?}", left),
                                right: format!("{:?}", right),
                            }
                        })?;
                }
            }
        }
        cast_types.insert(pred.clone(), unified);
    }

    Ok(ProgramAnalysis {
        bottom_up,
        extensional,
        rule_index,
        term_types,
        cast_types,
    })
}

fn collect_referenced(atom: &BodyAtom, out: &mut Vec<PredicateName>) {
    match atom {
        BodyAtom::Data(data) => out.push(data.predicate.clone()),
        BodyAtom::Join(children) | BodyAtom::LeftJoin(children) => {
            for c in children {
                collect_referenced(c, out);
            }
        }
        BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => {}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

/// Depth-first post-order over intensional predicates; ties broken by
/// first-seen order, the root forced last. Cycles are fatal.
fn topological_order(
    first_seen: &[PredicateName],
    edges: &HashMap<PredicateName, Vec<PredicateName>>,
    rule_index: &HashMap<PredicateName, Vec<Rule>>,
    root: &str,
) -> CompileResult<Vec<PredicateName>> {
    let mut states: HashMap<&str, VisitState> = HashMap::new();
    let mut order: Vec<PredicateName> = vec![];

    fn visit<'a>(
        pred: &'a str,
        edges: &'a HashMap<PredicateName, Vec<PredicateName>>,
        rule_index: &HashMap<PredicateName, Vec<Rule>>,
        states: &mut HashMap<&'a str, VisitState>,
        order: &mut Vec<PredicateName>,
    ) -> CompileResult<()> {
        match states.get(pred) {
            Some(VisitState::Done) => return Ok(()),
            Some(VisitState::InProgress) => {
                return Err(CompileError::CyclicProgram(pred.to_owned()));
            }
            None => {}
        }
        states.insert(pred, VisitState::InProgress);
        if let Some(deps) = edges.get(pred) {
            for dep in deps {
                if rule_index.contains_key(dep) {
                    visit(dep, edges, rule_index, states, order)?;
                }
            }
        }
        states.insert(pred, VisitState::Done);
        order.push(pred.to_owned());
        Ok(())
    }

    for pred in first_seen {
        if pred != root {
            visit(pred, edges, rule_index, &mut states, &mut order)?;
        }
    }
    visit(root, edges, rule_index, &mut states, &mut order)?;

    // A predicate unreachable from the root may still land after it.
    if let Some(i) = order.iter().position(|p| p == root) {
        let r = order.remove(i);
        order.push(r);
    }
    Ok(order)
}

/// Walks a head term's function symbol to its RDF type. Plain variables
/// carry no static type.
pub fn infer_term_type(term: &Term) -> Option<TermType> {
    match term {
        Term::Variable(_) => None,
        Term::Constant(c) => Some(match c {
            Constant::Iri(_) => TermType::plain(ColType::Object),
            Constant::BNode(_) => TermType::plain(ColType::BNode),
            Constant::Null => TermType::plain(ColType::Null),
            Constant::Literal {
                datatype, language, ..
            } => TermType {
                col_type: *datatype,
                language: language.clone().map(LanguageTag::Constant),
            },
        }),
        Term::Functional(f) => match &f.symbol {
            FunctionSymbol::UriTemplate => Some(TermType::plain(ColType::Object)),
            FunctionSymbol::BNodeTemplate => Some(TermType::plain(ColType::BNode)),
            FunctionSymbol::Datatype(col_type) => {
                let language = if *col_type == ColType::LangString {
                    match f.terms.get(1) {
                        Some(Term::Constant(Constant::Literal { value, .. })) => {
                            Some(LanguageTag::Constant(value.clone()))
                        }
                        Some(Term::Variable(name)) => Some(LanguageTag::Variable(name.clone())),
                        _ => None,
                    }
                } else {
                    None
                };
                Some(TermType {
                    col_type: *col_type,
                    language,
                })
            }
            FunctionSymbol::Op(op) => op.result_type().map(TermType::plain),
        },
    }
}

/// Cast type one rule proposes for a head position. For a plain variable
/// the type is read off the first body atom binding it: an intensional atom
/// supplies its own cast type for that position, an extensional atom the
/// declared column type.
fn proposed_cast_type(
    term: &Term,
    rule: &Rule,
    rule_index: &HashMap<PredicateName, Vec<Rule>>,
    cast_types: &HashMap<PredicateName, Vec<ColType>>,
    metadata: &DatabaseMetadata,
) -> ColType {
    if let Some(term_type) = infer_term_type(term) {
        return term_type.col_type;
    }
    let name = match term {
        Term::Variable(name) => name,
        _ => return ColType::String,
    };
    for atom in &rule.body {
        if let Some(col_type) = binding_type(atom, name, rule_index, cast_types, metadata) {
            return col_type;
        }
    }
    ColType::String
}

fn binding_type(
    atom: &BodyAtom,
    variable: &str,
    rule_index: &HashMap<PredicateName, Vec<Rule>>,
    cast_types: &HashMap<PredicateName, Vec<ColType>>,
    metadata: &DatabaseMetadata,
) -> Option<ColType> {
    match atom {
        BodyAtom::Data(data) => {
            let position = data
                .terms
                .iter()
                .position(|t| matches!(t, Term::Variable(v) if v == variable))?;
            if rule_index.contains_key(&data.predicate) {
                cast_types
                    .get(&data.predicate)
                    .and_then(|types| types.get(position))
                    .copied()
            } else {
                metadata
                    .relation(&data.predicate)
                    .and_then(|rel| rel.attribute(position))
                    .map(|attr| attr.sql_type.col_type())
            }
        }
        BodyAtom::Join(children) | BodyAtom::LeftJoin(children) => children
            .iter()
            .find_map(|c| binding_type(c, variable, rule_index, cast_types, metadata)),
        BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => None,
    }
}

fn numeric_rank(col_type: ColType) -> u8 {
    match col_type {
        ColType::Integer => 0,
        ColType::Long => 1,
        ColType::Decimal => 2,
        ColType::Float => 3,
        ColType::Double => 4,
        _ => 0,
    }
}

/// Widens two proposed cast types within a family; across families there is
/// no common supertype and typing fails.
pub fn unify_cast_types(left: ColType, right: ColType) -> Result<ColType, (ColType, ColType)> {
    use ColType::*;
    if left == right {
        return Ok(left);
    }
    match (left, right) {
        (Null, other) | (other, Null) => Ok(other),
        (a, b) if a.is_numeric() && b.is_numeric() => {
            Ok(if numeric_rank(a) >= numeric_rank(b) { a } else { b })
        }
        (a, b) if a.is_string_family() && b.is_string_family() => Ok(String),
        (Object, BNode) | (BNode, Object) => Ok(Object),
        (Object, b) | (b, Object) if b.is_string_family() => Ok(String),
        (BNode, b) | (b, BNode) if b.is_string_family() => Ok(String),
        _ => Err((left, right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::DataAtom;

    fn rule(head_pred: &str, head_vars: &[&str], body_atoms: Vec<BodyAtom>) -> Rule {
        Rule::new(
            DataAtom::new(head_pred, head_vars.iter().map(|v| Term::var(*v)).collect()),
            body_atoms,
        )
    }

    fn data(pred: &str, vars: &[&str]) -> BodyAtom {
        BodyAtom::Data(DataAtom::new(
            pred,
            vars.iter().map(|v| Term::var(*v)).collect(),
        ))
    }

    #[test]
    fn orders_predicates_bottom_up() {
        let program = Program::new(vec![
            rule("ans1", &["x"], vec![data("ans2", &["x"])]),
            rule("ans2", &["x"], vec![data("emp", &["x", "y"])]),
        ]);
        let analysis = analyze(&program, &DatabaseMetadata::new()).unwrap();
        assert_eq!(analysis.bottom_up, vec!["emp", "ans2", "ans1"]);
        assert!(analysis.extensional.contains("emp"));
        assert_eq!(analysis.root(), "ans1");
    }

    #[test]
    fn rejects_cyclic_definitions() {
        let program = Program::new(vec![
            rule("ans1", &["x"], vec![data("p", &["x"])]),
            rule("p", &["x"], vec![data("q", &["x"])]),
            rule("q", &["x"], vec![data("p", &["x"])]),
        ]);
        let err = analyze(&program, &DatabaseMetadata::new()).unwrap_err();
        assert!(matches!(err, CompileError::CyclicProgram(_)));
    }

    #[test]
    fn unification_widens_numerics_and_rejects_mixed_families() {
        assert_eq!(
            unify_cast_types(ColType::Integer, ColType::Double),
            Ok(ColType::Double)
        );
        assert_eq!(
            unify_cast_types(ColType::LangString, ColType::String),
            Ok(ColType::String)
        );
        assert!(unify_cast_types(ColType::String, ColType::Integer).is_err());
    }

    #[test]
    fn typing_error_for_incompatible_rule_projections() {
        let program = Program::new(vec![
            rule(
                "ans1",
                &[],
                vec![data("t", &["x"])],
            ),
            rule(
                "ans1",
                &[],
                vec![data("t", &["x"])],
            ),
        ]);
        // Same predicate, one rule projecting a string and one an integer.
        let mut program = program;
        program.rules[0].head.terms = vec![Term::typed(ColType::String, Term::var("x"))];
        program.rules[1].head.terms = vec![Term::typed(ColType::Integer, Term::var("x"))];
        let err = analyze(&program, &DatabaseMetadata::new()).unwrap_err();
        assert!(matches!(err, CompileError::Typing { position: 0, .. }));
    }
}
