//! Self-join elimination analysis for optional joins. Given the left
//! (required) and right (optional) data atoms of a left join, decides from
//! unique and foreign-key constraints whether the right side is provably
//! determined by the left, and rewrites it when argument sharing would
//! otherwise block the proof.
//!
//! Absence of evidence is never an error: without a matching constraint the
//! join is simply left as it is.

use tracing::debug;

use crate::ast::{BodyAtom, DataAtom, Expression, Program, Term, VariableGenerator};
use crate::metadata::{DatabaseMetadata, ForeignKeyConstraint, UniqueConstraint};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelfJoinAnalysis {
    /// No constraint matched; the join cannot be proven collapsible.
    NoConstraint,
    /// A constraint covers every right-hand position: the right atom is a
    /// functional extension of the left, nothing to rewrite.
    MatchesConstraint,
    /// A constraint matched but some positions conflict; the right atom is
    /// replaced and the displaced terms come back as equalities.
    Rewritten {
        right: DataAtom,
        expression: Expression,
    },
}

impl SelfJoinAnalysis {
    pub fn matches_constraint(&self) -> bool {
        !matches!(self, SelfJoinAnalysis::NoConstraint)
    }
}

pub fn analyze(
    left: &DataAtom,
    right: &DataAtom,
    metadata: &DatabaseMetadata,
    generator: &mut VariableGenerator,
) -> SelfJoinAnalysis {
    let (left_relation, right_relation) = match (
        metadata.relation(&left.predicate),
        metadata.relation(&right.predicate),
    ) {
        (Some(l), Some(r)) => (l, r),
        // One side is a derived view, not a base relation.
        _ => return SelfJoinAnalysis::NoConstraint,
    };

    // Unique constraints only apply to a genuine self-join; foreign keys
    // are consulted across relations unconditionally.
    let matched_ucs: Vec<&UniqueConstraint> = if left_relation.name == right_relation.name {
        left_relation
            .unique_constraints
            .iter()
            .filter(|uc| uc_matches(uc, left, right))
            .collect()
    } else {
        vec![]
    };

    let matched_fks: Vec<&ForeignKeyConstraint> = left_relation
        .foreign_keys
        .iter()
        .filter(|fk| fk.referenced_relation == right_relation.name)
        .filter(|fk| fk_matches(fk, left, right))
        .collect();

    if matched_ucs.is_empty() && matched_fks.is_empty() {
        return SelfJoinAnalysis::NoConstraint;
    }

    let free_positions = free_right_positions(&matched_ucs, &matched_fks, right.arity());
    let conflicting: Vec<usize> = free_positions
        .iter()
        .copied()
        .filter(|&i| is_conflicting(i, left, right, &free_positions))
        .collect();

    if conflicting.is_empty() {
        return SelfJoinAnalysis::MatchesConstraint;
    }

    let new_right = rewrite_right_atom(right, &conflicting, generator);
    let equalities: Vec<Expression> = right
        .terms
        .iter()
        .zip(&new_right.terms)
        .filter(|(former, new)| former != new)
        .map(|(former, new)| Expression::eq(new.clone(), former.clone()))
        .collect();
    let expression =
        Expression::fold_and(equalities).expect("a rewritten atom implies at least one equality");

    SelfJoinAnalysis::Rewritten {
        right: new_right,
        expression,
    }
}

fn uc_matches(constraint: &UniqueConstraint, left: &DataAtom, right: &DataAtom) -> bool {
    constraint.positions.iter().all(|&p| {
        match (left.terms.get(p), right.terms.get(p)) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        }
    })
}

fn fk_matches(constraint: &ForeignKeyConstraint, left: &DataAtom, right: &DataAtom) -> bool {
    constraint.components.iter().all(|c| {
        match (left.terms.get(c.attribute), right.terms.get(c.reference)) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        }
    })
}

/// Right-hand positions not covered by any matched constraint component,
/// ascending.
fn free_right_positions(
    matched_ucs: &[&UniqueConstraint],
    matched_fks: &[&ForeignKeyConstraint],
    arity: usize,
) -> Vec<usize> {
    (0..arity)
        .filter(|&i| !matched_ucs.iter().any(|uc| uc.positions.contains(&i)))
        .filter(|&i| {
            !matched_fks
                .iter()
                .any(|fk| fk.components.iter().any(|c| c.reference == i))
        })
        .collect()
}

/// A free position conflicts when its argument is ground, occurs in the
/// left atom, or repeats elsewhere in the right atom. An equality between
/// two free positions is counted once: the first occurrence stays.
fn is_conflicting(position: usize, left: &DataAtom, right: &DataAtom, free: &[usize]) -> bool {
    let argument = &right.terms[position];
    let variable = match argument {
        Term::Variable(_) => argument,
        // Ground term: pulled out as an equality.
        _ => return true,
    };

    if left.terms.contains(variable) {
        return true;
    }
    right
        .terms
        .iter()
        .enumerate()
        .filter(|(i, _)| *i < position || !free.contains(i))
        .any(|(_, t)| t == variable)
}

fn rewrite_right_atom(
    right: &DataAtom,
    conflicting: &[usize],
    generator: &mut VariableGenerator,
) -> DataAtom {
    let terms = right
        .terms
        .iter()
        .enumerate()
        .map(|(i, t)| {
            if conflicting.contains(&i) {
                Term::var(generator.fresh())
            } else {
                t.clone()
            }
        })
        .collect();
    DataAtom::new(right.predicate.clone(), terms)
}

/// Structural pass over a program: runs the analysis on every left join
/// whose two non-operation children are data atoms and splices the rewrite
/// back into the join node. Idempotent.
pub fn normalize_left_joins(program: &mut Program, metadata: &DatabaseMetadata) {
    let mut generator = VariableGenerator::for_program(program);
    for rule in &mut program.rules {
        for atom in &mut rule.body {
            normalize_atom(atom, metadata, &mut generator);
        }
    }
}

fn normalize_atom(atom: &mut BodyAtom, metadata: &DatabaseMetadata, generator: &mut VariableGenerator) {
    match atom {
        BodyAtom::Join(children) => {
            for c in children.iter_mut() {
                normalize_atom(c, metadata, generator);
            }
        }
        BodyAtom::LeftJoin(children) => {
            for c in children.iter_mut() {
                normalize_atom(c, metadata, generator);
            }
            let data_positions: Vec<usize> = children
                .iter()
                .enumerate()
                .filter(|(_, c)| matches!(c, BodyAtom::Data(_)))
                .map(|(i, _)| i)
                .collect();
            let has_algebra = children
                .iter()
                .any(|c| matches!(c, BodyAtom::Join(_) | BodyAtom::LeftJoin(_)));
            if has_algebra || data_positions.len() != 2 {
                return;
            }

            let (left, right) = match (&children[data_positions[0]], &children[data_positions[1]]) {
                (BodyAtom::Data(l), BodyAtom::Data(r)) => (l.clone(), r.clone()),
                _ => unreachable!(),
            };
            if let SelfJoinAnalysis::Rewritten { right: new_right, expression } =
                analyze(&left, &right, metadata, generator)
            {
                debug!(
                    left = %left.predicate,
                    right = %right.predicate,
                    "left join right child normalized against a constraint"
                );
                children[data_positions[1]] = BodyAtom::Data(new_right);
                children.push(BodyAtom::Operation(expression));
            }
        }
        BodyAtom::Data(_) | BodyAtom::Operation(_) | BodyAtom::Group(_) | BodyAtom::Having(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Constant;
    use crate::metadata::{RelationDefinition, SqlType};

    fn person_metadata() -> DatabaseMetadata {
        let mut metadata = DatabaseMetadata::new();
        metadata.add_relation(
            RelationDefinition::new("person")
                .with_attribute("id", SqlType::Integer)
                .with_attribute("first", SqlType::Varchar)
                .with_attribute("last", SqlType::Varchar)
                .with_unique_constraint("pk_person", vec![0]),
        );
        metadata
    }

    fn fk_metadata() -> DatabaseMetadata {
        let mut metadata = DatabaseMetadata::new();
        metadata.add_relation(
            RelationDefinition::new("emp")
                .with_attribute("id", SqlType::Integer)
                .with_attribute("dept", SqlType::Integer)
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

    fn generator() -> VariableGenerator {
        VariableGenerator::for_program(&Program::new(vec![]))
    }

    #[test]
    fn unique_constraint_self_join_needs_no_rewrite() {
        let metadata = person_metadata();
        let left = DataAtom::new("person", vec![Term::var("p"), Term::var("f"), Term::var("l1")]);
        let right = DataAtom::new("person", vec![Term::var("p"), Term::var("f2"), Term::var("l2")]);
        let outcome = analyze(&left, &right, &metadata, &mut generator());
        assert_eq!(outcome, SelfJoinAnalysis::MatchesConstraint);
    }

    #[test]
    fn foreign_key_covering_all_right_positions_needs_no_rewrite() {
        let metadata = fk_metadata();
        let mut md = metadata;
        // Widen the fk so both right positions are referenced.
        md.add_relation(
            RelationDefinition::new("emp")
                .with_attribute("id", SqlType::Integer)
                .with_attribute("dept", SqlType::Integer)
                .with_attribute("dept_name", SqlType::Varchar)
                .with_foreign_key("fk_emp_dept", "dept", vec![(1, 0), (2, 1)]),
        );
        let left = DataAtom::new("emp", vec![Term::var("e"), Term::var("d"), Term::var("n")]);
        let right = DataAtom::new("dept", vec![Term::var("d"), Term::var("n")]);
        let outcome = analyze(&left, &right, &md, &mut generator());
        assert_eq!(outcome, SelfJoinAnalysis::MatchesConstraint);
    }

    #[test]
    fn no_constraint_means_no_change() {
        let metadata = person_metadata();
        let left = DataAtom::new("person", vec![Term::var("p"), Term::var("f"), Term::var("l")]);
        let right =
            DataAtom::new("person", vec![Term::var("q"), Term::var("f2"), Term::var("l2")]);
        let outcome = analyze(&left, &right, &metadata, &mut generator());
        assert_eq!(outcome, SelfJoinAnalysis::NoConstraint);
    }

    #[test]
    fn left_variable_in_free_position_forces_rewrite() {
        let metadata = fk_metadata();
        let left = DataAtom::new("emp", vec![Term::var("e"), Term::var("d")]);
        // Right name position repeats a left variable.
        let right = DataAtom::new("dept", vec![Term::var("d"), Term::var("e")]);
        match analyze(&left, &right, &metadata, &mut generator()) {
            SelfJoinAnalysis::Rewritten { right: new_right, expression } => {
                assert_eq!(new_right.terms[0], Term::var("d"));
                let fresh = match &new_right.terms[1] {
                    Term::Variable(name) => name.clone(),
                    other => panic!("expected a fresh variable, got {:?}", other),
                };
                assert_ne!(fresh, "e");
                assert_eq!(
                    expression,
                    Expression::eq(Term::var(fresh), Term::var("e"))
                );
            }
            other => panic!("expected a rewrite, got {:?}", other),
        }
    }

    #[test]
    fn ground_term_in_free_position_forces_rewrite() {
        let metadata = fk_metadata();
        let left = DataAtom::new("emp", vec![Term::var("e"), Term::var("d")]);
        let right = DataAtom::new(
            "dept",
            vec![Term::var("d"), Term::Constant(Constant::string("sales"))],
        );
        match analyze(&left, &right, &metadata, &mut generator()) {
            SelfJoinAnalysis::Rewritten { right: new_right, expression } => {
                assert!(matches!(new_right.terms[1], Term::Variable(_)));
                assert_eq!(expression.op, crate::ast::Operation::Eq);
            }
            other => panic!("expected a rewrite, got {:?}", other),
        }
    }

    #[test]
    fn rewriting_is_idempotent() {
        let metadata = fk_metadata();
        let left = DataAtom::new("emp", vec![Term::var("e"), Term::var("d")]);
        let right = DataAtom::new("dept", vec![Term::var("d"), Term::var("e")]);
        let mut generator = generator();
        let rewritten = match analyze(&left, &right, &metadata, &mut generator) {
            SelfJoinAnalysis::Rewritten { right, .. } => right,
            other => panic!("expected a rewrite, got {:?}", other),
        };
        assert_eq!(
            analyze(&left, &rewritten, &metadata, &mut generator),
            SelfJoinAnalysis::MatchesConstraint
        );
    }

    #[test]
    fn internal_equality_of_free_positions_keeps_first_occurrence() {
        let mut metadata = DatabaseMetadata::new();
        metadata.add_relation(
            RelationDefinition::new("t")
                .with_attribute("a", SqlType::Integer)
                .with_attribute("b", SqlType::Varchar)
                .with_attribute("c", SqlType::Varchar)
                .with_unique_constraint("pk_t", vec![0]),
        );
        let left = DataAtom::new("t", vec![Term::var("k"), Term::var("x"), Term::var("y")]);
        // Fresh right-side variable repeated across two free positions: the
        // first occurrence is legitimate, the second conflicts.
        let right = DataAtom::new("t", vec![Term::var("k"), Term::var("w"), Term::var("w")]);
        match analyze(&left, &right, &metadata, &mut generator()) {
            SelfJoinAnalysis::Rewritten { right: new_right, .. } => {
                assert_eq!(new_right.terms[1], Term::var("w"));
                assert_ne!(new_right.terms[2], Term::var("w"));
            }
            other => panic!("expected a rewrite, got {:?}", other),
        }
    }
}
