use std::collections::HashSet;

pub type Identifier = String;
pub type PredicateName = Identifier;
pub type VariableName = Identifier;

/// RDF term type codes, as they appear in the type column of every projected
/// position. The numeric codes are part of the output contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColType {
    Null,
    Object,
    BNode,
    Literal,
    LangString,
    Integer,
    Decimal,
    Double,
    String,
    DateTime,
    Boolean,
    Date,
    Time,
    Long,
    Float,
}

impl ColType {
    pub fn code(self) -> i32 {
        match self {
            ColType::Null => 0,
            ColType::Object => 1,
            ColType::BNode => 2,
            ColType::Literal => 3,
            ColType::LangString => -3,
            ColType::Integer => 4,
            ColType::Decimal => 5,
            ColType::Double => 6,
            ColType::String => 7,
            ColType::DateTime => 8,
            ColType::Boolean => 9,
            ColType::Date => 10,
            ColType::Time => 11,
            ColType::Long => 13,
            ColType::Float => 14,
        }
    }

    pub fn is_integer_family(self) -> bool {
        matches!(self, ColType::Integer | ColType::Long)
    }

    pub fn is_floating_family(self) -> bool {
        matches!(self, ColType::Decimal | ColType::Double | ColType::Float)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer_family() || self.is_floating_family()
    }

    pub fn is_string_family(self) -> bool {
        matches!(self, ColType::Literal | ColType::String | ColType::LangString)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constant {
    Iri(String),
    Literal {
        value: String,
        datatype: ColType,
        language: Option<String>,
    },
    BNode(String),
    Null,
}

impl Constant {
    pub fn iri(value: impl Into<String>) -> Self {
        Constant::Iri(value.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Constant::Literal {
            value: value.into(),
            datatype: ColType::String,
            language: None,
        }
    }

    pub fn typed(value: impl Into<String>, datatype: ColType) -> Self {
        Constant::Literal {
            value: value.into(),
            datatype,
            language: None,
        }
    }

    pub fn lang_string(value: impl Into<String>, tag: impl Into<String>) -> Self {
        Constant::Literal {
            value: value.into(),
            datatype: ColType::LangString,
            language: Some(tag.into()),
        }
    }
}

/// Symbols a functional term can carry. Closed: every renderer matches
/// exhaustively, so a new kind cannot be half-supported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FunctionSymbol {
    /// Boolean, arithmetic, string, date or aggregate operator.
    Op(Operation),
    /// RDF typing wrapper, e.g. integer(x) or langString(x, "en").
    Datatype(ColType),
    /// IRI built from a `{}` placeholder template in the first argument.
    UriTemplate,
    /// Blank node built the same way.
    BNodeTemplate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionalTerm {
    pub symbol: FunctionSymbol,
    pub terms: Vec<Term>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    Variable(VariableName),
    Constant(Constant),
    Functional(FunctionalTerm),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }

    pub fn functional(symbol: FunctionSymbol, terms: Vec<Term>) -> Self {
        Term::Functional(FunctionalTerm { symbol, terms })
    }

    pub fn typed(datatype: ColType, inner: Term) -> Self {
        Term::functional(FunctionSymbol::Datatype(datatype), vec![inner])
    }

    pub fn uri_template(template: impl Into<String>, args: Vec<Term>) -> Self {
        let mut terms = vec![Term::Constant(Constant::string(template))];
        terms.extend(args);
        Term::functional(FunctionSymbol::UriTemplate, terms)
    }

    /// A term with no variables anywhere inside it.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Variable(_) => false,
            Term::Constant(_) => true,
            Term::Functional(f) => f.terms.iter().all(Term::is_ground),
        }
    }

    pub fn collect_variables(&self, out: &mut HashSet<VariableName>) {
        match self {
            Term::Variable(name) => {
                out.insert(name.clone());
            }
            Term::Constant(_) => {}
            Term::Functional(f) => {
                for t in &f.terms {
                    t.collect_variables(out);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Abs,
    Ceil,
    Floor,
    Round,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    IsNull,
    IsNotNull,
    IsTrue,
    Like,
    StrStarts,
    StrEnds,
    Contains,
    Regex,
    Lang,
    Str,
    Cast,
    Replace,
    Concat,
    StrLen,
    Ucase,
    Lcase,
    Substr2,
    Substr3,
    StrBefore,
    StrAfter,
    EncodeForUri,
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Year,
    Month,
    Day,
    Hours,
    Minutes,
    Seconds,
    Tz,
    Now,
    Uuid,
    StrUuid,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    IfElseNull,
}

impl Operation {
    /// Statically known result type of the operator, when it has one.
    pub fn result_type(self) -> Option<ColType> {
        use Operation::*;
        match self {
            Eq | Neq | Gt | Gte | Lt | Lte | And | Or | Not | IsNull | IsNotNull | IsTrue
            | Like | StrStarts | StrEnds | Contains | Regex => Some(ColType::Boolean),
            Add | Subtract | Multiply | Divide | Abs | Ceil | Floor | Round | Sum | Avg
            | Min | Max => Some(ColType::Decimal),
            Concat | Replace | Ucase | Lcase | Substr2 | Substr3 | StrBefore | StrAfter
            | EncodeForUri | Str | Md5 | Sha1 | Sha256 | Sha512 | Lang | Tz | StrUuid => {
                Some(ColType::String)
            }
            StrLen | Year | Month | Day | Hours | Minutes | Seconds | Count => {
                Some(ColType::Integer)
            }
            Now => Some(ColType::DateTime),
            Uuid => Some(ColType::Object),
            Cast | IfElseNull => None,
        }
    }
}

/// An operation atom: a boolean or arithmetic condition over terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    pub op: Operation,
    pub terms: Vec<Term>,
}

impl Expression {
    pub fn new(op: Operation, terms: Vec<Term>) -> Self {
        Expression { op, terms }
    }

    pub fn eq(left: Term, right: Term) -> Self {
        Expression::new(Operation::Eq, vec![left, right])
    }

    pub fn into_term(self) -> Term {
        Term::functional(FunctionSymbol::Op(self.op), self.terms)
    }

    /// Folds a sequence of expressions into a single conjunction.
    pub fn fold_and(mut exprs: Vec<Expression>) -> Option<Expression> {
        if exprs.is_empty() {
            return None;
        }
        let first = exprs.remove(0);
        Some(exprs.into_iter().fold(first, |acc, e| {
            Expression::new(Operation::And, vec![acc.into_term(), e.into_term()])
        }))
    }

    pub fn collect_variables(&self, out: &mut HashSet<VariableName>) {
        for t in &self.terms {
            t.collect_variables(out);
        }
    }
}

/// A reference to a relation or a derived predicate, with positional
/// arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataAtom {
    pub predicate: PredicateName,
    pub terms: Vec<Term>,
}

impl DataAtom {
    pub fn new(predicate: impl Into<String>, terms: Vec<Term>) -> Self {
        DataAtom {
            predicate: predicate.into(),
            terms,
        }
    }

    pub fn arity(&self) -> usize {
        self.terms.len()
    }
}

/// One node of a rule body. `Join`/`LeftJoin` children mix data or algebra
/// atoms with operation atoms; the operation children are that join's ON
/// conditions. A `LeftJoin` carries exactly two non-operation children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyAtom {
    Data(DataAtom),
    Operation(Expression),
    Join(Vec<BodyAtom>),
    LeftJoin(Vec<BodyAtom>),
    Group(Vec<VariableName>),
    Having(Vec<Expression>),
}

impl BodyAtom {
    pub fn collect_variables(&self, out: &mut HashSet<VariableName>) {
        match self {
            BodyAtom::Data(atom) => {
                for t in &atom.terms {
                    t.collect_variables(out);
                }
            }
            BodyAtom::Operation(e) => e.collect_variables(out),
            BodyAtom::Join(children) | BodyAtom::LeftJoin(children) => {
                for c in children {
                    c.collect_variables(out);
                }
            }
            BodyAtom::Group(vars) => out.extend(vars.iter().cloned()),
            BodyAtom::Having(exprs) => {
                for e in exprs {
                    e.collect_variables(out);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub head: DataAtom,
    pub body: Vec<BodyAtom>,
}

impl Rule {
    pub fn new(head: DataAtom, body: Vec<BodyAtom>) -> Self {
        Rule { head, body }
    }

    /// Head variable names in first-occurrence order, used to name the
    /// columns of a synthesized view.
    pub fn head_variable_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.head.arity());
        let mut seen = HashSet::new();
        for term in &self.head.terms {
            collect_in_order(term, &mut names, &mut seen);
        }
        names
    }
}

fn collect_in_order(term: &Term, names: &mut Vec<String>, seen: &mut HashSet<String>) {
    match term {
        Term::Variable(name) => {
            if seen.insert(name.clone()) {
                names.push(name.clone());
            }
        }
        Term::Constant(_) => {}
        Term::Functional(f) => {
            for t in &f.terms {
                collect_in_order(t, names, seen);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortCondition {
    pub variable: VariableName,
    pub descending: bool,
}

/// Global query modifiers. `limit`/`offset` use -1 for "unset".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryModifiers {
    pub distinct: bool,
    pub order: Vec<SortCondition>,
    pub group: Vec<VariableName>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for QueryModifiers {
    fn default() -> Self {
        QueryModifiers {
            distinct: false,
            order: vec![],
            group: vec![],
            limit: -1,
            offset: -1,
        }
    }
}

impl QueryModifiers {
    pub fn has_modifiers(&self) -> bool {
        self.distinct
            || !self.order.is_empty()
            || !self.group.is_empty()
            || self.limit != -1
            || self.offset != -1
    }

    pub fn has_slice(&self) -> bool {
        self.limit != -1 || self.offset != -1
    }
}

#[derive(Clone, Debug)]
pub struct Program {
    pub rules: Vec<Rule>,
    pub modifiers: QueryModifiers,
}

impl Program {
    pub fn new(rules: Vec<Rule>) -> Self {
        Program {
            rules,
            modifiers: QueryModifiers::default(),
        }
    }

    pub fn with_modifiers(rules: Vec<Rule>, modifiers: QueryModifiers) -> Self {
        Program { rules, modifiers }
    }

    pub fn all_variable_names(&self) -> HashSet<VariableName> {
        let mut names = HashSet::new();
        for rule in &self.rules {
            for t in &rule.head.terms {
                t.collect_variables(&mut names);
            }
            for atom in &rule.body {
                atom.collect_variables(&mut names);
            }
        }
        names
    }
}

/// Source of fresh variables that cannot collide with any name already in
/// the program.
#[derive(Clone, Debug, Default)]
pub struct VariableGenerator {
    known: HashSet<String>,
    counter: usize,
}

impl VariableGenerator {
    pub fn for_program(program: &Program) -> Self {
        VariableGenerator {
            known: program.all_variable_names(),
            counter: 0,
        }
    }

    pub fn fresh(&mut self) -> VariableName {
        loop {
            let candidate = format!("f{}", self.counter);
            self.counter += 1;
            if self.known.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}
