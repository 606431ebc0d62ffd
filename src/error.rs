use thiserror::Error;

/// Errors that abort a compilation. There is no partial SQL output: any of
/// these aborts the whole query for the affected predicate.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Rules of one predicate project incompatible types at the same head
    /// position.
    #[error("incompatible types for {predicate} at position {position}: {left} and {right}")]
    Typing {
        predicate: String,
        position: usize,
        left: String,
        right: String,
    },

    /// A function symbol or arity with no rendering in the active dialect.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A body variable with no resolvable column. Indicates an upstream
    /// contract violation, not a user error.
    #[error("unbound variable in rule body: {0}")]
    UnboundVariable(String),

    /// An algebra atom with no data children reached the join renderer.
    #[error("cannot generate a table definition for an empty join tree")]
    EmptyJoin,

    /// A body atom that is neither a base relation nor a defined predicate.
    /// Like an unbound variable, this is an upstream contract violation.
    #[error("no relation or defining rules for predicate {0}")]
    UnknownPredicate(String),

    /// Intensional predicates may not be mutually recursive at this stage.
    #[error("cyclic dependency through predicate {0}")]
    CyclicProgram(String),
}

pub type CompileResult<T> = Result<T, CompileError>;
