//! Read-only catalog of the relational schema the rules are compiled
//! against: relations, attributes, unique constraints and foreign keys, as
//! extracted upstream by the metadata provider.

use std::collections::HashMap;

use crate::ast::ColType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    Varchar,
    Char,
    Integer,
    Bigint,
    Decimal,
    Double,
    Float,
    Boolean,
    Date,
    Time,
    Timestamp,
}

impl SqlType {
    pub fn is_character(self) -> bool {
        matches!(self, SqlType::Varchar | SqlType::Char)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SqlType::Integer | SqlType::Bigint | SqlType::Decimal | SqlType::Double | SqlType::Float
        )
    }

    /// Type name as it appears in a CAST expression.
    pub fn sql_name(self) -> &'static str {
        match self {
            SqlType::Varchar => "VARCHAR",
            SqlType::Char => "CHAR",
            SqlType::Integer => "INTEGER",
            SqlType::Bigint => "BIGINT",
            SqlType::Decimal => "DECIMAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Float => "FLOAT",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    /// SQL type a projected position of the given RDF type is cast to.
    pub fn for_col_type(col_type: ColType) -> SqlType {
        match col_type {
            ColType::Integer | ColType::Long => SqlType::Bigint,
            ColType::Decimal => SqlType::Decimal,
            ColType::Double => SqlType::Double,
            ColType::Float => SqlType::Float,
            ColType::Boolean => SqlType::Boolean,
            ColType::DateTime => SqlType::Timestamp,
            ColType::Date => SqlType::Date,
            ColType::Time => SqlType::Time,
            ColType::Null
            | ColType::Object
            | ColType::BNode
            | ColType::Literal
            | ColType::LangString
            | ColType::String => SqlType::Varchar,
        }
    }

    /// RDF type a column of this SQL type provides when nothing more precise
    /// is known.
    pub fn col_type(self) -> ColType {
        match self {
            SqlType::Varchar | SqlType::Char => ColType::String,
            SqlType::Integer | SqlType::Bigint => ColType::Integer,
            SqlType::Decimal => ColType::Decimal,
            SqlType::Double => ColType::Double,
            SqlType::Float => ColType::Float,
            SqlType::Boolean => ColType::Boolean,
            SqlType::Date => ColType::Date,
            SqlType::Time => ColType::Time,
            SqlType::Timestamp => ColType::DateTime,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub sql_type: SqlType,
}

/// Ordered subset of attribute positions that is unique in the relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: String,
    pub positions: Vec<usize>,
}

/// One referencing/referenced attribute position pair of a foreign key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FkComponent {
    pub attribute: usize,
    pub reference: usize,
}

/// Foreign key from the owning relation into `referenced_relation`. The
/// referenced positions always form a unique constraint there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub name: String,
    pub referenced_relation: String,
    pub components: Vec<FkComponent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationDefinition {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub foreign_keys: Vec<ForeignKeyConstraint>,
}

impl RelationDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        RelationDefinition {
            name: name.into(),
            attributes: vec![],
            unique_constraints: vec![],
            foreign_keys: vec![],
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            sql_type,
        });
        self
    }

    pub fn with_unique_constraint(mut self, name: impl Into<String>, positions: Vec<usize>) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name: name.into(),
            positions,
        });
        self
    }

    pub fn with_foreign_key(
        mut self,
        name: impl Into<String>,
        referenced_relation: impl Into<String>,
        components: Vec<(usize, usize)>,
    ) -> Self {
        self.foreign_keys.push(ForeignKeyConstraint {
            name: name.into(),
            referenced_relation: referenced_relation.into(),
            components: components
                .into_iter()
                .map(|(attribute, reference)| FkComponent {
                    attribute,
                    reference,
                })
                .collect(),
        });
        self
    }

    pub fn arity(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute(&self, position: usize) -> Option<&Attribute> {
        self.attributes.get(position)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DatabaseMetadata {
    relations: HashMap<String, RelationDefinition>,
}

impl DatabaseMetadata {
    pub fn new() -> Self {
        DatabaseMetadata::default()
    }

    pub fn add_relation(&mut self, relation: RelationDefinition) {
        self.relations.insert(relation.name.clone(), relation);
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.get(name)
    }

    pub fn contains_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }
}
