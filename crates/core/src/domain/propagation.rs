// Propagation Domain Model

use serde::{Deserialize, Serialize};

/// Physical transaction identifier (UUID v4)
pub type TransactionId = String;

/// Propagation behavior chosen by each unit of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the ambient physical transaction, or create one
    #[default]
    Required,
    /// Suspend the ambient physical transaction (if any) and create an independent one
    RequiresNew,
    /// Savepoint inside the ambient physical transaction, or behave like `Required`
    Nested,
    /// Join the ambient physical transaction; fail if there is none
    Mandatory,
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Propagation::Required => write!(f, "REQUIRED"),
            Propagation::RequiresNew => write!(f, "REQUIRES_NEW"),
            Propagation::Nested => write!(f, "NESTED"),
            Propagation::Mandatory => write!(f, "MANDATORY"),
        }
    }
}

impl std::str::FromStr for Propagation {
    type Err = crate::domain::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "REQUIRES_NEW" => Ok(Propagation::RequiresNew),
            "NESTED" => Ok(Propagation::Nested),
            "MANDATORY" => Ok(Propagation::Mandatory),
            other => Err(crate::domain::DomainError::ValidationError(format!(
                "unknown propagation behavior: {}",
                other
            ))),
        }
    }
}

/// What a unit of work asks the coordinator for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDefinition {
    pub propagation: Propagation,

    #[serde(default)]
    pub read_only: bool,

    /// Diagnostic name, carried into logs
    #[serde(default)]
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            read_only: false,
            name: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<Propagation> for TransactionDefinition {
    fn from(propagation: Propagation) -> Self {
        Self::new(propagation)
    }
}

impl std::fmt::Display for TransactionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PROPAGATION_{}", self.propagation)?;
        if self.read_only {
            write!(f, ",readOnly")?;
        }
        if let Some(name) = &self.name {
            write!(f, " [{}]", name)?;
        }
        Ok(())
    }
}
