use regex::Regex;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Selects which inbound text frame answers a raw request
///
/// Validators compose: `Validator::all(vec![...])`, `Validator::any(vec![...])`
/// and `!validator`.
#[derive(Clone)]
pub enum Validator {
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Regex(Regex),
    Not(Box<Validator>),
    All(Vec<Validator>),
    Any(Vec<Validator>),
    Custom(Predicate),
}

impl Validator {
    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Validator::StartsWith(prefix.into())
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Validator::EndsWith(suffix.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Validator::Contains(needle.into())
    }

    /// Matches when `pattern` is found anywhere in the message
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Validator::Regex(Regex::new(pattern)?))
    }

    /// Matches when `validator` does not
    pub fn ne(validator: Validator) -> Self {
        Validator::Not(Box::new(validator))
    }

    /// Matches when every validator matches; an empty list matches everything
    pub fn all(validators: Vec<Validator>) -> Self {
        Validator::All(validators)
    }

    /// Matches when at least one validator matches; an empty list matches nothing
    pub fn any(validators: Vec<Validator>) -> Self {
        Validator::Any(validators)
    }

    /// Wrap an arbitrary predicate
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Validator::Custom(Arc::new(predicate))
    }

    /// Check a message against this validator
    pub fn check(&self, message: &str) -> bool {
        match self {
            Validator::StartsWith(prefix) => message.starts_with(prefix.as_str()),
            Validator::EndsWith(suffix) => message.ends_with(suffix.as_str()),
            Validator::Contains(needle) => message.contains(needle.as_str()),
            Validator::Regex(pattern) => pattern.is_match(message),
            Validator::Not(inner) => !inner.check(message),
            Validator::All(validators) => validators.iter().all(|v| v.check(message)),
            Validator::Any(validators) => validators.iter().any(|v| v.check(message)),
            Validator::Custom(predicate) => predicate(message),
        }
    }
}

impl std::ops::Not for Validator {
    type Output = Validator;

    fn not(self) -> Validator {
        Validator::ne(self)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::StartsWith(s) => f.debug_tuple("StartsWith").field(s).finish(),
            Validator::EndsWith(s) => f.debug_tuple("EndsWith").field(s).finish(),
            Validator::Contains(s) => f.debug_tuple("Contains").field(s).finish(),
            Validator::Regex(r) => f.debug_tuple("Regex").field(&r.as_str()).finish(),
            Validator::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Validator::All(list) => f.debug_tuple("All").field(list).finish(),
            Validator::Any(list) => f.debug_tuple("Any").field(list).finish(),
            Validator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
