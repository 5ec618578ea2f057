use std::env;
use std::fmt;
use std::str::FromStr;

/// Broker session token (SSID) wrapper that prevents accidental logging
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    token: String,
}

impl SessionToken {
    /// Create a new session token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Get the raw token (use with caution)
    pub fn expose(&self) -> &str {
        &self.token
    }

    /// Load the token from an environment variable
    pub fn from_env(var_name: &str) -> Result<Self, CredentialsError> {
        env::var(var_name)
            .map_err(|_| CredentialsError::Missing(var_name.to_string()))
            .and_then(|token| {
                if token.trim().is_empty() {
                    Err(CredentialsError::Empty(var_name.to_string()))
                } else {
                    Ok(Self::new(token.trim()))
                }
            })
    }

    /// Validate token format
    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.token.is_empty() {
            return Err(CredentialsError::Empty("session token".to_string()));
        }
        if self.token.chars().any(char::is_whitespace) {
            return Err(CredentialsError::Malformed(
                "session token contains whitespace".to_string(),
            ));
        }
        if self.token.len() < 16 {
            return Err(CredentialsError::TooShort);
        }
        Ok(())
    }

    /// Mask the token for logging (shows only first 4 and last 4 characters)
    pub fn mask(&self) -> String {
        if self.token.len() <= 8 {
            "****".to_string()
        } else {
            format!(
                "{}...{}",
                &self.token[..4],
                &self.token[self.token.len() - 4..]
            )
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &self.mask())
            .finish()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mask())
    }
}

impl FromStr for SessionToken {
    type Err = CredentialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(CredentialsError::Empty("session token".to_string()))
        } else {
            Ok(Self::new(s))
        }
    }
}

/// Everything needed to (re)authenticate a session
///
/// Kept in memory only; the engine never writes credentials to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: SessionToken,
    /// Trade on the practice account
    pub demo: bool,
}

impl Credentials {
    pub fn new(token: impl Into<String>, demo: bool) -> Self {
        Self {
            token: SessionToken::new(token),
            demo,
        }
    }

    pub fn demo(token: impl Into<String>) -> Self {
        Self::new(token, true)
    }

    pub fn live(token: impl Into<String>) -> Self {
        Self::new(token, false)
    }

    /// Load credentials from `token_var`; the account is demo unless `demo_var` is "0" or "false"
    pub fn from_env(token_var: &str, demo_var: &str) -> Result<Self, CredentialsError> {
        let token = SessionToken::from_env(token_var)?;
        let demo = env::var(demo_var)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false"))
            .unwrap_or(true);
        if !demo {
            tracing::warn!("Using live account credentials from {}", token_var);
        }
        Ok(Self { token, demo })
    }

    pub fn validate(&self) -> Result<(), CredentialsError> {
        self.token.validate()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let account = if self.demo { "demo" } else { "live" };
        write!(f, "{} ({})", self.token, account)
    }
}

/// Credential errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    Missing(String),
    Empty(String),
    Malformed(String),
    TooShort,
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsError::Missing(var) => {
                write!(f, "Environment variable '{}' is not set", var)
            }
            CredentialsError::Empty(what) => write!(f, "'{}' is empty", what),
            CredentialsError::Malformed(msg) => write!(f, "Malformed credentials: {}", msg),
            CredentialsError::TooShort => {
                write!(f, "Session token is too short (minimum 16 characters)")
            }
        }
    }
}

impl std::error::Error for CredentialsError {}
