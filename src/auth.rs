use std::fmt;

use subtle::ConstantTimeEq;

/// Shared-secret check for socket sessions. The chat front-end sends
/// `{"action":"auth","token":...}` before any command.
#[derive(Clone)]
pub struct TokenAuth {
    token: Option<String>,
}

impl TokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Accepts every session.
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn required(&self) -> bool {
        self.token.is_some()
    }

    /// Compare in time independent of where the first mismatch is.
    pub fn verify(&self, presented: &str) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth")
            .field("required", &self.required())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_accepts_anything() {
        let auth = TokenAuth::disabled();
        assert!(!auth.required());
        assert!(auth.verify(""));
        assert!(auth.verify("whatever"));
    }

    #[test]
    fn verify_token() {
        let auth = TokenAuth::new(Some("s3cret".into()));
        assert!(auth.required());
        assert!(auth.verify("s3cret"));
        assert!(!auth.verify("s3cre"));
        assert!(!auth.verify("s3cret!"));
        assert!(!auth.verify("S3cret"));
        assert!(!auth.verify(""));
    }

    #[test]
    fn debug_hides_token() {
        let auth = TokenAuth::new(Some("s3cret".into()));
        assert!(!format!("{auth:?}").contains("s3cret"));
    }
}
