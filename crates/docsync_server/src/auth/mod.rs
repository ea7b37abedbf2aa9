//! Connection authentication.
//!
//! Clients pass a token in the `token` query parameter of the sync
//! endpoint. A rejected client receives an auth error message before the
//! socket is closed.

/// Decides whether a client may open a document.
pub trait Authenticator: Send + Sync {
    /// Returns the rejection reason on failure.
    fn authenticate(&self, document: &str, token: Option<&str>) -> Result<(), String>;
}

/// Compares the presented token with a single shared secret.
///
/// Without a configured secret every client is accepted.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    token: Option<String>,
}

impl TokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn open() -> Self {
        Self::default()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, document: &str, token: Option<&str>) -> Result<(), String> {
        if document.is_empty() {
            return Err("missing document name".to_string());
        }

        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };

        match token {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err("invalid token".to_string()),
            None => Err("missing token".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_server_accepts_anyone() {
        let auth = TokenAuthenticator::open();
        assert!(auth.authenticate("notes", None).is_ok());
        assert!(auth.authenticate("notes", Some("anything")).is_ok());
    }

    #[test]
    fn test_token_must_match() {
        let auth = TokenAuthenticator::new(Some("s3cret".into()));
        assert!(auth.authenticate("notes", Some("s3cret")).is_ok());
        assert_eq!(
            auth.authenticate("notes", Some("guess")),
            Err("invalid token".to_string())
        );
        assert_eq!(
            auth.authenticate("notes", None),
            Err("missing token".to_string())
        );
    }

    #[test]
    fn test_document_name_required() {
        let auth = TokenAuthenticator::open();
        assert!(auth.authenticate("", None).is_err());
    }
}
