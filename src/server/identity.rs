use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::types::SESSION_HEADER;

pub const ANONYMOUS: &str = "anonymous";
const MAX_SESSION_LEN: usize = 128;

/// Who is calling, taken from the session header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity(pub String);

impl SessionIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(id) if !id.is_empty() && id.len() <= MAX_SESSION_LEN => Self(id.to_string()),
            _ => Self(ANONYMOUS.to_string()),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for SessionIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok());
        Ok(Self::from_header(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_anonymous() {
        assert_eq!(SessionIdentity::from_header(None).as_str(), ANONYMOUS);
        assert_eq!(SessionIdentity::from_header(Some("  ")).as_str(), ANONYMOUS);
        let long = "x".repeat(MAX_SESSION_LEN + 1);
        assert_eq!(SessionIdentity::from_header(Some(&long)).as_str(), ANONYMOUS);
        assert_eq!(SessionIdentity::from_header(Some(" s-1 ")).as_str(), "s-1");
    }
}
