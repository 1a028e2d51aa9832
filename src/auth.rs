//! Bearer-token verification and claim handling.
//!
//! Tokens are symmetric HMAC-SHA256. The validation allow-list is pinned to
//! HS256 so a token whose header declares any other algorithm is rejected
//! outright (algorithm-confusion hardening). Expiry is enforced with zero
//! clock-skew tolerance.

use std::sync::LazyLock;

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::error::GatewayError;

/// Verified claims extracted from a bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    /// `sub` claim, empty when absent.
    pub subject: String,
    /// `name` claim, empty when absent.
    pub name: String,
    /// `admin` claim, false when absent.
    pub admin: bool,
    /// The issuer this verifier was configured with.
    pub issuer: String,
    /// `exp` as seconds since epoch, 0 when absent.
    pub expires_at: i64,
    /// `iat` as seconds since epoch, 0 when absent.
    pub issued_at: i64,
    /// The full raw claim map.
    pub raw: Map<String, Value>,
}

/// Validates compact signed tokens against a shared secret and expected issuer.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl TokenVerifier {
    /// Build a verifier for the given secret. When `issuer` is non-empty the
    /// token's `iss` claim must match it exactly.
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        if !issuer.is_empty() {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
        }
    }

    /// Verify a compact token string and extract its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
                ErrorKind::InvalidIssuer => GatewayError::InvalidIssuer,
                ErrorKind::MissingRequiredClaim(claim) if claim.as_str() == "iss" => {
                    GatewayError::InvalidIssuer
                }
                _ => GatewayError::InvalidToken,
            })?;
        Ok(self.claims_from(data.claims))
    }

    fn claims_from(&self, raw: Map<String, Value>) -> Claims {
        let subject = raw
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let admin = raw.get("admin").and_then(Value::as_bool).unwrap_or(false);
        let expires_at = raw.get("exp").and_then(Value::as_i64).unwrap_or(0);
        let issued_at = raw.get("iat").and_then(Value::as_i64).unwrap_or(0);
        Claims {
            subject,
            name,
            admin,
            issuer: self.issuer.clone(),
            expires_at,
            issued_at,
            raw,
        }
    }
}

/// Canonical string form of a claim value, used for header interpolation.
///
/// Strings are taken verbatim, booleans render as `true`/`false`, integral
/// numbers drop the fraction, null renders empty; anything else falls back to
/// its JSON form.
pub fn claim_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\.[A-Za-z0-9_]+\}\}").expect("valid regex"));

/// Substitute `{{.UserID}}` and `{{.<claim>}}` placeholders in a header
/// template from the request's resolved identity. Placeholders naming absent
/// claims render as empty.
pub fn render_template(template: &str, ctx: &RequestContext) -> String {
    let mut rendered = template.replace("{{.UserID}}", ctx.subject().unwrap_or_default());
    if let Some(claims) = ctx.claims() {
        for (key, value) in claims {
            let placeholder = format!("{{{{.{key}}}}}");
            if rendered.contains(&placeholder) {
                rendered = rendered.replace(&placeholder, &claim_to_string(value));
            }
        }
    }
    PLACEHOLDER.replace_all(&rendered, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Identity;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";
    const ISSUER: &str = "routegate-tests";

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn sign(claims: Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn token(overrides: Value) -> String {
        let mut claims = json!({
            "sub": "alice",
            "name": "Alice",
            "admin": true,
            "iss": ISSUER,
            "iat": now(),
            "exp": now() + 3600,
        });
        if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        sign(claims)
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        let claims = verifier.verify(&token(json!({}))).unwrap();
        assert_eq!(claims.subject, "alice");
        assert_eq!(claims.name, "Alice");
        assert!(claims.admin);
        assert_eq!(claims.issuer, ISSUER);
        assert!(claims.expires_at > now());
        assert_eq!(claims.raw.get("sub"), Some(&json!("alice")));
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        let expired = token(json!({ "exp": now() - 10 }));
        assert_eq!(verifier.verify(&expired), Err(GatewayError::TokenExpired));
    }

    #[test]
    fn rejects_wrong_issuer() {
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        let wrong = token(json!({ "iss": "someone-else" }));
        assert_eq!(verifier.verify(&wrong), Err(GatewayError::InvalidIssuer));
    }

    #[test]
    fn rejects_missing_issuer_when_required() {
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        let claims = json!({ "sub": "alice", "exp": now() + 3600 });
        assert_eq!(
            verifier.verify(&sign(claims)),
            Err(GatewayError::InvalidIssuer)
        );
    }

    #[test]
    fn accepts_any_issuer_when_not_configured() {
        let verifier = TokenVerifier::new(SECRET, "");
        let claims = verifier.verify(&token(json!({ "iss": "whoever" }))).unwrap();
        assert_eq!(claims.subject, "alice");
    }

    #[test]
    fn rejects_wrong_signature() {
        let verifier = TokenVerifier::new("other-secret", ISSUER);
        assert_eq!(
            verifier.verify(&token(json!({}))),
            Err(GatewayError::InvalidToken)
        );
    }

    #[test]
    fn rejects_non_allowlisted_algorithm() {
        // Signed with HS384: still HMAC, but outside the HS256 allow-list.
        let claims = json!({ "sub": "alice", "iss": ISSUER, "exp": now() + 3600 });
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        assert_eq!(verifier.verify(&token), Err(GatewayError::InvalidToken));
    }

    #[test]
    fn rejects_garbage() {
        let verifier = TokenVerifier::new(SECRET, ISSUER);
        assert_eq!(
            verifier.verify("not.a.token"),
            Err(GatewayError::InvalidToken)
        );
    }

    #[test]
    fn claim_string_forms() {
        assert_eq!(claim_to_string(&json!("x")), "x");
        assert_eq!(claim_to_string(&json!(true)), "true");
        assert_eq!(claim_to_string(&json!(42)), "42");
        assert_eq!(claim_to_string(&json!(42.0)), "42");
        assert_eq!(claim_to_string(&json!(1.5)), "1.5");
        assert_eq!(claim_to_string(&Value::Null), "");
    }

    #[test]
    fn renders_templates_from_identity() {
        let mut ctx = RequestContext::new("/a", "1.2.3.4:1".parse().unwrap());
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!("alice"));
        claims.insert("role".to_string(), json!("admin"));
        claims.insert("level".to_string(), json!(3));
        ctx.identity = Identity::User {
            subject: "alice".to_string(),
            claims,
        };
        assert_eq!(render_template("{{.UserID}}", &ctx), "alice");
        assert_eq!(render_template("{{.role}}", &ctx), "admin");
        assert_eq!(render_template("level-{{.level}}", &ctx), "level-3");
        assert_eq!(render_template("{{.missing}}", &ctx), "");
        assert_eq!(render_template("a-{{.missing}}-b", &ctx), "a--b");
        assert_eq!(render_template("plain", &ctx), "plain");
    }

    #[test]
    fn anonymous_renders_empty_user_id() {
        let ctx = RequestContext::new("/a", "1.2.3.4:1".parse().unwrap());
        assert_eq!(render_template("u={{.UserID}}", &ctx), "u=");
    }
}
