//! Principal model: who a session is, and which upstreams it may reach.
//!
//! A principal is either anonymous (authentication disabled) or a token bound
//! to an optional project. Allowlists are the intersection of the token's and
//! the project's lists, where an absent list means "everything".

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::error::RouterError;

/// Length of the hex-truncated token fingerprint carried into audit logs.
const FINGERPRINT_HEX_CHARS: usize = 12;

static ALLOW_ALL: Allowlist = Allowlist::All;

/// An allowlist that is either unrestricted or an explicit name set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowlist {
    All,
    Only(BTreeSet<String>),
}

impl Allowlist {
    pub fn from_names(names: Option<&[String]>) -> Self {
        match names {
            None => Self::All,
            Some(names) => Self::Only(names.iter().cloned().collect()),
        }
    }

    pub fn permits(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }

    /// Set intersection; `All` is the identity element.
    pub fn intersect(&self, other: &Allowlist) -> Allowlist {
        match (self, other) {
            (Self::All, other) => other.clone(),
            (this, Self::All) => this.clone(),
            (Self::Only(a), Self::Only(b)) => Self::Only(a.intersection(b).cloned().collect()),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// The authenticated identity bound to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Authentication is disabled; every upstream is visible.
    Anonymous,
    Token {
        /// Truncated SHA-256 of the token; the only identifier that may
        /// appear in logs and audit entries.
        fingerprint: String,
        project_id: Option<String>,
        allowed_upstreams: Allowlist,
        allowed_tags: Allowlist,
        rate_limit_rpm: Option<u32>,
    },
}

impl Principal {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Token { fingerprint, .. } => Some(fingerprint),
        }
    }

    pub fn rate_limit_rpm(&self) -> Option<u32> {
        match self {
            Self::Anonymous => None,
            Self::Token { rate_limit_rpm, .. } => *rate_limit_rpm,
        }
    }

    pub fn allowed_upstreams(&self) -> &Allowlist {
        match self {
            Self::Anonymous => &ALLOW_ALL,
            Self::Token {
                allowed_upstreams, ..
            } => allowed_upstreams,
        }
    }

    pub fn allowed_tags(&self) -> &Allowlist {
        match self {
            Self::Anonymous => &ALLOW_ALL,
            Self::Token { allowed_tags, .. } => allowed_tags,
        }
    }

    /// True when this principal may see the named upstream with these tags.
    pub fn can_see_upstream(&self, name: &str, tags: &[String]) -> bool {
        if !self.allowed_upstreams().permits(name) {
            return false;
        }
        match self.allowed_tags() {
            Allowlist::All => true,
            Allowlist::Only(allowed) => tags.iter().any(|tag| allowed.contains(tag)),
        }
    }
}

/// Truncated SHA-256 hex digest of a token value.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest
        .iter()
        .take(FINGERPRINT_HEX_CHARS / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Reject the call unless `principal` may dispatch to the named upstream.
pub fn assert_allowed_upstream(
    principal: &Principal,
    upstream_name: &str,
    upstream_tags: &[String],
) -> Result<(), RouterError> {
    if principal.can_see_upstream(upstream_name, upstream_tags) {
        Ok(())
    } else {
        Err(RouterError::Forbidden(upstream_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only(names: &[&str]) -> Allowlist {
        Allowlist::Only(names.iter().map(|s| s.to_string()).collect())
    }

    fn token_principal(upstreams: Allowlist, tags: Allowlist) -> Principal {
        Principal::Token {
            fingerprint: token_fingerprint("dev-token"),
            project_id: None,
            allowed_upstreams: upstreams,
            allowed_tags: tags,
            rate_limit_rpm: None,
        }
    }

    #[test]
    fn fingerprint_is_twelve_hex_chars() {
        let fp = token_fingerprint("dev-token");
        assert_eq!(fp.len(), 12);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic across calls.
        assert_eq!(fp, token_fingerprint("dev-token"));
        assert_ne!(fp, token_fingerprint("other-token"));
    }

    #[test]
    fn intersect_treats_all_as_top() {
        assert_eq!(Allowlist::All.intersect(&Allowlist::All), Allowlist::All);
        assert_eq!(Allowlist::All.intersect(&only(&["a"])), only(&["a"]));
        assert_eq!(only(&["a"]).intersect(&Allowlist::All), only(&["a"]));
        assert_eq!(
            only(&["a", "b"]).intersect(&only(&["b", "c"])),
            only(&["b"])
        );
        assert_eq!(only(&["a"]).intersect(&only(&["b"])), only(&[]));
    }

    #[test]
    fn anonymous_passes_every_check() {
        assert!(Principal::Anonymous.can_see_upstream("anything", &[]));
        assert!(
            assert_allowed_upstream(&Principal::Anonymous, "anything", &["private".into()]).is_ok()
        );
    }

    #[test]
    fn upstream_allowlist_restricts_by_name() {
        let principal = token_principal(only(&["demo1"]), Allowlist::All);
        assert!(principal.can_see_upstream("demo1", &[]));
        assert!(!principal.can_see_upstream("demo2", &[]));
        let err = assert_allowed_upstream(&principal, "demo2", &[]).unwrap_err();
        assert!(matches!(err, RouterError::Forbidden(name) if name == "demo2"));
    }

    #[test]
    fn tag_allowlist_requires_a_shared_tag() {
        let principal = token_principal(Allowlist::All, only(&["prod"]));
        assert!(principal.can_see_upstream("a", &["prod".into(), "eu".into()]));
        assert!(!principal.can_see_upstream("a", &["staging".into()]));
        assert!(!principal.can_see_upstream("a", &[]));
    }

    #[test]
    fn both_lists_must_permit() {
        let principal = token_principal(only(&["a", "b"]), only(&["demo"]));
        assert!(principal.can_see_upstream("a", &["demo".into()]));
        assert!(!principal.can_see_upstream("c", &["demo".into()]));
        assert!(!principal.can_see_upstream("a", &["other".into()]));
    }
}
