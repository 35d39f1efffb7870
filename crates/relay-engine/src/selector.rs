//! Provider selectors: an explicit name, or a `tag:`/`version:` predicate
//! resolved against the visible upstream set.
//!
//! Version ranges follow the npm grammar: a bare version means an exact
//! match, and whitespace-separated comparators are an AND.

use semver::{Version, VersionReq};

use relay_config::NormalizedConfig;
use relay_core::error::RouterError;
use relay_core::principal::Principal;

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// An explicit provider name, passed through verbatim.
    Name(String),
    Tag {
        tag: String,
        range: Option<VersionReq>,
    },
    Version(VersionReq),
}

pub fn parse_selector(raw: &str) -> Result<Selector, RouterError> {
    if let Some(rest) = raw.strip_prefix("tag:") {
        let (tag, range) = match rest.split_once('@') {
            Some((tag, range)) => (tag, Some(parse_range(range)?)),
            None => (rest, None),
        };
        if tag.is_empty() {
            return Err(RouterError::BadRequest(format!(
                "selector '{raw}': empty tag"
            )));
        }
        return Ok(Selector::Tag {
            tag: tag.to_string(),
            range,
        });
    }
    if let Some(range) = raw.strip_prefix("version:") {
        return Ok(Selector::Version(parse_range(range)?));
    }
    Ok(Selector::Name(raw.to_string()))
}

/// Parse an npm-style range. `1.2.3` is exact; `>=1.2.0 <2` is the
/// comma-joined AND the semver crate expects.
fn parse_range(raw: &str) -> Result<VersionReq, RouterError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RouterError::BadRequest("empty version range".to_string()));
    }
    if Version::parse(trimmed).is_ok() {
        return VersionReq::parse(&format!("={trimmed}"))
            .map_err(|err| RouterError::BadRequest(format!("invalid range '{raw}': {err}")));
    }
    let normalized = trimmed.split_whitespace().collect::<Vec<_>>().join(", ");
    VersionReq::parse(&normalized)
        .map_err(|err| RouterError::BadRequest(format!("invalid range '{raw}': {err}")))
}

/// Candidate upstreams for a predicate selector, before breaker filtering:
/// enabled, visible to the principal, tag-matched, and version-satisfying.
/// Name order (ascending) is the tie-break.
pub fn candidates(
    cfg: &NormalizedConfig,
    principal: &Principal,
    selector: &Selector,
) -> Vec<String> {
    let (tag, range) = match selector {
        Selector::Name(_) => return Vec::new(),
        Selector::Tag { tag, range } => (Some(tag.as_str()), range.as_ref()),
        Selector::Version(range) => (None, Some(range)),
    };

    cfg.enabled_upstreams()
        .filter(|(name, upstream)| principal.can_see_upstream(name, &upstream.tags))
        .filter(|(_, upstream)| match tag {
            Some(tag) => upstream.tags.iter().any(|t| t == tag),
            None => true,
        })
        .filter(|(_, upstream)| match range {
            None => true,
            Some(range) => upstream
                .version
                .as_deref()
                .and_then(|v| Version::parse(v).ok())
                .map(|v| range.matches(&v))
                .unwrap_or(false),
        })
        .map(|(name, _)| name.clone())
        .collect()
}
