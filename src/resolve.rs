//! Target chat specifier parsing and resolution
//!
//! Runs once at startup to map a human-supplied channel specifier to a
//! numeric chat identity. Accepts a raw `-100…` identifier, `@username`,
//! invite links (`t.me/+…`, `t.me/joinchat/…`) and public internal-id links
//! (`t.me/c/<id>/…`).

use crate::source::MessageSource;
use lazy_regex::lazy_regex;
use tracing::{info, warn};

/// Match invite links: t.me/+code or t.me/joinchat/code
static RE_INVITE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"t\.me/(?:\+|joinchat/)([A-Za-z0-9_-]+)");

/// Match channel-by-internal-id links: t.me/c/<id>/…
static RE_INTERNAL: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"t\.me/c/(\d+)");

/// Parsed form of a channel specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Raw numeric chat identifier
    Id(i64),
    /// Public username, without the leading `@`
    Username(String),
    /// Invite code extracted from an invite link
    Invite(String),
    /// Internal channel id from a `t.me/c/…` link; the chat identifier is
    /// reconstructed with the `-100` channel prefix
    Internal(i64),
    /// Anything unparseable
    Unknown,
}

/// Parse a raw specifier into its syntactic form
#[must_use]
pub fn parse_target(raw: &str) -> TargetSpec {
    let spec = raw.trim();
    if spec.is_empty() {
        return TargetSpec::Unknown;
    }

    let digits = spec.strip_prefix('-').unwrap_or(spec);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(id) = spec.parse::<i64>() {
            return TargetSpec::Id(id);
        }
    }

    if let Some(username) = spec.strip_prefix('@') {
        return TargetSpec::Username(username.to_string());
    }

    if let Some(caps) = RE_INVITE.captures(spec) {
        return TargetSpec::Invite(caps[1].to_string());
    }

    if let Some(caps) = RE_INTERNAL.captures(spec) {
        if let Ok(id) = format!("-100{}", &caps[1]).parse::<i64>() {
            return TargetSpec::Internal(id);
        }
    }

    TargetSpec::Unknown
}

/// Resolve `raw` to a numeric chat identity through `source`.
///
/// `None` means the target could not be resolved; the caller then accepts
/// events from every chat the account can see. That is a degraded mode (safe
/// only when the account receives events solely from the intended chat) and
/// is logged explicitly rather than applied silently.
pub async fn resolve_target(source: &dyn MessageSource, raw: &str) -> Option<i64> {
    let resolved = match parse_target(raw) {
        TargetSpec::Id(id) => Some(id),
        TargetSpec::Internal(id) => Some(id),
        TargetSpec::Username(username) => resolve_username(source, &username).await,
        TargetSpec::Invite(code) => {
            // Joining keeps the subscription alive, but the invite form does
            // not carry enough to name the chat id.
            if let Err(e) = source.join_invite(&code).await {
                warn!(code, "invite join failed: {e}");
            }
            None
        }
        TargetSpec::Unknown => None,
    };

    match resolved {
        Some(id) => info!(chat_id = id, channel = raw, "target chat resolved"),
        None => warn!(
            channel = raw,
            "no resolved target identity; accepting events from all visible chats (degraded mode)"
        ),
    }
    resolved
}

async fn resolve_username(source: &dyn MessageSource, username: &str) -> Option<i64> {
    match source.resolve_identity(username).await {
        Ok(id) => Some(id),
        Err(first_err) => {
            // Not visible yet; a join attempt may make it resolvable
            // (harmless when already joined).
            if let Err(e) = source.join_public(username).await {
                warn!(username, "join/resolve failed: {e} (after: {first_err})");
                return None;
            }
            match source.resolve_identity(username).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(username, "join/resolve failed: {e}");
                    None
                }
            }
        }
    }
}
