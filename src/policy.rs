//! Turns a verified fingerprint list into an admission decision.

use std::collections::HashSet;

use tracing::{error, info, warn};

use crate::config::{ListMatchAction, PluginListType, PolicySettings};
use crate::context::GateContext;
use crate::crypto;
use crate::hasher::{self, ExecutionEnv, HasherArg};
use crate::outcome::{ValidationResultCode, ValidationResultData};
use crate::transport_adapter::PeerId;

/// Fingerprints that conflict with the configured list. Comparison ignores
/// case, and entries of the security module itself never conflict.
pub fn conflicts(settings: &PolicySettings, fingerprints: &[String], security_marker: &str) -> Vec<String> {
    let security: HashSet<String> = settings
        .security_hashes(security_marker)
        .map(str::to_lowercase)
        .collect();
    let selected: HashSet<String> = settings.selected_hashes().map(str::to_lowercase).collect();

    let mut seen = HashSet::new();
    fingerprints
        .iter()
        .filter(|hash| {
            let key = hash.to_lowercase();
            if security.contains(&key) || !seen.insert(key.clone()) {
                return false;
            }
            match settings.plugin_list_type {
                PluginListType::Blacklist => selected.contains(&key),
                PluginListType::Whitelist => !selected.contains(&key),
            }
        })
        .cloned()
        .collect()
}

pub fn evaluate(settings: &PolicySettings, fingerprints: &[String], security_marker: &str) -> ValidationResultData {
    let conflicting = conflicts(settings, fingerprints, security_marker);
    if conflicting.is_empty() {
        return ValidationResultData::allowed(Vec::new());
    }
    match settings.list_match_action {
        ListMatchAction::Accept => ValidationResultData::allowed(conflicting),
        ListMatchAction::Deny | ListMatchAction::None => {
            ValidationResultData::rejected(ValidationResultCode::RejectedMatch, conflicting)
        }
    }
}

/// Full validation of a response: token, attestation, then list policy.
///
/// `verifier_module` is the server flavor of the session's attestation
/// module; it is run against every catalog module carrying the security
/// marker and one of the results must equal `claimed`.
pub fn validate(
    ctx: &GateContext,
    peer: PeerId,
    token: &str,
    claimed: Option<&str>,
    verifier_module: &[u8],
    fingerprints: &[String],
) -> ValidationResultData {
    let data = decide(ctx, peer, token, claimed, verifier_module, fingerprints);
    if data.plugin_list.is_empty() {
        info!(peer = %peer, success = data.success, code = ?data.code, conflicts = "no conflicts", "validation finished");
    } else {
        info!(peer = %peer, success = data.success, code = ?data.code, conflicts = ?data.plugin_list, "validation finished");
    }
    data
}

fn decide(
    ctx: &GateContext,
    peer: PeerId,
    token: &str,
    claimed: Option<&str>,
    verifier_module: &[u8],
    fingerprints: &[String],
) -> ValidationResultData {
    let code = ctx.tokens.validate(peer, token);
    if code != ValidationResultCode::ValidToken {
        return ValidationResultData::rejected(code, Vec::new());
    }

    let policy = ctx.policy();
    if !attestation_matches(ctx, peer, claimed, verifier_module) {
        if policy.list_match_action == ListMatchAction::Deny {
            return ValidationResultData::rejected(ValidationResultCode::RejectedCleanSpaceHash, Vec::new());
        }
        warn!(target: "security", peer = %peer, "attestation mismatch tolerated by list action");
    }

    evaluate(&policy, fingerprints, ctx.security_marker())
}

fn attestation_matches(ctx: &GateContext, peer: PeerId, claimed: Option<&str>, verifier_module: &[u8]) -> bool {
    let Some(claimed) = claimed.filter(|c| !c.is_empty()) else {
        warn!(target: "security", peer = %peer, "response carried no attestation");
        return false;
    };
    let env = ExecutionEnv {
        catalog: ctx.catalog.as_ref(),
        security_marker: ctx.security_marker(),
    };
    let references: Vec<_> = ctx
        .catalog
        .loaded_modules()
        .into_iter()
        .filter(|m| m.name.contains(ctx.security_marker()))
        .collect();
    if references.is_empty() {
        error!(marker = %ctx.security_marker(), "no reference security module loaded");
        return false;
    }

    let matched = references.iter().any(|module| {
        match hasher::execute(verifier_module, &env, &[HasherArg::Module(module)]) {
            Ok(expected) => crypto::constant_time_eq(expected.as_bytes(), claimed.as_bytes()),
            Err(err) => {
                error!(module = %module.name, error = %err, "verifier module failed");
                false
            }
        }
    });
    if !matched {
        warn!(target: "security", peer = %peer, "attestation does not match any reference module");
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginListEntry;

    fn entry(hash: &str, assembly: &str, selected: bool) -> PluginListEntry {
        PluginListEntry {
            is_selected: selected,
            name: assembly.to_string(),
            assembly_name: assembly.to_string(),
            version: "1.0".to_string(),
            hash: hash.to_string(),
            ..PluginListEntry::default()
        }
    }

    fn settings(list: PluginListType, action: ListMatchAction) -> PolicySettings {
        PolicySettings {
            plugin_list_type: list,
            list_match_action: action,
            analyzed_plugins: vec![
                entry("AAAA", "Allowed.Plugin", true),
                entry("BBBB", "Cheat.Plugin", true),
                entry("CCCC", "CleanSpaceShared", true),
                entry("DDDD", "Unselected.Plugin", false),
            ],
        }
    }

    fn list(hashes: &[&str]) -> Vec<String> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn whitelist_deny_rejects_unlisted_plugin() {
        let data = evaluate(
            &settings(PluginListType::Whitelist, ListMatchAction::Deny),
            &list(&["AAAA", "EEEE"]),
            "CleanSpace",
        );
        assert!(!data.success);
        assert_eq!(data.code, ValidationResultCode::RejectedMatch);
        assert_eq!(data.plugin_list, list(&["EEEE"]));
    }

    #[test]
    fn blacklist_accept_surfaces_conflicts() {
        let data = evaluate(
            &settings(PluginListType::Blacklist, ListMatchAction::Accept),
            &list(&["BBBB", "EEEE"]),
            "CleanSpace",
        );
        assert!(data.success);
        assert_eq!(data.code, ValidationResultCode::Allowed);
        assert_eq!(data.plugin_list, list(&["BBBB"]));
    }

    #[test]
    fn none_action_behaves_like_deny() {
        let data = evaluate(
            &settings(PluginListType::Blacklist, ListMatchAction::None),
            &list(&["bbbb"]),
            "CleanSpace",
        );
        assert_eq!(data.code, ValidationResultCode::RejectedMatch);
    }

    #[test]
    fn unselected_entries_do_not_whitelist() {
        let data = evaluate(
            &settings(PluginListType::Whitelist, ListMatchAction::Deny),
            &list(&["DDDD"]),
            "CleanSpace",
        );
        assert_eq!(data.plugin_list, list(&["DDDD"]));
    }

    #[test]
    fn security_module_never_conflicts() {
        let mut s = settings(PluginListType::Blacklist, ListMatchAction::Deny);
        s.analyzed_plugins[2].is_selected = true;
        assert!(conflicts(&s, &list(&["CCCC"]), "CleanSpace").is_empty());
    }

    #[test]
    fn no_plugins_is_allowed_with_empty_list() {
        for list_type in [PluginListType::Whitelist, PluginListType::Blacklist] {
            let data = evaluate(&settings(list_type, ListMatchAction::Deny), &[], "CleanSpace");
            assert_eq!(data, ValidationResultData::allowed(Vec::new()));
        }
    }

    #[test]
    fn duplicates_are_reported_once() {
        let data = evaluate(
            &settings(PluginListType::Whitelist, ListMatchAction::Deny),
            &list(&["EEEE", "eeee"]),
            "CleanSpace",
        );
        assert_eq!(data.plugin_list, list(&["EEEE"]));
    }
}
