//! CDP emulation and event translation (spec §4.E, §4.F).

pub mod emulator;
pub mod translator;
pub mod wire;

use crate::state::TargetInfo;

/// Restricted-target filter (spec §4.E): a target is restricted if its
/// `type` is neither `"page"` nor `"iframe"`, or its URL begins with a
/// blocked scheme and (for `chrome-extension://`) its id is not in the
/// allow-list.
pub fn is_restricted(target: &TargetInfo, extension_origin_allowlist: &[String]) -> bool {
    if target.r#type != "page" && target.r#type != "iframe" {
        return true;
    }
    for scheme in ["chrome://", "devtools://", "edge://"] {
        if target.url.starts_with(scheme) {
            return true;
        }
    }
    if let Some(rest) = target.url.strip_prefix("chrome-extension://") {
        let id = rest.split('/').next().unwrap_or("");
        if !extension_origin_allowlist.iter().any(|allowed| allowed == id) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(r#type: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: "T1".into(),
            r#type: r#type.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[test]
    fn pages_and_iframes_are_not_restricted_by_default() {
        assert!(!is_restricted(&target("page", "https://a"), &[]));
        assert!(!is_restricted(&target("iframe", "https://a"), &[]));
    }

    #[test]
    fn worker_targets_are_restricted() {
        assert!(is_restricted(&target("service_worker", "https://a"), &[]));
    }

    #[test]
    fn internal_schemes_are_restricted() {
        assert!(is_restricted(&target("page", "chrome://newtab/"), &[]));
        assert!(is_restricted(&target("page", "devtools://devtools/bundled/x"), &[]));
    }

    #[test]
    fn allow_listed_extension_pages_are_not_restricted() {
        let url = "chrome-extension://abc123/popup.html";
        assert!(is_restricted(&target("page", url), &[]));
        assert!(!is_restricted(&target("page", url), &["abc123".to_string()]));
    }
}
