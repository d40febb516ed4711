//! Console build-signal convention shared by the payload generator, the
//! launcher that polls for it and the mock cloud that fakes it.
//!
//! The provisioning script writes exactly one marker line to the VM console:
//! `image-builder-signal:<token>:success` or
//! `image-builder-signal:<token>:failed:<reason>`.
//! The per-run token keeps stale console lines from other runs (or from the
//! seed image's own boot) from being mistaken for ours.

pub const SIGNAL_PREFIX: &str = "image-builder-signal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSignal {
    Succeeded,
    Failed(String),
}

pub fn success_marker(token: &str) -> String {
    format!("{}:{}:success", SIGNAL_PREFIX, token)
}

pub fn failure_marker(token: &str, reason: &str) -> String {
    format!("{}:{}:failed:{}", SIGNAL_PREFIX, token, reason)
}

/// Find the first build signal for `token` in console output.
///
/// Console lines are often prefixed (kernel timestamps, `cloud-init[pid]:`), so the
/// marker is matched anywhere in a line.
pub fn scan_console(output: &str, token: &str) -> Option<BuildSignal> {
    let needle = format!("{}:{}:", SIGNAL_PREFIX, token);
    for line in output.lines() {
        let Some(pos) = line.find(&needle) else {
            continue;
        };
        let rest = line[pos + needle.len()..].trim();
        if rest == "success" {
            return Some(BuildSignal::Succeeded);
        }
        if let Some(reason) = rest.strip_prefix("failed") {
            let reason = reason.trim_start_matches(':').trim();
            let reason = if reason.is_empty() { "unknown" } else { reason };
            return Some(BuildSignal::Failed(reason.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_prefixed_success() {
        let console = format!(
            "[   12.3] cloud-init[812]: installing\n[  99.1] cloud-init[812]: {}\n",
            success_marker("tok1")
        );
        assert_eq!(scan_console(&console, "tok1"), Some(BuildSignal::Succeeded));
    }

    #[test]
    fn ignores_other_tokens() {
        let console = success_marker("other");
        assert_eq!(scan_console(&console, "tok1"), None);
    }

    #[test]
    fn failure_reason_is_kept() {
        let console = failure_marker("t", "line 42");
        assert_eq!(
            scan_console(&console, "t"),
            Some(BuildSignal::Failed("line 42".to_string()))
        );
        assert_eq!(
            scan_console("image-builder-signal:t:failed", "t"),
            Some(BuildSignal::Failed("unknown".to_string()))
        );
    }

    #[test]
    fn unexpanded_script_text_does_not_match() {
        let script_line = "echo \"image-builder-signal:${SIGNAL_TOKEN}:success\"";
        assert_eq!(scan_console(script_line, "abc"), None);
    }
}
