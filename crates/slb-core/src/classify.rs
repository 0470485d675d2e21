//! Risk classification of normalized commands.
//!
//! Maps a [`NormalizedCommand`] onto a [`RiskTier`]. Classification is
//! evaluated per segment and the maximum tier across segments wins; a
//! subshell wrapping a non-safe command and a tokenizer failure each force a
//! one-step upgrade. Upgrades never downgrade.

use std::sync::LazyLock;

use regex::Regex;

use crate::normalize::{NormalizedCommand, extract_command_name};
use crate::types::RiskTier;

/// Classifier verdict with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The assigned tier.
    pub tier: RiskTier,
    /// Human-readable rationale (rule name or upgrade reason).
    pub rationale: String,
}

/// File extensions whose deletion is always safe.
const SAFE_DELETE_EXTENSIONS: &[&str] = &[
    ".log", ".tmp", ".bak", ".swp", ".swo", ".pyc", ".o", ".cache",
];

struct TierRule {
    pattern: &'static LazyLock<Regex>,
    name: &'static str,
}

macro_rules! rule {
    ($name:ident, $re:literal) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect("tier rule regex is valid"));
    };
}

rule!(DD_DEVICE, r"^dd\s+.*\bof=/dev/");
rule!(MKFS, r"^mkfs(\.\w+)?\s");
rule!(SHUTDOWN, r"^(shutdown|reboot|halt|poweroff)\b");
rule!(FORK_BOMB, r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:");
rule!(DROP_DATABASE, r"(?i)\bdrop\s+(database|schema)\b");
rule!(CHMOD_ROOT, r"^(chmod|chown)\s+(-[a-zA-Z]*R[a-zA-Z]*\s+).*\s/(\s|$)");
rule!(TERRAFORM_DESTROY, r"^terraform\s+destroy\b");
rule!(KUBECTL_DELETE_BROAD, r"^kubectl\s+delete\s+((ns|namespace)\s+\S|.*--all\b)");
rule!(GIT_PUSH_FORCE_MAIN, r"^git\s+push\s+.*(--force|-f)\b.*\b(main|master)\b");

rule!(GIT_RESET_HARD, r"^git\s+reset\s+--hard\b");
rule!(GIT_CLEAN, r"^git\s+clean\s+-[a-zA-Z]*f");
rule!(GIT_CHECKOUT_PATHS, r"^git\s+checkout\s+(--\s|\.)");
rule!(GIT_PUSH_FORCE, r"^git\s+push\s+.*(--force|-f)\b");
rule!(GIT_BRANCH_FORCE_DELETE, r"^git\s+branch\s+-[a-zA-Z]*D");
rule!(KUBECTL_DELETE, r"^kubectl\s+delete\s");
rule!(HELM_UNINSTALL, r"^helm\s+(uninstall|delete)\s");
rule!(TERRAFORM_APPLY, r"^terraform\s+apply\b");
rule!(DOCKER_PRUNE, r"^docker\s+(system|volume|image|container)\s+(prune|rm)\b");
rule!(SQL_DELETE, r"(?i)\b(delete\s+from|truncate\s+table?)\b");
rule!(DROP_TABLE, r"(?i)\bdrop\s+table\b");
rule!(FLUSHALL, r"^redis-cli\s+.*\bflush(all|db)\b");

rule!(GIT_STASH_DROP, r"^git\s+stash\s+(drop|clear)\b");
rule!(PKG_UNINSTALL, r"^(npm|pip|pip3|cargo|gem)\s+(uninstall|remove)\b");
rule!(KUBECTL_SCALE_ZERO, r"^kubectl\s+scale\s+.*--replicas=0\b");
rule!(SYSTEMCTL_STOP, r"^(systemctl|service)\s+(stop|disable|restart)\b");

static CRITICAL_RULES: &[TierRule] = &[
    TierRule { pattern: &DD_DEVICE, name: "dd onto a device" },
    TierRule { pattern: &MKFS, name: "filesystem format" },
    TierRule { pattern: &SHUTDOWN, name: "host shutdown" },
    TierRule { pattern: &FORK_BOMB, name: "fork bomb" },
    TierRule { pattern: &DROP_DATABASE, name: "drop database" },
    TierRule { pattern: &CHMOD_ROOT, name: "recursive permission change on /" },
    TierRule { pattern: &TERRAFORM_DESTROY, name: "terraform destroy" },
    TierRule { pattern: &KUBECTL_DELETE_BROAD, name: "kubectl delete namespace/all" },
    TierRule { pattern: &GIT_PUSH_FORCE_MAIN, name: "force push to protected branch" },
];

static DANGEROUS_RULES: &[TierRule] = &[
    TierRule { pattern: &GIT_RESET_HARD, name: "git reset --hard" },
    TierRule { pattern: &GIT_CLEAN, name: "git clean -f" },
    TierRule { pattern: &GIT_CHECKOUT_PATHS, name: "git checkout over working tree" },
    TierRule { pattern: &GIT_PUSH_FORCE, name: "git push --force" },
    TierRule { pattern: &GIT_BRANCH_FORCE_DELETE, name: "git branch -D" },
    TierRule { pattern: &KUBECTL_DELETE, name: "kubectl delete" },
    TierRule { pattern: &HELM_UNINSTALL, name: "helm uninstall" },
    TierRule { pattern: &TERRAFORM_APPLY, name: "terraform apply" },
    TierRule { pattern: &DOCKER_PRUNE, name: "docker prune/rm" },
    TierRule { pattern: &SQL_DELETE, name: "bulk SQL delete" },
    TierRule { pattern: &DROP_TABLE, name: "drop table" },
    TierRule { pattern: &FLUSHALL, name: "redis flush" },
];

static CAUTION_RULES: &[TierRule] = &[
    TierRule { pattern: &GIT_STASH_DROP, name: "git stash drop" },
    TierRule { pattern: &PKG_UNINSTALL, name: "package uninstall" },
    TierRule { pattern: &KUBECTL_SCALE_ZERO, name: "scale to zero" },
    TierRule { pattern: &SYSTEMCTL_STOP, name: "service stop" },
];

/// Classify a normalized command.
///
/// The maximum tier across segments wins; subshells wrapping non-safe
/// commands and parse errors each upgrade the result by one step.
#[must_use]
pub fn classify_command(norm: &NormalizedCommand) -> Classification {
    let mut tier = RiskTier::Safe;
    let mut rationale = String::from("no destructive pattern matched");

    for segment in &norm.segments {
        let seg_class = classify_segment(segment);
        if seg_class.tier > tier {
            tier = seg_class.tier;
            rationale = seg_class.rationale;
        }
    }

    if norm.has_subshell {
        if let Some(inner) = subshell_inner(&norm.original) {
            if classify_segment(&inner).tier > RiskTier::Safe {
                tier = tier.upgraded();
                rationale = format!("{rationale}; subshell wraps a non-safe command");
            }
        }
    }

    if norm.parse_error {
        tier = tier.upgraded();
        rationale = format!("{rationale}; command did not tokenize cleanly");
    }

    Classification { tier, rationale }
}

/// Classify one wrapper-stripped segment.
fn classify_segment(segment: &str) -> Classification {
    let name = extract_command_name(segment);
    if name == "rm" {
        return classify_rm(segment);
    }

    for (rules, tier) in [
        (CRITICAL_RULES, RiskTier::Critical),
        (DANGEROUS_RULES, RiskTier::Dangerous),
        (CAUTION_RULES, RiskTier::Caution),
    ] {
        for rule in rules {
            if rule.pattern.is_match(segment) {
                return Classification {
                    tier,
                    rationale: rule.name.to_string(),
                };
            }
        }
    }

    Classification {
        tier: RiskTier::Safe,
        rationale: "no destructive pattern matched".to_string(),
    }
}

/// `rm` gets bespoke handling: targets with safe extensions are exempt, and
/// recursive deletion of absolute paths outranks in-project deletion.
fn classify_rm(segment: &str) -> Classification {
    let tokens: Vec<String> = shlex::split(segment)
        .unwrap_or_else(|| segment.split_whitespace().map(str::to_string).collect());
    let flags: String = tokens
        .iter()
        .skip(1)
        .filter(|t| t.starts_with('-'))
        .cloned()
        .collect();
    let targets: Vec<&String> = tokens
        .iter()
        .skip(1)
        .filter(|t| !t.starts_with('-'))
        .collect();

    if !targets.is_empty()
        && targets.iter().all(|t| {
            SAFE_DELETE_EXTENSIONS
                .iter()
                .any(|ext| t.to_ascii_lowercase().ends_with(ext))
        })
    {
        return Classification {
            tier: RiskTier::Safe,
            rationale: "deletion limited to safe extensions".to_string(),
        };
    }

    let recursive = flags.contains('r') || flags.contains('R');
    if recursive {
        let absolute = targets.iter().any(|t| t.starts_with('/'));
        if absolute {
            return Classification {
                tier: RiskTier::Critical,
                rationale: "recursive deletion of an absolute path".to_string(),
            };
        }
        return Classification {
            tier: RiskTier::Dangerous,
            rationale: "recursive deletion".to_string(),
        };
    }

    Classification {
        tier: RiskTier::Caution,
        rationale: "file deletion".to_string(),
    }
}

static SUBSHELL_INNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(([^)]+)\)|`([^`]+)`|\(([^)]+)\)").expect("subshell inner regex is valid")
});

/// The text inside the first subshell construct, if any.
fn subshell_inner(cmd: &str) -> Option<String> {
    let caps = SUBSHELL_INNER.captures(cmd)?;
    for i in 1..=3 {
        if let Some(m) = caps.get(i) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_command;

    fn classify(cmd: &str) -> Classification {
        classify_command(&normalize_command(cmd))
    }

    #[test]
    fn test_plain_commands_are_safe() {
        assert_eq!(classify("ls -la").tier, RiskTier::Safe);
        assert_eq!(classify("echo hello").tier, RiskTier::Safe);
        assert_eq!(classify("cargo build").tier, RiskTier::Safe);
    }

    #[test]
    fn test_safe_extension_deletion() {
        assert_eq!(classify("rm test.log").tier, RiskTier::Safe);
        assert_eq!(classify("rm a.tmp b.bak").tier, RiskTier::Safe);
    }

    #[test]
    fn test_rm_tiers() {
        assert_eq!(classify("rm notes.txt").tier, RiskTier::Caution);
        assert_eq!(classify("rm -rf ./build").tier, RiskTier::Dangerous);
        assert_eq!(classify("rm -rf build").tier, RiskTier::Dangerous);
        assert_eq!(classify("rm -rf /etc/test").tier, RiskTier::Critical);
    }

    #[test]
    fn test_wrapper_stripping_applies() {
        assert_eq!(classify("sudo rm -rf /var/lib/data").tier, RiskTier::Critical);
        assert_eq!(classify("env FOO=1 git reset --hard HEAD").tier, RiskTier::Dangerous);
    }

    #[test]
    fn test_git_tiers() {
        assert_eq!(classify("git reset --hard HEAD~3").tier, RiskTier::Dangerous);
        assert_eq!(classify("git clean -fd").tier, RiskTier::Dangerous);
        assert_eq!(classify("git stash drop").tier, RiskTier::Caution);
        assert_eq!(classify("git status").tier, RiskTier::Safe);
    }

    #[test]
    fn test_infra_tiers() {
        assert_eq!(classify("kubectl delete deployment myapp").tier, RiskTier::Dangerous);
        assert_eq!(classify("kubectl delete namespace staging").tier, RiskTier::Critical);
        assert_eq!(classify("terraform destroy").tier, RiskTier::Critical);
        assert_eq!(classify("helm uninstall myrelease").tier, RiskTier::Dangerous);
    }

    #[test]
    fn test_compound_takes_maximum() {
        let c = classify("echo starting && rm -rf /opt/app");
        assert_eq!(c.tier, RiskTier::Critical);
    }

    #[test]
    fn test_quoted_sql_kept_in_one_segment() {
        let c = classify(r#"psql -c "DELETE FROM users; DROP TABLE users""#);
        assert_eq!(c.tier, RiskTier::Dangerous);
    }

    #[test]
    fn test_subshell_upgrades_non_safe_inner() {
        let c = classify("echo $(rm -rf /tmp/x)");
        assert_eq!(c.tier, RiskTier::Caution);
        let harmless = classify("echo $(date)");
        assert_eq!(harmless.tier, RiskTier::Safe);
    }

    #[test]
    fn test_parse_error_upgrades() {
        let c = classify("git reset --hard \"HEAD");
        assert_eq!(c.tier, RiskTier::Critical);
    }

    #[test]
    fn test_rationale_is_populated() {
        let c = classify("terraform destroy");
        assert_eq!(c.rationale, "terraform destroy");
    }
}
