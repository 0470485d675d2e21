//! Dry-run equivalents for destructive commands.
//!
//! Reviewers (and cautious requestors) can preview what a destructive
//! command would touch by running its dry-run equivalent. The mapping works
//! on the wrapper-stripped primary, so `sudo kubectl delete …` derives the
//! same preview as the bare command.

use crate::normalize::{extract_command_name, normalize_command};

/// Derive the dry-run equivalent of a command, if one is defined.
///
/// Known mappings:
///
/// | command | dry-run |
/// |---|---|
/// | `kubectl delete X` | `kubectl delete X --dry-run=client -o yaml` |
/// | `terraform destroy …` | `terraform plan -destroy …` |
/// | `rm [-flags] P…` | `ls -la P…` |
/// | `git reset --hard R` | `git diff R..HEAD` |
/// | `helm uninstall R` | `helm get manifest R` |
///
/// A command already carrying `--dry-run` is returned as-is.
#[must_use]
pub fn dry_run_command(cmd: &str) -> Option<String> {
    let norm = normalize_command(cmd);
    let primary = norm.primary.as_str();
    if primary.is_empty() {
        return None;
    }

    if primary.contains("--dry-run") {
        return Some(primary.to_string());
    }

    let tokens: Vec<String> = shlex::split(primary)
        .unwrap_or_else(|| primary.split_whitespace().map(str::to_string).collect());
    let name = extract_command_name(primary);

    match name.as_str() {
        "kubectl" if tokens.get(1).map(String::as_str) == Some("delete") => {
            Some(format!("{primary} --dry-run=client -o yaml"))
        }
        "terraform" if tokens.get(1).map(String::as_str) == Some("destroy") => {
            let rest = join_from(&tokens, 2);
            Some(trim_join("terraform plan -destroy", &rest))
        }
        "rm" => {
            let targets = join_filtered(&tokens, 1, |t| !t.starts_with('-'));
            if targets.is_empty() {
                None
            } else {
                Some(format!("ls -la {targets}"))
            }
        }
        "git" if tokens.get(1).map(String::as_str) == Some("reset")
            && tokens.iter().any(|t| t == "--hard") =>
        {
            let reference = tokens
                .iter()
                .skip(2)
                .find(|t| !t.starts_with('-'))
                .map_or("HEAD", String::as_str);
            Some(format!("git diff {reference}..HEAD"))
        }
        "helm" if matches!(tokens.get(1).map(String::as_str), Some("uninstall" | "delete")) => {
            let release = join_filtered(&tokens, 2, |t| !t.starts_with('-'));
            if release.is_empty() {
                None
            } else {
                Some(format!("helm get manifest {release}"))
            }
        }
        _ => None,
    }
}

fn join_from(tokens: &[String], start: usize) -> String {
    tokens.get(start..).unwrap_or_default().join(" ")
}

fn join_filtered(tokens: &[String], start: usize, keep: impl Fn(&str) -> bool) -> String {
    tokens
        .get(start..)
        .unwrap_or_default()
        .iter()
        .filter(|t| keep(t))
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

fn trim_join(head: &str, rest: &str) -> String {
    if rest.is_empty() {
        head.to_string()
    } else {
        format!("{head} {rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubectl_delete_adds_dry_run() {
        let out = dry_run_command("kubectl delete deployment foo").unwrap();
        for part in ["kubectl", "delete", "--dry-run=client", "-o", "yaml"] {
            assert!(out.contains(part), "{out:?} missing {part:?}");
        }
    }

    #[test]
    fn test_kubectl_keeps_existing_dry_run() {
        let out = dry_run_command("kubectl delete deployment foo --dry-run=client").unwrap();
        assert!(out.contains("--dry-run=client"));
        assert!(!out.contains("--dry-run=client --dry-run"));
    }

    #[test]
    fn test_terraform_destroy_becomes_plan() {
        let out = dry_run_command("terraform destroy").unwrap();
        assert!(out.contains("terraform plan -destroy"), "{out:?}");
    }

    #[test]
    fn test_rm_becomes_listing() {
        let out = dry_run_command("rm -rf ./build").unwrap();
        for part in ["ls", "-la", "./build"] {
            assert!(out.contains(part), "{out:?} missing {part:?}");
        }
    }

    #[test]
    fn test_git_reset_hard_becomes_diff() {
        let out = dry_run_command("git reset --hard HEAD~5").unwrap();
        assert!(out.contains("git diff HEAD~5..HEAD"), "{out:?}");
    }

    #[test]
    fn test_helm_uninstall_becomes_get_manifest() {
        let out = dry_run_command("helm uninstall myrelease").unwrap();
        assert!(out.contains("helm get manifest myrelease"), "{out:?}");
    }

    #[test]
    fn test_wrapper_stripping_still_detects() {
        let out = dry_run_command("sudo kubectl delete pod nginx-123").unwrap();
        assert!(out.contains("kubectl delete") && out.contains("--dry-run=client"), "{out:?}");
    }

    #[test]
    fn test_unsupported_command() {
        assert_eq!(dry_run_command("echo hello"), None);
        assert_eq!(dry_run_command(""), None);
    }
}
