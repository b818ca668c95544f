//! Target name resolution.
//!
//! A user pattern is either `PROJECT-PATTERN:TARGET-PATTERN` or a bare
//! `TARGET-PATTERN`. Both sides are glob patterns supporting `*`, `?`,
//! `[...]`, `[^...]` and backslash escapes.

use std::collections::BTreeSet;
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};

use crate::project::{Project, Target};
use crate::repo::Repo;
use crate::{Error, Result};

/// Whether a pattern is a plain name: no glob meta-character, no escape.
#[must_use]
pub fn is_literal_pattern(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', '\\'])
}

fn compile(pattern: &str, what: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .backslash_escape(true)
        .build()
        .map_err(|e| Error::BadPattern {
            pattern: pattern.to_string(),
            reason: format!("{what}: {e}"),
        })?;
    Ok(glob.compile_matcher())
}

/// Resolve a single pattern into the list of matched targets.
///
/// Rules:
/// - `P:T` with `P` empty matches the current project only; fails with
///   [`Error::NoCurrentProject`] when there is none.
/// - `P:T` otherwise matches `P` against all project names.
/// - Bare `T` matches across all projects. When `T` is a literal and more
///   than one target matches, [`Error::AmbiguousMatch`] is returned with
///   the candidate names so the caller can suggest `*:T`.
/// - An empty target pattern or more than one colon is a bad pattern.
/// - No match is not an error; the result is simply empty.
pub fn resolve_targets(repo: &Repo, pattern: &str) -> Result<Vec<Arc<Target>>> {
    let mut parts = pattern.splitn(2, ':');
    let first = parts.next().unwrap_or_default().trim();
    let second = parts.next().map(str::trim);
    if second.is_some_and(|s| s.contains(':')) {
        return Err(Error::BadPattern {
            pattern: pattern.to_string(),
            reason: "contains more than one colon".to_string(),
        });
    }
    let only_match_targets = second.is_none();

    let mut projects: Vec<&Arc<Project>> = Vec::new();
    let target_pattern = match second {
        None => {
            projects.extend(repo.projects());
            first
        }
        Some(target_pattern) => {
            if first.is_empty() {
                projects.push(repo.current_project().ok_or(Error::NoCurrentProject)?);
            } else {
                let matcher = compile(first, "for projects")?;
                projects.extend(
                    repo.projects().filter(|p| matcher.is_match(&p.name)),
                );
            }
            target_pattern
        }
    };

    if target_pattern.is_empty() {
        return Err(Error::BadPattern {
            pattern: pattern.to_string(),
            reason: "empty target pattern".to_string(),
        });
    }

    let matcher = compile(target_pattern, "for targets")?;
    let mut wildcard_match = false;
    let mut targets: Vec<Arc<Target>> = Vec::new();
    for project in projects {
        for target in project.targets() {
            if !matcher.is_match(&target.name.local) {
                continue;
            }
            if target.name.local != target_pattern {
                wildcard_match = true;
            }
            targets.push(Arc::clone(target));
        }
    }

    if only_match_targets && !wildcard_match && targets.len() > 1 {
        return Err(Error::AmbiguousMatch {
            pattern: target_pattern.to_string(),
            matches: targets.iter().map(|t| t.global_name()).collect(),
        });
    }

    Ok(targets)
}

/// Resolve multiple patterns into a deduplicated, sorted list of global
/// target names.
pub fn resolve_target_names(repo: &Repo, patterns: &[String]) -> Result<Vec<String>> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for pattern in patterns {
        let targets = resolve_targets(repo, pattern).map_err(|e| match e {
            Error::BadPattern { reason, .. } => Error::BadPattern {
                pattern: pattern.clone(),
                reason,
            },
            other => other,
        })?;
        names.extend(targets.iter().map(|t| t.global_name()));
    }
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn repo_with_two_libs() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("alpha/.repos/project.yaml"),
            "name: alpha\ntargets:\n  lib:\n    rule: {}\n  gen-code:\n    rule: {}\n",
        );
        write(
            &root.join("beta/.repos/project.yaml"),
            "name: beta\ntargets:\n  lib:\n    rule: {}\n  app:\n    rule: {}\n",
        );
        let mut repo = Repo::discover(Some(root)).unwrap();
        repo.load_projects().unwrap();
        (dir, repo)
    }

    #[test]
    fn literal_pattern_detection() {
        assert!(is_literal_pattern("build"));
        assert!(!is_literal_pattern("bu*ld"));
        assert!(!is_literal_pattern("b?ild"));
        assert!(!is_literal_pattern("b[a-z]ild"));
        assert!(!is_literal_pattern(r"b\*ild"));
    }

    #[test]
    fn exact_project_and_target() {
        let (_dir, repo) = repo_with_two_libs();
        let targets = resolve_targets(&repo, "alpha:lib").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].global_name(), "alpha:lib");
    }

    #[test]
    fn unknown_project_is_empty_not_error() {
        let (_dir, repo) = repo_with_two_libs();
        assert!(resolve_targets(&repo, "gamma:lib").unwrap().is_empty());
    }

    #[test]
    fn bare_literal_across_projects_is_ambiguous() {
        let (_dir, repo) = repo_with_two_libs();
        let err = resolve_targets(&repo, "lib").unwrap_err();
        match err {
            Error::AmbiguousMatch { pattern, matches } => {
                assert_eq!(pattern, "lib");
                assert_eq!(matches.len(), 2);
                assert!(matches.contains(&"alpha:lib".to_string()));
                assert!(matches.contains(&"beta:lib".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn glob_project_pattern_matches_both() {
        let (_dir, repo) = repo_with_two_libs();
        let targets = resolve_targets(&repo, "*:lib").unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn bare_glob_matches_silently() {
        let (_dir, repo) = repo_with_two_libs();
        let targets = resolve_targets(&repo, "li*").unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn bare_unique_literal_matches() {
        let (_dir, repo) = repo_with_two_libs();
        let targets = resolve_targets(&repo, "app").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].global_name(), "beta:app");
    }

    #[test]
    fn character_classes_and_negation() {
        let (_dir, repo) = repo_with_two_libs();
        let targets = resolve_targets(&repo, "alpha:gen-[a-z]ode").unwrap();
        assert_eq!(targets.len(), 1);
        let none = resolve_targets(&repo, "alpha:gen-[^c]ode").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn bad_patterns() {
        let (_dir, repo) = repo_with_two_libs();
        assert!(matches!(
            resolve_targets(&repo, "a:b:c"),
            Err(Error::BadPattern { .. })
        ));
        assert!(matches!(
            resolve_targets(&repo, "alpha:"),
            Err(Error::BadPattern { .. })
        ));
    }

    #[test]
    fn empty_project_needs_current() {
        let (_dir, repo) = repo_with_two_libs();
        assert!(matches!(
            resolve_targets(&repo, ":lib"),
            Err(Error::NoCurrentProject)
        ));
    }

    #[test]
    fn current_project_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("REPOS.yaml"), "absolute-root: true\n");
        write(
            &root.join("alpha/.repos/project.yaml"),
            "name: alpha\ntargets:\n  lib:\n    rule: {}\n",
        );
        let work = root.join("alpha/src");
        std::fs::create_dir_all(&work).unwrap();
        let mut repo = Repo::discover(Some(&work)).unwrap();
        repo.load_projects().unwrap();
        let targets = resolve_targets(&repo, ":lib").unwrap();
        assert_eq!(targets[0].global_name(), "alpha:lib");
    }

    #[test]
    fn names_are_deduplicated_and_sorted() {
        let (_dir, repo) = repo_with_two_libs();
        let names = resolve_target_names(
            &repo,
            &["*:lib".to_string(), "beta:*".to_string()],
        )
        .unwrap();
        assert_eq!(names, vec!["alpha:lib", "beta:app", "beta:lib"]);
    }
}
