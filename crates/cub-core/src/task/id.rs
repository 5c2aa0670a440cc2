//! Task-id format validation (spec §6.1, invariant I8).
//!
//! Format: `^[a-z][a-z0-9]*-[a-z0-9]+(-[0-9]+(\.[0-9]+)?)?$` — project
//! prefix, epic id, optional task number, each separated by `-`.
//! Hand-written rather than pulled in via a regex crate: it's a single
//! narrow grammar checked at a handful of call sites, not a general
//! pattern-matching concern.

/// Validate a task/epic id against the external id-format contract.
pub fn is_valid_task_id(id: &str) -> bool {
    let mut parts = id.splitn(3, '-');
    let Some(project) = parts.next() else { return false };
    let Some(epic) = parts.next() else { return false };
    let rest = parts.next();

    if !is_project_prefix(project) {
        return false;
    }
    if !is_alnum_lower(epic) || epic.is_empty() {
        return false;
    }
    match rest {
        None => true,
        Some(task_num) => is_task_number(task_num),
    }
}

fn is_project_prefix(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_alnum_lower(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_task_number(s: &str) -> bool {
    match s.split_once('.') {
        None => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        Some((whole, frac)) => {
            !whole.is_empty()
                && !frac.is_empty()
                && whole.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c.is_ascii_digit())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_examples_from_spec() {
        assert!(is_valid_task_id("cub-048a-5.4"));
        assert!(is_valid_task_id("acme-prod-2.1"));
        assert!(is_valid_task_id("app-001-0"));
    }

    #[test]
    fn accepts_epic_only_id() {
        assert!(is_valid_task_id("cub-048a"));
    }

    #[test]
    fn rejects_uppercase() {
        assert!(!is_valid_task_id("Cub-048a-5"));
        assert!(!is_valid_task_id("cub-048A-5"));
    }

    #[test]
    fn rejects_missing_epic() {
        assert!(!is_valid_task_id("cub"));
        assert!(!is_valid_task_id("cub-"));
    }

    #[test]
    fn rejects_bad_task_number() {
        assert!(!is_valid_task_id("cub-048a-abc"));
        assert!(!is_valid_task_id("cub-048a-5."));
        assert!(!is_valid_task_id("cub-048a-.5"));
    }

    #[test]
    fn rejects_leading_digit_project() {
        assert!(!is_valid_task_id("1cub-048a-5"));
    }

    #[test]
    fn rejects_empty() {
        assert!(!is_valid_task_id(""));
    }
}
