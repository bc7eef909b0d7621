//! Account identifier helpers.
//!
//! Participants everywhere in the flora are ledger account identifiers of
//! the triple-dotted form `shard.realm.num`. Ordering is by integer
//! component (missing components compare as 0), tie-broken on the raw
//! string, so every member derives the same participant sequence.

use std::cmp::Ordering;

/// True when `s` looks like a well-formed `shard.realm.num` account id.
pub fn is_account_id(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn components(s: &str) -> Vec<u64> {
    s.split('.').map(|p| p.trim().parse::<u64>().unwrap_or(0)).collect()
}

/// Deterministic account-id ordering: dotted-integer components, then the
/// raw string as tie-break.
pub fn compare_account_ids(a: &str, b: &str) -> Ordering {
    let ca = components(a);
    let cb = components(b);
    let len = ca.len().max(cb.len());
    for i in 0..len {
        let x = ca.get(i).copied().unwrap_or(0);
        let y = cb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.cmp(b)
}

/// Trim, drop empties, dedup and sort a participant set canonically.
pub fn normalize_participants<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = ids
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort_by(|a, b| compare_account_ids(a, b));
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_account_ids() {
        assert!(is_account_id("0.0.12345"));
        assert!(is_account_id("1.2.3"));
        assert!(!is_account_id("0.0"));
        assert!(!is_account_id("petal-a"));
        assert!(!is_account_id("0.0.12x"));
        assert!(!is_account_id("0..3"));
    }

    #[test]
    fn orders_by_integer_components() {
        // Lexical order would put "0.0.9" after "0.0.10".
        let mut ids = vec!["0.0.10", "0.0.9", "0.0.100", "0.0.2"];
        ids.sort_by(|a, b| compare_account_ids(a, b));
        assert_eq!(ids, vec!["0.0.2", "0.0.9", "0.0.10", "0.0.100"]);
    }

    #[test]
    fn missing_components_compare_as_zero() {
        assert_eq!(compare_account_ids("0.0", "0.0.0"), Ordering::Less);
        assert_eq!(compare_account_ids("0.0.1", "0.0"), Ordering::Greater);
    }

    #[test]
    fn normalize_trims_dedups_sorts() {
        let out = normalize_participants([" 0.0.11", "0.0.10", "0.0.11", "", "0.0.9 "]);
        assert_eq!(out, vec!["0.0.9", "0.0.10", "0.0.11"]);
    }

    #[test]
    fn ordering_is_stable_for_any_permutation() {
        let base = vec!["0.0.2", "0.0.10", "0.0.21", "1.0.1"];
        let mut rotated: Vec<&str> = base.iter().rev().copied().collect();
        rotated.sort_by(|a, b| compare_account_ids(a, b));
        let mut sorted = base.clone();
        sorted.sort_by(|a, b| compare_account_ids(a, b));
        assert_eq!(rotated, sorted);
    }
}
