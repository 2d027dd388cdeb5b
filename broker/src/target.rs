//! Target parsing: `user@target` login names (spec.md §4.2.1).

use crate::error::BrokerError;

/// Splits an SSH login name into `(user, target)` on the first `@`. Both
/// halves must be non-empty.
pub fn parse_login(login: &str) -> Result<(String, String), BrokerError> {
    match login.split_once('@') {
        Some((user, target)) if !user.is_empty() && !target.is_empty() => {
            Ok((user.to_string(), target.to_string()))
        }
        _ => Err(BrokerError::InvalidSessionTarget(login.to_string())),
    }
}

/// If `target` contains a `.`, splits it into `(domain, name)` once on the
/// first dot; a target with no dot is already a device UID.
pub fn split_domain_name(target: &str) -> Option<(&str, &str)> {
    target.split_once('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_at() {
        let (user, target) = parse_login("alice@device-uid-A").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(target, "device-uid-A");
    }

    #[test]
    fn rejects_missing_at() {
        assert!(matches!(
            parse_login("alice"),
            Err(BrokerError::InvalidSessionTarget(_))
        ));
    }

    #[test]
    fn rejects_empty_halves() {
        assert!(parse_login("@target").is_err());
        assert!(parse_login("alice@").is_err());
    }

    #[test]
    fn domain_name_target_splits_once() {
        assert_eq!(
            split_domain_name("acme.webserver"),
            Some(("acme", "webserver"))
        );
    }

    #[test]
    fn bare_uid_has_no_domain() {
        assert_eq!(split_domain_name("uid-A"), None);
    }
}
