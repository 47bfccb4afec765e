use lazy_static::lazy_static;
use regex::Regex;

use crate::error::RepoError;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_SEARCH_LIMIT: i64 = 500;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails are stored and looked up trimmed and lower-cased.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn validate_email(email: &str) -> Result<(), RepoError> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(RepoError::Validation("invalid email".into()))
    }
}

pub(crate) fn validate_username(username: &str) -> Result<(), RepoError> {
    let len = username.chars().count();
    if len == 0 || len > MAX_USERNAME_LEN {
        return Err(RepoError::Validation(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters"
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(RepoError::Validation("username contains control characters".into()));
    }
    Ok(())
}

pub(crate) fn validate_password(password: &str) -> Result<(), RepoError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(RepoError::Validation("password too short".into()));
    }
    Ok(())
}

pub(crate) fn validate_limit(limit: i64) -> Result<(), RepoError> {
    if (1..=MAX_SEARCH_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(RepoError::Validation(format!(
            "limit must be between 1 and {MAX_SEARCH_LIMIT}"
        )))
    }
}

/// Case folding shared by the stored search columns and search terms.
pub(crate) fn fold_case(s: &str) -> String {
    s.to_lowercase()
}

/// Builds a case-folded `LIKE` pattern matching `term` anywhere, with `\` as
/// the escape character.
pub(crate) fn contains_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in fold_case(term).chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert!(is_valid_email("ann@example.com"));
        assert!(!is_valid_email("ann@example"));
        assert!(!is_valid_email("ann example@x.io"));
        assert!(!is_valid_email("' OR 1=1 --"));
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_email("  Ann@Example.COM "), "ann@example.com");
    }

    #[test]
    fn username_bounds() {
        assert!(validate_username("ann").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username(&"x".repeat(MAX_USERNAME_LEN + 1)).is_err());
        assert!(validate_username("bad\nname").is_err());
    }

    #[test]
    fn password_length_counts_chars() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long-enough").is_ok());
        assert!(validate_password("ééééééé").is_err());
    }

    #[test]
    fn limit_range() {
        assert!(validate_limit(0).is_err());
        assert!(validate_limit(1).is_ok());
        assert!(validate_limit(MAX_SEARCH_LIMIT).is_ok());
        assert!(validate_limit(MAX_SEARCH_LIMIT + 1).is_err());
    }

    #[test]
    fn folding_covers_non_ascii_letters() {
        assert_eq!(fold_case("ÉLODIE"), "élodie");
        assert_eq!(fold_case("Ñandú"), "ñandú");
        assert_eq!(contains_pattern("ÉLO"), "%élo%");
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(contains_pattern("Ann"), "%ann%");
        assert_eq!(contains_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
    }
}
