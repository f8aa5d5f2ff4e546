//! URI redaction for log fields. Any log field emitting the broker URI must
//! go through [`redact`] so passwords never land in log output.

/// Replaces the password component of an `amqp(s)://user:pass@host/vhost`
/// URI with `xxxx`. Returns an empty string (rather than leaking the
/// original) if `uri` does not parse as `scheme://[userinfo@]rest`.
pub fn redact(uri: &str) -> String {
    if uri.is_empty() {
        return String::new();
    }

    let Some(scheme_end) = uri.find("://") else {
        return String::new();
    };
    let (scheme, rest) = uri.split_at(scheme_end);
    let rest = &rest[3..];

    let Some(at) = rest.find('@') else {
        return String::new();
    };
    let (userinfo, after_at) = rest.split_at(at);
    let after_at = &after_at[1..];

    match userinfo.split_once(':') {
        Some((user, _password)) => format!("{scheme}://{user}:xxxx@{after_at}"),
        None => format!("{scheme}://{userinfo}:xxxx@{after_at}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_component() {
        assert_eq!(
            redact("amqp://user:secret@h:5672/v"),
            "amqp://user:xxxx@h:5672/v"
        );
    }

    #[test]
    fn empty_uri_redacts_to_empty_string() {
        assert_eq!(redact(""), "");
    }

    #[test]
    fn unparseable_uri_redacts_to_empty_string() {
        assert_eq!(redact("::::not a uri"), "");
    }

    #[test]
    fn uri_without_userinfo_redacts_to_empty_string() {
        assert_eq!(redact("amqp://host:5672/v"), "");
    }
}
