use std::fmt;

use crate::error::HsmError;

/// Longest identity label accepted. Labels become file names and keychain
/// attributes, so they are kept short.
pub const MAX_IDENTITY_LEN: usize = 64;

/// A validated identity label (`personal`, `work`, `gitlab-ci`).
///
/// Only ASCII letters, digits and `-` are allowed, which keeps labels safe to
/// embed in file names and keychain service strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn parse(label: &str) -> Result<Self, HsmError> {
        if label.is_empty() || label.len() > MAX_IDENTITY_LEN {
            return Err(HsmError::InvalidParam);
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(HsmError::InvalidParam);
        }
        Ok(Self(label.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Identity {
    type Error = HsmError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_labels() {
        for ok in ["personal", "work", "gitlab-ci", "A1", "x"] {
            assert_eq!(Identity::parse(ok).unwrap().as_str(), ok);
        }
    }

    #[test]
    fn rejects_unsafe_labels() {
        let long = "a".repeat(MAX_IDENTITY_LEN + 1);
        for bad in [
            "",
            "../etc",
            "a/b",
            "a\\b",
            "dot.ted",
            "tab\there",
            "nul\0",
            "spa ce",
            "ünï",
            long.as_str(),
        ] {
            assert_eq!(Identity::parse(bad), Err(HsmError::InvalidParam), "{bad:?}");
        }
    }
}
