use std::fmt;

/// Client program metadata handed to a session at open time.
///
/// The name is what the radio shows for this client (`client program <name>`),
/// so it must be a single token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub name: String,
    pub version: String,
}

impl BuildInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Metadata of this crate as compiled.
    pub fn current() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Name with whitespace and the field separator replaced so it survives
    /// the line protocol.
    pub fn program_token(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_whitespace() || c == '|' { '_' } else { c })
            .collect()
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_token_strips_separators() {
        let info = BuildInfo::new("my radio|app", "1.0");
        assert_eq!(info.program_token(), "my_radio_app");
    }

    #[test]
    fn current_uses_package_metadata() {
        let info = BuildInfo::current();
        assert_eq!(info.name, "radiolink-rs");
        assert!(!info.version.is_empty());
    }
}
