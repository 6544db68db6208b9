//! Hostname match table deciding which hosts the proxy intercepts.
//!
//! Loaded once at startup from a line-oriented hosts file and read
//! concurrently by the DNS path without locking.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("failed to read hosts file: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable set of intercepted hostnames.
///
/// Entries are either exact hostnames or wildcard-suffix patterns written
/// as `*.example.com`. A wildcard matches any subdomain at any depth but
/// never the bare suffix itself.
#[derive(Debug, Default)]
pub struct HostSet {
    exact: HashSet<String>,
    wildcard: HashSet<String>,
}

impl HostSet {
    /// Loads a hosts file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HostsError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parses hosts file content. Each line longer than two characters is
    /// either a literal hostname or, when prefixed with `*.`, a
    /// wildcard-suffix pattern. Everything else is ignored.
    pub fn parse(content: &str) -> Self {
        let mut exact = HashSet::new();
        let mut wildcard = HashSet::new();

        for line in content.lines() {
            if line.len() > 2 {
                if let Some(suffix) = line.strip_prefix("*.") {
                    wildcard.insert(suffix.to_string());
                } else {
                    exact.insert(line.to_string());
                }
            }
        }

        Self { exact, wildcard }
    }

    /// Checks whether a queried or requested hostname belongs to the
    /// intercepted set.
    ///
    /// The input is normalized by stripping a single trailing dot (DNS
    /// FQDN form). Exact entries are checked first; wildcard entries are
    /// then checked against every suffix obtained by stripping the
    /// leftmost label, stopping once fewer than two labels remain, so
    /// `*.example.com` matches `a.example.com` and `a.b.example.com` but
    /// not `example.com` itself.
    pub fn is_intercepted(&self, host: &str) -> bool {
        let host = host.strip_suffix('.').unwrap_or(host);

        if self.exact.contains(host) {
            return true;
        }

        let mut rest = host;
        while let Some((_, suffix)) = rest.split_once('.') {
            if !suffix.contains('.') {
                break;
            }
            if self.wildcard.contains(suffix) {
                return true;
            }
            rest = suffix;
        }

        false
    }

    /// Number of loaded rules, exact and wildcard combined.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_set() -> HostSet {
        HostSet::parse("app.example.com\n*.stream.example.com\ndirect.test\n")
    }

    /// Exact entries match themselves, with and without the trailing dot
    /// DNS clients put on fully-qualified names.
    #[test]
    fn exact_matching() {
        let hosts = example_set();

        assert!(hosts.is_intercepted("app.example.com"));
        assert!(hosts.is_intercepted("app.example.com."));
        assert!(hosts.is_intercepted("direct.test"));

        // Exact entries do not cover subdomains.
        assert!(!hosts.is_intercepted("sub.app.example.com"));
        assert!(!hosts.is_intercepted("example.com"));
    }

    /// Wildcard entries match subdomains at any depth, but never the bare
    /// suffix unless it is also listed exactly.
    #[test]
    fn wildcard_matching() {
        let hosts = example_set();

        assert!(hosts.is_intercepted("a.stream.example.com"));
        assert!(hosts.is_intercepted("a.b.stream.example.com"));
        assert!(hosts.is_intercepted("a.b.stream.example.com."));

        assert!(!hosts.is_intercepted("stream.example.com"));
        assert!(!hosts.is_intercepted("otherstream.example.com"));
    }

    /// The bare suffix of a wildcard matches when separately listed.
    #[test]
    fn wildcard_suffix_listed_exactly() {
        let hosts = HostSet::parse("*.example.com\nexample.com\n");

        assert!(hosts.is_intercepted("www.example.com"));
        assert!(hosts.is_intercepted("example.com"));
    }

    /// Lines of two characters or fewer are ignored, as are empty lines.
    #[test]
    fn short_lines_ignored() {
        let hosts = HostSet::parse("\nab\n*.\nreal.example.com\n");

        assert_eq!(hosts.len(), 1);
        assert!(hosts.is_intercepted("real.example.com"));
        assert!(!hosts.is_intercepted("ab"));
    }

    #[test]
    fn unknown_hosts_pass_through() {
        let hosts = example_set();

        assert!(!hosts.is_intercepted("unrelated.org"));
        assert!(!hosts.is_intercepted("com"));
        assert!(!hosts.is_intercepted(""));
    }
}
