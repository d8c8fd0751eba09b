use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use tracing::info;

use crate::error::ScanError;

/// Public-suffix lookup set, loaded once at startup and shared by reference
/// with every connection handler.
///
/// The file format is the publicsuffix.org list: one suffix per line,
/// `//`-prefixed lines are comments.
#[derive(Debug, Default)]
pub struct SuffixList {
    suffixes: HashSet<String>,
}

impl SuffixList {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let list = Self::from_lines(&text);
        info!(
            suffixes = list.len(),
            path = %path.display(),
            "loaded public suffix list"
        );
        Ok(list)
    }

    pub fn from_lines(text: &str) -> Self {
        let suffixes = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("//"))
            .map(str::to_string)
            .collect();
        Self { suffixes }
    }

    pub fn contains(&self, suffix: &str) -> bool {
        self.suffixes.contains(suffix)
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}

/// Canonical identity of a visited page: the unit of classification,
/// caching, and corpus storage.
///
/// `domain` is the registrable domain: the last two hostname labels, plus a
/// third when the trailing two form a known public suffix such as `co.uk`.
/// The proxy and the detection pipeline must resolve identities through this
/// one code path or the cache and corpus keys diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSite {
    pub subdomain: String,
    pub domain: String,
    pub path: String,
}

impl CanonicalSite {
    /// Splits a raw hostname and URL path into a canonical site.
    pub fn resolve(
        suffixes: &SuffixList,
        host: &str,
        raw_path: &str,
    ) -> Result<Self, ScanError> {
        let host = host.trim().trim_end_matches('.');
        let mut labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return Err(ScanError::InvalidDomain(host.to_string()));
        }

        let mut domain = format!(
            "{}.{}",
            labels[labels.len() - 2],
            labels[labels.len() - 1]
        );
        labels.truncate(labels.len() - 2);

        // A two-label public suffix (co.uk) absorbs one more label so the
        // registrable domain stays meaningful.
        if suffixes.contains(&domain) {
            if let Some(extra) = labels.pop() {
                domain = format!("{extra}.{domain}");
            }
        }

        let subdomain = labels.join(".");

        let path = raw_path
            .split('?')
            .next()
            .unwrap_or("")
            .trim()
            .trim_matches('/')
            .to_string();

        Ok(Self {
            subdomain,
            domain,
            path,
        })
    }

    /// Cache/corpus key: `subdomain.domain/path`, subdomain omitted when
    /// empty.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Absolute URL for re-fetching the page through the given scheme.
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}{self}")
    }
}

impl fmt::Display for CanonicalSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subdomain.is_empty() {
            write!(f, "{}/{}", self.domain, self.path)
        } else {
            write!(f, "{}.{}/{}", self.subdomain, self.domain, self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> SuffixList {
        SuffixList::from_lines("// comment\nco.uk\ncom.au\n\n")
    }

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        let list = suffixes();
        assert_eq!(list.len(), 2);
        assert!(list.contains("co.uk"));
        assert!(!list.contains("// comment"));
    }

    #[test]
    fn plain_hostname_splits_on_last_two_labels() {
        let site = CanonicalSite::resolve(&suffixes(), "www.login.example.com", "/a/b").unwrap();
        assert_eq!(site.domain, "example.com");
        assert_eq!(site.subdomain, "www.login");
        assert_eq!(site.path, "a/b");
        assert_eq!(site.key(), "www.login.example.com/a/b");
    }

    #[test]
    fn bare_domain_has_empty_subdomain() {
        let site = CanonicalSite::resolve(&suffixes(), "example.com", "/").unwrap();
        assert_eq!(site.subdomain, "");
        assert_eq!(site.key(), "example.com/");
    }

    #[test]
    fn multi_label_suffix_absorbs_third_label() {
        let site = CanonicalSite::resolve(&suffixes(), "shop.example.co.uk", "/cart").unwrap();
        assert_eq!(site.domain, "example.co.uk");
        assert_eq!(site.subdomain, "shop");
    }

    #[test]
    fn multi_label_suffix_without_extra_label_keeps_two() {
        // Degenerate but resolvable: nothing left to absorb.
        let site = CanonicalSite::resolve(&suffixes(), "co.uk", "").unwrap();
        assert_eq!(site.domain, "co.uk");
        assert_eq!(site.subdomain, "");
    }

    #[test]
    fn single_label_host_is_rejected() {
        let err = CanonicalSite::resolve(&suffixes(), "localhost", "/").unwrap_err();
        assert!(matches!(err, ScanError::InvalidDomain(_)));
    }

    #[test]
    fn query_string_is_dropped_and_slashes_trimmed() {
        let site =
            CanonicalSite::resolve(&suffixes(), "example.com", "/login/?next=/home").unwrap();
        assert_eq!(site.path, "login");
    }

    #[test]
    fn url_prepends_scheme() {
        let site = CanonicalSite::resolve(&suffixes(), "a.example.com", "/x").unwrap();
        assert_eq!(site.url("https://"), "https://a.example.com/x");
    }
}
