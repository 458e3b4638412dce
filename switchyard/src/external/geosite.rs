use crate::common::host_matcher::{HostMatcher, HostMatcherBuilder};
use aho_corasick::AhoCorasick;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;

/// Domain categories loaded from a YAML document of the form
/// `category: [entries]`. Entries take the prefixes `full:`, `domain:`,
/// `keyword:` and `regexp:`; a bare entry is a domain suffix.
pub struct GeoSiteDb {
    categories: HashMap<String, SiteCategory>,
}

struct SiteCategory {
    hosts: HostMatcher,
    keywords: Option<AhoCorasick>,
    regexes: Vec<Regex>,
}

impl SiteCategory {
    fn matches(&self, host: &str) -> bool {
        self.hosts.matches(host)
            || self
                .keywords
                .as_ref()
                .is_some_and(|ac| ac.is_match(host.to_ascii_lowercase().as_str()))
            || self.regexes.iter().any(|r| r.is_match(host))
    }
}

impl GeoSiteDb {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("{}: {}", path.as_ref().display(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let raw: HashMap<String, Vec<String>> =
            serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        let mut categories = HashMap::new();
        for (name, entries) in raw {
            let mut hosts = HostMatcherBuilder::new();
            let mut keywords = vec![];
            let mut regexes = vec![];
            for entry in entries {
                let entry = entry.trim();
                if let Some(dn) = entry.strip_prefix("full:") {
                    hosts.add_exact(dn);
                } else if let Some(dn) = entry.strip_prefix("domain:") {
                    hosts.add_suffix(dn);
                } else if let Some(kw) = entry.strip_prefix("keyword:") {
                    keywords.push(kw.to_ascii_lowercase());
                } else if let Some(re) = entry.strip_prefix("regexp:") {
                    regexes.push(
                        Regex::new(re).map_err(|e| format!("{}: {}", name, e))?,
                    );
                } else if !entry.is_empty() && !entry.starts_with('#') {
                    hosts.add_suffix(entry);
                }
            }
            let keywords = if keywords.is_empty() {
                None
            } else {
                Some(AhoCorasick::new(keywords).map_err(|e| e.to_string())?)
            };
            categories.insert(
                name.to_ascii_lowercase(),
                SiteCategory {
                    hosts: hosts.build(),
                    keywords,
                    regexes,
                },
            );
        }
        Ok(Self { categories })
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(&category.to_ascii_lowercase())
    }

    /// `category` must already be lowercase.
    pub fn matches(&self, category: &str, host: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|c| c.matches(host))
    }
}

impl Debug for GeoSiteDb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GeoSite({} categories)", self.categories.len())
    }
}

#[test]
fn test_geosite() {
    let db = GeoSiteDb::parse(
        r#"
google:
  - google.com
  - full:goo.gl
  - keyword:gstatic
cn:
  - regexp:^.*\.cn$
"#,
    )
    .unwrap();
    assert!(db.has_category("Google"));
    assert!(db.matches("google", "mail.google.com"));
    assert!(db.matches("google", "goo.gl"));
    assert!(!db.matches("google", "x.goo.gl"));
    assert!(db.matches("google", "www.gstatic.com"));
    assert!(db.matches("cn", "baidu.cn"));
    assert!(!db.matches("cn", "baidu.com"));
    assert!(!db.matches("missing", "google.com"));
}
