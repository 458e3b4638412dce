use radix_trie::{Trie, TrieCommon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostType {
    Exact,
    Suffix,
}

/// Exact and suffix domain matching over a trie of reversed, lowercased names.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    trie: Trie<String, HostType>,
}

impl HostMatcher {
    pub fn matches(&self, host: &str) -> bool {
        let rev_dn: String = host
            .trim_end_matches('.')
            .chars()
            .rev()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let mut probe = rev_dn.as_str();
        // walk ancestors so that an exact entry on a longer key does not hide a shorter suffix
        while let Some(node) = self.trie.get_ancestor(probe) {
            let (Some(key), Some(val)) = (node.key(), node.value()) else {
                break;
            };
            match val {
                HostType::Exact if key.len() == rev_dn.len() => return true,
                HostType::Suffix
                    if key.len() == rev_dn.len()
                        || rev_dn.as_bytes().get(key.len()) == Some(&b'.') =>
                {
                    return true
                }
                _ => {}
            }
            let Some(last) = key.chars().next_back() else {
                break;
            };
            probe = &key[..key.len() - last.len_utf8()];
        }
        false
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HostMatcherBuilder(Vec<(String, HostType)>);

impl HostMatcherBuilder {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add_exact(&mut self, host: &str) {
        self.0.push((Self::key(host), HostType::Exact))
    }

    pub fn add_suffix(&mut self, host: &str) {
        self.0.push((Self::key(host), HostType::Suffix))
    }

    fn key(host: &str) -> String {
        host.trim_matches('.')
            .chars()
            .rev()
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    pub fn build(self) -> HostMatcher {
        let mut trie = Trie::new();
        for (key, ty) in self.0 {
            // a suffix entry subsumes an exact entry on the same key
            match trie.get(&key) {
                Some(HostType::Suffix) => {}
                _ => {
                    trie.insert(key, ty);
                }
            }
        }
        HostMatcher { trie }
    }
}

#[test]
fn test_matcher() {
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("telemetry.google.com");
    builder.add_suffix("analytics.google.com");
    builder.add_exact("test.google.com");
    let matcher = builder.build();
    assert!(!matcher.matches("google.com"));
    assert!(matcher.matches("telemetry.google.com"));
    assert!(matcher.matches("t-01.telemetry.google.com"));
    assert!(matcher.matches("T-01.Telemetry.Google.com"));
    assert!(matcher.matches("test.google.com"));
    assert!(!matcher.matches("notgoogle.com"));
    assert!(!matcher.matches("me.notgoogle.com"));
    assert!(!matcher.matches("ogle.com"));
    assert!(!matcher.matches("t-02.test.google.com"));
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("ogle.com");
    let matcher = builder.build();
    assert!(matcher.matches("hi.ogle.com"));
    assert!(!matcher.matches("google.com"));
    assert!(!matcher.matches("hi.google.com"));
}

#[test]
fn test_matcher_nested_entries() {
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("example.com");
    builder.add_exact("api.example.com");
    let matcher = builder.build();
    assert!(matcher.matches("api.example.com"));
    assert!(matcher.matches("v2.api.example.com"));
    assert!(matcher.matches("example.com"));
    assert_eq!(matcher.len(), 2);
}

#[test]
fn test_matcher_non_ascii() {
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("例.com");
    builder.add_exact("bücher.de");
    let matcher = builder.build();
    assert!(matcher.matches("例.com"));
    assert!(matcher.matches("www.例.com"));
    assert!(!matcher.matches("x例.com"));
    assert!(!matcher.matches("例例.com"));
    assert!(matcher.matches("bücher.de"));
    assert!(!matcher.matches("abücher.de"));
    assert!(!matcher.matches("shop.bücher.de"));
}
