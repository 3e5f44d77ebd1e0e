//! Option strings and config files.
//!
//! Index descriptors, search options, and the CDC credentials file all use
//! the same `k=v` grammar: comma-separated pairs, optional `…|` prefix
//! (column comments store `MYVECTOR Column |type=…`), whitespace-tolerant.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionsError {
    #[error("option entry '{0}' is not k=v")]
    MalformedEntry(String),

    #[error("option entry with empty key or value: '{0}'")]
    EmptyEntry(String),

    #[error("cannot read config file: {0}")]
    ConfigRead(String),
}

/// Parsed `k=v,k=v,…` option string.
#[derive(Debug, Clone, Default)]
pub struct OptionsMap {
    entries: HashMap<String, String>,
}

impl OptionsMap {
    /// Parse an option string. Anything before a `|` marker is ignored
    /// (column comments carry a `MYVECTOR Column |` prefix).
    pub fn parse(options: &str) -> Result<Self, OptionsError> {
        let body = match options.find('|') {
            Some(at) => &options[at + 1..],
            None => options,
        };

        let mut entries = HashMap::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some(eq) = part.find('=') else {
                return Err(OptionsError::MalformedEntry(part.to_string()));
            };
            let key = part[..eq].trim();
            let val = part[eq + 1..].trim();
            if key.is_empty() || val.is_empty() {
                return Err(OptionsError::EmptyEntry(part.to_string()));
            }
            entries.insert(key.to_string(), val.to_string());
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Numeric option lookup; `None` when absent or non-numeric.
    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, key: &str, val: &str) {
        self.entries.insert(key.to_string(), val.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a `k=v`-per-line config file. Lines starting with `#` are
/// comments; blank lines are skipped. Used for CDC credentials.
pub fn read_config_file(path: &Path) -> Result<OptionsMap, OptionsError> {
    let text = fs::read_to_string(path)
        .map_err(|e| OptionsError::ConfigRead(format!("{}: {e}", path.display())))?;

    let mut joined = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !joined.is_empty() {
            joined.push(',');
        }
        joined.push_str(line);
    }

    OptionsMap::parse(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_basic_options() {
        let opts = OptionsMap::parse("type=HNSW,dim=1536,size=1000000,M=64,ef=100").unwrap();
        assert_eq!(opts.get("type"), Some("HNSW"));
        assert_eq!(opts.get_usize("dim"), Some(1536));
        assert_eq!(opts.get_usize("M"), Some(64));
        assert_eq!(opts.get("missing"), None);
    }

    #[test]
    fn parse_skips_comment_prefix() {
        let opts = OptionsMap::parse("MYVECTOR Column |type=KNN,dim=4").unwrap();
        assert_eq!(opts.get("type"), Some("KNN"));
        assert_eq!(opts.get_usize("dim"), Some(4));
    }

    #[test]
    fn parse_trims_whitespace() {
        let opts = OptionsMap::parse(" type = HNSW , dim = 8 ").unwrap();
        assert_eq!(opts.get("type"), Some("HNSW"));
        assert_eq!(opts.get_usize("dim"), Some(8));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(OptionsMap::parse("type=HNSW,dim").is_err());
        assert!(OptionsMap::parse("=4").is_err());
        assert!(OptionsMap::parse("dim=").is_err());
    }

    #[test]
    fn config_file_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# cdc credentials").unwrap();
        writeln!(f, "myvector_user_id=repl").unwrap();
        writeln!(f, "myvector_host=127.0.0.1").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "myvector_port=3306").unwrap();

        let opts = read_config_file(f.path()).unwrap();
        assert_eq!(opts.get("myvector_user_id"), Some("repl"));
        assert_eq!(opts.get("myvector_host"), Some("127.0.0.1"));
        assert_eq!(opts.get("myvector_port"), Some("3306"));
    }
}
