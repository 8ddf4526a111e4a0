use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Prefix of every file name in the disk tier.
///
/// This avoids empty names, hidden dot-files and names like `..` or `tmp`.
const FILE_PREFIX: &str = "k_";

/// File names are kept below this length, as most filesystems cap a path segment at 255 bytes.
const MAX_FILE_NAME: usize = 200;

/// Separates the source key from the processor chain signature in a derived key.
const SIGNATURE_SEPARATOR: char = '#';

/// Separates individual processor identifiers inside the chain signature.
const CHAIN_SEPARATOR: char = '>';

/// Builds the derived key for `key` with the processors identified by `identifiers`.
///
/// Without any identifiers this is `key` itself, so a lookup without a processor chain shares its
/// slot with the raw value.
pub fn derived_key<'a, I>(key: &str, identifiers: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut derived = String::from(key);
    for (i, identifier) in identifiers.into_iter().enumerate() {
        derived.push(if i == 0 {
            SIGNATURE_SEPARATOR
        } else {
            CHAIN_SEPARATOR
        });
        derived.push_str(identifier);
    }
    derived
}

/// Maps a cache key to the file name used by the disk tier.
///
/// Protect against:
/// * ".." and absolute paths
/// * path separators
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder and is illegal on Windows)
/// * control characters and the remaining characters Windows refuses in file names
///
/// Everything outside `[A-Za-z0-9._-]` is escaped as `%XX`, and overlong names are cut and
/// suffixed with the sha-256 of the full key so they stay distinct.
pub fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(FILE_PREFIX.len() + key.len());
    name.push_str(FILE_PREFIX);
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => name.push(b as char),
            // a leading `.` is impossible thanks to the prefix, but `..` is escaped anyway
            b'.' if !name.ends_with('.') => name.push('.'),
            _ => {
                let _ = write!(name, "%{b:02X}");
            }
        }
    }

    if name.len() > MAX_FILE_NAME {
        let hash = Sha256::digest(key.as_bytes());
        // escapes are ASCII, so every index is a char boundary
        name.truncate(MAX_FILE_NAME - 65);
        name.push('~');
        for b in hash {
            let _ = write!(name, "{b:02x}");
        }
    }

    name
}

/// Whether `name` was produced by [`file_name`].
///
/// Used to skip foreign files when scanning the cache directory.
pub fn is_entry_file_name(name: &str) -> bool {
    name.starts_with(FILE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key() {
        assert_eq!(derived_key("1", []), "1");
        assert_eq!(derived_key("1", ["oreo"]), "1#oreo");
        assert_eq!(
            derived_key("https://x/1.png", ["resize-20x20", "round"]),
            "https://x/1.png#resize-20x20>round"
        );
    }

    #[test]
    fn test_file_names() {
        assert_eq!(file_name(""), "k_");
        assert_eq!(file_name("1"), "k_1");
        assert_eq!(file_name("a.b"), "k_a.b");
        assert_eq!(file_name(".."), "k_.%2E");
        assert_eq!(file_name("../etc/passwd"), "k_.%2E%2Fetc%2Fpasswd");
        assert_eq!(
            file_name("https://example.com/a b.png"),
            "k_https%3A%2F%2Fexample.com%2Fa%20b.png"
        );
        assert_eq!(file_name("1#oreo"), "k_1%23oreo");
        assert!(is_entry_file_name(&file_name("anything")));
        assert!(!is_entry_file_name("tmp"));
    }

    #[test]
    fn test_long_file_names() {
        let long_a = "a".repeat(500);
        let long_b = format!("{}b", "a".repeat(499));

        let name_a = file_name(&long_a);
        let name_b = file_name(&long_b);

        assert_eq!(name_a.len(), MAX_FILE_NAME);
        assert_eq!(name_b.len(), MAX_FILE_NAME);
        assert_ne!(name_a, name_b);
        assert_eq!(name_a, file_name(&long_a));
    }
}
