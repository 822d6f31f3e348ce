//! Fingerprints of reports and backtraces.

use sha1::{Digest as _, Sha1};

/// Returns the hex encoded SHA-1 digest of `items` joined by newlines.
pub fn hash_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha1::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(item.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Drops all non-ASCII characters, which are not part of file name hashes.
pub fn ascii(s: &str) -> String {
    s.chars().filter(char::is_ascii).collect()
}
