use std::borrow::Cow;

const LEGACY_MARKER: &str = "fff";

/// Hashing key of a segment filename.
///
/// `<hash>_<seq>...` keys on the second `_` token, legacy `fff`-marked
/// names key on the name with every marker removed. Anything else is not
/// routable.
pub fn chunk_key(filename: &str) -> Option<Cow<'_, str>> {
    if filename.contains('_') {
        return filename
            .split('_')
            .nth(1)
            .filter(|token| !token.is_empty())
            .map(Cow::Borrowed);
    }
    if filename.contains(LEGACY_MARKER) {
        let key = filename.replace(LEGACY_MARKER, "");
        if key.is_empty() {
            return None;
        }
        return Some(Cow::Owned(key));
    }
    None
}
