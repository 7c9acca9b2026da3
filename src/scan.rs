/// Return the balanced `{...}` object starting at byte offset `start`.
///
/// Braces inside string literals are ignored, and a backslash inside a
/// string escapes the following character. Returns `None` when `start` is not
/// an opening brace or the text ends before the object closes.
pub fn scan_object(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    // Every delimiter we track is ASCII, so walking bytes is safe for UTF-8:
    // continuation bytes never collide with them.
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match b {
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Every balanced object in `text` whose opening brace sits at some `{`,
/// in order of their opening offsets. Nested objects are yielded too.
pub fn balanced_objects(text: &str) -> impl Iterator<Item = &str> {
    text.match_indices('{')
        .filter_map(move |(idx, _)| scan_object(text, idx))
}
