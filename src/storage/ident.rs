/// Normalizes an arbitrary string into a safe SQL identifier: every
/// character outside `[A-Za-z0-9]` becomes `_`, and a leading digit gets a
/// `_` prefix so the result is always a valid bare table/column name.
///
/// Two distinct inputs may collapse to the same identifier; callers own that
/// hazard (the built-in table set cannot collide).
pub fn safe_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
