/// Expand `${VAR}` references against the process environment.
///
/// Runs over the raw config text before parsing, so any string value may
/// carry a secret by reference instead of inline. A reference to a
/// variable that is unset (or an unterminated `${`) is emitted verbatim.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    },
                }
                rest = &after[end + 1..];
            },
            _ => {
                // No closing brace (or empty name): nothing to expand.
                out.push_str(&rest[start..start + 2]);
                rest = after;
            },
        }
    }

    out.push_str(rest);
    out
}
