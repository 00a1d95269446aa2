//! Shared utility functions.

/// Replace `{key}` placeholders in `template` with their values.
///
/// Unknown placeholders are left untouched.
pub fn expand_placeholders(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Truncate a string to max length, adding "..." if needed.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_placeholders() {
        let vars = [("memory_mb", "256"), ("name", "db")];
        assert_eq!(
            expand_placeholders("--mem {memory_mb} --name={name}", &vars),
            "--mem 256 --name=db"
        );
        assert_eq!(expand_placeholders("{unknown}", &vars), "{unknown}");
        assert_eq!(expand_placeholders("plain", &vars), "plain");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-vm-name", 10), "a-very-...");
        assert_eq!(truncate("ünïcödé-name", 8), "ünïcö...");
    }
}
