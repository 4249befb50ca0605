/// Reduces an arbitrary name to `[a-z0-9_]` for use in ids and topics.
///
/// ASCII letters are lowercased, spaces, `-`, `_` and `.` become `_`, and every
/// other character is dropped. Runs of `_` collapse to one and leading or
/// trailing `_` are removed, so `" My--Disk.01 "` becomes `my_disk_01`.
pub fn sanitize_id(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for c in input.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else if matches!(c, ' ' | '-' | '_' | '.') {
            '_'
        } else {
            continue;
        };

        if mapped == '_' && (out.is_empty() || out.ends_with('_')) {
            continue;
        }
        out.push(mapped);
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(id: &str) {
        assert!(
            id.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
            "bad character in {id:?}"
        );
        assert!(!id.starts_with('_'), "leading underscore in {id:?}");
        assert!(!id.ends_with('_'), "trailing underscore in {id:?}");
        assert!(!id.contains("__"), "double underscore in {id:?}");
    }

    #[test]
    fn test_common_names() {
        assert_eq!(sanitize_id("nginx"), "nginx");
        assert_eq!(sanitize_id("My Service"), "my_service");
        assert_eq!(sanitize_id("docker.service"), "docker_service");
        assert_eq!(sanitize_id(" My--Disk.01 "), "my_disk_01");
        assert_eq!(sanitize_id("BAT0"), "bat0");
    }

    #[test]
    fn test_drops_unsupported_characters() {
        assert_eq!(sanitize_id("cpu%/core#1"), "cpucore1");
        assert_eq!(sanitize_id("température"), "temprature");
        assert_eq!(sanitize_id("!!!"), "");
    }

    #[test]
    fn test_invariant_holds_for_awkward_inputs() {
        let inputs = [
            "",
            "_",
            "___",
            "_a_",
            "a__b",
            "a _ - . b",
            "--x--",
            "ÄÖÜ äöü",
            "日本語 name",
            "tab\tand\nnewline",
            "UPPER_lower-123",
            "..leading.dots..",
            "a_-_b",
            "emoji 🐧 penguin",
        ];
        for input in inputs {
            assert_well_formed(&sanitize_id(input));
        }
    }

    #[test]
    fn test_idempotent() {
        for input in ["Hello World", "a__b", "x.y-z"] {
            let once = sanitize_id(input);
            assert_eq!(sanitize_id(&once), once);
        }
    }
}
