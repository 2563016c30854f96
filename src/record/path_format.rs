//! Segment path templating
//!
//! Segment file names are rendered from a template with the substitutions
//! `%path` (path name), `%Y %m %d %H %M %S` (wall clock of the segment
//! start, UTC), `%f` (six-digit microseconds) and `%s` (unix seconds).
//! Rendering is a pure function: the same inputs always produce the same
//! string.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Render `template` for a segment of `path_name` starting at `start`.
pub fn encode(template: &str, path_name: &str, start: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(template.len() + path_name.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('p') => {
                // check the full word to leave e.g. "%part" alone
                let rest: String = chars.clone().take(4).collect();
                if rest == "path" {
                    for _ in 0..4 {
                        chars.next();
                    }
                    out.push_str(path_name);
                } else {
                    out.push('%');
                }
            }
            Some('Y') => {
                chars.next();
                out.push_str(&format!("{:04}", start.year()));
            }
            Some('m') => {
                chars.next();
                out.push_str(&format!("{:02}", start.month()));
            }
            Some('d') => {
                chars.next();
                out.push_str(&format!("{:02}", start.day()));
            }
            Some('H') => {
                chars.next();
                out.push_str(&format!("{:02}", start.hour()));
            }
            Some('M') => {
                chars.next();
                out.push_str(&format!("{:02}", start.minute()));
            }
            Some('S') => {
                chars.next();
                out.push_str(&format!("{:02}", start.second()));
            }
            Some('f') => {
                chars.next();
                out.push_str(&format!("{:06}", start.timestamp_subsec_micros()));
            }
            Some('s') => {
                chars.next();
                out.push_str(&format!("{}", start.timestamp()));
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => out.push('%'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2008, 5, 20, 22, 15, 25).unwrap()
    }

    #[test]
    fn test_full_template() {
        let out = encode(
            "/rec/%path/%Y-%m-%d_%H-%M-%S-%f",
            "mypath",
            sample_time(),
        );
        assert_eq!(out, "/rec/mypath/2008-05-20_22-15-25-000000");
    }

    #[test]
    fn test_unix_seconds() {
        let out = encode("%path-%s", "cam1", sample_time());
        assert_eq!(out, format!("cam1-{}", sample_time().timestamp()));
    }

    #[test]
    fn test_deterministic() {
        let a = encode("%path/%Y%m%d%H%M%S%f", "p", sample_time());
        let b = encode("%path/%Y%m%d%H%M%S%f", "p", sample_time());
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_specifier_kept() {
        assert_eq!(encode("a%zb", "p", sample_time()), "a%zb");
        assert_eq!(encode("100%%", "p", sample_time()), "100%");
    }
}
