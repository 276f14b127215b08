//! Helpers for turning raw console output into log records and presence events.

use crate::models::LogLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerPresence {
    Joined(String),
    Left(String),
}

/// Remove ANSI escape sequences and stray control characters.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                // CSI: parameters then a final byte in '@'..='~'
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: terminated by BEL or ESC '\'
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        out.push(c);
    }
    out
}

/// Level for one console line. Stderr defaults to `Error` unless the text
/// says otherwise.
pub fn classify_line(line: &str, from_stderr: bool) -> LogLevel {
    let upper = line.to_ascii_uppercase();
    if ["ERROR", "SEVERE", "FATAL", "EXCEPTION"]
        .iter()
        .any(|p| upper.contains(p))
    {
        return LogLevel::Error;
    }
    if upper.contains("WARN") {
        return LogLevel::Warning;
    }
    if from_stderr && !["INFO", "DEBUG", "FINE"].iter().any(|p| upper.contains(p)) {
        return LogLevel::Error;
    }
    LogLevel::Info
}

/// Recognise player join/leave lines.
pub fn parse_player_event(line: &str) -> Option<PlayerPresence> {
    let body = line
        .rsplit_once("]: ")
        .map(|(_, b)| b)
        .or_else(|| line.rsplit_once("] ").map(|(_, b)| b))
        .unwrap_or(line)
        .trim();

    if let Some(name) = body.strip_suffix(" joined the game") {
        return valid_name(name).map(PlayerPresence::Joined);
    }
    if let Some(name) = body.strip_suffix(" left the game") {
        return valid_name(name).map(PlayerPresence::Left);
    }

    let rest = body.strip_prefix("Player ")?;
    let (name, action) = if let Some(quoted) = rest.strip_prefix('\'') {
        let (name, action) = quoted.split_once('\'')?;
        (name, action.trim_start())
    } else {
        rest.split_once(' ')?
    };
    if action.starts_with("joined") || action.starts_with("connected") {
        valid_name(name).map(PlayerPresence::Joined)
    } else if action.starts_with("left") || action.starts_with("disconnected") {
        valid_name(name).map(PlayerPresence::Left)
    } else {
        None
    }
}

fn valid_name(name: &str) -> Option<String> {
    let ok = !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    ok.then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_title_sequences() {
        assert_eq!(strip_ansi("\u{1b}[32mOK\u{1b}[0m done"), "OK done");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text\r"), "text");
    }

    #[test]
    fn stderr_defaults_to_error() {
        assert_eq!(classify_line("something odd", true), LogLevel::Error);
        assert_eq!(classify_line("[INFO] loading", true), LogLevel::Info);
        assert_eq!(classify_line("WARNING: low memory", true), LogLevel::Warning);
        assert_eq!(classify_line("plain stdout", false), LogLevel::Info);
        assert_eq!(classify_line("[SEVERE] boom", false), LogLevel::Error);
    }

    #[test]
    fn recognises_presence_lines() {
        assert_eq!(
            parse_player_event("[12:00:01 INFO]: Steve joined the game"),
            Some(PlayerPresence::Joined("Steve".into()))
        );
        assert_eq!(
            parse_player_event("[2026/01/01 10:00:00 INFO] [World] Player 'Alex_2' left world"),
            Some(PlayerPresence::Left("Alex_2".into()))
        );
        assert_eq!(
            parse_player_event("Player Bob connected from 10.0.0.2"),
            Some(PlayerPresence::Joined("Bob".into()))
        );
        assert_eq!(parse_player_event("[INFO]: Some Thing joined the game"), None);
        assert_eq!(parse_player_event("Server started"), None);
    }
}
