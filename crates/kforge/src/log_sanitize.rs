//! Strip terminal control sequences from tool output before it reaches the task log.
//!
//! Compilers and `make` colourise diagnostics; `magiskboot` and friends print progress
//! with carriage returns. None of that belongs in log files.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum State {
    Text,
    Esc,
    // ESC [ ... final byte in '@'..='~'
    Csi,
    // ESC ] ... BEL or ST; `esc_seen` tracks a pending ESC of the ST terminator
    Osc { esc_seen: bool },
    // ESC P / X / ^ / _ ... ST
    StString { esc_seen: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut state = State::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match (state, c) {
            (State::Text, '\x1b') => State::Esc,
            (State::Text, '\t') => {
                out.push(' ');
                kept += 1;
                State::Text
            }
            (State::Text, c) if c.is_control() || is_format_control(c) => State::Text,
            (State::Text, c) => {
                out.push(c);
                kept += 1;
                State::Text
            }

            (State::Esc, '[') => State::Csi,
            (State::Esc, ']') => State::Osc { esc_seen: false },
            (State::Esc, 'P' | 'X' | '^' | '_') => State::StString { esc_seen: false },
            (State::Esc, _) => State::Text,

            (State::Csi, c) if ('@'..='~').contains(&c) => State::Text,
            (State::Csi, _) => State::Csi,

            (State::Osc { .. }, '\x07') => State::Text,
            (State::Osc { esc_seen: true }, '\\') => State::Text,
            (State::Osc { .. }, c) => State::Osc {
                esc_seen: c == '\x1b',
            },

            (State::StString { esc_seen: true }, '\\') => State::Text,
            (State::StString { .. }, c) => State::StString {
                esc_seen: c == '\x1b',
            },
        };

        if kept >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

// Bidi overrides can visually reorder a log line.
fn is_format_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_compiler_colours() {
        let input = "\u{1b}[01m\u{1b}[Kdrivers/foo.c:12:\u{1b}[m\u{1b}[K \u{1b}[01;35mwarning:\u{1b}[m unused";
        assert_eq!(sanitize_log_line(input), "drivers/foo.c:12: warning: unused");
    }

    #[test]
    fn strips_osc_and_st_sequences() {
        assert_eq!(
            sanitize_log_line("a\u{1b}]0;title\u{7}b\u{1b}Ppayload\u{1b}\\c"),
            "abc"
        );
    }

    #[test]
    fn drops_carriage_returns_and_bidi_controls() {
        assert_eq!(sanitize_log_line("Image\tdone\r\u{202e}!"), "Image done!");
    }

    #[test]
    fn truncates_very_long_lines() {
        let long = "x".repeat(5000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with(" ...[truncated]"));
        assert_eq!(got.len(), 4096 + " ...[truncated]".len());
    }
}
