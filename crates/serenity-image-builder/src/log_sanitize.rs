//! Makes subprocess output safe to echo into the build log.
//!
//! Build tools like ninja and cmake colorize and redraw their progress lines;
//! those escape sequences are dropped so the log stays plain text.

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Scan {
    Text,
    Escape,
    Csi,
    // OSC may end with BEL; DCS/SOS/PM/APC only with ESC '\'.
    Str { bel_ends: bool },
    StrEscape { bel_ends: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut state = Scan::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match state {
            Scan::Text if c == '\x1b' => Scan::Escape,
            Scan::Text if (c.is_control() && c != '\t') || is_bidi_control(c) => Scan::Text,
            Scan::Text => {
                // Only mark truncation when visible text is actually cut.
                if kept == MAX_LINE_CHARS {
                    out.push_str(" ...[truncated]");
                    break;
                }
                out.push(if c == '\t' { ' ' } else { c });
                kept += 1;
                Scan::Text
            }
            Scan::Escape => match c {
                '[' => Scan::Csi,
                ']' => Scan::Str { bel_ends: true },
                'P' | 'X' | '^' | '_' => Scan::Str { bel_ends: false },
                _ => Scan::Text,
            },
            Scan::Csi if ('@'..='~').contains(&c) => Scan::Text,
            Scan::Csi => Scan::Csi,
            Scan::Str { bel_ends } => match c {
                '\x07' if bel_ends => Scan::Text,
                '\x1b' => Scan::StrEscape { bel_ends },
                _ => Scan::Str { bel_ends },
            },
            Scan::StrEscape { bel_ends } => match c {
                '\\' => Scan::Text,
                '\x1b' => Scan::StrEscape { bel_ends },
                _ => Scan::Str { bel_ends },
            },
        };
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
