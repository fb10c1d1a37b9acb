use std::sync::OnceLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;
const REDACTED: &str = "***";

// Flags whose following argument is a secret (keytool/openssl conventions).
const SECRET_FLAGS: &[&str] = &["-storepass", "-keypass", "-passin", "-passout"];

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
}

/// Strips terminal escapes and control characters from one line of child output.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut char_count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.as_ref() {
            match mode {
                EscapeMode::Esc => match c {
                    '[' => esc_mode = Some(EscapeMode::Csi),
                    ']' => esc_mode = Some(EscapeMode::Osc),
                    _ => esc_mode = None,
                },
                EscapeMode::Csi => {
                    if ('@'..='~').contains(&c) {
                        esc_mode = None;
                    }
                }
                EscapeMode::Osc => {
                    if c == '\x07' {
                        esc_mode = None;
                    } else if c == '\x1b' {
                        esc_mode = Some(EscapeMode::OscEsc);
                    }
                }
                EscapeMode::OscEsc => {
                    if c == '\\' {
                        esc_mode = None;
                    } else if c != '\x1b' {
                        esc_mode = Some(EscapeMode::Osc);
                    }
                }
            }
            continue;
        }

        match c {
            '\x1b' => esc_mode = Some(EscapeMode::Esc),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                char_count += 1;
            }
            c if c.is_control() => {}
            c => {
                out.push(c);
                char_count += 1;
            }
        }

        if char_count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn pass_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pass:\S+").expect("static regex"))
}

/// Returns a copy of `args` safe to log: `pass:<secret>` material and the values
/// following password flags are replaced.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for a in args {
        if hide_next {
            out.push(REDACTED.to_string());
            hide_next = false;
            continue;
        }
        if SECRET_FLAGS.contains(&a.as_str()) {
            hide_next = true;
            out.push(a.clone());
            continue;
        }
        out.push(redact_inline(a));
    }
    out
}

fn redact_inline(arg: &str) -> String {
    pass_pattern()
        .replace_all(arg, format!("pass:{REDACTED}").as_str())
        .into_owned()
}

/// Renders a command line for logs with secrets redacted.
pub fn display_command(command: &str, args: &[String]) -> String {
    let mut s = command.to_string();
    for a in redact_args(args) {
        s.push(' ');
        s.push_str(&a);
    }
    s
}
