use std::io::{self, BufRead, IsTerminal, Write};

use crate::error::{Error, Result};

/// Operator confirmation for soft failures.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Asks on the controlling terminal. Refuses to block when stdin is not a
/// terminal; unattended runs must opt in with `--force` instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str) -> Result<bool> {
        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        prompt_yes_no(interactive, question, &mut stdin.lock(), &mut io::stdout())
    }
}

/// Ask `question` on `output` and read one answer line from `input`.
///
/// When `interactive` is false nothing is read and the call fails with a hint
/// to use `--force`.
pub fn prompt_yes_no(
    interactive: bool,
    question: &str,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<bool> {
    if !interactive {
        return Err(Error::msg(
            "cannot ask for confirmation: stdin is not a terminal (pass --force to continue unattended)",
        ));
    }
    write!(output, "{question} [y/N] ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

/// Always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(self.0)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
