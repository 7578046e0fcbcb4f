use std::fmt;
use std::io::{self, Write};

/// Where human-readable progress lines go. Machine-readable output owns
/// stdout, so `--json` callers route progress to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Progress {
    #[default]
    Stdout,
    Stderr,
    Quiet,
}

impl Progress {
    pub fn for_json(json: bool) -> Self {
        if json {
            Progress::Stderr
        } else {
            Progress::Stdout
        }
    }

    /// Writes without a newline and flushes, for lines finished later.
    pub fn print(self, args: fmt::Arguments<'_>) {
        // A closed pipe must not abort a batch.
        let _ = match self {
            Progress::Stdout => write_flush(&mut io::stdout().lock(), args),
            Progress::Stderr => write_flush(&mut io::stderr().lock(), args),
            Progress::Quiet => Ok(()),
        };
    }

    pub fn line(self, args: fmt::Arguments<'_>) {
        self.print(format_args!("{}\n", args));
    }
}

fn write_flush(out: &mut dyn Write, args: fmt::Arguments<'_>) -> io::Result<()> {
    out.write_fmt(args)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_keeps_progress_off_stdout() {
        assert_eq!(Progress::for_json(true), Progress::Stderr);
        assert_eq!(Progress::for_json(false), Progress::Stdout);
        assert_eq!(Progress::default(), Progress::Stdout);
    }

    #[test]
    fn writes_arguments_and_flushes() {
        let mut buf = Vec::new();
        write_flush(&mut buf, format_args!("[{}/{}] Run {}", 1, 4, 1)).expect("write");
        assert_eq!(buf, b"[1/4] Run 1");
    }
}
