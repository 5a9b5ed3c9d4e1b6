//! Operator input: one line in, one [`Command`] out.
//!
//! Runs on its own OS thread with plain blocking reads. A read blocked on the
//! terminal cannot be cancelled, and keeping it off the async runtime means it
//! never holds up runtime shutdown.

use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::client::shutdown::Shutdown;

pub const PROMPT: &str = "> ";

/// Lines that end the session. Matched exactly, case-sensitive.
pub const QUIT_TOKENS: [&str; 2] = ["exit", "quit"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Publish { text: String },
    Quit,
}

impl Command {
    /// Translates one input line, without its line terminator.
    ///
    /// Anything that is not a quit token is published verbatim, including the
    /// empty line.
    pub fn parse(line: &str) -> Self {
        if QUIT_TOKENS.contains(&line) {
            Command::Quit
        } else {
            Command::Publish {
                text: line.to_string(),
            }
        }
    }
}

/// Why the ingress loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressExit {
    Quit,
    EndOfInput,
    Shutdown,
    DispatcherGone,
}

/// Reads commands from `input` until quit, end of input, or shutdown.
///
/// Blocks on each read and on each hand-off: the channel has room for one
/// command, so a new line is not read until the previous command was taken.
/// End of input is handed over as [`Command::Quit`].
pub fn run<R, W>(
    mut input: R,
    mut prompt: W,
    commands: &Sender<Command>,
    shutdown: &Shutdown,
) -> IngressExit
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();

    loop {
        if shutdown.is_fired() {
            return IngressExit::Shutdown;
        }

        let _ = prompt.write_all(PROMPT.as_bytes());
        let _ = prompt.flush();

        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                debug!("input closed");
                let _ = commands.blocking_send(Command::Quit);
                return IngressExit::EndOfInput;
            }
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                let _ = writeln!(prompt, "Input is not valid UTF-8, ignored");
                warn!(?error, "skipping unreadable input line");
                continue;
            }
            Err(error) => {
                warn!(?error, "failed to read input, treating as end of input");
                let _ = commands.blocking_send(Command::Quit);
                return IngressExit::EndOfInput;
            }
        }

        let command = Command::parse(trim_line_ending(&line));
        let quit = command == Command::Quit;
        debug!(?command, "input received");

        if commands.blocking_send(command).is_err() {
            return IngressExit::DispatcherGone;
        }
        if quit {
            return IngressExit::Quit;
        }
    }
}

/// Starts [`run`] on a dedicated thread reading stdin and prompting on stdout.
pub fn spawn(commands: Sender<Command>, shutdown: Shutdown) -> io::Result<JoinHandle<IngressExit>> {
    thread::Builder::new()
        .name("ingress".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            run(stdin.lock(), io::stdout(), &commands, &shutdown)
        })
}

fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
