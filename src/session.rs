use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::api::Backend;
use crate::chat::{self, Message};
use crate::config::{Config, Mode};
use crate::image_gen;

/// Typing this on a line of its own ends the session.
pub const EXIT_FLAG: &str = "exit";

/// The interactive read-dispatch loop. One line of input is one turn, and a turn is
/// fully handled before the next line is read.
pub struct Session<'a, B: Backend + ?Sized> {
    backend: &'a B,
    mode: Mode,
    image_dir: &'a Path,

    // Only grows in `Mode::ChatWithContext`, always as user/assistant pairs.
    history: Vec<Message>,
}

impl<'a, B: Backend + ?Sized> Session<'a, B> {
    /// Creates a session that sends its turns to `backend`.
    ///
    /// The mode and image directory are taken from `config`, which must outlive the
    /// session. The conversation history starts out empty.
    ///
    /// # Returns
    /// - `Result<Self>`: the session, or an Err if `config` holds an unknown mode.
    pub fn new(backend: &'a B, config: &'a Config) -> Result<Self> {
        Ok(Session {
            backend,
            mode: config.mode()?,
            image_dir: &config.image_dir,
            history: Vec::new(),
        })
    }

    /// The completed exchanges so far; always empty outside `Mode::ChatWithContext`.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Runs turns until the exit flag or the end of `input`.
    ///
    /// Failed turns are reported on `out` and the loop carries on; the only error
    /// returned is one that makes every later turn pointless, such as an image
    /// directory that cannot be created.
    pub async fn run<R, W>(&mut self, mut input: R, out: &mut W) -> Result<()>
    where
        R: BufRead,
        W: Write,
    {
        let mut buf = Vec::new();
        loop {
            write!(out, "You: ")?;
            out.flush()?;

            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                tracing::debug!("input closed");
                break;
            }
            // invalid UTF-8 is passed on as replacement characters rather than rejected
            let line = String::from_utf8_lossy(&buf);
            let text = line.strip_suffix('\n').unwrap_or(&*line);
            let text = text.strip_suffix('\r').unwrap_or(text);
            if text == EXIT_FLAG {
                break;
            }

            writeln!(out, ">")?;
            if self.turn(text, out).await? {
                writeln!(out)?;
                writeln!(out, ">>>")?;
            }
        }

        Ok(())
    }

    /// Handles one line of input. Returns whether the turn succeeded.
    async fn turn<W: Write>(&mut self, text: &str, out: &mut W) -> Result<bool> {
        match self.mode {
            Mode::ChatWithContext => {
                self.history.push(Message::user(text));
                match chat::stream_reply(self.backend, &self.history, out).await {
                    Ok(reply) => {
                        self.history.push(Message::assistant(reply));
                        Ok(true)
                    }
                    Err(e) => {
                        // drop the whole turn so the history keeps alternating
                        self.history.pop();
                        report_chat_error(out, &e)?;
                        Ok(false)
                    }
                }
            }
            Mode::ChatNoContext => {
                match chat::stream_reply(self.backend, &[Message::user(text)], out).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        report_chat_error(out, &e)?;
                        Ok(false)
                    }
                }
            }
            Mode::Image => {
                let saved = image_gen::generate(self.backend, text, self.image_dir, out)
                    .await
                    .context("generate image error")?;
                Ok(saved.is_some())
            }
        }
    }
}

fn report_chat_error<W: Write>(out: &mut W, e: &anyhow::Error) -> Result<()> {
    tracing::warn!(error = %e, "chat turn dropped");
    writeln!(out)?;
    writeln!(out, "chat error: {:#}", e)?;
    Ok(())
}
