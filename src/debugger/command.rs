use log::debug;
use regex::Regex;

use super::console::{compile_patterns, Console};
use crate::error::{Error, Result};

/// Prompt-driven command/response exchange on a debugger console.
pub struct CommandSession {
    console: Console,
    prompts: Vec<Regex>,
    error_messages: Vec<String>,
    line_ending: &'static str,
}

impl CommandSession {
    pub fn new<S: AsRef<str>>(
        console: Console,
        prompts: &[S],
        error_messages: &[S],
        line_ending: &'static str,
    ) -> Result<Self> {
        let prompts = prompts.iter().map(|prompt| regex::escape(prompt.as_ref())).collect::<Vec<_>>();
        Ok(Self {
            console,
            prompts: compile_patterns(&prompts)?,
            error_messages: error_messages.iter().map(|message| message.as_ref().to_string()).collect(),
            line_ending,
        })
    }

    /// Sends `text` and waits for `expected` (in order) and then the prompt.
    ///
    /// Every failure is reported as a protocol error carrying `label`, also
    /// when the prompt was seen but the captured output contains one of the
    /// known error messages. An empty `text` only drains output up to the
    /// next prompt.
    pub fn command<S: AsRef<str>>(&mut self, text: &str, expected: &[S], label: &str) -> Result<String> {
        if !text.is_empty() {
            let unread = self.console.read_lazy();
            if !unread.is_empty() {
                debug!("[{}] unread: {}", self.console.name(), unread.trim_end());
            }
            self.console.note(&format!("{text}\n"));
            self.console
                .write_str(&format!("{text}{}", self.line_ending))
                .map_err(|e| relabel(e, label))?;
        }

        let mut buffer = String::new();
        for pattern in compile_patterns(expected)? {
            let (_, chunk) = self.console.expect(&[pattern]).map_err(|e| relabel(e, label))?;
            buffer.push_str(&chunk);
        }
        let (_, chunk) = self.console.expect(&self.prompts).map_err(|e| relabel(e, label))?;
        buffer.push_str(&chunk);

        if let Some(message) = self.error_messages.iter().find(|message| buffer.contains(message.as_str())) {
            return Err(Error::protocol(label, format!("debugger reported '{message}'")));
        }
        Ok(buffer)
    }

    /// Writes without waiting for any response.
    pub fn send(&mut self, text: &str) -> Result<()> {
        self.console.note(&format!("{text}\n"));
        self.console.write_str(&format!("{text}{}", self.line_ending))
    }

    /// Waits for the prompt without sending anything first.
    pub fn wait_for_prompt(&mut self, label: &str) -> Result<String> {
        let (_, buffer) = self.console.expect(&self.prompts).map_err(|e| relabel(e, label))?;
        match self.error_messages.iter().find(|message| buffer.contains(message.as_str())) {
            Some(message) => Err(Error::protocol(label, format!("debugger reported '{message}'"))),
            None => Ok(buffer),
        }
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn take_transcript(&mut self) -> String {
        self.console.take_transcript()
    }

    pub fn close(mut self) -> String {
        self.console.close();
        self.console.take_transcript()
    }
}

/// Keeps interruption and configuration errors, turns the rest into a
/// protocol error with the command label.
fn relabel(error: Error, label: &str) -> Error {
    match error {
        Error::Interrupted | Error::Config(_) => error,
        other => Error::protocol(label, other.to_string()),
    }
}

/// Extracts the first value printed after a `:` in a debugger response.
pub fn parse_value(buffer: &str) -> Option<u64> {
    let line = buffer.lines().find(|line| line.contains(':'))?;
    let (_, rest) = line.split_once(':')?;
    let token = rest.split_whitespace().next()?;
    let digits = token.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::debugger::console::testing::{responder, SharedWriter};
    use std::time::Duration;

    const ERRORS: [&str; 2] = ["syntax error in command", "read access failed"];

    fn session(reply: &str) -> (CommandSession, SharedWriter) {
        let (console, writer) = responder("", &[reply], Duration::from_millis(300), CancelToken::new());
        (CommandSession::new(console, &["P2020>"], &ERRORS, "\r\n").unwrap(), writer)
    }

    #[test]
    fn expected_lines_then_prompt() {
        let reply = "select 1\r\nTarget CPU  : MPC85xx\r\nCore state  : debug mode\r\nP2020>";
        let (mut session, writer) = session(reply);
        let buffer = session.command("select 1", &["Target CPU", "Core state"], "Error selecting core").unwrap();
        assert!(buffer.ends_with("P2020>"));
        assert_eq!(writer.contents(), "select 1\r\n");
    }

    #[test]
    fn error_message_fails_even_with_prompt() {
        let (mut session, _) = session("rd r99\r\nsyntax error in command\r\nP2020>");
        let error = session.command("rd r99", &[] as &[&str], "Error getting register value").unwrap_err();
        assert_eq!(error.outcome(), "Error getting register value");
    }

    #[test]
    fn missing_expected_line_is_labelled() {
        let (mut session, _) = session("halt 0 1\r\nP2020>");
        let error = session
            .command("halt 0 1", &["- TARGET: core #0 has entered debug mode"], "Error halting DUT")
            .unwrap_err();
        assert!(matches!(error, Error::Protocol { ref label, .. } if label == "Error halting DUT"));
    }

    #[test]
    fn values_follow_first_colon() {
        assert_eq!(parse_value("rd r3\r\nr3  : 0x0000abcd  43981\r\nP2020>"), Some(0xabcd));
        assert_eq!(parse_value("ffe02110 : 12345678 ....\r\n"), Some(0x1234_5678));
        assert_eq!(parse_value("no value here"), None);
    }
}
