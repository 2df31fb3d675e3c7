//! Detects user interrupts in a session transcript by raw substring match.
//!
//! Runs on the same tailing machinery as the transcript watcher but never
//! parses JSON. The first load only establishes the baseline offset; old
//! interrupts in the file are history, not news.

use crate::transcript_watcher::{TailConsumer, TailRead, TailState};
use crate::transition::Input;

const INTERRUPT_MARKERS: [&str; 3] = [
    "[Request interrupted by user",
    "Interrupted by user",
    "\"interrupted\":true",
];

pub fn contains_interrupt(line: &str) -> bool {
    INTERRUPT_MARKERS.iter().any(|marker| line.contains(marker))
}

#[derive(Debug, Default)]
pub struct InterruptConsumer;

impl TailConsumer for InterruptConsumer {
    fn kind(&self) -> &'static str {
        "interrupts"
    }

    fn consume(&mut self, _tail: &mut TailState, read: TailRead) -> Option<Input> {
        match read {
            TailRead::Appended(lines) if lines.iter().any(|l| contains_interrupt(l)) => {
                Some(Input::Interrupted)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn markers() {
        assert!(contains_interrupt(
            r#"{"type":"user","message":{"content":"[Request interrupted by user for tool use]"}}"#
        ));
        assert!(contains_interrupt(r#"{"toolUseResult":{"interrupted":true}}"#));
        assert!(contains_interrupt("Interrupted by user"));
        assert!(!contains_interrupt(r#"{"toolUseResult":{"interrupted":false}}"#));
        assert!(!contains_interrupt(r#"{"type":"assistant","uuid":"a"}"#));
    }

    #[test]
    fn baseline_is_ignored_and_one_event_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "[Request interrupted by user]\n").unwrap();

        let mut tail = TailState::new(&path);
        let mut consumer = InterruptConsumer;
        let read = tail.read().unwrap();
        assert!(consumer.consume(&mut tail, read).is_none());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"a\":1}\n[Request interrupted by user]\nInterrupted by user\n")
            .unwrap();
        let read = tail.read().unwrap();
        assert_eq!(consumer.consume(&mut tail, read), Some(Input::Interrupted));

        file.write_all(b"{\"type\":\"assistant\"}\n").unwrap();
        let read = tail.read().unwrap();
        assert!(consumer.consume(&mut tail, read).is_none());
    }
}
