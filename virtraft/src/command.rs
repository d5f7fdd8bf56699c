//! Scripted command stream.
//!
//! Words are assembled one byte at a time: `entry`, `perid<d>`, `recv<d>`, `drop<d>`,
//! `part<d>` and `togglmem<d>`, where `<d>` is a single digit naming a replica slot.
//! Whitespace between words is skipped, `\0` ends the stream.

use std::io::{BufReader, Bytes, Read};

use crate::{Result, SimError};

/// One scripted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// One fuzz tick
    Tick,
    /// Timed tick of one replica by the fixed period
    Periodic(usize),
    /// Propose a client entry, then drain one replica's inbox
    Receive(usize),
    /// Propose a client entry, then discard the head of one replica's inbox
    Drop(usize),
    /// Flip one replica's partition flag
    Partition(usize),
    ToggleMembership(usize),
}

impl Command {
    /// Replica slot the command names, if any.
    pub fn slot(&self) -> Option<usize> {
        match *self {
            Self::Tick => None,
            Self::Periodic(slot)
            | Self::Receive(slot)
            | Self::Drop(slot)
            | Self::Partition(slot)
            | Self::ToggleMembership(slot) => Some(slot),
        }
    }
}

const WORDS: [&[u8]; 6] = [b"entry", b"perid", b"recv", b"drop", b"part", b"togglmem"];

fn with_slot(word: &[u8], slot: usize) -> Option<Command> {
    match word {
        b"perid" => Some(Command::Periodic(slot)),
        b"recv" => Some(Command::Receive(slot)),
        b"drop" => Some(Command::Drop(slot)),
        b"part" => Some(Command::Partition(slot)),
        b"togglmem" => Some(Command::ToggleMembership(slot)),
        _ => None,
    }
}

/// Result of feeding one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Need more bytes
    Pending,
    Command(Command),
    /// Sentinel seen
    End,
}

/// Byte-at-a-time word recognizer.
#[derive(Debug, Default)]
pub struct CommandParser {
    word: Vec<u8>,
    awaiting_slot: bool,
    offset: usize,
}

impl CommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, byte: u8) -> Result<Feed> {
        let offset = self.offset;
        self.offset += 1;
        let malformed = || SimError::MalformedCommand { offset, byte };

        if self.awaiting_slot {
            if !byte.is_ascii_digit() {
                return Err(malformed());
            }
            let command = with_slot(&self.word, usize::from(byte - b'0')).ok_or_else(malformed)?;
            self.word.clear();
            self.awaiting_slot = false;
            return Ok(Feed::Command(command));
        }

        if byte == 0 || byte.is_ascii_whitespace() {
            if !self.word.is_empty() {
                return Err(malformed());
            }
            return Ok(if byte == 0 { Feed::End } else { Feed::Pending });
        }

        self.word.push(byte);
        if self.word == b"entry" {
            self.word.clear();
            return Ok(Feed::Command(Command::Tick));
        }
        if with_slot(&self.word, 0).is_some() {
            self.awaiting_slot = true;
            return Ok(Feed::Pending);
        }
        if WORDS.iter().any(|word| word.starts_with(&self.word)) {
            Ok(Feed::Pending)
        } else {
            Err(malformed())
        }
    }

    /// Whether the parser sits between words.
    pub fn is_idle(&self) -> bool {
        self.word.is_empty()
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Iterator of commands read from a byte source.
///
/// Stops after the sentinel, at end of input, or after the first error.
pub struct CommandReader<R: Read> {
    bytes: Bytes<BufReader<R>>,
    parser: CommandParser,
    done: bool,
}

impl<R: Read> CommandReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            bytes: BufReader::new(reader).bytes(),
            parser: CommandParser::new(),
            done: false,
        }
    }

    fn next_command(&mut self) -> Result<Option<Command>> {
        loop {
            let Some(byte) = self.bytes.next().transpose()? else {
                if self.parser.is_idle() {
                    return Ok(None);
                }
                // a word cut off by end of input
                return Err(SimError::MalformedCommand {
                    offset: self.parser.offset(),
                    byte: 0,
                });
            };

            match self.parser.feed(byte)? {
                Feed::Pending => continue,
                Feed::Command(command) => return Ok(Some(command)),
                Feed::End => return Ok(None),
            }
        }
    }
}

impl<R: Read> Iterator for CommandReader<R> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_command().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}
