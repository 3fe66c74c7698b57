//! Fault Sequence grammar and fault-list loading.
//!
//! A fault sequence is a short string over the alphabet `{x, w, X, W}`:
//! lowercase letters are non-terminal outcomes, a single uppercase letter
//! terminates the sequence and is returned for every access beyond it. Once
//! the terminal is reached it is sticky — the sequence never resets.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// The result of one access against a sector governed by a [`FaultSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The access should fail (the disk "drops" the sector write).
    Fail,
    /// The access should proceed normally.
    Pass,
}

/// Stateful per-(path, offset) fault generator.
///
/// Constructed once from a grammar string via [`FaultSequence::new`], then
/// cloned for each sector the sequence governs — [`FaultSequence`] derives
/// [`Clone`], which copies both the sequence bytes and the current cursor,
/// giving each sector its own independent copy of the state machine.
#[derive(Debug, Clone)]
pub struct FaultSequence {
    chars: Vec<u8>,
    /// Index of the last character, i.e. the terminal.
    end_idx: usize,
    term: u8,
    /// -1 before the first call to `next`.
    idx: i64,
}

impl FaultSequence {
    /// Parses and validates a fault sequence string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFaultSequence`] if the string is empty,
    /// contains characters outside `{x,w,X,W}`, has more than one uppercase
    /// character, or does not end in an uppercase character.
    pub fn new(seq: &str) -> Result<Self> {
        let chars: Vec<u8> = seq.bytes().collect();
        if chars.is_empty() {
            return Err(Error::InvalidFaultSequence {
                seq: seq.to_owned(),
                reason: "sequence must not be empty",
            });
        }
        if !chars
            .iter()
            .all(|&c| matches!(c, b'x' | b'w' | b'X' | b'W'))
        {
            return Err(Error::InvalidFaultSequence {
                seq: seq.to_owned(),
                reason: "sequence must only contain the characters x, w, X, W",
            });
        }
        let uppercase_count = chars.iter().filter(|c| c.is_ascii_uppercase()).count();
        if uppercase_count != 1 {
            return Err(Error::InvalidFaultSequence {
                seq: seq.to_owned(),
                reason: "sequence must contain exactly one uppercase (terminal) character",
            });
        }
        if !chars[chars.len() - 1].is_ascii_uppercase() {
            return Err(Error::InvalidFaultSequence {
                seq: seq.to_owned(),
                reason: "the terminal character must be the last character in the sequence",
            });
        }
        let end_idx = chars.len() - 1;
        let term = chars[end_idx].to_ascii_lowercase();
        Ok(Self {
            chars,
            end_idx,
            term,
            idx: -1,
        })
    }

    /// Advances the sequence and returns the outcome for this access.
    pub fn next(&mut self) -> FaultOutcome {
        self.idx += 1;
        #[allow(clippy::cast_sign_loss)]
        let c = if self.idx as usize >= self.end_idx {
            self.term
        } else {
            self.chars[self.idx as usize]
        };
        match c {
            b'x' => FaultOutcome::Fail,
            b'w' => FaultOutcome::Pass,
            _ => unreachable!("new() guarantees every character is x, w, or their uppercase form"),
        }
    }
}

/// One entry from a fault-list document: a fault sequence installed on a
/// single block or sector of a given logical path.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultSpec {
    /// Logical path (relative to the mount root) the fault applies to.
    pub path: String,
    /// The fault sequence grammar string.
    pub seq: String,
    /// Block index, mutually exclusive with `sector`.
    pub block: Option<u64>,
    /// Sector index, mutually exclusive with `block`.
    pub sector: Option<u64>,
}

impl FaultSpec {
    /// Validates that exactly one of `block`/`sector` is set, returning the
    /// index and whether it addresses a whole block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFaultSpec`] if both or neither are set.
    pub fn target(&self) -> Result<(u64, bool)> {
        match (self.block, self.sector) {
            (Some(b), None) => Ok((b, true)),
            (None, Some(s)) => Ok((s, false)),
            _ => Err(Error::InvalidFaultSpec {
                path: self.path.clone(),
                reason: "exactly one of `block` or `sector` must be set",
            }),
        }
    }
}

/// Loads a fault-list document: a JSON array of [`FaultSpec`] entries.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read, or [`Error::Json`] if
/// it is not a valid JSON array of fault-list entries.
pub fn load_fault_list(path: &Path) -> Result<Vec<FaultSpec>> {
    let text = std::fs::read_to_string(path)?;
    let specs: Vec<FaultSpec> = serde_json::from_str(&text)?;
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_sequence() {
        assert!(matches!(
            FaultSequence::new(""),
            Err(Error::InvalidFaultSequence { .. })
        ));
    }

    #[test]
    fn rejects_bad_alphabet() {
        assert!(matches!(
            FaultSequence::new("xyZ"),
            Err(Error::InvalidFaultSequence { .. })
        ));
    }

    #[test]
    fn rejects_multiple_uppercase() {
        assert!(matches!(
            FaultSequence::new("XW"),
            Err(Error::InvalidFaultSequence { .. })
        ));
    }

    #[test]
    fn rejects_terminal_not_last() {
        assert!(matches!(
            FaultSequence::new("Xw"),
            Err(Error::InvalidFaultSequence { .. })
        ));
    }

    #[test]
    fn single_fail_then_pass_forever() {
        let mut seq = FaultSequence::new("xW").unwrap();
        assert_eq!(seq.next(), FaultOutcome::Fail);
        for _ in 0..10 {
            assert_eq!(seq.next(), FaultOutcome::Pass);
        }
    }

    #[test]
    fn always_fails() {
        let mut seq = FaultSequence::new("X").unwrap();
        for _ in 0..5 {
            assert_eq!(seq.next(), FaultOutcome::Fail);
        }
    }

    #[test]
    fn pre_terminal_prefix_then_sticky_terminal() {
        let mut seq = FaultSequence::new("xxwxW").unwrap();
        assert_eq!(seq.next(), FaultOutcome::Fail);
        assert_eq!(seq.next(), FaultOutcome::Fail);
        assert_eq!(seq.next(), FaultOutcome::Pass);
        assert_eq!(seq.next(), FaultOutcome::Fail);
        for _ in 0..5 {
            assert_eq!(seq.next(), FaultOutcome::Pass);
        }
    }

    #[test]
    fn clone_carries_independent_cursor() {
        let mut a = FaultSequence::new("xW").unwrap();
        assert_eq!(a.next(), FaultOutcome::Fail);
        let mut b = a.clone();
        assert_eq!(a.next(), FaultOutcome::Pass);
        assert_eq!(b.next(), FaultOutcome::Pass);
        // b was cloned after a's first call, so it never sees the Fail again.
        assert_eq!(b.next(), FaultOutcome::Pass);
    }

    #[test]
    fn fault_spec_requires_exactly_one_target() {
        let both = FaultSpec {
            path: "/a".into(),
            seq: "X".into(),
            block: Some(0),
            sector: Some(0),
        };
        assert!(both.target().is_err());

        let neither = FaultSpec {
            path: "/a".into(),
            seq: "X".into(),
            block: None,
            sector: None,
        };
        assert!(neither.target().is_err());

        let block_only = FaultSpec {
            path: "/a".into(),
            seq: "X".into(),
            block: Some(3),
            sector: None,
        };
        assert_eq!(block_only.target().unwrap(), (3, true));
    }
}
