//! The control-channel command set: a tiny JSON protocol a test harness
//! drives over the HTTP control port, independent of the FUSE mount.

use serde_json::{json, Value};

use crate::facade::Facade;

/// A decoded control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clears every installed fault sequence, the `allow-all-writes`
    /// command — used by a test once it is done provoking a failure, so
    /// cleanup writes (like removing a test's scratch files) do not
    /// themselves hit an induced fault.
    AllowAllWrites,
    /// Logs `message` at info level, so a test can correlate its own
    /// timeline with the mount's log output.
    InsertLogEntry {
        /// The message to log.
        message: String,
    },
    /// Drops every clean page from the Page Cache, forcing the next read to
    /// re-materialize from the Block Manager.
    EvictCleanPages,
    /// Runs the Fsync Policy Engine against every resident inode, as if each
    /// had been fsynced, without any caller-owned fd.
    Checkpoint,
}

impl Command {
    /// Parses a [`Command`] out of a JSON value shaped like
    /// `{"cmd": "insert-log-entry", "msg": "..."}`.
    ///
    /// # Errors
    ///
    /// Returns a diagnostic string if `"cmd"` is missing, not a string, not
    /// recognized, or a required argument for that command is missing.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let cmd = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing \"cmd\" field".to_string())?;

        match cmd {
            "allow-all-writes" => Ok(Self::AllowAllWrites),
            "evict-clean-pages" => Ok(Self::EvictCleanPages),
            "checkpoint" => Ok(Self::Checkpoint),
            "insert-log-entry" => {
                let message = value
                    .get("msg")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "\"insert-log-entry\" requires a \"msg\" field".to_string())?
                    .to_string();
                Ok(Self::InsertLogEntry { message })
            }
            other => Err(format!("unrecognized command {other:?}")),
        }
    }
}

/// Parses and applies a control-channel command against `facade`, returning
/// the JSON response body.
pub(crate) fn dispatch(facade: &mut Facade, value: &Value) -> Value {
    let parsed = Command::parse(value);
    log::info!("control channel command received: {value}");
    match parsed {
        Ok(Command::AllowAllWrites) => {
            facade.clear_all_faults();
            json!({"success": true})
        }
        Ok(Command::InsertLogEntry { message }) => {
            log::info!("control channel: {message}");
            json!({"success": true})
        }
        Ok(Command::EvictCleanPages) => {
            facade.evict_clean_pages();
            json!({"success": true})
        }
        Ok(Command::Checkpoint) => {
            facade.fs_checkpoint();
            json!({"success": true})
        }
        Err(reason) => json!({"success": false, "error": reason}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_command() {
        assert_eq!(
            Command::parse(&json!({"cmd": "allow-all-writes"})),
            Ok(Command::AllowAllWrites)
        );
        assert_eq!(
            Command::parse(&json!({"cmd": "evict-clean-pages"})),
            Ok(Command::EvictCleanPages)
        );
        assert_eq!(
            Command::parse(&json!({"cmd": "checkpoint"})),
            Ok(Command::Checkpoint)
        );
        assert_eq!(
            Command::parse(&json!({"cmd": "insert-log-entry", "msg": "hello"})),
            Ok(Command::InsertLogEntry {
                message: "hello".to_string()
            })
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_commands() {
        assert!(Command::parse(&json!({"cmd": "reboot"})).is_err());
        assert!(Command::parse(&json!({})).is_err());
        assert!(Command::parse(&json!({"cmd": "insert-log-entry"})).is_err());
    }

    #[test]
    fn dispatch_runs_allow_all_writes_against_a_facade() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let metadir = dir.path().join("meta");
        std::fs::create_dir_all(&root).unwrap();
        let specs = vec![crate::fault::FaultSpec {
            path: "/a".into(),
            seq: "X".into(),
            block: Some(0),
            sector: None,
        }];
        let mut facade =
            Facade::new(&root, &metadir, crate::FsyncKind::Ext4Ordered, &specs).unwrap();

        let response = dispatch(&mut facade, &json!({"cmd": "allow-all-writes"}));
        assert_eq!(response["success"], true);
    }
}
