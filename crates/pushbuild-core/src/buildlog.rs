//! Append-only record of the commands a build ran.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;

use crate::Result;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Combined stdout and stderr.
    pub output: String,
    /// Wall-clock time the command took.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Process exit code. `None` when killed by a signal.
    pub exit_status: Option<i32>,
}

impl BuildLogEntry {
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildLog {
    entries: Vec<BuildLogEntry>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BuildLogEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[BuildLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to gzip-compressed JSON.
    ///
    /// The gzip header carries no timestamp, so identical logs encode to
    /// identical bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Inverse of [`BuildLog::encode`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut json = Vec::new();
        GzDecoder::new(data).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cmd: &str, exit: Option<i32>) -> BuildLogEntry {
        BuildLogEntry {
            command: cmd.split(' ').map(String::from).collect(),
            output: format!("output of {}", cmd),
            duration: Duration::from_millis(1500),
            exit_status: exit,
        }
    }

    #[test]
    fn test_append_and_clear() {
        let mut log = BuildLog::new();
        log.push(entry("hg update -C -r abc", Some(0)));
        log.push(entry("make -f client.mk", Some(2)));
        assert_eq!(log.len(), 2);
        assert!(log.entries()[0].succeeded());
        assert!(!log.entries()[1].succeeded());

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut log = BuildLog::new();
        log.push(entry("hg pull", Some(0)));

        let first = log.encode().unwrap();
        let second = log.clone().encode().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_restores_entries() {
        let mut log = BuildLog::new();
        log.push(entry("make", None));

        let decoded = BuildLog::decode(&log.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries()[0].command, vec!["make"]);
        assert_eq!(decoded.entries()[0].exit_status, None);
        assert_eq!(decoded.entries()[0].duration, Duration::from_millis(1500));
    }
}
