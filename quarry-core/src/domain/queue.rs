//! Queue descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a logical queue namespace
///
/// Immutable after construction; backends interpret the fields as they need:
/// Pub/Sub reads the project and credentials, the file backend treats the
/// management identifier as its root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDesc {
    project: String,
    management: String,
    credentials: String,
}

impl QueueDesc {
    pub fn new(
        project: impl Into<String>,
        management: impl Into<String>,
        credentials: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            management: management.into(),
            credentials: credentials.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn management(&self) -> &str {
        &self.management
    }

    pub fn credentials(&self) -> &str {
        &self.credentials
    }
}

/// Backend technology tag carried on every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    PubSub,
    File,
    Memory,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::PubSub => "pubsub",
            QueueType::File => "file",
            QueueType::Memory => "memory",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pubsub" | "gcp" => Ok(QueueType::PubSub),
            "file" | "dir" => Ok(QueueType::File),
            "memory" | "mem" => Ok(QueueType::Memory),
            other => Err(format!("unknown queue type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_type_parse() {
        assert_eq!("pubsub".parse::<QueueType>(), Ok(QueueType::PubSub));
        assert_eq!(" File ".parse::<QueueType>(), Ok(QueueType::File));
        assert_eq!("mem".parse::<QueueType>(), Ok(QueueType::Memory));
        assert!("sqs".parse::<QueueType>().is_err());
    }

    #[test]
    fn test_queue_type_display_round_trips() {
        for kind in [QueueType::PubSub, QueueType::File, QueueType::Memory] {
            assert_eq!(kind.to_string().parse::<QueueType>(), Ok(kind));
        }
    }
}
