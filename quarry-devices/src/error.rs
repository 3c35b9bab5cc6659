//! Device telemetry errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised while reading accelerator telemetry
///
/// `Clone` so a failed driver initialization can be stored once and handed
/// back on every later query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The driver library could not be loaded or initialized
    #[error("device driver unavailable: {message}")]
    Init { message: String },

    #[error("failed to count devices: {message}")]
    Count { message: String },

    /// Reading one field of one device failed
    #[error("failed to read {field} of device {index}{}: {message}", uuid_suffix(.uuid))]
    Query {
        index: u32,
        uuid: Option<String>,
        field: &'static str,
        message: String,
    },
}

fn uuid_suffix(uuid: &Option<String>) -> String {
    match uuid {
        Some(uuid) => format!(" ({})", uuid),
        None => String::new(),
    }
}

impl DeviceError {
    pub fn query(
        index: u32,
        uuid: Option<&str>,
        field: &'static str,
        message: impl ToString,
    ) -> Self {
        Self::Query {
            index,
            uuid: uuid.map(str::to_string),
            field,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_message_includes_identity() {
        let err = DeviceError::query(1, Some("GPU-abc"), "temperature", "not supported");
        assert_eq!(
            err.to_string(),
            "failed to read temperature of device 1 (GPU-abc): not supported"
        );

        let err = DeviceError::query(0, None, "uuid", "lost");
        assert_eq!(err.to_string(), "failed to read uuid of device 0: lost");
    }
}
