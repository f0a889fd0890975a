use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {message}")]
    Database { message: String },
    #[error("substrate error: {message}")]
    Substrate { message: String },
    #[error("event log error: {message}")]
    EventLog { message: String },
    #[error("downstream circuit open: {service}")]
    CircuitOpen { service: &'static str },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn substrate(message: impl Into<String>) -> Self {
        Self::Substrate {
            message: message.into(),
        }
    }

    pub fn event_log(message: impl Into<String>) -> Self {
        Self::EventLog {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
