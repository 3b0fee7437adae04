#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No device is routed from topic {0}")]
    NotFound(String),

    #[error("Topic {0} is assigned to more than one device")]
    DuplicateTopic(String),

    #[error("Device {0} is configured more than once")]
    DuplicateDevice(String),
}
