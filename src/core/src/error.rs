use std::fmt;

use thiserror::Error;

/// Phase of configuration resolution that failed.
///
/// Phases are surfaced verbatim in error output so an operator can tell a
/// syntax problem (`load`, `build`) from a schema or cross-reference problem
/// (`constrain`, `convert`, `validate`, `decode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPhase {
    Load,
    Build,
    Constrain,
    Convert,
    Validate,
    Decode,
}

impl fmt::Display for ConfigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigPhase::Load => "load",
            ConfigPhase::Build => "build",
            ConfigPhase::Constrain => "constrain",
            ConfigPhase::Convert => "convert",
            ConfigPhase::Validate => "validate",
            ConfigPhase::Decode => "decode",
        };
        f.write_str(s)
    }
}

/// Image store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOp {
    Fetch,
    Metadata,
}

impl fmt::Display for ImageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageOp::Fetch => "fetch",
            ImageOp::Metadata => "metadata",
        })
    }
}

/// Unit file lifecycle operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOp {
    Render,
    Write,
    Link,
    Enable,
    Disable,
}

impl fmt::Display for UnitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitOp::Render => "render",
            UnitOp::Write => "write",
            UnitOp::Link => "link",
            UnitOp::Enable => "enable",
            UnitOp::Disable => "disable",
        })
    }
}

/// Service-manager RPC that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    List,
    Start,
    Stop,
    Reload,
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuntimeOp::List => "list",
            RuntimeOp::Start => "start",
            RuntimeOp::Stop => "stop",
            RuntimeOp::Reload => "reload",
        })
    }
}

/// Sloop error kinds, namespaced the way they are printed to the operator.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration problem in one of the resolution phases.
    #[error("[config.{phase}] {message}")]
    Config {
        phase: ConfigPhase,
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Subnet exhausted or bridge prefix invalid.
    #[error("[ip] {0}")]
    Ip(String),

    /// Image transport, unpack, or config.json parse failure.
    #[error("[image.{op}] {message}")]
    Image { op: ImageOp, message: String },

    /// mkdir/write/remove failure on the state directory.
    #[error("[filesystem] {message}")]
    Filesystem {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Unit file lifecycle failure.
    #[error("[unit.{op}] {message}")]
    Unit { op: UnitOp, message: String },

    /// Service-manager RPC failure, including non-`done` job completions.
    #[error("[runtime.{op}] {message}")]
    Runtime { op: RuntimeOp, message: String },
}

impl Error {
    pub fn config(phase: ConfigPhase, message: impl Into<String>) -> Self {
        Error::Config {
            phase,
            message: message.into(),
            cause: None,
        }
    }

    pub fn config_with(
        phase: ConfigPhase,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Config {
            phase,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn ip(message: impl Into<String>) -> Self {
        Error::Ip(message.into())
    }

    pub fn image(op: ImageOp, message: impl Into<String>) -> Self {
        Error::Image {
            op,
            message: message.into(),
        }
    }

    pub fn filesystem(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Filesystem {
            message: message.into(),
            source,
        }
    }

    pub fn unit(op: UnitOp, message: impl Into<String>) -> Self {
        Error::Unit {
            op,
            message: message.into(),
        }
    }

    pub fn runtime(op: RuntimeOp, message: impl Into<String>) -> Self {
        Error::Runtime {
            op,
            message: message.into(),
        }
    }

    /// Whether this is a configuration error (any phase).
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }
}

/// Result type alias for sloop operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_is_namespaced() {
        let err = Error::config(ConfigPhase::Constrain, "services.web: missing image");
        assert_eq!(
            err.to_string(),
            "[config.constrain] services.web: missing image"
        );
    }

    #[test]
    fn test_config_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::NotFound, "no such dir");
        let err = Error::config_with(ConfigPhase::Load, "cannot read config root", cause);
        let source = std::error::Error::source(&err).expect("cause present");
        assert!(source.to_string().contains("no such dir"));
    }

    #[test]
    fn test_runtime_error_display() {
        let err = Error::runtime(RuntimeOp::Start, "cannot start unit web.service");
        assert_eq!(
            err.to_string(),
            "[runtime.start] cannot start unit web.service"
        );
    }

    #[test]
    fn test_all_config_phases_render() {
        let phases = [
            (ConfigPhase::Load, "load"),
            (ConfigPhase::Build, "build"),
            (ConfigPhase::Constrain, "constrain"),
            (ConfigPhase::Convert, "convert"),
            (ConfigPhase::Validate, "validate"),
            (ConfigPhase::Decode, "decode"),
        ];
        for (phase, expected) in phases {
            assert_eq!(phase.to_string(), expected);
        }
    }
}
