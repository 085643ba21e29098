use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required external tool or toolchain is absent.
    MissingTool,
    /// A required input file or directory is absent.
    MissingInput,
    InvalidConfig,
    /// An external command exited non-zero or could not be spawned.
    ToolFailed,
    /// An expected field was absent from a tool's output.
    Parse,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn missing_tool<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MissingTool, msg)
    }

    pub fn missing_input<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MissingInput, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::InvalidConfig, msg)
    }

    pub fn tool_failed<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ToolFailed, msg)
    }

    pub fn parse<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Parse, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Keeps the kind while prefixing context, e.g. the task or variant that failed.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
