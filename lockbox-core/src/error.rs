//! Error taxonomy shared by the client engine and the CLI.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The service answered with data of an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("object is locked")]
    IsLocked,

    #[error("no such object")]
    NoSuchObject,

    #[error("object already exists")]
    AlreadyExists,

    #[error("attributes belong to schema {0}")]
    MismatchedSchema(String),

    #[error("no such attribute in schema: {0}")]
    NoMatchingAttribute(String),

    #[error("attribute has wrong type: {0}")]
    WrongType(String),

    #[error("attribute table must not be empty")]
    EmptyAttributeTable,

    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The bus could not be reached or the connection broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote error whose name has no domain mapping.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("prompt already used: {0}")]
    PromptReentered(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub const ERROR_IS_LOCKED: &str = "org.freedesktop.Secret.Error.IsLocked";
pub const ERROR_NO_SUCH_OBJECT: &str = "org.freedesktop.Secret.Error.NoSuchObject";
pub const ERROR_ALREADY_EXISTS: &str = "org.freedesktop.Secret.Error.AlreadyExists";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

impl Error {
    /// Map a symbolic remote error name onto the taxonomy.  Unknown names are
    /// kept verbatim in [`Error::Remote`].
    pub fn from_remote(name: &str, message: impl Into<String>) -> Self {
        match name {
            ERROR_IS_LOCKED => Self::IsLocked,
            ERROR_NO_SUCH_OBJECT | ERROR_UNKNOWN_METHOD | ERROR_UNKNOWN_OBJECT => {
                Self::NoSuchObject
            }
            ERROR_ALREADY_EXISTS => Self::AlreadyExists,
            _ => Self::Remote {
                name: name.to_string(),
                message: message.into(),
            },
        }
    }

    /// Validation failures raised locally, before any remote call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MismatchedSchema(_)
                | Self::NoMatchingAttribute(_)
                | Self::WrongType(_)
                | Self::EmptyAttributeTable
        )
    }
}
