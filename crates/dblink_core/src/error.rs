use backtrace::Backtrace;
use thiserror::Error;

/// Structured payload carried by every [`DbError`] variant.
///
/// The `code` is a 12-hex-character identifier of the construction site.
/// It is constant per site (not per instance) so log lines can be grepped
/// back to the exact place an error class originates from. Two errors
/// compare equal when their codes match.
#[derive(Debug)]
pub struct ErrorDetail {
    code: &'static str,
    message: String,
    backtrace: Option<String>,
    cause: Option<Box<DbError>>,
}

impl ErrorDetail {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        debug_assert!(
            code.len() == 12 && code.bytes().all(|b| b.is_ascii_hexdigit()),
            "site code must be 12 hex characters"
        );

        Self {
            code,
            message: message.into(),
            backtrace: capture_backtrace(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: DbError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Rendered call-stack snapshot, when capture was enabled.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    pub fn cause(&self) -> Option<&DbError> {
        self.cause.as_deref()
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Snapshots are expensive, so they are only taken when the process opted
/// in through `RUST_BACKTRACE`.
fn capture_backtrace() -> Option<String> {
    match std::env::var("RUST_BACKTRACE") {
        Ok(v) if v != "0" => Some(format!("{:?}", Backtrace::new())),
        _ => None,
    }
}

/// Database operation errors.
///
/// Every fallible operation in the workspace returns this type. Variants
/// follow the failure taxonomy of the library surface: URL dispatch,
/// connection lifecycle, statements, results/cursors, documents,
/// transactions, pooling, and resource handling.
#[derive(Debug, Error)]
pub enum DbError {
    /// No registered driver accepts the URL.
    #[error("no suitable driver found: {0}")]
    UnknownUrl(ErrorDetail),

    /// URL matched a driver but its tail does not parse.
    #[error("malformed URL: {0}")]
    MalformedUrl(ErrorDetail),

    /// Operation attempted on a closed connection, or on a child whose
    /// connection has been closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(ErrorDetail),

    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectFailed(ErrorDetail),

    /// Parameter index outside 1..=placeholder-count.
    #[error("invalid parameter index: {0}")]
    InvalidParameterIndex(ErrorDetail),

    /// Parameter could not be bound to the engine statement.
    #[error("bind failed: {0}")]
    BindFailed(ErrorDetail),

    /// Statement or query execution failed.
    #[error("{0}")]
    ExecuteFailed(ErrorDetail),

    /// Column name not present in the result.
    #[error("column not found: {0}")]
    ColumnNotFound(ErrorDetail),

    /// Value exists but cannot be produced as the requested type.
    #[error("type mismatch: {0}")]
    TypeMismatch(ErrorDetail),

    /// Row access before the first `next()` or after exhaustion.
    #[error("cursor position: {0}")]
    CursorPosition(ErrorDetail),

    /// Forward-only cursors cannot rewind.
    #[error("rewind not supported: {0}")]
    RewindUnsupported(ErrorDetail),

    /// Cursor modifier applied after iteration started.
    #[error("cursor already iterating: {0}")]
    ModifyAfterIteration(ErrorDetail),

    /// Document field path did not resolve.
    #[error("field not found: {0}")]
    FieldNotFound(ErrorDetail),

    /// Setting a dotted field path is not implemented.
    #[error("nested set not supported: {0}")]
    NestedSetUnsupported(ErrorDetail),

    /// Filter/update/options text is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(ErrorDetail),

    /// Transaction id not present in the active map.
    #[error("transaction not found: {0}")]
    TransactionNotFound(ErrorDetail),

    /// Engine rejected a commit.
    #[error("commit failed: {0}")]
    CommitFailed(ErrorDetail),

    /// Engine rejected a rollback.
    #[error("rollback failed: {0}")]
    RollbackFailed(ErrorDetail),

    /// Borrow attempted on a closed pool.
    #[error("pool closed: {0}")]
    PoolClosed(ErrorDetail),

    /// Borrow wait exceeded `max_wait_millis`.
    #[error("borrow timeout: {0}")]
    BorrowTimeout(ErrorDetail),

    /// Connection failed its validation query.
    #[error("validation failed: {0}")]
    ValidationFailed(ErrorDetail),

    /// Pool could not create a physical connection.
    #[error("connection creation failed: {0}")]
    CreationFailed(ErrorDetail),

    /// Read attempted into an empty destination where data was required.
    #[error("null buffer: {0}")]
    NullBuffer(ErrorDetail),

    /// Engine support not compiled into this build.
    #[error("feature disabled: {0}")]
    FeatureDisabled(ErrorDetail),
}

macro_rules! ctor {
    ($fn_name:ident, $variant:ident) => {
        pub fn $fn_name(code: &'static str, message: impl Into<String>) -> Self {
            Self::$variant(ErrorDetail::new(code, message))
        }
    };
}

impl DbError {
    ctor!(unknown_url, UnknownUrl);
    ctor!(malformed_url, MalformedUrl);
    ctor!(connection_closed, ConnectionClosed);
    ctor!(connect_failed, ConnectFailed);
    ctor!(invalid_parameter_index, InvalidParameterIndex);
    ctor!(bind_failed, BindFailed);
    ctor!(execute_failed, ExecuteFailed);
    ctor!(column_not_found, ColumnNotFound);
    ctor!(type_mismatch, TypeMismatch);
    ctor!(cursor_position, CursorPosition);
    ctor!(rewind_unsupported, RewindUnsupported);
    ctor!(modify_after_iteration, ModifyAfterIteration);
    ctor!(field_not_found, FieldNotFound);
    ctor!(nested_set_unsupported, NestedSetUnsupported);
    ctor!(invalid_json, InvalidJson);
    ctor!(transaction_not_found, TransactionNotFound);
    ctor!(commit_failed, CommitFailed);
    ctor!(rollback_failed, RollbackFailed);
    ctor!(pool_closed, PoolClosed);
    ctor!(borrow_timeout, BorrowTimeout);
    ctor!(validation_failed, ValidationFailed);
    ctor!(creation_failed, CreationFailed);
    ctor!(null_buffer, NullBuffer);
    ctor!(feature_disabled, FeatureDisabled);

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            Self::UnknownUrl(d)
            | Self::MalformedUrl(d)
            | Self::ConnectionClosed(d)
            | Self::ConnectFailed(d)
            | Self::InvalidParameterIndex(d)
            | Self::BindFailed(d)
            | Self::ExecuteFailed(d)
            | Self::ColumnNotFound(d)
            | Self::TypeMismatch(d)
            | Self::CursorPosition(d)
            | Self::RewindUnsupported(d)
            | Self::ModifyAfterIteration(d)
            | Self::FieldNotFound(d)
            | Self::NestedSetUnsupported(d)
            | Self::InvalidJson(d)
            | Self::TransactionNotFound(d)
            | Self::CommitFailed(d)
            | Self::RollbackFailed(d)
            | Self::PoolClosed(d)
            | Self::BorrowTimeout(d)
            | Self::ValidationFailed(d)
            | Self::CreationFailed(d)
            | Self::NullBuffer(d)
            | Self::FeatureDisabled(d) => d,
        }
    }

    pub fn code(&self) -> &'static str {
        self.detail().code()
    }

    pub fn cause(&self) -> Option<&DbError> {
        self.detail().cause()
    }

    /// Equality by construction site.
    pub fn same_site(&self, other: &DbError) -> bool {
        self.code() == other.code()
    }

    /// Attach an underlying error without losing the outer site.
    pub fn with_cause(self, cause: DbError) -> Self {
        fn attach(detail: ErrorDetail, cause: DbError) -> ErrorDetail {
            detail.with_cause(cause)
        }

        match self {
            Self::UnknownUrl(d) => Self::UnknownUrl(attach(d, cause)),
            Self::MalformedUrl(d) => Self::MalformedUrl(attach(d, cause)),
            Self::ConnectionClosed(d) => Self::ConnectionClosed(attach(d, cause)),
            Self::ConnectFailed(d) => Self::ConnectFailed(attach(d, cause)),
            Self::InvalidParameterIndex(d) => Self::InvalidParameterIndex(attach(d, cause)),
            Self::BindFailed(d) => Self::BindFailed(attach(d, cause)),
            Self::ExecuteFailed(d) => Self::ExecuteFailed(attach(d, cause)),
            Self::ColumnNotFound(d) => Self::ColumnNotFound(attach(d, cause)),
            Self::TypeMismatch(d) => Self::TypeMismatch(attach(d, cause)),
            Self::CursorPosition(d) => Self::CursorPosition(attach(d, cause)),
            Self::RewindUnsupported(d) => Self::RewindUnsupported(attach(d, cause)),
            Self::ModifyAfterIteration(d) => Self::ModifyAfterIteration(attach(d, cause)),
            Self::FieldNotFound(d) => Self::FieldNotFound(attach(d, cause)),
            Self::NestedSetUnsupported(d) => Self::NestedSetUnsupported(attach(d, cause)),
            Self::InvalidJson(d) => Self::InvalidJson(attach(d, cause)),
            Self::TransactionNotFound(d) => Self::TransactionNotFound(attach(d, cause)),
            Self::CommitFailed(d) => Self::CommitFailed(attach(d, cause)),
            Self::RollbackFailed(d) => Self::RollbackFailed(attach(d, cause)),
            Self::PoolClosed(d) => Self::PoolClosed(attach(d, cause)),
            Self::BorrowTimeout(d) => Self::BorrowTimeout(attach(d, cause)),
            Self::ValidationFailed(d) => Self::ValidationFailed(attach(d, cause)),
            Self::CreationFailed(d) => Self::CreationFailed(attach(d, cause)),
            Self::NullBuffer(d) => Self::NullBuffer(attach(d, cause)),
            Self::FeatureDisabled(d) => Self::FeatureDisabled(attach(d, cause)),
        }
    }
}
