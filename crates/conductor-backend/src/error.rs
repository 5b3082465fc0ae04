//! Error kinds surfaced across the client-facing boundary.

use std::fmt;

use conductor_provider::ProviderError;
use conductor_sql::SqlError;

/// Mirrors the original's four-way error split: a client mistake carrying
/// an HTTP-style status code, a provider RPC failure, a database failure,
/// and admission overload.
#[derive(Debug)]
pub enum ConductorError {
    ClientError(u16, String),
    Provider(ProviderError),
    Sql(SqlError),
    Overload,
}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConductorError::ClientError(code, msg) => write!(f, "client error {code}: {msg}"),
            ConductorError::Provider(err) => write!(f, "{err}"),
            ConductorError::Sql(err) => write!(f, "{err}"),
            ConductorError::Overload => write!(f, "too busy"),
        }
    }
}

impl std::error::Error for ConductorError {}

impl From<ProviderError> for ConductorError {
    fn from(err: ProviderError) -> Self {
        ConductorError::Provider(err)
    }
}

impl From<SqlError> for ConductorError {
    fn from(err: SqlError) -> Self {
        ConductorError::Sql(err)
    }
}

impl ConductorError {
    /// HTTP status code this error should be reported as.
    pub fn status_code(&self) -> u16 {
        match self {
            ConductorError::ClientError(code, _) => *code,
            ConductorError::Provider(_) | ConductorError::Sql(_) => 500,
            ConductorError::Overload => 503,
        }
    }
}
