//! Pool error types and user-facing message translation.

use thiserror::Error;

use browserpool_cdp::CdpError;

/// Errors raised inside the session pool.
///
/// Nothing in this enum crosses the controller boundary raw: public
/// operations fold failures into a [`crate::session::StartResult`] with a
/// sanitized message, or reject with a single summarized error.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queued session request waited past the admission timeout.
    #[error("Timeout na fila de sessões")]
    QueueTimeout,

    /// No usable browser executable was found.
    #[error(
        "Nenhum executável de navegador foi encontrado. Defina CHROME_PATH ou instale um navegador compatível."
    )]
    ExecutableNotFound,

    /// Browser process or context failed to start.
    #[error("{0}")]
    Launch(String),

    /// The account has no stored platform credentials.
    #[error("Credenciais da modelo não encontradas.")]
    MissingCredentials,

    /// Account is unknown to the store.
    #[error("Modelo não encontrada para validação.")]
    AccountNotFound(i64),

    /// The platform redirected to its login page and recovery failed.
    #[error("Sessão expirada. Peça ao administrador para fazer login novamente.")]
    SessionExpired,

    /// CDP-level failure.
    #[error(transparent)]
    Cdp(#[from] CdpError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PoolError {
    /// Sanitized, user-facing message for this error.
    ///
    /// Internal detail stays in the server logs; callers across the pool
    /// boundary only ever see these strings.
    pub fn user_message(&self) -> String {
        match self {
            PoolError::Cdp(e) => translate_launch_error(&e.to_string()).to_string(),
            PoolError::Launch(msg) => msg.clone(),
            PoolError::Io(_) => "Erro temporário. Por favor, tente novamente.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Map a raw browser/network error string to a user-facing message.
pub(crate) fn translate_launch_error(raw: &str) -> &'static str {
    if raw.contains("ERR_CONNECTION_FAILED") || raw.contains("Connection failed") {
        "Erro de conexão. Verifique sua internet."
    } else if raw.contains("ERR_NAME_NOT_RESOLVED") {
        "Site não encontrado. Tente novamente."
    } else if raw.contains("Timeout") || raw.contains("timed out") {
        "Tempo limite excedido. Tente novamente."
    } else if raw.contains("Failed to launch") || raw.contains("launch") {
        "Erro ao abrir navegador. Sistema tentará outra opção."
    } else {
        "Erro temporário. Por favor, tente novamente."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_connection_errors() {
        assert_eq!(
            translate_launch_error("net::ERR_CONNECTION_FAILED at https://..."),
            "Erro de conexão. Verifique sua internet."
        );
        assert_eq!(
            translate_launch_error("net::ERR_NAME_NOT_RESOLVED"),
            "Site não encontrado. Tente novamente."
        );
        assert_eq!(
            translate_launch_error("Request Page.navigate timed out"),
            "Tempo limite excedido. Tente novamente."
        );
        assert_eq!(
            translate_launch_error("something unexpected"),
            "Erro temporário. Por favor, tente novamente."
        );
    }

    #[test]
    fn test_queue_timeout_message() {
        let err = PoolError::QueueTimeout;
        assert_eq!(err.user_message(), "Timeout na fila de sessões");
    }

    #[test]
    fn test_expired_message_mentions_admin() {
        let err = PoolError::SessionExpired;
        assert!(err.user_message().contains("expirada"));
        assert!(err.user_message().contains("administrador"));
    }
}
