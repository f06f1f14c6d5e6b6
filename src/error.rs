use bytes::Bytes;
use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS entropy source failed. Tokens are never generated from a
    /// weaker source instead; the request fails with a 500.
    #[error("system entropy source unavailable")]
    EntropyUnavailable,
    /// An expected extension was missing.
    #[error("couldn't extract `{0}`. is `CsrfProtect` layered?")]
    ExtensionNotFound(&'static str),
    /// The token cookie couldn't be found.
    #[error("couldn't get token cookie")]
    NoCookie,
    /// The request body could not be read up to its declared length.
    #[error("failed to read request body")]
    BodyRead(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Logs `err` and resolves the request with a synthetic 500. The
    /// response carries the [`Rejected`](crate::guard::Rejected) marker so
    /// the response phase leaves it untouched.
    pub(crate) fn make_layer_error<T: From<Bytes>, E>(
        err: impl std::error::Error,
    ) -> Result<http::Response<T>, E> {
        tracing::error!(err = %err);

        let mut response = http::Response::new(T::from(Bytes::new()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response.extensions_mut().insert(crate::guard::Rejected);

        Ok(response)
    }
}
