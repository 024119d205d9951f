//! Protocol switch for interactive jobs.
//!
//! A client asks for an interactive session by sending the attach media type
//! in `Accept` together with `Connection: upgrade` and
//! `Upgrade: jobgate-attach`. Once the job's attach is confirmed the server
//! answers `101 Switching Protocols` and the connection becomes a raw duplex
//! byte stream wired to the job.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use crate::dispatch::AttachedJob;
use crate::error::{ControllerError, Result};
use crate::proxy::proxy;

/// Media type that marks a run request as interactive.
pub const ATTACH_MEDIA_TYPE: &str = "application/vnd.jobgate.attach";

/// Protocol token used in the `Upgrade` header.
pub const ATTACH_PROTOCOL: &str = "jobgate-attach";

/// The connection's upgrade handle, if it has one.
///
/// Requests without `Connection: upgrade`, and requests that did not arrive
/// over a live HTTP/1 connection, have none.
pub struct AttachUpgrade(Option<OnUpgrade>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AttachUpgrade
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let requested = header_has_token(&parts.headers, header::CONNECTION, "upgrade");
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();
        Ok(AttachUpgrade(on_upgrade.filter(|_| requested)))
    }
}

impl AttachUpgrade {
    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }

    /// Answer `101` and bridge the upgraded connection to `job` in the
    /// background. The host lease is released when the session ends.
    pub fn switch(self, job: AttachedJob) -> Result<Response> {
        let on_upgrade = self.0.ok_or(ControllerError::UpgradeRequired)?;
        let AttachedJob { id, stream, host } = job;

        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Connection upgrade failed");
                    return;
                }
            };
            tracing::debug!(job_id = %id, "Attach session started");

            let stats = proxy(TokioIo::new(upgraded), stream).await;
            tracing::info!(
                job_id = %id,
                bytes_to_job = stats.to_job,
                bytes_to_client = stats.to_client,
                "Attach session ended"
            );
            drop(host);
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, ATTACH_PROTOCOL)
            .header(header::CONTENT_TYPE, ATTACH_MEDIA_TYPE)
            .body(Body::empty())
            .map_err(|e| ControllerError::Internal(e.to_string()))
    }
}

/// Whether `Accept` lists `media_type`, ignoring parameters.
pub fn accepts(headers: &HeaderMap, media_type: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|item| item.split(';').next())
        .any(|item| item.trim().eq_ignore_ascii_case(media_type))
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_matches_listed_media_type() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, application/vnd.jobgate.attach;q=0.9"),
        );
        assert!(accepts(&headers, ATTACH_MEDIA_TYPE));
        assert!(accepts(&headers, "application/json"));
        assert!(!accepts(&headers, "text/event-stream"));
    }

    #[test]
    fn accepts_without_header_is_false() {
        assert!(!accepts(&HeaderMap::new(), ATTACH_MEDIA_TYPE));
    }

    #[test]
    fn connection_tokens_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(header_has_token(&headers, header::CONNECTION, "upgrade"));
        assert!(!header_has_token(&headers, header::CONNECTION, "close"));
    }

    #[tokio::test]
    async fn extractor_without_upgrade_handle_is_unavailable() {
        let (mut parts, _) = axum::http::Request::builder()
            .header(header::CONNECTION, "upgrade")
            .body(())
            .unwrap()
            .into_parts();
        let upgrade = AttachUpgrade::from_request_parts(&mut parts, &()).await.unwrap();
        assert!(!upgrade.is_available());
    }
}
