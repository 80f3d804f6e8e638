//! Request-scoped context.
//!
//! A [`RequestContext`] is built once per inbound HTTP request or gRPC call by the
//! mode middleware, stored in the request extensions, and passed explicitly to every
//! store call. It is immutable after construction.

use crate::mode::OperationMode;
use axum::{extract::FromRequestParts, http::HeaderMap, http::request::Parts};
use std::{collections::HashSet, convert::Infallible};
use tonic::{metadata::MetadataValue, service::Interceptor};
use url::Url;

pub const OPERATION_MODE_HEADER: &str = "x-operation-mode";
pub const OPERATION_MODE_METADATA: &str = "x-operation-mode";
pub const DEBUG_HEADER: &str = "x-debug";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    operation_mode: OperationMode,
    debug: bool,
    request_id: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(operation_mode: OperationMode) -> Self {
        Self {
            operation_mode,
            debug: false,
            request_id: None,
        }
    }

    /// Context for work that does not originate from a request (CLI, workers).
    #[must_use]
    pub fn background(operation_mode: OperationMode) -> Self {
        Self::new(operation_mode)
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn operation_mode(&self) -> OperationMode {
        self.operation_mode
    }

    /// Whether per-request debug output (SQL, headers) is switched on.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Read the context stored by the mode middleware; absent means a test context.
    #[must_use]
    pub fn from_extensions(extensions: &http::Extensions) -> Self {
        extensions.get::<Self>().cloned().unwrap_or_default()
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_extensions(&parts.extensions))
    }
}

/// Decides the [`OperationMode`] of inbound HTTP requests.
///
/// Resolution order:
/// 1. a trusted `Origin` (or `Referer` origin) together with `X-Operation-Mode: live`;
/// 2. an API key (`Authorization: Bearer` or `X-API-Key`) prefixed `sk_live_` / `pk_live_`;
/// 3. otherwise `test`.
#[derive(Debug, Clone, Default)]
pub struct ModeResolver {
    trusted_origins: HashSet<String>,
}

impl ModeResolver {
    pub fn new<I, S>(trusted_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            trusted_origins: trusted_origins
                .into_iter()
                .filter_map(|origin| normalize_origin(origin.as_ref()))
                .collect(),
        }
    }

    #[must_use]
    pub fn resolve(&self, headers: &HeaderMap) -> OperationMode {
        if self.has_trusted_origin(headers) {
            let requested = header_str(headers, OPERATION_MODE_HEADER);
            if OperationMode::from_signal(requested).is_live() {
                return OperationMode::Live;
            }
        }

        api_key(headers).map_or(OperationMode::Test, OperationMode::from_api_key)
    }

    fn has_trusted_origin(&self, headers: &HeaderMap) -> bool {
        if self.trusted_origins.is_empty() {
            return false;
        }

        header_str(headers, http::header::ORIGIN.as_str())
            .or_else(|| header_str(headers, http::header::REFERER.as_str()))
            .and_then(normalize_origin)
            .is_some_and(|origin| self.trusted_origins.contains(&origin))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, http::header::AUTHORIZATION.as_str())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .or_else(|| header_str(headers, API_KEY_HEADER))
        .map(str::trim)
}

/// `scheme://host[:port]` of a URL, `None` for opaque or invalid values.
fn normalize_origin(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    let origin = url.origin();
    origin
        .is_tuple()
        .then(|| origin.ascii_serialization())
}

/// Read the operation mode from gRPC metadata; absent or unknown values mean test.
#[must_use]
pub fn mode_from_metadata(metadata: &tonic::metadata::MetadataMap) -> OperationMode {
    OperationMode::from_signal(
        metadata
            .get(OPERATION_MODE_METADATA)
            .and_then(|value| value.to_str().ok()),
    )
}

/// Outbound client interceptor copying the caller's mode into `x-operation-mode`.
///
/// A [`RequestContext`] placed in the outgoing request extensions wins over the
/// mode the interceptor was built with.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationModeInterceptor {
    fallback: OperationMode,
}

impl OperationModeInterceptor {
    #[must_use]
    pub fn new(fallback: OperationMode) -> Self {
        Self { fallback }
    }
}

impl From<&RequestContext> for OperationModeInterceptor {
    fn from(ctx: &RequestContext) -> Self {
        Self::new(ctx.operation_mode())
    }
}

impl Interceptor for OperationModeInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let mode = request
            .extensions()
            .get::<RequestContext>()
            .map_or(self.fallback, RequestContext::operation_mode);
        request.metadata_mut().insert(
            OPERATION_MODE_METADATA,
            MetadataValue::from_static(mode.as_str()),
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn resolver() -> ModeResolver {
        ModeResolver::new(["https://dashboard.example.com"])
    }

    #[test]
    fn no_signal_is_test() {
        assert_eq!(resolver().resolve(&HeaderMap::new()), OperationMode::Test);
    }

    #[test]
    fn trusted_origin_with_live_header_is_live() {
        let map = headers(&[
            ("origin", "https://dashboard.example.com"),
            ("x-operation-mode", "live"),
        ]);
        assert_eq!(resolver().resolve(&map), OperationMode::Live);
    }

    #[test]
    fn trusted_referer_counts_as_origin() {
        let map = headers(&[
            ("referer", "https://dashboard.example.com/payments?page=2"),
            ("x-operation-mode", "live"),
        ]);
        assert_eq!(resolver().resolve(&map), OperationMode::Live);
    }

    #[test]
    fn untrusted_origin_cannot_request_live() {
        let map = headers(&[
            ("origin", "https://evil.example.com"),
            ("x-operation-mode", "live"),
        ]);
        assert_eq!(resolver().resolve(&map), OperationMode::Test);
    }

    #[test]
    fn trusted_origin_without_header_is_test() {
        let map = headers(&[("origin", "https://dashboard.example.com")]);
        assert_eq!(resolver().resolve(&map), OperationMode::Test);
    }

    #[test]
    fn live_api_keys_select_live() {
        let bearer = headers(&[("authorization", "Bearer sk_live_123")]);
        assert_eq!(resolver().resolve(&bearer), OperationMode::Live);

        let header = headers(&[("x-api-key", "pk_live_123")]);
        assert_eq!(resolver().resolve(&header), OperationMode::Live);

        let test_key = headers(&[("authorization", "Bearer sk_test_123")]);
        assert_eq!(resolver().resolve(&test_key), OperationMode::Test);
    }

    #[test]
    fn live_header_without_origin_falls_back_to_key() {
        let map = headers(&[("x-operation-mode", "live"), ("x-api-key", "sk_test_1")]);
        assert_eq!(resolver().resolve(&map), OperationMode::Test);
    }

    #[test]
    fn context_defaults_to_test_when_missing() {
        let extensions = http::Extensions::new();
        let ctx = RequestContext::from_extensions(&extensions);
        assert_eq!(ctx.operation_mode(), OperationMode::Test);
        assert!(!ctx.debug());
    }

    #[test]
    fn metadata_mode_defaults_to_test() {
        let mut metadata = tonic::metadata::MetadataMap::new();
        assert_eq!(mode_from_metadata(&metadata), OperationMode::Test);
        metadata.insert(OPERATION_MODE_METADATA, MetadataValue::from_static("live"));
        assert_eq!(mode_from_metadata(&metadata), OperationMode::Live);
    }

    #[test]
    fn interceptor_copies_mode() -> Result<(), tonic::Status> {
        let mut interceptor = OperationModeInterceptor::new(OperationMode::Test);

        let mut request = tonic::Request::new(());
        request
            .extensions_mut()
            .insert(RequestContext::new(OperationMode::Live));
        let request = interceptor.call(request)?;
        assert_eq!(mode_from_metadata(request.metadata()), OperationMode::Live);

        let request = interceptor.call(tonic::Request::new(()))?;
        assert_eq!(mode_from_metadata(request.metadata()), OperationMode::Test);
        Ok(())
    }
}
