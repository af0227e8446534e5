//! Span attribute keys and event names written by the instrumentation.

pub const HTTP_METHOD: &str = "http.method";
pub const HTTP_URL: &str = "http.url";
/// Path and query of the request URL.
pub const HTTP_TARGET: &str = "http.target";
/// `host:port`, with the scheme's default port filled in.
pub const HTTP_HOST: &str = "http.host";
pub const NET_PEER_NAME: &str = "net.peer.name";

pub const HTTP_STATUS_CODE: &str = "http.status_code";
pub const HTTP_STATUS_TEXT: &str = "http.status_text";
/// Body size on the wire, when a non-identity `content-encoding` applies.
pub const HTTP_RESPONSE_CONTENT_LENGTH: &str = "http.response_content_length";
pub const HTTP_RESPONSE_CONTENT_LENGTH_UNCOMPRESSED: &str =
    "http.response_content_length_uncompressed";

pub const HTTP_ERROR_NAME: &str = "http.error_name";
pub const HTTP_ERROR_MESSAGE: &str = "http.error_message";

pub const EXCEPTION_EVENT: &str = "exception";
pub const EXCEPTION_MESSAGE: &str = "exception.message";
pub const EXCEPTION_TYPE: &str = "exception.type";
pub const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";

pub const CORS_PREFLIGHT_SPAN: &str = "CORS Preflight";

// Resource timing phase events, in the order they occur.
pub const FETCH_START: &str = "fetchStart";
pub const DOMAIN_LOOKUP_START: &str = "domainLookupStart";
pub const DOMAIN_LOOKUP_END: &str = "domainLookupEnd";
pub const CONNECT_START: &str = "connectStart";
pub const SECURE_CONNECTION_START: &str = "secureConnectionStart";
pub const CONNECT_END: &str = "connectEnd";
pub const REQUEST_START: &str = "requestStart";
pub const RESPONSE_START: &str = "responseStart";
pub const RESPONSE_END: &str = "responseEnd";
