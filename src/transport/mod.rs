mod http;

pub use http::{HttpTransport, HttpTransportConfig, DEFAULT_TIMEOUT};
