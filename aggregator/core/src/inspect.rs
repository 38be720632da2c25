use std::fmt;

/// Wire discriminant for on-demand inspection requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum RequestKind {
    Unknown = 0,
    ProxyConfig = 1,
    ServiceMetrics = 2,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => "unknown".fmt(f),
            Self::ProxyConfig => "proxy-config".fmt(f),
            Self::ServiceMetrics => "service-metrics".fmt(f),
        }
    }
}

/// One kind of on-demand inspection that can be pushed down a collector
/// stream: a typed request, a typed response, and the wire discriminant that
/// binds the two across the correlation boundary.
///
/// Response payloads are produced by collector-side parsers; the aggregator
/// routes them without interpreting their contents.
pub trait InspectKind: Send + Sync + 'static {
    const KIND: RequestKind;

    type Request: prost::Message;
    type Response: prost::Message + Default;
}
