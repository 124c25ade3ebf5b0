//! Call descriptors and call-shape classification

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Static description of one remote method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Fully qualified service name (e.g. `example.v1.Greeter`)
    pub service_name: String,
    /// Method name (e.g. `SayHello`)
    pub method_name: String,
    /// Full method path (e.g. `/example.v1.Greeter/SayHello`)
    pub path: String,
    /// Client sends a stream of messages
    pub request_stream: bool,
    /// Server sends a stream of messages
    pub response_stream: bool,
}

impl CallDescriptor {
    /// Describe a unary method of `service`
    pub fn unary(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(service, method, false, false)
    }

    /// Describe a method with explicit stream flags
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        request_stream: bool,
        response_stream: bool,
    ) -> Self {
        let service_name = service.into();
        let method_name = method.into();
        let path = format!("/{}/{}", service_name, method_name);
        Self {
            service_name,
            method_name,
            path,
            request_stream,
            response_stream,
        }
    }

    /// Synthesize a unary descriptor for a method that was never registered
    pub fn synthesize(service: &str, method: &str) -> Self {
        Self::unary(service, method)
    }

    /// Parse a descriptor from a `/package.Service/Method` path
    pub fn from_path(path: &str, request_stream: bool, response_stream: bool) -> Result<Self> {
        let trimmed = path.trim_start_matches('/');
        let mut parts = trimmed.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(service), Some(method))
                if !service.is_empty() && !method.is_empty() && !method.contains('/') =>
            {
                Ok(Self::new(service, method, request_stream, response_stream))
            }
            _ => Err(Error::InvalidDescriptor(format!(
                "expected /Service/Method, got '{}'",
                path
            ))),
        }
    }

    /// Mark the request side as streaming
    pub fn with_request_stream(mut self) -> Self {
        self.request_stream = true;
        self
    }

    /// Mark the response side as streaming
    pub fn with_response_stream(mut self) -> Self {
        self.response_stream = true;
        self
    }

    /// Shape of the call
    pub fn call_type(&self) -> CallType {
        CallType::from_descriptor(self)
    }

    /// Short service name without the package (`Greeter` for `example.v1.Greeter`)
    pub fn short_service_name(&self) -> &str {
        self.service_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.service_name)
    }
}

/// Shape of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallType {
    /// Single request, single response
    Unary,
    /// Single request, response stream
    ServerStreaming,
    /// Request stream, single response
    ClientStreaming,
    /// Streams in both directions
    Bidirectional,
}

impl CallType {
    /// Classify from the descriptor's stream flags
    pub fn from_descriptor(descriptor: &CallDescriptor) -> Self {
        Self::from_flags(descriptor.request_stream, descriptor.response_stream)
    }

    /// Classify from raw stream flags
    pub fn from_flags(request_stream: bool, response_stream: bool) -> Self {
        match (request_stream, response_stream) {
            (true, true) => CallType::Bidirectional,
            (true, false) => CallType::ClientStreaming,
            (false, true) => CallType::ServerStreaming,
            (false, false) => CallType::Unary,
        }
    }

    /// Whether either side streams
    pub fn is_streaming(self) -> bool {
        self != CallType::Unary
    }

    /// Whether the response side streams
    pub fn streams_response(self) -> bool {
        matches!(self, CallType::ServerStreaming | CallType::Bidirectional)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallType::Unary => "unary",
            CallType::ServerStreaming => "server-streaming",
            CallType::ClientStreaming => "client-streaming",
            CallType::Bidirectional => "bidirectional",
        };
        f.write_str(s)
    }
}
