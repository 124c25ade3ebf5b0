//! Per-call request context and the factory that builds it
//!
//! The [`ContextFactory`] turns a tonic request plus its [`CallDescriptor`]
//! into a [`RequestContext`]: identifiers, caller identity, deadline, peer,
//! metadata and extension fields, with a [`CancellationToken`] bridged to
//! the transport.
//!
//! The context is passed explicitly to middleware and handlers; there is no
//! task-local "current context".
//!
//! ## Identifier precedence
//!
//! For both trace and request ids a configured generator wins, then the
//! incoming header, then the built-in generator:
//!
//! ```rust
//! use grpc_bridge::context::ContextFactory;
//! use grpc_bridge::descriptor::CallDescriptor;
//!
//! let factory = ContextFactory::new("grpc");
//! let mut request = tonic::Request::new(());
//! request.metadata_mut().insert("x-trace-id", "abc".parse().unwrap());
//!
//! let desc = CallDescriptor::unary("example.Greeter", "SayHello");
//! let ctx = factory.create_context(&request, &desc).unwrap();
//! assert_eq!(ctx.trace_id(), "abc");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancellation::{CallDeadline, CallSignals, CancelReason, CancellationBridge, CancellationToken};
use crate::descriptor::{CallDescriptor, CallType};
use crate::error::{Error, Result};
use crate::ids::{IdGenerator, PrefixedIdGenerator, SharedIdGenerator};
use crate::metadata::{HeaderNames, Metadata};

/// gRPC timeout header
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Value of an extension field on the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Text(String),
    /// List of strings
    List(Vec<String>),
    /// Arbitrary JSON
    Json(serde_json::Value),
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Integer(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(value: Vec<String>) -> Self {
        ContextValue::List(value)
    }
}

/// Everything known about one in-flight call
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    trace_id: String,
    request_id: String,
    user_id: Option<String>,
    correlation_id: Option<String>,
    #[serde(skip_serializing)]
    authorization: Option<String>,
    created_at: DateTime<Utc>,
    service_name: String,
    method_name: String,
    method_path: String,
    call_type: CallType,
    deadline: Option<DateTime<Utc>>,
    peer: String,
    metadata: Metadata,
    is_streaming: bool,
    extensions: BTreeMap<String, ContextValue>,
    #[serde(skip)]
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Trace identifier
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Request identifier
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Authenticated caller, if known
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Correlation id sent by the caller
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Raw authorization header
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// Bearer token from the authorization header
    pub fn bearer_token(&self) -> Option<&str> {
        self.authorization()
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    /// When the context was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Method name
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Full method path
    pub fn method_path(&self) -> &str {
        &self.method_path
    }

    /// Call shape
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Absolute deadline
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Time left before the deadline, zero once elapsed
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Incoming metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether either side of the call streams
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    /// Extension field contributed by the metadata transformer
    pub fn extension(&self, key: &str) -> Option<&ContextValue> {
        self.extensions.get(key)
    }

    /// All extension fields
    pub fn extensions(&self) -> &BTreeMap<String, ContextValue> {
        &self.extensions
    }

    /// Cancellation token of this call
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the call has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancel the call from application code
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancellation
            .cancel(CancelReason::Requested(reason.into()))
    }

    /// JSON snapshot of the context, suitable for logs and hooks
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Extracts a user id from incoming metadata
pub type UserIdExtractor = Arc<dyn Fn(&Metadata) -> Option<String> + Send + Sync>;

/// Derives extension fields from incoming metadata
pub type MetadataTransformer = Arc<dyn Fn(&Metadata) -> Vec<(String, ContextValue)> + Send + Sync>;

/// Invoked once a context has been created and bridged
pub type ContextHook = Arc<dyn Fn(&RequestContext) + Send + Sync>;

/// Builds request contexts from tonic requests
#[derive(Clone)]
pub struct ContextFactory {
    protocol: String,
    headers: HeaderNames,
    default_trace_ids: PrefixedIdGenerator,
    default_request_ids: PrefixedIdGenerator,
    trace_id_generator: Option<SharedIdGenerator>,
    request_id_generator: Option<SharedIdGenerator>,
    user_id_extractor: Option<UserIdExtractor>,
    metadata_transformer: Option<MetadataTransformer>,
    on_context_created: Option<ContextHook>,
}

impl ContextFactory {
    /// Factory for the given protocol tag (used as the trace id prefix)
    pub fn new(protocol: impl Into<String>) -> Self {
        let protocol = protocol.into();
        Self {
            default_trace_ids: PrefixedIdGenerator::new(protocol.clone()),
            default_request_ids: PrefixedIdGenerator::request(),
            protocol,
            headers: HeaderNames::default(),
            trace_id_generator: None,
            request_id_generator: None,
            user_id_extractor: None,
            metadata_transformer: None,
            on_context_created: None,
        }
    }

    /// Override the canonical header names
    pub fn with_headers(mut self, headers: HeaderNames) -> Self {
        self.headers = headers;
        self
    }

    /// Use a custom trace id generator
    pub fn with_trace_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.trace_id_generator = Some(Arc::new(generator));
        self
    }

    /// Use a custom request id generator
    pub fn with_request_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.request_id_generator = Some(Arc::new(generator));
        self
    }

    /// Use a custom user id extractor
    pub fn with_user_id_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Metadata) -> Option<String> + Send + Sync + 'static,
    {
        self.user_id_extractor = Some(Arc::new(extractor));
        self
    }

    /// Merge extension fields derived from metadata into every context
    pub fn with_metadata_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(&Metadata) -> Vec<(String, ContextValue)> + Send + Sync + 'static,
    {
        self.metadata_transformer = Some(Arc::new(transformer));
        self
    }

    /// Hook invoked after each context is created
    pub fn on_context_created<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestContext) + Send + Sync + 'static,
    {
        self.on_context_created = Some(Arc::new(hook));
        self
    }

    /// Protocol tag
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Header names in use
    pub fn headers(&self) -> &HeaderNames {
        &self.headers
    }

    /// Build the context for one call
    ///
    /// The context is returned with an active token; use
    /// [`run_with_context`](Self::run_with_context) to also bridge deadline
    /// and transport signals.
    pub fn create_context<T>(
        &self,
        request: &tonic::Request<T>,
        descriptor: &CallDescriptor,
    ) -> Result<RequestContext> {
        let metadata = Metadata::from_metadata_map(request.metadata());

        let trace_id = self.resolve_id(
            self.trace_id_generator.as_ref(),
            metadata.get_str(&self.headers.trace_id),
            &self.default_trace_ids,
        );
        let request_id = self.resolve_id(
            self.request_id_generator.as_ref(),
            metadata.get_str(&self.headers.request_id),
            &self.default_request_ids,
        );
        if trace_id.is_empty() || request_id.is_empty() {
            return Err(Error::Context(format!(
                "empty identifier generated for {}",
                descriptor.path
            )));
        }

        let user_id = match &self.user_id_extractor {
            Some(extract) => extract(&metadata),
            None => None,
        }
        .or_else(|| metadata.get_str(&self.headers.user_id).map(str::to_string));

        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let deadline = resolve_deadline(request.extensions().get::<CallDeadline>(), &metadata);

        let mut extensions = BTreeMap::new();
        if let Some(transform) = &self.metadata_transformer {
            for (key, value) in transform(&metadata) {
                extensions.insert(key, value);
            }
        }

        let call_type = CallType::from_descriptor(descriptor);

        Ok(RequestContext {
            correlation_id: metadata
                .get_str(&self.headers.correlation_id)
                .map(str::to_string),
            authorization: metadata
                .get_str(&self.headers.authorization)
                .map(str::to_string),
            trace_id,
            request_id,
            user_id,
            created_at: Utc::now(),
            service_name: descriptor.service_name.clone(),
            method_name: descriptor.method_name.clone(),
            method_path: descriptor.path.clone(),
            call_type,
            deadline,
            peer,
            metadata,
            is_streaming: call_type.is_streaming(),
            extensions,
            cancellation: CancellationToken::new(),
        })
    }

    /// Build the context for one call and bridge it to the deadline and to
    /// the transport signals found in the request extensions
    ///
    /// The bridge stays attached while the returned scope is alive. Must be
    /// called from within a tokio runtime.
    pub fn enter<T>(
        &self,
        request: &tonic::Request<T>,
        descriptor: &CallDescriptor,
    ) -> Result<ContextScope> {
        let context = Arc::new(self.create_context(request, descriptor)?);
        let signals = request.extensions().get::<CallSignals>();
        let bridge = CancellationBridge::attach(context.cancellation(), context.deadline(), signals);

        tracing::trace!(
            trace_id = %context.trace_id(),
            request_id = %context.request_id(),
            method = %context.method_path(),
            call_type = %context.call_type(),
            "request context established"
        );

        if let Some(hook) = &self.on_context_created {
            hook(&context);
        }

        Ok(ContextScope {
            context,
            _bridge: bridge,
        })
    }

    /// Run `f` inside a freshly built, bridged context
    ///
    /// The deadline timer and the transport listener live exactly as long as
    /// the returned future, whether `f` completes, fails or is dropped.
    pub async fn run_with_context<T, F, Fut, R>(
        &self,
        request: tonic::Request<T>,
        descriptor: &CallDescriptor,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(Arc<RequestContext>, tonic::Request<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let scope = self.enter(&request, descriptor)?;
        let context = scope.context().clone();
        let output = f(context, request).await;
        drop(scope);
        Ok(output)
    }

    fn resolve_id(
        &self,
        configured: Option<&SharedIdGenerator>,
        header: Option<&str>,
        fallback: &PrefixedIdGenerator,
    ) -> String {
        match (configured, header) {
            (Some(generator), _) => generator.generate(),
            (None, Some(value)) => value.to_string(),
            (None, None) => fallback.generate(),
        }
    }
}

impl Default for ContextFactory {
    fn default() -> Self {
        Self::new("grpc")
    }
}

impl fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFactory")
            .field("protocol", &self.protocol)
            .field("headers", &self.headers)
            .field("custom_trace_ids", &self.trace_id_generator.is_some())
            .field("custom_request_ids", &self.request_id_generator.is_some())
            .field("user_id_extractor", &self.user_id_extractor.is_some())
            .field("metadata_transformer", &self.metadata_transformer.is_some())
            .finish()
    }
}

/// A bridged request context
///
/// Dropping the scope detaches the deadline timer and transport listener;
/// the context itself stays valid for anyone still holding it.
pub struct ContextScope {
    context: Arc<RequestContext>,
    _bridge: CancellationBridge,
}

impl ContextScope {
    /// The context of the call
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("trace_id", &self.context.trace_id())
            .field("request_id", &self.context.request_id())
            .finish()
    }
}

fn resolve_deadline(explicit: Option<&CallDeadline>, metadata: &Metadata) -> Option<DateTime<Utc>> {
    if let Some(CallDeadline(deadline)) = explicit {
        return *deadline;
    }
    let timeout = metadata.get_str(GRPC_TIMEOUT_HEADER).and_then(parse_grpc_timeout)?;
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    Utc::now().checked_add_signed(timeout)
}

/// Parse a `grpc-timeout` header value (`<at most 8 digits><unit>`)
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
