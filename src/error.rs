//! Error types for the natgate operator
//!
//! Variants follow the failure taxonomy the work queue acts on: transient
//! collaborator failures and appliance business errors are retried with
//! backoff, malformed input and contract violations are surfaced and dropped.

use thiserror::Error;

/// A single per-tenant entry from an AS3 `results[]` array
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TenantResult {
    /// Status code reported for this tenant
    #[serde(default)]
    pub code: Option<i64>,
    /// Tenant (partition) the result applies to
    #[serde(default)]
    pub tenant: Option<String>,
    /// Human readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Additional detail from the appliance
    #[serde(default)]
    pub response: Option<serde_json::Value>,
}

impl std::fmt::Display for TenantResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tenant={} code={} message={}",
            self.tenant.as_deref().unwrap_or("-"),
            self.code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            self.message.as_deref().unwrap_or("-"),
        )
    }
}

/// Errors raised while decrypting and checking a license token
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LicenseError {
    /// Token is not valid base64
    #[error("license token is not valid base64: {0}")]
    Decode(String),

    /// Key length does not select a supported AES variant
    #[error("license key must be 16 or 32 bytes, got {0}")]
    KeyLength(usize),

    /// Decryption or padding check failed (bad key or corrupt token)
    #[error("license token could not be decrypted")]
    Decrypt,

    /// Registration key missing from the appliance license report
    #[error("registration key not found in appliance license: {0}")]
    Registration(String),
}

/// Main error type for natgate operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cached read from a collaborator failed
    #[error("cache lookup failed for {kind} {key}: {message}")]
    Cache {
        /// Resource kind that was being read
        kind: String,
        /// namespace/name key
        key: String,
        /// Description of the failure
        message: String,
    },

    /// A service referenced by a rule has no endpoint addresses yet
    #[error("service {namespace}/{service} has no endpoint addresses")]
    EmptyEndpoints {
        /// Namespace of the service
        namespace: String,
        /// Service name
        service: String,
    },

    /// Object spec is invalid and will not sync until it changes
    #[error("validation error for {object}: {message}")]
    Validation {
        /// namespace/name of the offending object
        object: String,
        /// Description of what is invalid
        message: String,
    },

    /// The declarative endpoint rejected one or more tenants
    #[error("appliance rejected declaration with status {status}: {}", join_results(.results))]
    TenantRejected {
        /// HTTP status code
        status: u16,
        /// Per-tenant results reported by the appliance
        results: Vec<TenantResult>,
    },

    /// The appliance answered with a structured error code
    #[error("appliance responded with error code {code}: {message}")]
    ApplianceRejected {
        /// HTTP status code
        status: u16,
        /// `error.code` from the response
        code: String,
        /// `error.message` from the response, if any
        message: String,
    },

    /// Transport failure or unrecognised appliance response
    #[error("appliance request failed (status {}): {message}", .status.map(|s| s.to_string()).unwrap_or_else(|| "none".into()))]
    Appliance {
        /// HTTP status code if a response was received
        status: Option<u16>,
        /// Description of the failure
        message: String,
    },

    /// Object is being deleted but still governed by a rule
    #[error("{object} is pending: {message}")]
    Pending {
        /// namespace/name of the object
        object: String,
        /// What the object is waiting for
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Operator configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// License verification error
    #[error("license error: {0}")]
    License(#[from] LicenseError),
}

fn join_results(results: &[TenantResult]) -> String {
    if results.is_empty() {
        return "no tenant detail".to_string();
    }
    results
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a cache lookup error
    pub fn cache(kind: impl Into<String>, key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an empty endpoint set error
    pub fn empty_endpoints(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self::EmptyEndpoints {
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    /// Create a validation error for an object
    pub fn validation(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create an opaque appliance failure
    pub fn appliance(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Appliance {
            status,
            message: msg.into(),
        }
    }

    /// Create a pending-deletion error
    pub fn pending(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Pending {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the work item should be requeued with backoff
    ///
    /// Fatal errors (invalid specs, structured appliance rejections,
    /// serialization contract violations) are dropped and surfaced as events.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. }
            | Self::Cache { .. }
            | Self::EmptyEndpoints { .. }
            | Self::TenantRejected { .. }
            | Self::Appliance { .. }
            | Self::Pending { .. } => true,
            Self::Validation { .. }
            | Self::ApplianceRejected { .. }
            | Self::Serialization { .. }
            | Self::Config(_)
            | Self::License(_) => false,
        }
    }

    /// Short machine-readable reason used for Kubernetes events
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation { .. } => crate::events::reasons::INVALID_SPEC,
            Self::TenantRejected { .. } | Self::ApplianceRejected { .. } => {
                crate::events::reasons::APPLIANCE_REJECTED
            }
            _ => crate::events::reasons::SYNC_FAILED,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::appliance(e.status().map(|s| s.as_u16()), e.to_string())
    }
}
