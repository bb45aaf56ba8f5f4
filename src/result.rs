//! LDAP result codes and the error type carried by operations
//!
//! Every operation ends with exactly one [`ResultCode`] on the wire. Handler code
//! and the filter evaluator signal failures by returning an [`LdapError`], which
//! pairs a code from the closed set below with an optional diagnostic message.

use std::fmt;

use thiserror::Error;
use tracing::error;

use crate::error::AppError;

/// LDAP Result Codes (RFC 4511 Appendix A)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    InappropriateMatching = 18,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    AliasProblem = 33,
    InvalidDnSyntax = 34,
    AliasDereferencingProblem = 36,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    LoopDetect = 54,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    ObjectClassModsProhibited = 69,
    AffectsMultipleDsas = 71,
    /// RFC 4511 `other`; the catch-all for failures outside this set.
    ServerError = 80,
}

const ALL_CODES: [ResultCode; 39] = [
    ResultCode::Success,
    ResultCode::OperationsError,
    ResultCode::ProtocolError,
    ResultCode::TimeLimitExceeded,
    ResultCode::SizeLimitExceeded,
    ResultCode::CompareFalse,
    ResultCode::CompareTrue,
    ResultCode::AuthMethodNotSupported,
    ResultCode::StrongerAuthRequired,
    ResultCode::Referral,
    ResultCode::AdminLimitExceeded,
    ResultCode::UnavailableCriticalExtension,
    ResultCode::ConfidentialityRequired,
    ResultCode::SaslBindInProgress,
    ResultCode::NoSuchAttribute,
    ResultCode::UndefinedAttributeType,
    ResultCode::InappropriateMatching,
    ResultCode::ConstraintViolation,
    ResultCode::AttributeOrValueExists,
    ResultCode::InvalidAttributeSyntax,
    ResultCode::NoSuchObject,
    ResultCode::AliasProblem,
    ResultCode::InvalidDnSyntax,
    ResultCode::AliasDereferencingProblem,
    ResultCode::InappropriateAuthentication,
    ResultCode::InvalidCredentials,
    ResultCode::InsufficientAccessRights,
    ResultCode::Busy,
    ResultCode::Unavailable,
    ResultCode::UnwillingToPerform,
    ResultCode::LoopDetect,
    ResultCode::NamingViolation,
    ResultCode::ObjectClassViolation,
    ResultCode::NotAllowedOnNonLeaf,
    ResultCode::NotAllowedOnRdn,
    ResultCode::EntryAlreadyExists,
    ResultCode::ObjectClassModsProhibited,
    ResultCode::AffectsMultipleDsas,
    ResultCode::ServerError,
];

impl ResultCode {
    /// Numeric value sent in the `resultCode` ENUMERATED
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Maps a numeric code back into the closed set
    pub fn from_code(code: u8) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.code() == code)
    }

    /// RFC 4511 name of the code
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::StrongerAuthRequired => "strongerAuthRequired",
            ResultCode::Referral => "referral",
            ResultCode::AdminLimitExceeded => "adminLimitExceeded",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::ConfidentialityRequired => "confidentialityRequired",
            ResultCode::SaslBindInProgress => "saslBindInProgress",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::InappropriateMatching => "inappropriateMatching",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::AliasProblem => "aliasProblem",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::AliasDereferencingProblem => "aliasDereferencingProblem",
            ResultCode::InappropriateAuthentication => "inappropriateAuthentication",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::LoopDetect => "loopDetect",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::ObjectClassModsProhibited => "objectClassModsProhibited",
            ResultCode::AffectsMultipleDsas => "affectsMultipleDSAs",
            ResultCode::ServerError => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// An operation outcome other than success, raised by handlers or the filter evaluator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}{}", .message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct LdapError {
    code: ResultCode,
    message: Option<String>,
}

impl LdapError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    /// Diagnostic message sent to the client, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn operations_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::OperationsError, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ProtocolError, message)
    }

    pub fn unwilling_to_perform(message: impl Into<String>) -> Self {
        Self::new(ResultCode::UnwillingToPerform, message)
    }

    pub fn invalid_credentials() -> Self {
        ResultCode::InvalidCredentials.into()
    }

    pub fn no_such_object(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NoSuchObject, message)
    }

    /// Generic failure with no diagnostic text
    pub fn server_error() -> Self {
        ResultCode::ServerError.into()
    }

    /// Logs an internal failure and hides its detail behind `ServerError`
    pub fn internal(err: impl fmt::Display) -> Self {
        error!("Internal failure mapped to server error: {}", err);
        Self::server_error()
    }
}

impl From<ResultCode> for LdapError {
    fn from(code: ResultCode) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

impl From<AppError> for LdapError {
    fn from(err: AppError) -> Self {
        Self::internal(err)
    }
}

impl From<anyhow::Error> for LdapError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}
