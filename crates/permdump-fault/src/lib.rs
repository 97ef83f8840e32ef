//! vSphere `NoPermissionFault` detection and field extraction.
//!
//! Detection is a cheap yes/no check used to filter every proxied response;
//! extraction runs only on responses that were classified as faults. Both
//! tolerate arbitrary bodies: anything that is not a well-formed SOAP fault
//! resolves to "no fault" / "absent" rather than an error.

pub mod charset;
pub mod soap;

use permdump_protocol::FaultFieldSet;
use roxmltree::Document;
use thiserror::Error;

use crate::charset::decode_body;
use crate::soap::{permission_fault, permission_fault_child};

pub const SUCCESS_STATUS: u16 = 200;

#[derive(Debug, Error)]
pub enum FaultError {
    #[error("body is not valid utf-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("body is not valid {0}")]
    Undecodable(&'static str),
    #[error("unsupported xml encoding {0:?}")]
    UnknownEncoding(String),
    #[error("body is not well-formed xml: {0}")]
    Malformed(#[from] roxmltree::Error),
    #[error("no NoPermissionFault detail element")]
    NoPermissionFaultMissing,
    #[error("NoPermissionFault has no object element")]
    ObjectMissing,
    #[error("NoPermissionFault has no privilegeId element")]
    PrivilegeMissing,
}

pub type FaultResult<T> = Result<T, FaultError>;


/// Returns true when a non-success response carries a `NoPermissionFault`.
///
/// Responses with status 200 are never inspected.
pub fn is_permission_fault(status_code: u16, body: &[u8]) -> bool {
    if status_code == SUCCESS_STATUS {
        return false;
    }
    body_has_permission_fault(body)
}

/// Status-independent half of [`is_permission_fault`].
pub fn body_has_permission_fault(body: &[u8]) -> bool {
    let Ok(text) = decode_body(body) else {
        return false;
    };
    match Document::parse(&text) {
        Ok(doc) => permission_fault(&doc).is_some(),
        Err(_) => false,
    }
}

/// Extracts object type, object name and missing privilege from a
/// `NoPermissionFault` body, or `None` when any piece is missing.
pub fn extract_fields(body: &[u8]) -> Option<FaultFieldSet> {
    try_extract_fields(body).ok()
}

/// Like [`extract_fields`], with the reason when nothing can be extracted.
///
/// When several `NoPermissionFault` elements are present, `object` and
/// `privilegeId` are each taken from the first fault that carries one.
pub fn try_extract_fields(body: &[u8]) -> FaultResult<FaultFieldSet> {
    let text = decode_body(body)?;
    let doc = Document::parse(&text)?;
    if permission_fault(&doc).is_none() {
        return Err(FaultError::NoPermissionFaultMissing);
    }
    let object = permission_fault_child(&doc, "object").ok_or(FaultError::ObjectMissing)?;
    let privilege =
        permission_fault_child(&doc, "privilegeId").ok_or(FaultError::PrivilegeMissing)?;

    Ok(FaultFieldSet {
        object_type: object.attribute("type").unwrap_or_default().to_string(),
        object_name: object.text().unwrap_or_default().to_string(),
        missing_privilege: privilege.text().unwrap_or_default().to_string(),
    })
}
