//! Shared value types for captured HTTP exchanges and permission fault records.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CLIENT_IDENTIFIER_HEADER: &str = "User-Agent";

/// Column order of a [`FaultRecord`]; also the tabular header row.
pub const FAULT_RECORD_COLUMNS: [&str; 4] = [
    "ClientIdentifier",
    "ObjectType",
    "ObjectName",
    "MissingPrivilege",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

/// One completed request/response pair as delivered by the proxy host.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpExchange {
    pub request: HttpRequest,
    pub response: HttpResponse,
}

impl HttpExchange {
    pub fn status_code(&self) -> u16 {
        self.response.status_code
    }

    pub fn body(&self) -> &[u8] {
        &self.response.body
    }

    /// Client identifier from the given request header, empty when absent.
    pub fn client_identifier(&self, header: &str) -> String {
        self.request.header(header).unwrap_or_default().to_string()
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Fields pulled out of a `NoPermissionFault` detail element.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FaultFieldSet {
    pub object_type: String,
    pub object_name: String,
    pub missing_privilege: String,
}

impl FaultFieldSet {
    pub fn with_client(self, client_identifier: impl Into<String>) -> FaultRecord {
        FaultRecord {
            client_identifier: client_identifier.into(),
            object_type: self.object_type,
            object_name: self.object_name,
            missing_privilege: self.missing_privilege,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub struct FaultRecord {
    pub client_identifier: String,
    pub object_type: String,
    pub object_name: String,
    pub missing_privilege: String,
}

impl FaultRecord {
    /// Field values in [`FAULT_RECORD_COLUMNS`] order.
    pub fn fields(&self) -> [&str; 4] {
        [
            self.client_identifier.as_str(),
            self.object_type.as_str(),
            self.object_name.as_str(),
            self.missing_privilege.as_str(),
        ]
    }

    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey::from_record(self)
    }
}

/// Order-fixed encoding of a record used as the deduplication key.
///
/// Encoded as a JSON string array so that embedded separators cannot make
/// two distinct records collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn from_record(record: &FaultRecord) -> Self {
        let fields = record
            .fields()
            .iter()
            .map(|field| serde_json::Value::String(field.to_string()))
            .collect();
        Self(serde_json::Value::Array(fields).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
