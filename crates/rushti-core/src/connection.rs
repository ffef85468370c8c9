use serde::{Deserialize, Serialize};

/// Per-instance connection record from the connection descriptor file
/// (spec §6). `password` is base64-at-rest, decoded on load — this is
/// obfuscation, not encryption, matching the source's actual guarantee
/// (`rushti.py::decrypt_password` is a plain base64 decode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub address: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub session_context: Option<String>,
}

/// Decodes a base64-at-rest password. Named to avoid implying real
/// cryptographic protection.
pub fn decode_password_at_rest(encoded: &str) -> Result<String, base64::DecodeError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
