//! Connection protocol messages: request, signed response, problem report, and the DID document they carry.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::envelope::{new_id, MessageError, Thread};
use crate::identity::Verkey;
use crate::invitation::is_routable;
use crate::message::ProtocolMessage;
use crate::wallet::{Wallet, WalletError};

const DID_CONTEXT: &str = "https://w3id.org/did/v1";
const KEY_TYPE: &str = "Ed25519VerificationKey2018";
const AUTH_TYPE: &str = "Ed25519SignatureAuthentication2018";
const SERVICE_TYPE: &str = "IndyAgent";
const SIGNATURE_TYPE: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/signature/1.0/ed25519Sha512_single";

/// Request rejected as malformed.
pub const REQUEST_NOT_ACCEPTED: &str = "request_not_accepted";
/// Request was well-formed but could not be processed.
pub const REQUEST_PROCESSING_ERROR: &str = "request_processing_error";
/// Response rejected as malformed or forged.
pub const RESPONSE_NOT_ACCEPTED: &str = "response_not_accepted";
/// Response was well-formed but could not be processed.
pub const RESPONSE_PROCESSING_ERROR: &str = "response_processing_error";

/// Extra field of the signed connection: SHA-256 of the request thread id, base64url.
pub const THREAD_COMMITMENT: &str = "thread~sha256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase58")]
    pub public_key_base58: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "routingKeys", default)]
    pub routing_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDoc {
    #[serde(rename = "@context", default)]
    pub context: String,
    pub id: String,
    #[serde(rename = "publicKey", default)]
    pub public_key: Vec<PublicKey>,
    #[serde(default)]
    pub authentication: Vec<Authentication>,
    #[serde(default)]
    pub service: Vec<Service>,
}

/// Where and how to reach the owner of a DID document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub recipient_keys: Vec<Verkey>,
    pub routing_keys: Vec<String>,
    pub endpoint: String,
}

impl DidDoc {
    pub fn new(did: &str, verkey: &Verkey, endpoint: &str, routing_keys: Vec<String>) -> Self {
        let key_id = format!("{did}#1");
        Self {
            context: DID_CONTEXT.to_string(),
            id: did.to_string(),
            public_key: vec![PublicKey {
                id: key_id.clone(),
                key_type: KEY_TYPE.to_string(),
                controller: did.to_string(),
                public_key_base58: verkey.to_base58(),
            }],
            authentication: vec![Authentication {
                auth_type: AUTH_TYPE.to_string(),
                public_key: key_id,
            }],
            service: vec![Service {
                id: format!("{did};indy"),
                service_type: SERVICE_TYPE.to_string(),
                priority: 0,
                recipient_keys: vec![verkey.to_base58()],
                routing_keys,
                service_endpoint: endpoint.to_string(),
            }],
        }
    }

    /// Highest-priority agent service, with `#` key references resolved.
    pub fn extract_service(&self) -> Result<ServiceInfo, MessageError> {
        let service = self
            .service
            .iter()
            .filter(|s| s.service_type == SERVICE_TYPE || self.service.len() == 1)
            .min_by_key(|s| s.priority)
            .ok_or_else(|| invalid("service", "no agent service"))?;
        let recipient_keys = service
            .recipient_keys
            .iter()
            .map(|key| self.resolve_key(key))
            .collect::<Result<Vec<_>, _>>()?;
        if recipient_keys.is_empty() {
            return Err(invalid("recipientKeys", "empty"));
        }
        if !is_routable(&service.service_endpoint) {
            return Err(invalid("serviceEndpoint", "not routable"));
        }
        Ok(ServiceInfo {
            recipient_keys,
            routing_keys: service.routing_keys.clone(),
            endpoint: service.service_endpoint.clone(),
        })
    }

    fn resolve_key(&self, reference: &str) -> Result<Verkey, MessageError> {
        let raw = if reference.contains('#') {
            self.public_key
                .iter()
                .find(|k| k.id == reference)
                .map(|k| k.public_key_base58.as_str())
                .ok_or_else(|| invalid("recipientKeys", "dangling key reference"))?
        } else {
            reference
        };
        raw.parse()
            .map_err(|_| invalid("recipientKeys", "not a verkey"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDoc,
}

impl Connection {
    pub fn new(did: &str, verkey: &Verkey, endpoint: &str, routing_keys: Vec<String>) -> Self {
        Self {
            did: did.to_string(),
            did_doc: DidDoc::new(did, verkey, endpoint, routing_keys),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnRequest {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub connection: Connection,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl ConnRequest {
    pub fn new(label: impl Into<String>, connection: Connection) -> Self {
        Self {
            msg_type: Self::default_type(),
            id: new_id(),
            label: label.into(),
            connection,
            thread: None,
        }
    }

    /// Structural checks; returns the requester's reachable service.
    pub fn validate(&self) -> Result<ServiceInfo, MessageError> {
        if self.connection.did.is_empty() {
            return Err(invalid("connection.DID", "empty"));
        }
        if !self.connection.did_doc.id.is_empty()
            && !self.connection.did_doc.id.ends_with(&self.connection.did)
        {
            return Err(invalid("connection.DIDDoc.id", "does not match DID"));
        }
        self.connection.did_doc.extract_service()
    }
}

impl ProtocolMessage for ConnRequest {
    const PROTOCOL: &'static str = "connections";
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "request";

    fn id(&self) -> &str {
        &self.id
    }

    fn thread(&self) -> Option<&Thread> {
        self.thread.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSignature {
    #[serde(rename = "@type")]
    pub sig_type: String,
    pub signature: String,
    pub sig_data: String,
    pub signer: Verkey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnResponse {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default = "new_id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(rename = "connection~sig")]
    pub connection_sig: ConnectionSignature,
}

impl ConnResponse {
    /// Sign `connection` with `signer`, bound to the request thread `request_thid`.
    ///
    /// `sig_data` is an 8-byte big-endian timestamp followed by the JSON
    /// connection. The connection object also carries [`THREAD_COMMITMENT`],
    /// the SHA-256 of the request thread id; readers that only know the plain
    /// connection fields skip it.
    pub async fn sign(
        wallet: &dyn Wallet,
        signer: &Verkey,
        request_thid: &str,
        connection: &Connection,
    ) -> Result<Self, WalletError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut signed = serde_json::to_value(connection)?;
        if let Value::Object(fields) = &mut signed {
            fields.insert(
                THREAD_COMMITMENT.to_string(),
                Value::String(URL_SAFE_NO_PAD.encode(thread_commitment(request_thid))),
            );
        }
        let mut sig_data = timestamp.to_be_bytes().to_vec();
        sig_data.extend(serde_json::to_vec(&signed)?);
        let signature = wallet.sign(signer, &sig_data).await?;
        Ok(Self {
            msg_type: Self::default_type(),
            id: new_id(),
            thread: Thread::new(request_thid),
            connection_sig: ConnectionSignature {
                sig_type: SIGNATURE_TYPE.to_string(),
                signature: URL_SAFE.encode(signature),
                sig_data: URL_SAFE.encode(sig_data),
                signer: *signer,
            },
        })
    }

    /// Check thread binding, signer and signature; return the signed connection.
    pub fn verify(
        &self,
        expected_signer: &Verkey,
        request_thid: &str,
    ) -> Result<Connection, MessageError> {
        if self.thread.thid != request_thid {
            return Err(invalid("~thread", "not bound to the request"));
        }
        let sig = &self.connection_sig;
        if sig.signer != *expected_signer {
            return Err(invalid("connection~sig", "unexpected signer"));
        }
        let data = decode_b64(&sig.sig_data)?;
        let signature = decode_b64(&sig.signature)?;
        sig.signer
            .verify(&data, &signature)
            .map_err(|_| invalid("connection~sig", "bad signature"))?;
        if data.len() <= 8 {
            return Err(invalid("connection~sig", "short sig_data"));
        }
        let mut signed: Value = serde_json::from_slice(&data[8..])?;
        let commitment = signed
            .as_object_mut()
            .and_then(|fields| fields.remove(THREAD_COMMITMENT))
            .ok_or_else(|| invalid("connection~sig", "missing thread commitment"))?;
        let expected = URL_SAFE_NO_PAD.encode(thread_commitment(request_thid));
        if commitment.as_str() != Some(expected.as_str()) {
            return Err(invalid("connection~sig", "thread commitment mismatch"));
        }
        Ok(serde_json::from_value(signed)?)
    }
}

impl ProtocolMessage for ConnResponse {
    const PROTOCOL: &'static str = "connections";
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "response";

    fn id(&self) -> &str {
        &self.id
    }

    fn thread(&self) -> Option<&Thread> {
        Some(&self.thread)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default = "new_id")]
    pub id: String,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(rename = "problem-code", default)]
    pub problem_code: String,
    #[serde(default)]
    pub explain: String,
}

impl ProblemReport {
    pub fn new(thid: Option<&str>, code: &str, explain: impl Into<String>) -> Self {
        Self {
            msg_type: Self::default_type(),
            id: new_id(),
            thread: thid.map(Thread::new),
            problem_code: code.to_string(),
            explain: explain.into(),
        }
    }
}

impl ProtocolMessage for ProblemReport {
    const PROTOCOL: &'static str = "connections";
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "problem_report";

    fn id(&self) -> &str {
        &self.id
    }

    fn thread(&self) -> Option<&Thread> {
        self.thread.as_ref()
    }
}

fn thread_commitment(thid: &str) -> [u8; 32] {
    Sha256::digest(thid.as_bytes()).into()
}

fn decode_b64(text: &str) -> Result<Vec<u8>, MessageError> {
    URL_SAFE_NO_PAD
        .decode(text.trim_end_matches('='))
        .map_err(|_| invalid("connection~sig", "bad base64"))
}

fn invalid(field: &'static str, reason: &str) -> MessageError {
    MessageError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}
