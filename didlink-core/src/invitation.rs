//! Out-of-band invitation (`connections/1.0/invitation`) and its URL encoding.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::{new_id, MessageError, Thread};
use crate::identity::Verkey;
use crate::message::ProtocolMessage;

/// Query parameter carrying the invitation.
pub const INVITATION_PARAM: &str = "c_i";
/// Legacy query parameter some older peers emit.
const LEGACY_PARAM: &str = "d_m";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "recipientKeys", alias = "recipient_keys")]
    pub recipient_keys: Vec<Verkey>,
    #[serde(
        rename = "serviceEndpoint",
        alias = "service_endpoint",
        alias = "endpoint"
    )]
    pub endpoint: String,
    #[serde(
        rename = "routingKeys",
        alias = "routing_keys",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub routing_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
}

impl Invitation {
    pub fn new(
        label: impl Into<String>,
        recipient_keys: Vec<Verkey>,
        endpoint: impl Into<String>,
        routing_keys: Vec<String>,
    ) -> Self {
        Self {
            msg_type: Self::default_type(),
            id: new_id(),
            label: label.into(),
            recipient_keys,
            endpoint: endpoint.into(),
            routing_keys,
            did: None,
        }
    }

    /// Well-formed iff there is at least one recipient key and a routable endpoint.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.recipient_keys.is_empty() {
            return Err(MessageError::InvalidField {
                field: "recipientKeys",
                reason: "empty".into(),
            });
        }
        if !is_routable(&self.endpoint) {
            return Err(MessageError::InvalidField {
                field: "serviceEndpoint",
                reason: format!("not routable: {:?}", self.endpoint),
            });
        }
        Ok(())
    }

    /// The key the invitation was published under: `recipient_keys[0]`.
    pub fn connection_key(&self) -> Option<Verkey> {
        self.recipient_keys.first().copied()
    }

    /// `<endpoint-origin>/invitation?c_i=<base64url(json)>`.
    pub fn invitation_url(&self) -> Result<String, MessageError> {
        let json = serde_json::to_vec(self)?;
        let encoded = URL_SAFE.encode(json);
        let base = self.endpoint.trim_end_matches('/');
        Ok(format!("{base}/invitation?{INVITATION_PARAM}={encoded}"))
    }

    /// Parse an invitation link. Accepts `c_i` or `d_m`, padded or unpadded base64url.
    pub fn from_url(url: &str) -> Result<Self, MessageError> {
        let query = url
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| invalid_url("missing query"))?;
        let query = query.split('#').next().unwrap_or(query);
        let encoded = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == INVITATION_PARAM || *k == LEGACY_PARAM)
            .map(|(_, v)| v)
            .ok_or_else(|| invalid_url("no invitation parameter"))?;
        let encoded = encoded.replace("%3D", "=").replace("%3d", "=");
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| invalid_url(&e.to_string()))?;
        let invitation: Invitation = serde_json::from_slice(&bytes)?;
        let envelope = invitation.to_envelope()?;
        Self::check_type(&envelope)?;
        invitation.validate()?;
        Ok(invitation)
    }
}

impl ProtocolMessage for Invitation {
    const PROTOCOL: &'static str = "connections";
    const VERSION: &'static str = "1.0";
    const NAME: &'static str = "invitation";

    fn id(&self) -> &str {
        &self.id
    }

    fn thread(&self) -> Option<&Thread> {
        None
    }
}

/// http(s) or ws(s) URL with a non-empty host.
pub(crate) fn is_routable(endpoint: &str) -> bool {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    matches!(scheme, "http" | "https" | "ws" | "wss") && !host.is_empty()
}

fn invalid_url(reason: &str) -> MessageError {
    MessageError::InvalidField {
        field: "url",
        reason: reason.to_string(),
    }
}
