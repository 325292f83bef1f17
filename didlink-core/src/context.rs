//! Session negotiation: the context frame the server sends first on every connection.

use serde_json::Value;

pub const MSG_TYPE_CONTEXT: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/sirius_rpc/1.0/context";

const PROXY_RPC: &str = "reverse";
const PROXY_COPROTOCOL: &str = "sub-protocol";
const BALANCING_KAFKA: &str = "kafka";

/// Active agent endpoint. Immutable once negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub routing_keys: Vec<String>,
    pub is_default: bool,
}

impl Endpoint {
    /// Endpoint without routing keys.
    pub fn simple(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            routing_keys: Vec::new(),
            is_default: false,
        }
    }
}

/// Parsed context frame.
#[derive(Debug, Clone)]
pub struct ServerContext {
    raw: Value,
}

impl ServerContext {
    /// Accepts only a JSON object declaring the context type.
    pub fn parse(value: Value) -> Result<Self, ContextError> {
        match value.get("@type").and_then(Value::as_str) {
            None => Err(ContextError::MissingType),
            Some(t) if t != MSG_TYPE_CONTEXT => Err(ContextError::UnexpectedType(t.to_string())),
            Some(_) => Ok(Self { raw: value }),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ContextError> {
        let value = serde_json::from_slice(bytes).map_err(|_| ContextError::Malformed)?;
        Self::parse(value)
    }

    /// `(rpc, co-protocol)` channel addresses. Both are mandatory.
    pub fn rpc_channels(&self) -> Result<(String, String), ContextError> {
        let mut rpc = None;
        let mut coprotocol = None;
        for proxy in list(&self.raw, "~proxy") {
            let address = proxy
                .pointer("/data/json/address")
                .and_then(Value::as_str)
                .map(str::to_string);
            match proxy.get("id").and_then(Value::as_str) {
                Some(PROXY_RPC) => rpc = address,
                Some(PROXY_COPROTOCOL) => coprotocol = address,
                _ => {}
            }
        }
        Ok((
            rpc.ok_or(ContextError::MissingChannel(PROXY_RPC))?,
            coprotocol.ok_or(ContextError::MissingChannel(PROXY_COPROTOCOL))?,
        ))
    }

    /// Expand advertised endpoints: one record per routing key when a front-end
    /// key is present, otherwise one simple endpoint.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ContextError> {
        let mut out = Vec::new();
        for entry in list(&self.raw, "~endpoints") {
            let body = entry
                .pointer("/data/json")
                .ok_or(ContextError::Malformed)?;
            let address = body
                .get("address")
                .and_then(Value::as_str)
                .ok_or(ContextError::Malformed)?;
            match body.get("frontend_routing_key").and_then(Value::as_str) {
                Some(frontend) if !frontend.is_empty() => {
                    for key in list(body, "routing_keys") {
                        let routing_key = key
                            .get("routing_key")
                            .and_then(Value::as_str)
                            .ok_or(ContextError::Malformed)?;
                        out.push(Endpoint {
                            address: address.to_string(),
                            routing_keys: vec![routing_key.to_string(), frontend.to_string()],
                            is_default: key
                                .get("is_default")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        });
                    }
                }
                _ => out.push(Endpoint::simple(address)),
            }
        }
        if out.is_empty() {
            return Err(ContextError::NoEndpoints);
        }
        Ok(out)
    }

    /// Load-balancing group for event delivery, if the server assigns one.
    pub fn balancing_group(&self) -> Option<String> {
        list(&self.raw, "~balancing")
            .iter()
            .find(|b| b.get("id").and_then(Value::as_str) == Some(BALANCING_KAFKA))
            .and_then(|b| b.pointer("/data/json/group_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

fn list<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context frame is not valid JSON")]
    Malformed,
    #[error("context @type is empty")]
    MissingType,
    #[error("unexpected context type: {0}")]
    UnexpectedType(String),
    #[error("{0} channel is empty")]
    MissingChannel(&'static str),
    #[error("endpoints are empty")]
    NoEndpoints,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "@type": MSG_TYPE_CONTEXT,
            "~proxy": [
                {"id": "reverse", "data": {"json": {"address": "rpc-chan"}}},
                {"id": "sub-protocol", "data": {"json": {"address": "co-chan"}}}
            ],
            "~endpoints": [
                {"data": {"json": {
                    "address": "https://relay.example/e",
                    "frontend_routing_key": "front",
                    "routing_keys": [
                        {"routing_key": "rk-1", "is_default": true},
                        {"routing_key": "rk-2", "is_default": false}
                    ]
                }}}
            ],
            "~balancing": [{"id": "kafka", "data": {"json": {"group_id": "g-7"}}}]
        })
    }

    #[test]
    fn frontend_endpoint_expands_per_routing_key() {
        let ctx = ServerContext::parse(context()).unwrap();
        let endpoints = ctx.endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints.iter().filter(|e| e.is_default).count(), 1);
        assert_eq!(endpoints[0].routing_keys, vec!["rk-1", "front"]);
    }

    #[test]
    fn simple_endpoint_without_frontend_key() {
        let mut value = context();
        value["~endpoints"] = json!([{"data": {"json": {"address": "https://relay.example/s"}}}]);
        let endpoints = ServerContext::parse(value).unwrap().endpoints().unwrap();
        assert_eq!(endpoints, vec![Endpoint::simple("https://relay.example/s")]);
    }

    #[test]
    fn channels_and_balancing() {
        let ctx = ServerContext::parse(context()).unwrap();
        assert_eq!(
            ctx.rpc_channels().unwrap(),
            ("rpc-chan".to_string(), "co-chan".to_string())
        );
        assert_eq!(ctx.balancing_group().as_deref(), Some("g-7"));
    }

    #[test]
    fn missing_channel_is_fatal() {
        let mut value = context();
        value["~proxy"] = json!([{"id": "reverse", "data": {"json": {"address": "rpc-chan"}}}]);
        let ctx = ServerContext::parse(value).unwrap();
        assert!(matches!(
            ctx.rpc_channels(),
            Err(ContextError::MissingChannel("sub-protocol"))
        ));
    }

    #[test]
    fn wrong_type_and_no_endpoints() {
        let mut value = context();
        value["@type"] = json!("https://didcomm.org/other/1.0/x");
        assert!(matches!(
            ServerContext::parse(value),
            Err(ContextError::UnexpectedType(_))
        ));

        let mut value = context();
        value["~endpoints"] = json!([]);
        assert!(matches!(
            ServerContext::parse(value).unwrap().endpoints(),
            Err(ContextError::NoEndpoints)
        ));
    }
}
