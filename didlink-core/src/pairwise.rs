//! Pairwise relationship: our DID paired with a counterpart's, persisted in a [`Wallet`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Verkey;
use crate::wallet::{Wallet, WalletError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub did: String,
    pub verkey: Verkey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Their {
    pub did: String,
    pub verkey: Verkey,
    pub label: String,
    pub endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pairwise {
    pub me: Me,
    pub their: Their,
    /// Free-form; always carries the serialized `me`/`their` halves.
    #[serde(default)]
    pub metadata: Value,
}

impl Pairwise {
    pub fn new(me: Me, their: Their) -> Self {
        let mut pairwise = Self {
            me,
            their,
            metadata: Value::Null,
        };
        pairwise.metadata = pairwise.describe();
        pairwise
    }

    fn describe(&self) -> Value {
        serde_json::json!({
            "me": self.me,
            "their": self.their,
        })
    }

    /// Merge caller metadata with the relationship description.
    fn stored_metadata(&self) -> Value {
        let mut metadata = match &self.metadata {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Value::Object(described) = self.describe() {
            metadata.extend(described);
        }
        Value::Object(metadata)
    }
}

/// Create the record, or refresh its metadata if the counterpart DID is already paired.
/// Returns `true` if a new record was created.
pub async fn ensure_exists(wallet: &dyn Wallet, pairwise: &Pairwise) -> Result<bool, WalletError> {
    wallet.store_their_did(&pairwise.their.did, &pairwise.their.verkey).await?;
    let metadata = pairwise.stored_metadata();
    if wallet.is_pairwise_exists(&pairwise.their.did).await? {
        wallet.set_pairwise_metadata(&pairwise.their.did, metadata).await?;
        tracing::debug!(their_did = %pairwise.their.did, "pairwise metadata refreshed");
        Ok(false)
    } else {
        wallet.create_pairwise(&pairwise.their.did, &pairwise.me.did, metadata).await?;
        tracing::debug!(their_did = %pairwise.their.did, "pairwise created");
        Ok(true)
    }
}

/// Load a stored relationship by counterpart DID.
pub async fn load(wallet: &dyn Wallet, their_did: &str) -> Result<Pairwise, WalletError> {
    let record = wallet.get_pairwise(their_did).await?;
    let me = Me {
        did: record.my_did.clone(),
        verkey: wallet.key_for_local_did(&record.my_did).await?,
    };
    let their = match record.metadata.get("their") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Their {
            did: record.their_did.clone(),
            verkey: wallet.key_for_did(&record.their_did).await?,
            label: String::new(),
            endpoint: String::new(),
            routing_keys: Vec::new(),
        },
    };
    Ok(Pairwise {
        me,
        their,
        metadata: record.metadata,
    })
}

/// Stored relationship whose counterpart uses `verkey`, if any.
pub async fn find_by_their_verkey(
    wallet: &dyn Wallet,
    verkey: &Verkey,
) -> Result<Option<Pairwise>, WalletError> {
    for record in wallet.list_pairwise().await? {
        if wallet.key_for_did(&record.their_did).await.ok().as_ref() == Some(verkey) {
            return load(wallet, &record.their_did).await.map(Some);
        }
    }
    Ok(None)
}
