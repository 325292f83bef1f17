//! Encrypted pairwise channel: seal a payload to one or more recipient verkeys,
//! either authenticated (sender bound by key agreement) or anonymous.
//!
//! Wire shape (JSON):
//! `{"protected": b64url(header), "iv": b64url, "ciphertext": b64url, "tag": b64url}`.
//! The header lists one entry per recipient holding the content key wrapped under
//! a key agreed between an ephemeral X25519 key and the recipient. In authenticated
//! mode the wrap key also mixes in the sender's static agreement secret and the
//! sender verkey travels encrypted to the recipient.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::identity::{
    decrypt_wire, derive_session_key, encrypt_wire, random_nonce, KeyError, Keypair, Verkey,
    WireCryptoError,
};

/// Field whose presence marks a packed payload.
pub const PROTECTED_MARKER: &str = "protected";

const ENC: &str = "chacha20poly1305";
const TYP: &str = "JWM/1.0";
const ALG_AUTH: &str = "Authcrypt";
const ALG_ANON: &str = "Anoncrypt";
const TAG_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct Packed {
    protected: String,
    iv: String,
    ciphertext: String,
    tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProtectedHeader {
    enc: String,
    typ: String,
    alg: String,
    recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipientEntry {
    encrypted_key: String,
    header: RecipientHeader,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipientHeader {
    kid: Verkey,
    epk: String,
    iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_iv: Option<String>,
}

/// Result of opening a packed payload.
#[derive(Debug, Clone)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    /// `None` for anonymous payloads.
    pub sender_key: Option<Verkey>,
    pub recipient_key: Verkey,
}

/// True if a JSON value looks like a packed payload.
pub fn is_packed(value: &Value) -> bool {
    value.get(PROTECTED_MARKER).is_some()
}

/// Seal `plaintext` so that any holder of one of `recipients` can open it.
/// With `sender = None` the payload is anonymous.
pub fn seal(
    plaintext: &[u8],
    recipients: &[Verkey],
    sender: Option<&Keypair>,
) -> Result<Vec<u8>, PackError> {
    if recipients.is_empty() {
        return Err(PackError::NoRecipients);
    }
    let mut cek = [0u8; 32];
    OsRng.fill_bytes(&mut cek);

    let mut entries = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let epk = X25519PublicKey::from(&ephemeral);
        let anon_secret = ephemeral.diffie_hellman(&recipient.agreement_key()?).to_bytes();
        let (wrap_key, sender_field, sender_iv) = match sender {
            Some(kp) => {
                let sender_key = derive_session_key(b"sender", &[&anon_secret]);
                let iv = random_nonce();
                let sealed_sender =
                    encrypt_wire(&sender_key, &iv, kp.verkey().to_base58().as_bytes(), b"")?;
                let static_secret = kp.shared_secret(recipient)?;
                let wrap = derive_session_key(b"authcrypt", &[&anon_secret, &static_secret]);
                (
                    wrap,
                    Some(URL_SAFE_NO_PAD.encode(sealed_sender)),
                    Some(URL_SAFE_NO_PAD.encode(iv)),
                )
            }
            None => (derive_session_key(b"anoncrypt", &[&anon_secret]), None, None),
        };
        let key_iv = random_nonce();
        let encrypted_key = encrypt_wire(&wrap_key, &key_iv, &cek, b"")?;
        entries.push(RecipientEntry {
            encrypted_key: URL_SAFE_NO_PAD.encode(encrypted_key),
            header: RecipientHeader {
                kid: *recipient,
                epk: URL_SAFE_NO_PAD.encode(epk.as_bytes()),
                iv: URL_SAFE_NO_PAD.encode(key_iv),
                sender: sender_field,
                sender_iv,
            },
        });
    }

    let header = ProtectedHeader {
        enc: ENC.to_string(),
        typ: TYP.to_string(),
        alg: if sender.is_some() { ALG_AUTH } else { ALG_ANON }.to_string(),
        recipients: entries,
    };
    let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let iv = random_nonce();
    let mut sealed = encrypt_wire(&cek, &iv, plaintext, protected.as_bytes())?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    let packed = Packed {
        protected,
        iv: URL_SAFE_NO_PAD.encode(iv),
        ciphertext: URL_SAFE_NO_PAD.encode(sealed),
        tag: URL_SAFE_NO_PAD.encode(tag),
    };
    Ok(serde_json::to_vec(&packed)?)
}

/// Open a packed payload. `lookup` returns the keypair for a recipient kid we hold.
pub fn open<F>(wire: &[u8], lookup: F) -> Result<Opened, PackError>
where
    F: Fn(&Verkey) -> Option<Keypair>,
{
    let packed: Packed = serde_json::from_slice(wire)?;
    let header_bytes = decode_b64(&packed.protected)?;
    let header: ProtectedHeader = serde_json::from_slice(&header_bytes)?;
    if header.enc != ENC {
        return Err(PackError::Unsupported(header.enc));
    }
    let authenticated = match header.alg.as_str() {
        ALG_AUTH => true,
        ALG_ANON => false,
        other => return Err(PackError::Unsupported(other.to_string())),
    };

    let (entry, keypair) = header
        .recipients
        .iter()
        .find_map(|entry| lookup(&entry.header.kid).map(|kp| (entry, kp)))
        .ok_or(PackError::NotARecipient)?;

    let epk: [u8; 32] = decode_b64(&entry.header.epk)?
        .try_into()
        .map_err(|_| PackError::Malformed("epk length"))?;
    let my_secret = keypair.agreement_with_point(&epk);

    let (wrap_key, sender_key) = if authenticated {
        let sealed_sender = entry
            .header
            .sender
            .as_deref()
            .ok_or(PackError::Malformed("sender missing in authcrypt"))?;
        let sender_iv = nonce_from(
            entry
                .header
                .sender_iv
                .as_deref()
                .ok_or(PackError::Malformed("sender_iv missing"))?,
        )?;
        let sender_unwrap = derive_session_key(b"sender", &[&my_secret]);
        let sender_text =
            decrypt_wire(&sender_unwrap, &sender_iv, &decode_b64(sealed_sender)?, b"")?;
        let sender: Verkey = std::str::from_utf8(&sender_text)
            .map_err(|_| PackError::Malformed("sender verkey encoding"))?
            .parse()?;
        let static_secret = keypair.shared_secret(&sender)?;
        (
            derive_session_key(b"authcrypt", &[&my_secret, &static_secret]),
            Some(sender),
        )
    } else {
        (derive_session_key(b"anoncrypt", &[&my_secret]), None)
    };

    let key_iv = nonce_from(&entry.header.iv)?;
    let cek: [u8; 32] = decrypt_wire(&wrap_key, &key_iv, &decode_b64(&entry.encrypted_key)?, b"")?
        .try_into()
        .map_err(|_| PackError::Malformed("content key length"))?;

    let iv = nonce_from(&packed.iv)?;
    let mut body = decode_b64(&packed.ciphertext)?;
    body.extend_from_slice(&decode_b64(&packed.tag)?);
    let plaintext = decrypt_wire(&cek, &iv, &body, packed.protected.as_bytes())?;
    Ok(Opened {
        plaintext,
        sender_key,
        recipient_key: keypair.verkey(),
    })
}

fn decode_b64(text: &str) -> Result<Vec<u8>, PackError> {
    let trimmed = text.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| PackError::Malformed("base64"))
}

fn nonce_from(text: &str) -> Result<[u8; 12], PackError> {
    decode_b64(text)?
        .try_into()
        .map_err(|_| PackError::Malformed("nonce length"))
}

/// Encrypted channel between this agent and one fixed counterpart (typically the relay).
/// Both directions are authenticated.
#[derive(Debug, Clone)]
pub struct P2PConnection {
    me: Keypair,
    their: Verkey,
}

impl P2PConnection {
    pub fn new(me: Keypair, their: Verkey) -> Self {
        Self { me, their }
    }

    pub fn my_verkey(&self) -> Verkey {
        self.me.verkey()
    }

    pub fn their_verkey(&self) -> Verkey {
        self.their
    }

    /// Pack a JSON message for the counterpart.
    pub fn pack(&self, message: &Value) -> Result<Value, PackError> {
        let plaintext = serde_json::to_vec(message)?;
        let wire = seal(&plaintext, &[self.their], Some(&self.me))?;
        Ok(serde_json::from_slice(&wire)?)
    }

    /// Unpack a JSON message; the sender must be the counterpart.
    pub fn unpack(&self, packed: &Value) -> Result<Value, PackError> {
        let wire = serde_json::to_vec(packed)?;
        let me = &self.me;
        let opened = open(&wire, |kid| (*kid == me.verkey()).then(|| me.clone()))?;
        if opened.sender_key != Some(self.their) {
            return Err(PackError::UnexpectedSender);
        }
        Ok(serde_json::from_slice(&opened.plaintext)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("no recipients")]
    NoRecipients,
    #[error("none of the recipient keys is held locally")]
    NotARecipient,
    #[error("unsupported algorithm: {0}")]
    Unsupported(String),
    #[error("malformed packed payload: {0}")]
    Malformed(&'static str),
    #[error("payload sender is not the expected counterpart")]
    UnexpectedSender,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("crypto error: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(kp: &Keypair) -> impl Fn(&Verkey) -> Option<Keypair> + '_ {
        move |kid| (*kid == kp.verkey()).then(|| kp.clone())
    }

    #[test]
    fn authcrypt_reveals_sender() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let wire = seal(b"hi bob", &[bob.verkey()], Some(&alice)).unwrap();
        let opened = open(&wire, holder(&bob)).unwrap();
        assert_eq!(opened.plaintext, b"hi bob");
        assert_eq!(opened.sender_key, Some(alice.verkey()));
        assert_eq!(opened.recipient_key, bob.verkey());
    }

    #[test]
    fn anoncrypt_hides_sender() {
        let bob = Keypair::generate();
        let wire = seal(b"anonymous", &[bob.verkey()], None).unwrap();
        let opened = open(&wire, holder(&bob)).unwrap();
        assert_eq!(opened.plaintext, b"anonymous");
        assert!(opened.sender_key.is_none());
    }

    #[test]
    fn any_recipient_can_open() {
        let bob = Keypair::generate();
        let carol = Keypair::generate();
        let wire = seal(b"both", &[bob.verkey(), carol.verkey()], None).unwrap();
        assert_eq!(open(&wire, holder(&carol)).unwrap().plaintext, b"both");
        assert_eq!(open(&wire, holder(&bob)).unwrap().plaintext, b"both");
    }

    #[test]
    fn stranger_cannot_open() {
        let bob = Keypair::generate();
        let eve = Keypair::generate();
        let wire = seal(b"secret", &[bob.verkey()], None).unwrap();
        assert!(matches!(
            open(&wire, holder(&eve)),
            Err(PackError::NotARecipient)
        ));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let bob = Keypair::generate();
        let wire = seal(b"integrity", &[bob.verkey()], None).unwrap();
        let mut packed: Value = serde_json::from_slice(&wire).unwrap();
        packed["ciphertext"] = Value::String(URL_SAFE_NO_PAD.encode(b"garbage!!"));
        let wire = serde_json::to_vec(&packed).unwrap();
        assert!(open(&wire, holder(&bob)).is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let bob = Keypair::generate();
        assert!(open(b"{\"not\":\"packed\"}", holder(&bob)).is_err());
        assert!(open(b"not json", holder(&bob)).is_err());
    }

    #[test]
    fn p2p_rejects_foreign_sender() {
        let agent = Keypair::generate();
        let server = Keypair::generate();
        let intruder = Keypair::generate();
        let agent_side = P2PConnection::new(agent.clone(), server.verkey());
        let server_side = P2PConnection::new(server, agent.verkey());
        let intruder_side = P2PConnection::new(intruder, agent.verkey());

        let msg = serde_json::json!({"@type": "x", "n": 1});
        let packed = server_side.pack(&msg).unwrap();
        assert!(is_packed(&packed));
        assert_eq!(agent_side.unpack(&packed).unwrap(), msg);

        let forged = intruder_side.pack(&msg).unwrap();
        assert!(matches!(
            agent_side.unpack(&forged),
            Err(PackError::UnexpectedSender)
        ));
    }
}
