//! The key-agreement handshake runner.
//!
//! The real UKEY2 key-agreement protocol is out of scope for this crate
//! and treated as an opaque collaborator. What lives here is the
//! framing *around* that handshake: running it in one of two roles over
//! a raw, not-yet-registered channel, enforcing a bounded timeout, and
//! producing a shared [`EncryptionContext`] on success.
//!
//! Because no real UKEY2 dependency is pulled in, [`AeadEncryptionContext`]
//! ships as the crate's only concrete context: an AES-256-GCM cipher
//! keyed from an unauthenticated Diffie-Hellman-free share exchange. It
//! is documented here, loudly, as a development/test stand-in — never as
//! a production authentication mechanism (see DESIGN.md).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use serde::{Deserialize, Serialize};

use crate::channel::EndpointChannel;
use crate::error::{Error, ErrorKind, Result};

/// Bound on the whole client/server handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque symmetric-crypto state produced by the key-agreement handshake.
/// Owned by exactly one `EndpointChannel` at a time, never the other way
/// round.
pub trait EncryptionContext: Send + Sync + 'static {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// The outcome of a completed handshake.
pub struct EncryptionOutcome {
    pub endpoint_id: String,
    pub context: Arc<dyn EncryptionContext>,
    /// A short, human-comparable string derived from the shared secret
    /// (the UKEY2 "auth string" equivalent).
    pub auth_token: String,
    pub raw_auth_token: Vec<u8>,
}

/// Delivered to the caller so it can react to a completed or failed
/// handshake without blocking the handshake thread itself.
pub trait EncryptionResultListener: Send + 'static {
    fn on_success(&self, outcome: EncryptionOutcome);
    /// On failure, the channel that failed to authenticate is handed
    /// back so the caller can tear down that *specific* channel -- it
    /// may since have been replaced by a BWU handover, in which case the
    /// caller must verify identity before acting.
    fn on_failure(&self, endpoint_id: String, channel: Arc<EndpointChannel>);
}

#[derive(Serialize, Deserialize)]
struct HandshakeMessage {
    share: Vec<u8>,
}

/// Which side of the handshake this party played. Carried through to
/// [`AeadEncryptionContext::derive`] so the two directions of the duplex
/// channel never encrypt under the same key.
#[derive(Copy, Clone)]
pub enum Role {
    Client,
    Server,
}

/// Runs the handshake role on a dedicated thread, arming a watchdog that
/// closes the channel if the handshake has not finished within
/// [`HANDSHAKE_TIMEOUT`].
pub struct EncryptionRunner;

impl EncryptionRunner {
    pub fn start_client(
        endpoint_id: String,
        channel: Arc<EndpointChannel>,
        listener: Box<dyn EncryptionResultListener>,
    ) {
        Self::start(Role::Client, endpoint_id, channel, listener);
    }

    pub fn start_server(
        endpoint_id: String,
        channel: Arc<EndpointChannel>,
        listener: Box<dyn EncryptionResultListener>,
    ) {
        Self::start(Role::Server, endpoint_id, channel, listener);
    }

    fn start(
        role: Role,
        endpoint_id: String,
        channel: Arc<EndpointChannel>,
        listener: Box<dyn EncryptionResultListener>,
    ) {
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let channel = channel.clone();
            thread::Builder::new()
                .name(format!("enc-watchdog-{}", endpoint_id))
                .spawn(move || {
                    thread::sleep(HANDSHAKE_TIMEOUT);
                    if !done.load(Ordering::Acquire) {
                        tracing::warn!(endpoint_id = %channel.channel_name(), "handshake timed out");
                        channel.close();
                    }
                })
                .expect("spawn encryption watchdog thread");
        }
        thread::Builder::new()
            .name(format!("enc-{}", endpoint_id))
            .spawn(move || {
                let result = run_handshake(role, &endpoint_id, &channel);
                done.store(true, Ordering::Release);
                match result {
                    Ok(outcome) => listener.on_success(outcome),
                    Err(e) => {
                        tracing::warn!(error = %e, "handshake failed");
                        listener.on_failure(endpoint_id, channel);
                    }
                }
            })
            .expect("spawn encryption handshake thread");
    }
}

fn run_handshake(role: Role, endpoint_id: &str, channel: &EndpointChannel) -> Result<EncryptionOutcome> {
    let mut my_share = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut my_share);

    let (client_share, server_share) = match role {
        Role::Client => {
            write_handshake_message(channel, &my_share)?;
            let peer_share = read_handshake_message(channel)?;
            (my_share, peer_share)
        }
        Role::Server => {
            let peer_share = read_handshake_message(channel)?;
            write_handshake_message(channel, &my_share)?;
            (peer_share, my_share)
        }
    };

    let digest = ring::digest::digest(
        &ring::digest::SHA256,
        &[client_share.as_slice(), server_share.as_slice()].concat(),
    );
    let shared_secret = digest.as_ref().to_vec();
    let context = Arc::new(AeadEncryptionContext::derive(&shared_secret, role)?);
    let raw_auth_token = shared_secret[..16].to_vec();
    let auth_token = raw_auth_token.iter().map(|b| format!("{:02x}", b)).collect();

    Ok(EncryptionOutcome {
        endpoint_id: endpoint_id.to_owned(),
        context,
        auth_token,
        raw_auth_token,
    })
}

fn write_handshake_message(channel: &EndpointChannel, share: &[u8]) -> Result<()> {
    let msg = HandshakeMessage { share: share.to_vec() };
    let bytes = bincode::serialize(&msg)
        .map_err(|e| Error::wrapped(ErrorKind::InvalidProtocolBuffer, e))?;
    channel.write(&bytes)
}

fn read_handshake_message(channel: &EndpointChannel) -> Result<Vec<u8>> {
    let bytes = channel.read()?;
    let msg: HandshakeMessage =
        bincode::deserialize(&bytes).map_err(|e| Error::wrapped(ErrorKind::InvalidProtocolBuffer, e))?;
    Ok(msg.share)
}

const C2S_INFO: &[u8] = b"nearby-connections-core c2s";
const S2C_INFO: &[u8] = b"nearby-connections-core s2c";

/// Fixed-length output key material request for HKDF-Expand: always one
/// AES-256 key.
struct Aes256KeyLen;

impl hkdf::KeyType for Aes256KeyLen {
    fn len(&self) -> usize {
        32
    }
}

fn derive_direction_key(shared_secret: &[u8], info: &[u8]) -> Result<LessSafeKey> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(shared_secret);
    let okm = prk.expand(&[info], Aes256KeyLen).map_err(|_| Error::simple(ErrorKind::AuthenticationFailure))?;
    let mut key_bytes = [0u8; 32];
    okm.fill(&mut key_bytes).map_err(|_| Error::simple(ErrorKind::AuthenticationFailure))?;
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|_| Error::simple(ErrorKind::AuthenticationFailure))?;
    Ok(LessSafeKey::new(unbound))
}

/// AES-256-GCM encryption context keyed from a handshake-derived shared
/// secret. Not a production authentication mechanism -- see the module
/// doc comment.
///
/// Both peers compute the same raw shared secret (see `run_handshake`),
/// so `send_key`/`recv_key` are derived from it with HKDF under
/// direction-specific info labels rather than used directly: this keeps
/// the client-to-server and server-to-client directions on distinct
/// keys, so two messages that happen to reuse the same nonce counter in
/// opposite directions are never encrypted under the same (key, nonce)
/// pair.
pub struct AeadEncryptionContext {
    send_key: LessSafeKey,
    recv_key: LessSafeKey,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
}

impl AeadEncryptionContext {
    pub fn derive(shared_secret: &[u8], role: Role) -> Result<Self> {
        let c2s = derive_direction_key(shared_secret, C2S_INFO)?;
        let s2c = derive_direction_key(shared_secret, S2C_INFO)?;
        let (send_key, recv_key) = match role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        Ok(Self {
            send_key,
            recv_key,
            send_counter: AtomicU64::new(0),
            recv_counter: AtomicU64::new(0),
        })
    }

    fn nonce_for(counter: u64) -> Nonce {
        let mut bytes = [0u8; aead::NONCE_LEN];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Nonce::assume_unique_for_key(bytes)
    }
}

impl EncryptionContext for AeadEncryptionContext {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
        let mut in_out = plaintext.to_vec();
        self.send_key
            .seal_in_place_append_tag(Self::nonce_for(counter), Aad::empty(), &mut in_out)
            .map_err(|_| Error::simple(ErrorKind::EndpointIoError))?;
        Ok(in_out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.recv_counter.fetch_add(1, Ordering::SeqCst);
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .recv_key
            .open_in_place(Self::nonce_for(counter), Aad::empty(), &mut in_out)
            .map_err(|_| Error::simple(ErrorKind::AuthenticationFailure))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_context_roundtrips_across_roles() {
        let secret = [7u8; 32];
        let client = AeadEncryptionContext::derive(&secret, Role::Client).unwrap();
        let server = AeadEncryptionContext::derive(&secret, Role::Server).unwrap();

        let ct1 = client.encrypt(b"first message").unwrap();
        let ct2 = client.encrypt(b"second message").unwrap();
        assert_ne!(ct1, ct2);

        assert_eq!(server.decrypt(&ct1).unwrap(), b"first message");
        assert_eq!(server.decrypt(&ct2).unwrap(), b"second message");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let a = AeadEncryptionContext::derive(&[1u8; 32], Role::Client).unwrap();
        let b = AeadEncryptionContext::derive(&[2u8; 32], Role::Server).unwrap();
        let ct = a.encrypt(b"hello").unwrap();
        assert!(b.decrypt(&ct).is_err());
    }

    #[test]
    fn the_two_directions_never_share_a_key_even_at_the_same_nonce_counter() {
        let secret = [9u8; 32];
        let client = AeadEncryptionContext::derive(&secret, Role::Client).unwrap();
        let server = AeadEncryptionContext::derive(&secret, Role::Server).unwrap();

        // both contexts are fresh, so this is nonce counter 0 in both
        // directions -- the bug this guards against reused one AES key for
        // both, which would make these two ciphertexts decryptable under
        // either context.
        let from_client = client.encrypt(b"hello").unwrap();
        let from_server = server.encrypt(b"hello").unwrap();
        assert_ne!(from_client, from_server);

        assert_eq!(server.decrypt(&from_client).unwrap(), b"hello");
        assert_eq!(client.decrypt(&from_server).unwrap(), b"hello");
    }
}
