use ed25519_dalek::{self, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Serialize, Deserialize};

use crate::block::ClientId;

pub type PublicKey = ed25519_dalek::PublicKey;
pub type Signature = ed25519_dalek::Signature;

/// A client's long-lived identity. Separate from its threshold share, which
/// the server hands out at registration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Keypair {
    pub kp: ed25519_dalek::Keypair,
}

impl Keypair {
    pub fn gen() -> Self {
        let mut csprng = OsRng {};
        Self { kp: ed25519_dalek::Keypair::generate(&mut csprng) }
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.kp.public.to_bytes().to_vec()
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.kp.sign(msg).to_bytes().to_vec()
    }

    /// Proof of possession presented at registration.
    pub fn prove(&self, client_id: ClientId) -> Vec<u8> {
        self.sign(&client_id.to_be_bytes())
    }
}

pub fn verify(public_key: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let pk = match PublicKey::from_bytes(public_key) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    match Signature::try_from(sig) {
        Ok(sig) => pk.verify(msg, &sig).is_ok(),
        Err(_) => false,
    }
}

pub fn verify_proof(public_key: &[u8], client_id: ClientId, proof: &[u8]) -> bool {
    verify(public_key, &client_id.to_be_bytes(), proof)
}
