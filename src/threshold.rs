//! (t, n) BLS threshold signatures over BLS12-381.
//!
//! Shares are dealt deterministically from a deployment seed so every server
//! derives the same key material. This deployment always runs with t = n: the
//! group key is the aggregate of all public shares and a merged signature is the
//! aggregate of every signer's share.

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey};
use blst::BLST_ERROR;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use thiserror::Error;

pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

pub type Hash = [u8; 32];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },
    #[error("invalid key material")]
    InvalidKey,
    #[error("invalid signature share from signer {0}")]
    InvalidShare(u32),
    #[error("share parameters ({t}, {n}) do not match the scheme")]
    ParamMismatch { t: u32, n: u32 },
    #[error("merged signature does not verify under the group key")]
    InvalidSignature,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Params {
    pub t: u32,
    pub n: u32,
}

impl Params {
    pub fn unanimous(n: u32) -> Self {
        Self { t: n, n }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigShare {
    pub signer_index: u32,
    pub t: u32,
    pub n: u32,
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub t: u32,
    pub n: u32,
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
}

/// A signer's private share.
#[derive(Debug, Clone)]
pub struct KeyShare {
    index: u32,
    params: Params,
    sk: SecretKey,
}

impl KeyShare {
    pub fn from_bytes(index: u32, params: Params, bytes: &[u8]) -> Result<Self, ThresholdError> {
        let sk = SecretKey::from_bytes(bytes).map_err(|_| ThresholdError::InvalidKey)?;
        Ok(Self { index, params, sk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn public(&self) -> PublicShare {
        PublicShare { index: self.index, pk: self.sk.sk_to_pk() }
    }

    pub fn sign(&self, hash: &Hash) -> SigShare {
        SigShare {
            signer_index: self.index,
            t: self.params.t,
            n: self.params.n,
            sig: self.sk.sign(hash, DST, &[]).to_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublicShare {
    pub index: u32,
    pk: PublicKey,
}

impl PublicShare {
    pub fn verify(&self, hash: &Hash, share: &SigShare) -> bool {
        match blst::min_pk::Signature::from_bytes(&share.sig) {
            Ok(sig) => sig.verify(true, hash, DST, &[], &self.pk, true) == BLST_ERROR::BLST_SUCCESS,
            Err(_) => false,
        }
    }
}

/// Output of the one-time key dealing: one share per signer, indexed from 1.
pub struct Dealt {
    pub shares: Vec<KeyShare>,
    pub scheme: BlsThreshold,
}

pub fn deal(seed: &[u8], params: Params) -> Result<Dealt, ThresholdError> {
    if params.t == 0 || params.t > params.n {
        return Err(ThresholdError::ParamMismatch { t: params.t, n: params.n });
    }
    let shares = (1..=params.n)
        .map(|index| {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(index.to_be_bytes());
            let ikm: [u8; 32] = hasher.finalize().into();
            SecretKey::key_gen(&ikm, &[])
                .map(|sk| KeyShare { index, params, sk })
                .map_err(|_| ThresholdError::InvalidKey)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let pks: Vec<PublicKey> = shares.iter().map(|s| s.sk.sk_to_pk()).collect();
    let refs: Vec<&PublicKey> = pks.iter().collect();
    let group_key = AggregatePublicKey::aggregate(&refs, false)
        .map_err(|_| ThresholdError::InvalidKey)?
        .to_public_key();
    Ok(Dealt { shares, scheme: BlsThreshold { params, group_key } })
}

/// Quorum check and share aggregation, as seen by the vote collector.
pub trait Threshold: Send + Sync {
    fn params(&self) -> Params;

    fn is_quorum(&self, shares: usize) -> bool {
        shares >= self.params().t as usize
    }

    fn merge(&self, hash: &Hash, shares: &[&SigShare]) -> Result<Signature, ThresholdError>;

    fn verify(&self, hash: &Hash, signature: &Signature) -> bool;
}

#[derive(Debug, Clone)]
pub struct BlsThreshold {
    params: Params,
    group_key: PublicKey,
}

impl Threshold for BlsThreshold {
    fn params(&self) -> Params {
        self.params
    }

    fn merge(&self, hash: &Hash, shares: &[&SigShare]) -> Result<Signature, ThresholdError> {
        let need = self.params.t as usize;
        if !self.is_quorum(shares.len()) {
            return Err(ThresholdError::InsufficientShares { have: shares.len(), need });
        }
        let mut sigs = Vec::with_capacity(shares.len());
        for share in shares {
            if share.t != self.params.t || share.n != self.params.n {
                return Err(ThresholdError::ParamMismatch { t: share.t, n: share.n });
            }
            let sig = blst::min_pk::Signature::from_bytes(&share.sig)
                .map_err(|_| ThresholdError::InvalidShare(share.signer_index))?;
            sigs.push(sig);
        }
        let refs: Vec<&blst::min_pk::Signature> = sigs.iter().collect();
        let merged = AggregateSignature::aggregate(&refs, true)
            .map_err(|_| ThresholdError::InvalidSignature)?
            .to_signature();
        let signature = Signature {
            t: self.params.t,
            n: self.params.n,
            sig: merged.to_bytes().to_vec(),
        };
        if !self.verify(hash, &signature) {
            return Err(ThresholdError::InvalidSignature);
        }
        Ok(signature)
    }

    fn verify(&self, hash: &Hash, signature: &Signature) -> bool {
        match blst::min_pk::Signature::from_bytes(&signature.sig) {
            Ok(sig) => sig.verify(true, hash, DST, &[], &self.group_key, true) == BLST_ERROR::BLST_SUCCESS,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dealt(n: u32) -> Dealt {
        deal(b"threshold tests", Params::unanimous(n)).expect("dealing works")
    }

    #[test]
    fn merge_all_shares() {
        let dealt = dealt(4);
        let hash = [7u8; 32];
        let shares: Vec<SigShare> = dealt.shares.iter().map(|k| k.sign(&hash)).collect();
        for (key, share) in dealt.shares.iter().zip(&shares) {
            assert!(key.public().verify(&hash, share));
        }
        let refs: Vec<&SigShare> = shares.iter().collect();
        let sig = dealt.scheme.merge(&hash, &refs).expect("quorum reached");
        assert!(dealt.scheme.verify(&hash, &sig));
        assert!(!dealt.scheme.verify(&[8u8; 32], &sig));
    }

    #[test]
    fn below_threshold() {
        let dealt = dealt(4);
        let hash = [1u8; 32];
        let shares: Vec<SigShare> = dealt.shares[..3].iter().map(|k| k.sign(&hash)).collect();
        let refs: Vec<&SigShare> = shares.iter().collect();
        assert!(!dealt.scheme.is_quorum(refs.len()));
        assert_eq!(
            dealt.scheme.merge(&hash, &refs),
            Err(ThresholdError::InsufficientShares { have: 3, need: 4 })
        );
    }

    #[test]
    fn wrong_message_share() {
        let dealt = dealt(3);
        let hash = [2u8; 32];
        let mut shares: Vec<SigShare> = dealt.shares.iter().map(|k| k.sign(&hash)).collect();
        shares[1] = dealt.shares[1].sign(&[3u8; 32]);
        let refs: Vec<&SigShare> = shares.iter().collect();
        assert_eq!(dealt.scheme.merge(&hash, &refs), Err(ThresholdError::InvalidSignature));
    }

    #[test]
    fn garbage_share() {
        let dealt = dealt(2);
        let hash = [2u8; 32];
        let mut shares: Vec<SigShare> = dealt.shares.iter().map(|k| k.sign(&hash)).collect();
        shares[0].sig = vec![0u8; 5];
        let refs: Vec<&SigShare> = shares.iter().collect();
        assert_eq!(dealt.scheme.merge(&hash, &refs), Err(ThresholdError::InvalidShare(1)));
    }

    #[test]
    fn dealing_is_deterministic() {
        let a = dealt(3);
        let b = dealt(3);
        for (x, y) in a.shares.iter().zip(&b.shares) {
            assert_eq!(x.to_bytes(), y.to_bytes());
        }
        let other = deal(b"another seed", Params::unanimous(3)).unwrap();
        assert_ne!(a.shares[0].to_bytes(), other.shares[0].to_bytes());
        let restored = KeyShare::from_bytes(2, Params::unanimous(3), &a.shares[1].to_bytes()).unwrap();
        assert_eq!(restored.sign(&[9u8; 32]), a.shares[1].sign(&[9u8; 32]));
    }

    #[test]
    fn bad_params() {
        assert!(deal(b"x", Params { t: 0, n: 3 }).is_err());
        assert!(deal(b"x", Params { t: 4, n: 3 }).is_err());
    }
}
