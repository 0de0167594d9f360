//! Node identity: a long-lived x25519 keypair and the 40-bit overlay
//! address derived from it.
//!
//! Blob formats (ASCII, colon-separated, stable):
//!
//! ```text
//! public: <addr:10 hex>:0:<public key:64 hex>
//! secret: <addr:10 hex>:0:<public key:64 hex>:<secret key:64 hex>
//! ```
//!
//! The `0` field is the identity type, reserved for future key schemes.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use zerolink_core::{Error, NodeId, Result};

/// Identity type tag carried in the blob format.
const IDENTITY_TYPE: u8 = 0;

/// A node identity. The secret half is optional so the same type carries
/// both "public only" (remote peers) and "full" (our own) identities.
#[derive(Clone)]
pub struct Identity {
    address: NodeId,
    public: PublicKey,
    secret: Option<StaticSecret>,
}

impl Identity {
    /// Generate a fresh identity. Re-draws the keypair until the derived
    /// address avoids zero and the reserved prefix.
    pub fn generate() -> Self {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            let address = derive_address(public.as_bytes());
            if address.is_valid() {
                return Self { address, public, secret: Some(secret) };
            }
        }
    }

    pub fn address(&self) -> NodeId {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Build a public-only identity from a raw key, checking the claimed
    /// address against the key.
    pub fn from_public_key(address: NodeId, key: [u8; 32]) -> Result<Self> {
        let public = PublicKey::from(key);
        if derive_address(public.as_bytes()) != address {
            return Err(Error::identity("address does not match public key"));
        }
        Ok(Self { address, public, secret: None })
    }

    /// X25519 agreement with a remote public key. Errors when this is a
    /// public-only identity.
    pub fn agree(&self, remote: &PublicKey) -> Result<Zeroizing<[u8; 32]>> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| Error::identity("no secret key available"))?;
        Ok(Zeroizing::new(secret.diffie_hellman(remote).to_bytes()))
    }

    /// The public blob (no secret material).
    pub fn to_public_blob(&self) -> String {
        format!(
            "{}:{}:{}",
            self.address,
            IDENTITY_TYPE,
            hex::encode(self.public.as_bytes())
        )
    }

    /// The secret blob, or `None` for public-only identities.
    pub fn to_secret_blob(&self) -> Option<Zeroizing<String>> {
        self.secret.as_ref().map(|s| {
            Zeroizing::new(format!(
                "{}:{}:{}:{}",
                self.address,
                IDENTITY_TYPE,
                hex::encode(self.public.as_bytes()),
                hex::encode(s.to_bytes())
            ))
        })
    }

    /// Full consistency check: the address must re-derive from the public
    /// key, and when a secret is present it must produce the public key.
    pub fn validate(&self) -> bool {
        if derive_address(self.public.as_bytes()) != self.address {
            return false;
        }
        match &self.secret {
            Some(s) => PublicKey::from(s).as_bytes() == self.public.as_bytes(),
            None => true,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("secret", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(Error::identity("malformed identity blob"));
        }
        let address: NodeId = fields[0]
            .parse()
            .map_err(|_| Error::identity("bad address field"))?;
        if fields[1] != "0" {
            return Err(Error::identity("unknown identity type"));
        }
        let public = PublicKey::from(parse_key(fields[2])?);
        let secret = match fields.get(3) {
            Some(hexkey) => Some(StaticSecret::from(parse_key(hexkey)?)),
            None => None,
        };
        let id = Self { address, public, secret };
        if !id.validate() {
            return Err(Error::identity("inconsistent identity blob"));
        }
        Ok(id)
    }
}

fn parse_key(hexkey: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hexkey).map_err(|_| Error::identity("bad key hex"))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::identity("bad key length"))
}

/// Derive the 40-bit address from a public key: the first five bytes of
/// the key's BLAKE3 digest, masked into the valid range.
fn derive_address(public: &[u8; 32]) -> NodeId {
    let digest = blake3::hash(public);
    let b = digest.as_bytes();
    NodeId::new(
        ((b[0] as u64) << 32)
            | ((b[1] as u64) << 24)
            | ((b[2] as u64) << 16)
            | ((b[3] as u64) << 8)
            | b[4] as u64,
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn generate_validate_round_trip() {
        let id = Identity::generate();
        assert!(id.validate());
        assert!(id.address().is_valid());

        let secret_blob = id.to_secret_blob().unwrap();
        let parsed: Identity = secret_blob.parse().unwrap();
        assert_eq!(parsed.address(), id.address());
        assert!(parsed.has_secret());

        let public_blob = id.to_public_blob();
        let parsed_pub: Identity = public_blob.parse().unwrap();
        assert!(!parsed_pub.has_secret());
        assert!(parsed_pub.validate());
    }

    #[test]
    fn corrupted_blob_is_rejected() {
        let id = Identity::generate();
        let blob = id.to_secret_blob().unwrap();
        // Flip one hex digit of the public key field
        let mut chars: Vec<char> = blob.chars().collect();
        let colon2 = blob.match_indices(':').nth(1).unwrap().0;
        let i = colon2 + 2;
        chars[i] = if chars[i] == '0' { '1' } else { '0' };
        let corrupted: String = chars.into_iter().collect();
        assert!(corrupted.parse::<Identity>().is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        let ab = a.agree(b.public_key()).unwrap();
        let ba = b.agree(a.public_key()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn public_only_identity_cannot_agree() {
        let a = Identity::generate();
        let b: Identity = a.to_public_blob().parse().unwrap();
        assert!(b.agree(a.public_key()).is_err());
    }
}
