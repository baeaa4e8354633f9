//! Identifiers of pinned content and stores.
//!
//! Both types are validated when parsed, and (de)serialize as plain strings.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BASE32_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz234567";

/// Length of a base58 encoded CIDv0.
const CID_V0_LEN: usize = 46;

/// Minimal length of a multibase encoded CIDv1, excluding the multibase prefix.
const CID_V1_MIN_LEN: usize = 40;

/// An invalid [`IpfsHash`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum HashError {
    #[error("hash is empty")]
    Empty,
    #[error("unsupported multibase encoding `{0}`")]
    UnsupportedEncoding(char),
    #[error("hash has invalid length {0}")]
    InvalidLength(usize),
    #[error("invalid character `{0}` in hash")]
    InvalidCharacter(char),
}

/// A content identifier of an immutable object in IPFS.
///
/// Supported are base58 encoded CIDv0 (`Qm…`), and CIDv1 in the `b` (base32) or `z` (base58)
/// multibase encodings. The hash is only validated syntactically.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IpfsHash(Arc<str>);

impl IpfsHash {
    pub fn parse(hash: &str) -> Result<Self, HashError> {
        let first = hash.chars().next().ok_or(HashError::Empty)?;

        if hash.starts_with("Qm") {
            if hash.len() != CID_V0_LEN {
                return Err(HashError::InvalidLength(hash.len()));
            }
            check_alphabet(hash, BASE58_ALPHABET)?;
        } else {
            let alphabet = match first {
                'b' => BASE32_ALPHABET,
                'z' => BASE58_ALPHABET,
                other => return Err(HashError::UnsupportedEncoding(other)),
            };
            let encoded = &hash[1..];
            if encoded.len() < CID_V1_MIN_LEN {
                return Err(HashError::InvalidLength(hash.len()));
            }
            check_alphabet(encoded, alphabet)?;
        }

        Ok(Self(hash.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_alphabet(encoded: &str, alphabet: &str) -> Result<(), HashError> {
    match encoded.chars().find(|c| !alphabet.contains(*c)) {
        Some(c) => Err(HashError::InvalidCharacter(c)),
        None => Ok(()),
    }
}

impl fmt::Display for IpfsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IpfsHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for IpfsHash {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// An invalid [`StoreAddress`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with `/orbitdb/`")]
    MissingPrefix,
    #[error("address has no store name")]
    MissingName,
    #[error("invalid root hash")]
    InvalidRoot(#[source] HashError),
}

/// The address of a store, `/orbitdb/<root>/<name>`.
///
/// The root is the hash of the store's manifest, which makes two addresses with the same name but
/// different roots refer to distinct stores.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StoreAddress {
    full: Arc<str>,
    root: IpfsHash,
}

impl StoreAddress {
    const PREFIX: &'static str = "/orbitdb/";

    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let rest = address
            .strip_prefix(Self::PREFIX)
            .ok_or(AddressError::MissingPrefix)?;
        let (root, name) = rest.split_once('/').ok_or(AddressError::MissingName)?;
        if name.is_empty() {
            return Err(AddressError::MissingName);
        }
        let root = IpfsHash::parse(root).map_err(AddressError::InvalidRoot)?;

        Ok(Self {
            full: address.into(),
            root,
        })
    }

    /// The hash of the store's manifest.
    pub fn root(&self) -> &IpfsHash {
        &self.root
    }

    /// The name of the store, everything after the root.
    pub fn name(&self) -> &str {
        &self.full[Self::PREFIX.len() + self.root.as_str().len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for StoreAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

macro_rules! impl_string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_string_serde!(IpfsHash);
impl_string_serde!(StoreAddress);

#[cfg(test)]
mod tests {
    use super::*;

    const CID_V0: &str = "QmWATWQ7fVPP2EFGu71UkfnqhYXDYH566qy47CnJDgvs8u";
    const CID_V1: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

    #[test]
    fn test_parse_hash() {
        assert_eq!(IpfsHash::parse(CID_V0).unwrap().as_str(), CID_V0);
        assert_eq!(IpfsHash::parse(CID_V1).unwrap().as_str(), CID_V1);
        assert!(IpfsHash::parse("zdj7WWeQ43G6JJvLWQWZpyHuAMq6uYWRjkBXFad11vE2LHhQ7").is_ok());
    }

    #[test]
    fn test_parse_invalid_hash() {
        assert_eq!(IpfsHash::parse(""), Err(HashError::Empty));
        assert_eq!(
            IpfsHash::parse("QmWATWQ7fVPP2EFGu71Ukfnq"),
            Err(HashError::InvalidLength(24))
        );
        // `0` is not part of the base58 alphabet
        assert_eq!(
            IpfsHash::parse("QmWATWQ7fVPP2EFGu71UkfnqhYXDYH566qy47CnJDgvs80"),
            Err(HashError::InvalidCharacter('0'))
        );
        assert_eq!(
            IpfsHash::parse("fabcdef"),
            Err(HashError::UnsupportedEncoding('f'))
        );
        assert_eq!(
            IpfsHash::parse("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdI"),
            Err(HashError::InvalidCharacter('I'))
        );
    }

    #[test]
    fn test_parse_address() {
        let address = format!("/orbitdb/{CID_V1}/colony.users");
        let parsed = StoreAddress::parse(&address).unwrap();
        assert_eq!(parsed.as_str(), address);
        assert_eq!(parsed.root().as_str(), CID_V1);
        assert_eq!(parsed.name(), "colony.users");

        // names may contain further slashes
        let address = format!("/orbitdb/{CID_V0}/colony/tasks");
        assert_eq!(StoreAddress::parse(&address).unwrap().name(), "colony/tasks");
    }

    #[test]
    fn test_parse_invalid_address() {
        assert_eq!(
            StoreAddress::parse(&format!("/ipfs/{CID_V0}/name")),
            Err(AddressError::MissingPrefix)
        );
        assert_eq!(
            StoreAddress::parse(&format!("/orbitdb/{CID_V0}")),
            Err(AddressError::MissingName)
        );
        assert_eq!(
            StoreAddress::parse(&format!("/orbitdb/{CID_V0}/")),
            Err(AddressError::MissingName)
        );
        assert!(matches!(
            StoreAddress::parse("/orbitdb/notahash/name"),
            Err(AddressError::InvalidRoot(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let address = StoreAddress::parse(&format!("/orbitdb/{CID_V0}/store")).unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"/orbitdb/{CID_V0}/store\""));
        let back: StoreAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);

        assert!(serde_json::from_str::<IpfsHash>("\"nope\"").is_err());
    }
}
