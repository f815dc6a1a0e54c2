//! EFI signature lists.
//!
//! A signature database is a sequence of `EFI_SIGNATURE_LIST` blocks:
//!
//! ```text
//! SignatureType    GUID   16
//! ListSize         u32     4   whole block, header included
//! HeaderSize       u32     4   always 0 here
//! SignatureSize    u32     4   16 + data length
//! { owner GUID, data } * n
//! ```
//!
//! GUIDs are stored in the mixed-endian EFI layout. Consecutive entries of
//! the same type and size share a block, so serialization keeps entry order
//! and parsing a written database yields the same entries.

use anyhow::{bail, Result};
use uuid::Uuid;

/// `EFI_CERT_X509_GUID`
pub const CERT_X509: Uuid = Uuid::from_u128(0xa5c059a1_94e4_4aa7_87b5_ab155c2bf072);
/// `EFI_CERT_SHA256_GUID`
pub const CERT_SHA256: Uuid = Uuid::from_u128(0xc1c41626_504c_4092_aca9_41f936934328);

const LIST_HEADER_LEN: usize = 28;
const OWNER_LEN: usize = 16;

/// One signature: a certificate or hash owned by `owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    pub sig_type: Uuid,
    pub owner: Uuid,
    pub data: Vec<u8>,
}

impl SignatureEntry {
    pub fn x509(owner: Uuid, der: Vec<u8>) -> Self {
        Self {
            sig_type: CERT_X509,
            owner,
            data: der,
        }
    }

    pub fn is_x509(&self) -> bool {
        self.sig_type == CERT_X509
    }
}

/// Human-readable name for well-known signature types.
pub fn type_name(sig_type: &Uuid) -> String {
    match *sig_type {
        CERT_X509 => "EFI_CERT_X509".to_string(),
        CERT_SHA256 => "EFI_CERT_SHA256".to_string(),
        other => other.to_string(),
    }
}

/// Ordered signature database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureDatabase {
    entries: Vec<SignatureEntry>,
}

impl SignatureDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: SignatureEntry) {
        self.entries.push(entry);
    }

    /// Append every entry of `other`, keeping its order.
    pub fn append(&mut self, other: SignatureDatabase) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[SignatureEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let first = &self.entries[i];
            let run = self.entries[i..]
                .iter()
                .take_while(|e| e.sig_type == first.sig_type && e.data.len() == first.data.len())
                .count();
            let sig_size = OWNER_LEN + first.data.len();
            let list_size = LIST_HEADER_LEN + run * sig_size;

            out.extend_from_slice(&first.sig_type.to_bytes_le());
            out.extend_from_slice(&(list_size as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(sig_size as u32).to_le_bytes());
            for entry in &self.entries[i..i + run] {
                out.extend_from_slice(&entry.owner.to_bytes_le());
                out.extend_from_slice(&entry.data);
            }
            i += run;
        }
        out
    }

    /// Parse a sequence of signature lists.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            if bytes.len() - pos < LIST_HEADER_LEN {
                bail!("truncated signature list header at offset {}", pos);
            }
            let sig_type = guid_at(bytes, pos);
            let list_size = u32_at(bytes, pos + 16) as usize;
            let header_size = u32_at(bytes, pos + 20) as usize;
            let sig_size = u32_at(bytes, pos + 24) as usize;

            if list_size < LIST_HEADER_LEN || pos + list_size > bytes.len() {
                bail!("signature list at offset {} has invalid size {}", pos, list_size);
            }
            if sig_size < OWNER_LEN {
                bail!("signature list at offset {} has invalid entry size {}", pos, sig_size);
            }
            let body = list_size
                .checked_sub(LIST_HEADER_LEN + header_size)
                .filter(|b| b % sig_size == 0);
            let Some(body) = body else {
                bail!("signature list at offset {} is not a whole number of entries", pos);
            };

            let mut entry_pos = pos + LIST_HEADER_LEN + header_size;
            for _ in 0..body / sig_size {
                entries.push(SignatureEntry {
                    sig_type,
                    owner: guid_at(bytes, entry_pos),
                    data: bytes[entry_pos + OWNER_LEN..entry_pos + sig_size].to_vec(),
                });
                entry_pos += sig_size;
            }
            pos += list_size;
        }

        Ok(Self { entries })
    }

    /// Parse a firmware variable export, which may carry the 4-byte
    /// attribute prefix efivarfs puts in front of the value.
    pub fn parse_variable(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > 4 + 16 && !is_known_type(bytes) && is_known_type(&bytes[4..]) {
            return Self::parse(&bytes[4..]);
        }
        Self::parse(bytes)
    }
}

fn is_known_type(bytes: &[u8]) -> bool {
    bytes.len() >= 16 && matches!(guid_at(bytes, 0), CERT_X509 | CERT_SHA256)
}

fn guid_at(bytes: &[u8], pos: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[pos..pos + 16]);
    Uuid::from_bytes_le(raw)
}

fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_guid_is_mixed_endian() {
        let bytes = CERT_X509.to_bytes_le();
        assert_eq!(&bytes[..4], &[0xa1, 0x59, 0xc0, 0xa5]);
        assert_eq!(&bytes[4..6], &[0xe4, 0x94]);
        assert_eq!(&bytes[8..], &[0x87, 0xb5, 0xab, 0x15, 0x5c, 0x2b, 0xf0, 0x72]);
    }

    #[test]
    fn test_single_list_layout() {
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner(1), vec![0xAA; 10]));
        let bytes = db.to_bytes();

        assert_eq!(bytes.len(), 28 + 16 + 10);
        assert_eq!(u32_at(&bytes, 16), 54); // list size
        assert_eq!(u32_at(&bytes, 20), 0); // header size
        assert_eq!(u32_at(&bytes, 24), 26); // signature size
    }

    #[test]
    fn test_round_trip_keeps_order() {
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner(1), vec![1; 30]));
        db.push(SignatureEntry::x509(owner(2), vec![2; 30]));
        db.push(SignatureEntry::x509(owner(3), vec![3; 45]));
        db.push(SignatureEntry {
            sig_type: CERT_SHA256,
            owner: owner(4),
            data: vec![4; 32],
        });
        db.push(SignatureEntry::x509(owner(5), vec![5; 30]));

        let parsed = SignatureDatabase::parse(&db.to_bytes()).unwrap();
        assert_eq!(parsed, db);
    }

    #[test]
    fn test_same_size_entries_share_a_list() {
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner(1), vec![1; 8]));
        db.push(SignatureEntry::x509(owner(2), vec![2; 8]));
        let bytes = db.to_bytes();
        assert_eq!(bytes.len(), 28 + 2 * 24);
    }

    #[test]
    fn test_efivarfs_prefix_tolerated() {
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner(9), vec![7; 12]));
        let mut exported = vec![0x27, 0, 0, 0];
        exported.extend(db.to_bytes());

        assert_eq!(SignatureDatabase::parse_variable(&exported).unwrap(), db);
        assert_eq!(SignatureDatabase::parse_variable(&db.to_bytes()).unwrap(), db);
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner(1), vec![1; 20]));
        let bytes = db.to_bytes();
        assert!(SignatureDatabase::parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(SignatureDatabase::parse(&bytes[..10]).is_err());
    }

    #[test]
    fn test_empty_database() {
        let db = SignatureDatabase::new();
        assert!(db.to_bytes().is_empty());
        assert!(SignatureDatabase::parse(&[]).unwrap().is_empty());
    }
}
