//! Time-based authenticated variables (`EFI_VARIABLE_AUTHENTICATION_2`).
//!
//! ```text
//! EFI_TIME                  16
//! WIN_CERTIFICATE_UEFI_GUID
//!   dwLength        u32         header + pkcs7
//!   wRevision       u16         0x0200
//!   wCertificateType u16        0x0EF1 (WIN_CERT_TYPE_EFI_GUID)
//!   CertType        GUID        EFI_CERT_TYPE_PKCS7_GUID
//!   CertData        pkcs7 DER
//! variable data (the signature database)
//! ```
//!
//! The PKCS#7 signature covers `name (UTF-16LE, no NUL) || vendor GUID ||
//! attributes (u32 LE) || EFI_TIME || data`.

use anyhow::{bail, Result};
use std::path::Path;
use time::OffsetDateTime;
use uuid::Uuid;

use super::authority::CertAuthority;

/// `EFI_CERT_TYPE_PKCS7_GUID`
pub const CERT_TYPE_PKCS7: Uuid = Uuid::from_u128(0x4aafd29d_68df_49ee_8aa9_347d375665a7);
/// `EFI_GLOBAL_VARIABLE`, vendor of `PK` and `KEK`.
pub const EFI_GLOBAL_VARIABLE: Uuid = Uuid::from_u128(0x8be4df61_93ca_11d2_aa0d_00e098032b8c);
/// `EFI_IMAGE_SECURITY_DATABASE_GUID`, vendor of `db` and `dbx`.
pub const IMAGE_SECURITY_DATABASE: Uuid = Uuid::from_u128(0xd719b2cb_3d3a_4596_a3bc_dad00e67656f);

/// NV | BS | RT | TIME_BASED_AUTHENTICATED_WRITE_ACCESS
pub const AUTH_VAR_ATTRIBUTES: u32 = 0x01 | 0x02 | 0x04 | 0x20;

const WIN_CERT_REVISION: u16 = 0x0200;
const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;
const EFI_TIME_LEN: usize = 16;
const WIN_CERT_HEADER_LEN: usize = 4 + 2 + 2 + 16;

/// `EFI_TIME` with nanoseconds, timezone and daylight zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EfiTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl EfiTime {
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let dt = dt.to_offset(time::UtcOffset::UTC);
        Self {
            year: dt.year() as u16,
            month: dt.month() as u8,
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn to_bytes(self) -> [u8; EFI_TIME_LEN] {
        let mut out = [0u8; EFI_TIME_LEN];
        out[0..2].copy_from_slice(&self.year.to_le_bytes());
        out[2] = self.month;
        out[3] = self.day;
        out[4] = self.hour;
        out[5] = self.minute;
        out[6] = self.second;
        // pad1, nanosecond, timezone, daylight, pad2 stay zero
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            year: u16::from_le_bytes([bytes[0], bytes[1]]),
            month: bytes[2],
            day: bytes[3],
            hour: bytes[4],
            minute: bytes[5],
            second: bytes[6],
        }
    }
}

/// The bytes the PKCS#7 signature is computed over.
pub fn signed_payload(name: &str, vendor: Uuid, timestamp: EfiTime, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() * 2 + 16 + 4 + EFI_TIME_LEN + data.len());
    for unit in name.encode_utf16() {
        payload.extend_from_slice(&unit.to_le_bytes());
    }
    payload.extend_from_slice(&vendor.to_bytes_le());
    payload.extend_from_slice(&AUTH_VAR_ATTRIBUTES.to_le_bytes());
    payload.extend_from_slice(&timestamp.to_bytes());
    payload.extend_from_slice(data);
    payload
}

/// Sign `data` as the variable `name` and return the `.auth` file contents.
pub fn sign_variable(
    name: &str,
    vendor: Uuid,
    timestamp: EfiTime,
    data: &[u8],
    authority: &dyn CertAuthority,
    key: &Path,
    cert: &Path,
) -> Result<Vec<u8>> {
    let payload = signed_payload(name, vendor, timestamp, data);
    let pkcs7 = authority.sign_detached(&payload, key, cert)?;
    Ok(encode(timestamp, &pkcs7, data))
}

/// Assemble an authenticated variable from its parts.
pub fn encode(timestamp: EfiTime, pkcs7: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(EFI_TIME_LEN + WIN_CERT_HEADER_LEN + pkcs7.len() + data.len());
    out.extend_from_slice(&timestamp.to_bytes());
    out.extend_from_slice(&((WIN_CERT_HEADER_LEN + pkcs7.len()) as u32).to_le_bytes());
    out.extend_from_slice(&WIN_CERT_REVISION.to_le_bytes());
    out.extend_from_slice(&WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
    out.extend_from_slice(&CERT_TYPE_PKCS7.to_bytes_le());
    out.extend_from_slice(pkcs7);
    out.extend_from_slice(data);
    out
}

/// An authenticated variable split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedVariable {
    pub timestamp: EfiTime,
    pub pkcs7: Vec<u8>,
    pub data: Vec<u8>,
}

impl AuthenticatedVariable {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EFI_TIME_LEN + WIN_CERT_HEADER_LEN {
            bail!("authenticated variable too short ({} bytes)", bytes.len());
        }
        let timestamp = EfiTime::from_bytes(&bytes[..EFI_TIME_LEN]);
        let cert = &bytes[EFI_TIME_LEN..];
        let length = u32::from_le_bytes([cert[0], cert[1], cert[2], cert[3]]) as usize;
        let revision = u16::from_le_bytes([cert[4], cert[5]]);
        let cert_type = u16::from_le_bytes([cert[6], cert[7]]);

        if revision != WIN_CERT_REVISION || cert_type != WIN_CERT_TYPE_EFI_GUID {
            bail!("unexpected WIN_CERTIFICATE header {:#06x}/{:#06x}", revision, cert_type);
        }
        if length < WIN_CERT_HEADER_LEN || length > cert.len() {
            bail!("WIN_CERTIFICATE length {} out of range", length);
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&cert[8..24]);
        if Uuid::from_bytes_le(guid) != CERT_TYPE_PKCS7 {
            bail!("authenticated variable is not PKCS#7 signed");
        }

        Ok(Self {
            timestamp,
            pkcs7: cert[WIN_CERT_HEADER_LEN..length].to_vec(),
            data: cert[length..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_efi_time_layout() {
        let t = EfiTime::from_datetime(datetime!(2024-03-05 06:07:08 UTC));
        let bytes = t.to_bytes();
        assert_eq!(&bytes[..7], &[0xE8, 0x07, 3, 5, 6, 7, 8]);
        assert!(bytes[7..].iter().all(|b| *b == 0));
        assert_eq!(EfiTime::from_bytes(&bytes), t);
    }

    #[test]
    fn test_signed_payload_layout() {
        let t = EfiTime::from_datetime(datetime!(2024-01-01 00:00:00 UTC));
        let payload = signed_payload("db", IMAGE_SECURITY_DATABASE, t, b"DATA");
        // "db" in UTF-16LE without terminator
        assert_eq!(&payload[..4], &[b'd', 0, b'b', 0]);
        assert_eq!(&payload[4..20], &IMAGE_SECURITY_DATABASE.to_bytes_le());
        assert_eq!(&payload[20..24], &[0x27, 0, 0, 0]);
        assert_eq!(&payload[24..40], &t.to_bytes());
        assert_eq!(&payload[40..], b"DATA");
    }

    #[test]
    fn test_encode_parse() {
        let t = EfiTime::from_datetime(datetime!(2024-01-01 12:00:00 UTC));
        let bytes = encode(t, b"PKCS7SIG", b"ESLDATA");
        assert_eq!(&bytes[16..20], &(24u32 + 8).to_le_bytes());
        assert_eq!(&bytes[20..22], &[0x00, 0x02]);
        assert_eq!(&bytes[22..24], &[0xF1, 0x0E]);

        let parsed = AuthenticatedVariable::parse(&bytes).unwrap();
        assert_eq!(parsed.timestamp, t);
        assert_eq!(parsed.pkcs7, b"PKCS7SIG");
        assert_eq!(parsed.data, b"ESLDATA");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AuthenticatedVariable::parse(&[0u8; 10]).is_err());
        assert!(AuthenticatedVariable::parse(&[0u8; 64]).is_err());
    }
}
