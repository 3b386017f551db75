//! Message signing
//!
//! SMB 2.x signs with HMAC-SHA256 keyed by the session key. SMB 3.0 and
//! 3.0.2 sign with AES-128-CMAC keyed by a signing key derived from the
//! session key (SP800-108 counter mode, HMAC-SHA256 PRF).

use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{SmbError, SmbResult};
use crate::flags::Flag;
use crate::protocol::{
    Dialect, HeaderFlag, FLAGS_OFFSET, SIGNATURE_OFFSET, SIGNATURE_SIZE, SMB2_HEADER_SIZE,
};

type HmacSha256 = Hmac<Sha256>;
type AesCmac = Cmac<Aes128>;

/// Session and signing key length
pub const KEY_SIZE: usize = 16;

/// KDF label for the SMB 3.0 signing key
pub const SIGNING_KEY_LABEL: &[u8] = b"SMB2AESCMAC\0";

/// KDF context for the SMB 3.0 signing key
pub const SIGNING_KEY_CONTEXT: &[u8] = b"SmbSign\0";

/// MAC algorithm chosen by the negotiated dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// HMAC-SHA256 truncated to 16 bytes
    HmacSha256,
    /// AES-128-CMAC
    AesCmac,
}

impl SigningAlgorithm {
    /// Algorithm for a dialect
    pub fn for_dialect(dialect: Dialect) -> SmbResult<Self> {
        match dialect {
            Dialect::Smb202 | Dialect::Smb210 => Ok(Self::HmacSha256),
            Dialect::Smb300 | Dialect::Smb302 => Ok(Self::AesCmac),
            Dialect::Smb311 => Err(SmbError::NotSupported(
                "SMB 3.1.1 signing (AES-GMAC / preauth integrity)".to_string(),
            )),
            other => Err(SmbError::Negotiation(format!(
                "No signing algorithm for dialect {other}"
            ))),
        }
    }
}

/// SP800-108 counter-mode KDF with HMAC-SHA256, 128-bit output
pub fn derive_key(key: &[u8], label: &[u8], context: &[u8]) -> SmbResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SmbError::Protocol(format!("Invalid KDF key: {e}")))?;
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0]);
    mac.update(context);
    mac.update(&(KEY_SIZE as u32 * 8).to_be_bytes());

    let digest = mac.finalize().into_bytes();
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(&digest[..KEY_SIZE]);
    Ok(out)
}

/// Keys of an authenticated session
pub struct SessionDetails {
    session_id: u64,
    dialect: Dialect,
    session_key: Zeroizing<[u8; KEY_SIZE]>,
    signing_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl SessionDetails {
    /// Build session keys from the key the authentication mechanism exported
    ///
    /// The key is truncated or zero-padded to 16 bytes. For SMB 3.x the
    /// signing key is derived immediately.
    pub fn new(session_id: u64, dialect: Dialect, exported_key: &[u8]) -> SmbResult<Self> {
        let mut session_key = Zeroizing::new([0u8; KEY_SIZE]);
        let len = exported_key.len().min(KEY_SIZE);
        session_key[..len].copy_from_slice(&exported_key[..len]);

        let signing_key = if dialect.is_smb3() {
            Some(derive_key(
                &session_key[..],
                SIGNING_KEY_LABEL,
                SIGNING_KEY_CONTEXT,
            )?)
        } else {
            None
        };

        Ok(Self {
            session_id,
            dialect,
            session_key,
            signing_key,
        })
    }

    /// Session ID
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Dialect the session was established under
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Session key (first 16 bytes of the exported key)
    pub fn session_key(&self) -> &[u8; KEY_SIZE] {
        &self.session_key
    }

    /// Derived signing key (SMB 3.x only)
    pub fn signing_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.signing_key.as_deref()
    }

    /// Create the packet signer for this session
    pub fn signer(&self) -> SmbResult<PacketSigner> {
        let algorithm = SigningAlgorithm::for_dialect(self.dialect)?;
        let key = match algorithm {
            SigningAlgorithm::HmacSha256 => self.session_key.clone(),
            SigningAlgorithm::AesCmac => self
                .signing_key
                .clone()
                .ok_or_else(|| SmbError::Protocol("Missing SMB3 signing key".to_string()))?,
        };
        debug!(session_id = self.session_id, ?algorithm, "Created packet signer");
        Ok(PacketSigner { algorithm, key })
    }
}

impl std::fmt::Debug for SessionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDetails")
            .field("session_id", &self.session_id)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

/// MAC context bound to one session
pub struct PacketSigner {
    algorithm: SigningAlgorithm,
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl PacketSigner {
    /// Signer for an explicit algorithm and key
    pub fn new(algorithm: SigningAlgorithm, key: [u8; KEY_SIZE]) -> Self {
        Self {
            algorithm,
            key: Zeroizing::new(key),
        }
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Sign an encoded message in place
    ///
    /// Sets the signed flag, zeroes the signature field, MACs the whole
    /// message and writes the first 16 MAC bytes into the signature field.
    pub fn sign_outbound(&self, message: &mut [u8]) -> SmbResult<()> {
        check_length(message)?;
        let flags = read_flags(message) | HeaderFlag::Signed.bits();
        message[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());
        message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);

        let signature = self.compute(message)?;
        message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].copy_from_slice(&signature);
        Ok(())
    }

    /// Verify the signature of a received message
    pub fn verify_inbound_signature(&self, message: &[u8]) -> SmbResult<()> {
        check_length(message)?;
        if read_flags(message) & HeaderFlag::Signed.bits() == 0 {
            return Err(SmbError::Signature("Message is not signed".to_string()));
        }

        let mut copy = message.to_vec();
        copy[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);
        let expected = self.compute(&copy)?;
        let received = &message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE];

        if bool::from(expected[..].ct_eq(received)) {
            Ok(())
        } else {
            Err(SmbError::Signature("Signature mismatch".to_string()))
        }
    }

    fn compute(&self, data: &[u8]) -> SmbResult<[u8; SIGNATURE_SIZE]> {
        let mut out = [0u8; SIGNATURE_SIZE];
        match self.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key[..])
                    .map_err(|e| SmbError::Signature(format!("Invalid HMAC key: {e}")))?;
                mac.update(data);
                out.copy_from_slice(&mac.finalize().into_bytes()[..SIGNATURE_SIZE]);
            }
            SigningAlgorithm::AesCmac => {
                let mut mac = <AesCmac as Mac>::new_from_slice(&self.key[..])
                    .map_err(|e| SmbError::Signature(format!("Invalid CMAC key: {e}")))?;
                mac.update(data);
                out.copy_from_slice(&mac.finalize().into_bytes()[..SIGNATURE_SIZE]);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for PacketSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn check_length(message: &[u8]) -> SmbResult<()> {
    if message.len() < SMB2_HEADER_SIZE {
        return Err(SmbError::Signature(format!(
            "Message of {} bytes has no signature field",
            message.len()
        )));
    }
    Ok(())
}

fn read_flags(message: &[u8]) -> u32 {
    u32::from_le_bytes([
        message[FLAGS_OFFSET],
        message[FLAGS_OFFSET + 1],
        message[FLAGS_OFFSET + 2],
        message[FLAGS_OFFSET + 3],
    ])
}
