use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use twinleg_core::{Amount, ParticipantId, Plan, Timestamp};

/// A ledger command as it is written to the journal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Register {
        plan: Plan,
        referrer: Option<ParticipantId>,
        volume: Option<Amount>,
    },
    ChangeRewardCycle {
        secs: u64,
    },
    SendMessage {
        text: String,
    },
    Distribute,
    EmergencyWithdraw {
        amount: Option<Amount>,
    },
    Deactivate {
        participant: ParticipantId,
    },
}

/// One signed, hash-chained journal line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(with = "serde_bytes")]
    pub prev: Vec<u8>,
    pub at: Timestamp,
    pub caller: ParticipantId,
    pub command: Command,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl JournalEntry {
    pub fn digest(&self) -> [u8; 32] {
        entry_digest(self.seq, &self.prev, self.at, &self.caller, &self.command)
    }
}

fn entry_digest(
    seq: u64,
    prev: &[u8],
    at: Timestamp,
    caller: &str,
    command: &Command,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"twinleg-journal");
    hasher.update(seq.to_le_bytes());
    hasher.update(prev);
    hasher.update(at.to_le_bytes());
    hasher.update(caller.as_bytes());
    hasher.update([0u8]);
    // Commands hold only strings, integers and enums; encoding cannot fail.
    hasher.update(serde_json::to_vec(command).unwrap_or_default());
    hasher.finalize().into()
}

/// Ordered log of every command that changed the ledger.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Journal {
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn head(&self) -> [u8; 32] {
        self.entries
            .last()
            .map(JournalEntry::digest)
            .unwrap_or_else(|| Sha256::digest(b"twinleg-journal-genesis").into())
    }

    pub fn append(&mut self, key: &SigningKey, at: Timestamp, command: Command) -> &JournalEntry {
        let seq = self.entries.len() as u64;
        let prev = self.head().to_vec();
        let caller = identity_of(&key.verifying_key());
        let digest = entry_digest(seq, &prev, at, &caller, &command);
        let signature = key.sign(&digest).to_bytes().to_vec();
        self.entries.push(JournalEntry {
            seq,
            prev,
            at,
            caller,
            command,
            signature,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Check sequence numbers, the hash chain and every caller signature.
    pub fn verify(&self) -> Result<(), VerificationError> {
        let mut prev = Journal::default().head().to_vec();
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.seq != idx as u64 {
                return Err(VerificationError::OutOfOrder(entry.seq));
            }
            if entry.prev != prev {
                return Err(VerificationError::BrokenChain(entry.seq));
            }
            let key = parse_identity(&entry.caller)
                .map_err(|_| VerificationError::MalformedIdentity(entry.caller.clone()))?;
            let signature = Signature::from_slice(&entry.signature)
                .map_err(|_| VerificationError::MalformedSignature(entry.seq))?;
            let digest = entry.digest();
            key.verify_strict(&digest, &signature)
                .map_err(|_| VerificationError::InvalidSignature(entry.seq))?;
            prev = digest.to_vec();
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("journal entry {0} is out of sequence")]
    OutOfOrder(u64),
    #[error("journal entry {0} does not extend the previous entry")]
    BrokenChain(u64),
    #[error("caller {0} is not a valid ed25519 public key")]
    MalformedIdentity(String),
    #[error("malformed signature on journal entry {0}")]
    MalformedSignature(u64),
    #[error("invalid signature on journal entry {0}")]
    InvalidSignature(u64),
    #[error("replayed state root {replayed} does not match stored root {stored}")]
    RootMismatch { stored: String, replayed: String },
}

/// Ledger identities are hex-encoded ed25519 public keys.
pub fn identity_of(key: &VerifyingKey) -> ParticipantId {
    hex::encode(key.as_bytes())
}

pub fn parse_identity(id: &str) -> Result<VerifyingKey, String> {
    let bytes: [u8; 32] = hex::decode(id.trim())
        .map_err(|e| e.to_string())?
        .try_into()
        .map_err(|_| "identity must be 32 bytes (64 hex chars)".to_string())?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| e.to_string())
}

pub fn parse_sk_hex(sk_hex: &str) -> Result<SigningKey, String> {
    let bytes: [u8; 32] = hex::decode(sk_hex.trim())
        .map_err(|e| format!("invalid sk-hex: {e}"))?
        .try_into()
        .map_err(|_| "sk-hex must be 32 bytes (64 hex chars)".to_string())?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
