//! EIP-712 typed data for decryption grant signatures.
//!
//! The decryption gateway verifies a `UserDecryptRequestVerification`
//! signature before serving user decryptions. The document binds the grant
//! keypair's public key, the contract scope, and the validity window to the
//! gateway chain's decryption verifier domain.

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use fhes_common::types::Address;

/// Domain name the decryption verifier checks signatures under.
pub const DOMAIN_NAME: &str = "Decryption";
pub const DOMAIN_VERSION: &str = "1";
/// Primary type of a user decryption request.
pub const PRIMARY_TYPE: &str = "UserDecryptRequestVerification";

/// EIP-712 domain of a deployment's decryption verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eip712Domain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

static TYPES: Lazy<Value> = Lazy::new(|| {
    json!({
        "EIP712Domain": [
            { "name": "name", "type": "string" },
            { "name": "version", "type": "string" },
            { "name": "chainId", "type": "uint256" },
            { "name": "verifyingContract", "type": "address" },
        ],
        "UserDecryptRequestVerification": [
            { "name": "publicKey", "type": "bytes" },
            { "name": "contractAddresses", "type": "address[]" },
            { "name": "startTimestamp", "type": "uint256" },
            { "name": "durationDays", "type": "uint256" },
        ],
    })
});

/// Full `eth_signTypedData_v4` document for a user decryption request.
///
/// Addresses render checksummed; uint256 values render as decimal strings.
pub fn user_decrypt_typed_data(
    domain: &Eip712Domain,
    public_key_hex: &str,
    contract_addresses: &[Address],
    start_timestamp: u64,
    duration_days: u64,
) -> Value {
    let contracts: Vec<String> = contract_addresses.iter().map(Address::to_checksum).collect();
    json!({
        "types": &*TYPES,
        "primaryType": PRIMARY_TYPE,
        "domain": {
            "name": DOMAIN_NAME,
            "version": DOMAIN_VERSION,
            "chainId": domain.chain_id,
            "verifyingContract": domain.verifying_contract.to_checksum(),
        },
        "message": {
            "publicKey": public_key_hex,
            "contractAddresses": contracts,
            "startTimestamp": start_timestamp.to_string(),
            "durationDays": duration_days.to_string(),
        },
    })
}
