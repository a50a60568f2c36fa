//! Cell transaction builders

use alloy::primitives::{Address, Bytes, B256};

use crate::events::{BridgeIdentity, CellOutput, HashType, ResolvedTransaction, Script};
use crate::hash::keccak256;
use crate::types::Account;

/// A fixed bridge instance
pub fn bridge_identity() -> BridgeIdentity {
    BridgeIdentity {
        bridge_type: Script {
            code_hash: B256::repeat_byte(0xb1),
            hash_type: HashType::Type,
            args: Bytes::from(vec![0x01; 32]),
        },
        bridge_type_hash: B256::repeat_byte(0xb2),
        deposit_code_hash: B256::repeat_byte(0xd1),
    }
}

fn secp_lock(owner: u8) -> Script {
    Script {
        code_hash: B256::repeat_byte(0x9b),
        hash_type: HashType::Type,
        args: Bytes::from(vec![owner; 20]),
    }
}

fn tx_hash(kind: &str, block_number: u64, tx_index: u32) -> B256 {
    let mut data = kind.as_bytes().to_vec();
    data.extend_from_slice(&block_number.to_be_bytes());
    data.extend_from_slice(&tx_index.to_be_bytes());
    B256::from(keccak256(&data))
}

pub fn plain_cell(capacity: u64) -> CellOutput {
    CellOutput {
        capacity,
        lock: secp_lock(0x0a),
        type_script: None,
        data: Bytes::new(),
    }
}

pub fn bridge_cell(bridge: &BridgeIdentity, capacity: u64) -> CellOutput {
    CellOutput {
        capacity,
        lock: secp_lock(0x0b),
        type_script: Some(bridge.bridge_type.clone()),
        data: Bytes::new(),
    }
}

pub fn deposit_cell(bridge: &BridgeIdentity, depositor: Account, capacity: u64) -> CellOutput {
    let mut args = depositor.0.to_vec();
    args.extend_from_slice(bridge.bridge_type_hash.as_slice());
    CellOutput {
        capacity,
        lock: Script {
            code_hash: bridge.deposit_code_hash,
            hash_type: HashType::Type,
            args: Bytes::from(args),
        },
        type_script: None,
        data: Bytes::new(),
    }
}

/// Deposit cell whose data names the account-ledger recipient
pub fn deposit_cell_to(
    bridge: &BridgeIdentity,
    depositor: Account,
    recipient: Address,
    capacity: u64,
) -> CellOutput {
    CellOutput {
        data: Bytes::copy_from_slice(recipient.as_slice()),
        ..deposit_cell(bridge, depositor, capacity)
    }
}

/// Creates the bridge state cell from a plain cell
pub fn deploy_tx(
    bridge: &BridgeIdentity,
    block_number: u64,
    tx_index: u32,
    capacity: u64,
) -> ResolvedTransaction {
    ResolvedTransaction {
        hash: tx_hash("deploy", block_number, tx_index),
        block_number,
        tx_index,
        inputs: vec![plain_cell(capacity + 100)],
        outputs: vec![bridge_cell(bridge, capacity), plain_cell(100)],
    }
}

/// Moves `capacity` from a plain cell into a deposit cell
pub fn deposit_tx(
    bridge: &BridgeIdentity,
    block_number: u64,
    tx_index: u32,
    depositor: Account,
    capacity: u64,
) -> ResolvedTransaction {
    ResolvedTransaction {
        hash: tx_hash("deposit", block_number, tx_index),
        block_number,
        tx_index,
        inputs: vec![plain_cell(capacity + 100)],
        outputs: vec![deposit_cell(bridge, depositor, capacity), plain_cell(100)],
    }
}

/// Like `deposit_tx`, with the recipient recorded in the deposit cell data
pub fn deposit_tx_to(
    bridge: &BridgeIdentity,
    block_number: u64,
    tx_index: u32,
    depositor: Account,
    recipient: Address,
    capacity: u64,
) -> ResolvedTransaction {
    ResolvedTransaction {
        hash: tx_hash("deposit", block_number, tx_index),
        block_number,
        tx_index,
        inputs: vec![plain_cell(capacity + 100)],
        outputs: vec![
            deposit_cell_to(bridge, depositor, recipient, capacity),
            plain_cell(100),
        ],
    }
}

/// Consumes the bridge cell and the given deposits, folding them into the bridge cell
pub fn collect_tx(
    bridge: &BridgeIdentity,
    block_number: u64,
    tx_index: u32,
    bridge_capacity: u64,
    deposits: &[(Account, u64)],
) -> ResolvedTransaction {
    let mut inputs = vec![bridge_cell(bridge, bridge_capacity)];
    inputs.extend(
        deposits
            .iter()
            .map(|(depositor, capacity)| deposit_cell(bridge, *depositor, *capacity)),
    );
    let total: u64 = bridge_capacity + deposits.iter().map(|(_, c)| c).sum::<u64>();

    ResolvedTransaction {
        hash: tx_hash("collect", block_number, tx_index),
        block_number,
        tx_index,
        inputs,
        outputs: vec![bridge_cell(bridge, total)],
    }
}
