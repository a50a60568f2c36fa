//! Account-ledger bridge contract ABI
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge token contract.

use alloy::sol;

sol! {
    /// Bridge token on the account ledger. Holders burn to move value to the cell ledger.
    #[sol(rpc)]
    contract ChildBridge {
        /// Emitted when a holder burns `value` to start an unlock
        event Burn(address indexed sender, uint256 value);

        /// Emitted once a burn's unlock receipt has collected a quorum on chain
        event BurnQuorum(address from, uint256 amount, bytes32 txHash);
    }
}
