use std::time::Duration;

use ethers_core::types::{Address, Bytes};
use ethers_providers::{Http, Middleware, Provider};
use httpmock::MockServer;
use mev_searcher_core::executor::{Relay, RelayClient};
use mev_searcher_core::node::{EthersNode, NodeClient};
use mev_searcher_core::signer::{LocalKeySigner, Signer};
use mev_searcher_core::tx::{step_tx, tx_hash};
use mev_searcher_core::types::{Action, Step};

// E2E test - ignored by default. Requires env vars:
// - ANVIL_RPC_URL (default: http://127.0.0.1:8545)
// - PRIVATE_KEY (hex, 0x optional) for a funded Anvil account
// The relay is a local mock server.

#[tokio::test]
#[ignore]
async fn e2e_sign_step_submit_bundle_and_mine() {
    let anvil_rpc = std::env::var("ANVIL_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
    let private = match std::env::var("PRIVATE_KEY") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("Skipping E2E: set PRIVATE_KEY (Anvil funded key)");
            return;
        }
    };

    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/").body_contains("eth_sendBundle");
        then.status(200).body(r#"{"jsonrpc":"2.0","id":1,"result":{"bundleHash":"0xfeed"}}"#);
    });

    let node = EthersNode::new(&anvil_rpc, &anvil_rpc, &[], 1_000_000_000).expect("node");
    let provider = Provider::<Http>::try_from(anvil_rpc.as_str()).expect("provider");
    let chain_id = provider.get_chainid().await.expect("chainid").as_u64();

    let signer = LocalKeySigner::from_secret(&private).expect("signer");
    let head = node.head().await.expect("head");
    let nonce = node.nonce_at(signer.address(), head).await.expect("nonce");
    let fees = node.fee_quote().await.expect("fees");

    let step = Step {
        account: signer.address(),
        action: Action::Transfer { to: Address::zero(), amount: 1 },
        gas_limit: 21_000,
    };
    let raw = signer.sign_typed_transaction(&step_tx(&step, nonce, &fees, chain_id)).await.expect("sign tx");

    let relay = RelayClient::new("mock", server.url("/"), Duration::from_secs(2)).unwrap();
    let ack = relay.submit(&[raw.clone()], head + 1).await.expect("submit bundle");
    assert_eq!(ack.bundle_hash.as_deref(), Some("0xfeed"));
    m.assert();

    // the mock relay does not mine; send the same bytes to Anvil directly
    let pending = provider.send_raw_transaction(Bytes::from(raw.clone())).await.expect("send raw");
    let mined = pending.await.expect("mined").expect("receipt");
    assert_eq!(mined.transaction_hash, tx_hash(&raw));

    let receipt = node.receipt(tx_hash(&raw)).await.expect("receipt query").expect("included");
    assert!(!receipt.reverted);
    assert!(receipt.block > head);
}
