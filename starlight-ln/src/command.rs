//! Local commands accepted by the agent facade (§4.4 `Cmd`, §6).

use serde::{Deserialize, Serialize};
use starlight_common::federation::FederationAddress;
use starlight_common::LedgerAddress;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    CreateChannel(CreateChannel),
    Pay(Pay),
    ChannelPay(ChannelPay),
    Close,
    CleanUp,
    ForceClose,
    KeepAlive,
    AddAsset(AddAsset),
    RemoveAsset(RemoveAsset),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateChannel {
    pub guest: FederationAddress,
    pub host_amount: u64,
}

/// A direct on-chain wallet payment (distinct from an in-channel payment).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pay {
    pub destination: LedgerAddress,
    pub amount: u64,
}

/// An in-channel payment, driving the payment-round protocol (§4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelPay {
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddAsset {
    pub asset_code: String,
    pub asset_issuer: LedgerAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveAsset {
    pub asset_code: String,
    pub asset_issuer: LedgerAddress,
}
